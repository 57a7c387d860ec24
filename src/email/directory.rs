//! Alias lookups the sync engine depends on.
//!
//! Alias and user management is owned elsewhere; the engine only resolves
//! aliases and enumerates the mailboxes it should pull from.

use crate::config::ImapSettings;
use crate::email::database::{format_timestamp, DatabaseResult, EmailDatabase};
use crate::imap::ImapConfig;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::warn;

/// One alias row. `is_active` is false when either the alias or its owning
/// user has been deactivated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AliasRecord {
    pub id: i64,
    pub user_id: i64,
    pub email: String,
    pub name: Option<String>,
    pub is_active: bool,
}

impl AliasRecord {
    /// Domain part of the alias address
    pub fn domain(&self) -> &str {
        self.email.rsplit_once('@').map(|(_, d)| d).unwrap_or("localhost")
    }
}

/// Connection parameters for one active alias's remote mailbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailboxTarget {
    pub alias_id: i64,
    pub alias_email: String,
    pub user_id: i64,
    pub imap: ImapConfig,
}

#[async_trait]
pub trait AliasDirectory: Send + Sync {
    /// Look up an alias by its full address (case-insensitive)
    async fn resolve_alias_by_address(&self, email: &str) -> DatabaseResult<Option<AliasRecord>>;

    /// Every active alias that has usable mailbox credentials
    async fn list_active_mailbox_targets(&self) -> DatabaseResult<Vec<MailboxTarget>>;

    /// Target for one alias, if it is active and has credentials
    async fn mailbox_target(&self, alias_id: i64) -> DatabaseResult<Option<MailboxTarget>>;

    /// The alias, only if it belongs to `owner_user_id`
    async fn owned_alias(&self, owner_user_id: i64, alias_id: i64) -> DatabaseResult<Option<AliasRecord>>;
}

/// Insert payload for provisioning an alias
#[derive(Debug, Clone, Default)]
pub struct NewAlias {
    pub user_id: i64,
    pub email: String,
    pub name: Option<String>,
    pub imap_host: Option<String>,
    pub imap_port: Option<u16>,
    pub imap_username: Option<String>,
    pub imap_password: Option<String>,
}

/// Directory backed by the `users` and `aliases` tables
#[derive(Debug, Clone)]
pub struct SqliteAliasDirectory {
    db: EmailDatabase,
    imap: ImapSettings,
}

const ALIAS_COLUMNS: &str = "a.id, a.user_id, a.email, a.name, (a.is_active AND u.is_active) AS is_active, \
     a.imap_host, a.imap_port, a.imap_username, a.imap_password";
const ALIAS_FROM: &str = "aliases a JOIN users u ON u.id = a.user_id";

impl SqliteAliasDirectory {
    pub fn new(db: EmailDatabase, imap: ImapSettings) -> Self {
        Self { db, imap }
    }

    /// Create a user row and return its id
    pub async fn create_user(&self, email: &str, name: Option<&str>) -> DatabaseResult<i64> {
        let mut tx = self.db.pool.begin().await?;
        let id = sqlx::query_scalar("INSERT INTO users (email, name, created_at) VALUES (?1, ?2, ?3) RETURNING id")
            .bind(email)
            .bind(name)
            .bind(format_timestamp(&Utc::now()))
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(id)
    }

    /// Create an active alias and return its record
    pub async fn create_alias(&self, alias: &NewAlias) -> DatabaseResult<AliasRecord> {
        let mut tx = self.db.pool.begin().await?;
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO aliases (user_id, email, name, is_active, imap_host, imap_port, imap_username, imap_password, created_at)
            VALUES (?1, ?2, ?3, TRUE, ?4, ?5, ?6, ?7, ?8)
            RETURNING id
        "#,
        )
        .bind(alias.user_id)
        .bind(&alias.email)
        .bind(&alias.name)
        .bind(&alias.imap_host)
        .bind(alias.imap_port.map(i64::from))
        .bind(&alias.imap_username)
        .bind(&alias.imap_password)
        .bind(format_timestamp(&Utc::now()))
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(AliasRecord {
            id,
            user_id: alias.user_id,
            email: alias.email.clone(),
            name: alias.name.clone(),
            is_active: true,
        })
    }

    /// Activate or deactivate an alias
    pub async fn set_alias_active(&self, alias_id: i64, active: bool) -> DatabaseResult<bool> {
        let result = sqlx::query("UPDATE aliases SET is_active = ?1 WHERE id = ?2")
            .bind(active)
            .bind(alias_id)
            .execute(&self.db.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Activate or deactivate a user; a deactivated user's aliases are
    /// neither synced nor allowed to send
    pub async fn set_user_active(&self, user_id: i64, active: bool) -> DatabaseResult<bool> {
        let result = sqlx::query("UPDATE users SET is_active = ?1 WHERE id = ?2")
            .bind(active)
            .bind(user_id)
            .execute(&self.db.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    fn row_to_record(row: &SqliteRow) -> AliasRecord {
        AliasRecord {
            id: row.get("id"),
            user_id: row.get("user_id"),
            email: row.get("email"),
            name: row.get("name"),
            is_active: row.get("is_active"),
        }
    }

    /// Build a target from an alias row, falling back to configured defaults.
    /// Aliases without any password cannot be synced.
    fn row_to_target(&self, row: &SqliteRow) -> Option<MailboxTarget> {
        let record = Self::row_to_record(row);
        let password: Option<String> = row.get("imap_password");
        let Some(password) = password.or_else(|| self.imap.default_password.clone()) else {
            warn!("Alias {} has no mailbox password, skipping", record.email);
            return None;
        };

        let host: Option<String> = row.get("imap_host");
        let port: Option<i64> = row.get("imap_port");
        let username: Option<String> = row.get("imap_username");

        let imap = ImapConfig::new(
            host.unwrap_or_else(|| self.imap.host.clone()),
            port.and_then(|p| u16::try_from(p).ok()).unwrap_or(self.imap.port),
            username.unwrap_or_else(|| record.email.clone()),
            password,
        )
        .with_mailbox(self.imap.mailbox.clone())
        .with_timeout(self.imap.timeout_seconds)
        .with_certificate_validation(self.imap.validate_certificates);

        Some(MailboxTarget {
            alias_id: record.id,
            alias_email: record.email,
            user_id: record.user_id,
            imap,
        })
    }
}

#[async_trait]
impl AliasDirectory for SqliteAliasDirectory {
    async fn resolve_alias_by_address(&self, email: &str) -> DatabaseResult<Option<AliasRecord>> {
        let sql = format!("SELECT {} FROM {} WHERE a.email = ?1 COLLATE NOCASE", ALIAS_COLUMNS, ALIAS_FROM);
        let row = sqlx::query(&sql)
            .bind(email.trim())
            .fetch_optional(&self.db.pool)
            .await?;
        Ok(row.as_ref().map(Self::row_to_record))
    }

    async fn list_active_mailbox_targets(&self) -> DatabaseResult<Vec<MailboxTarget>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE a.is_active = TRUE AND u.is_active = TRUE ORDER BY a.id",
            ALIAS_COLUMNS, ALIAS_FROM
        );
        let rows = sqlx::query(&sql).fetch_all(&self.db.pool).await?;
        Ok(rows.iter().filter_map(|row| self.row_to_target(row)).collect())
    }

    async fn mailbox_target(&self, alias_id: i64) -> DatabaseResult<Option<MailboxTarget>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE a.id = ?1 AND a.is_active = TRUE AND u.is_active = TRUE",
            ALIAS_COLUMNS, ALIAS_FROM
        );
        let row = sqlx::query(&sql)
            .bind(alias_id)
            .fetch_optional(&self.db.pool)
            .await?;
        Ok(row.as_ref().and_then(|row| self.row_to_target(row)))
    }

    async fn owned_alias(&self, owner_user_id: i64, alias_id: i64) -> DatabaseResult<Option<AliasRecord>> {
        let sql = format!("SELECT {} FROM {} WHERE a.id = ?1 AND a.user_id = ?2", ALIAS_COLUMNS, ALIAS_FROM);
        let row = sqlx::query(&sql)
            .bind(alias_id)
            .bind(owner_user_id)
            .fetch_optional(&self.db.pool)
            .await?;
        Ok(row.as_ref().map(Self::row_to_record))
    }
}
