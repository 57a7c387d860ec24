use crate::email::message::{
    Folder, NewAttachment, NewMessage, RecipientKind, StoredAttachment, StoredMessage,
};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Database-related errors
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Database connection error: {0}")]
    Connection(#[from] sqlx::Error),

    #[error("Database file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Date parsing error: {0}")]
    DateParse(#[from] chrono::ParseError),

    #[error("Invalid stored data: {0}")]
    InvalidData(String),
}

impl DatabaseError {
    /// Text safe to show to an end user. Internal details stay in the logs.
    pub fn public_message(&self) -> &'static str {
        "Internal storage error"
    }
}

pub type DatabaseResult<T> = Result<T, DatabaseError>;

/// Column list for message reads; callers join `aliases a ON a.id = m.alias_id`
pub(crate) const MESSAGE_COLUMNS: &str = "m.id, m.message_id, m.alias_id, a.email AS alias_email, \
     a.name AS alias_name, m.from_addr, m.from_name, m.subject, m.body_text, m.body_html, m.size, \
     m.is_read, m.is_starred, m.is_deleted, m.folder, m.created_at, m.received_at";

/// Database statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseStats {
    pub message_count: u32,
    pub unread_count: u32,
    pub tombstone_count: u32,
    pub attachment_count: u32,
    pub user_count: u32,
    pub alias_count: u32,
    pub db_size_bytes: u64,
}

/// Shared handle over the relay's SQLite store. Clones share one pool.
#[derive(Debug, Clone)]
pub struct EmailDatabase {
    pub pool: SqlitePool,
    db_path: String,
}

impl EmailDatabase {
    /// Open (creating if needed) the database at `db_path` and run migrations.
    ///
    /// Accepts either a plain file path or a `sqlite:` URL.
    pub async fn new(db_path: &str) -> DatabaseResult<Self> {
        let options = if db_path.starts_with("sqlite:") {
            SqliteConnectOptions::from_str(db_path)?
        } else {
            if let Some(parent) = Path::new(db_path).parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await?;
            }
            SqliteConnectOptions::new().filename(db_path)
        };
        let options = options
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(20)
            .connect_with(options)
            .await
            .map_err(DatabaseError::Connection)?;

        let db = Self {
            pool,
            db_path: db_path.trim_start_matches("sqlite://").trim_start_matches("sqlite:").to_string(),
        };

        db.migrate().await?;

        Ok(db)
    }

    /// Create a new in-memory database for testing.
    ///
    /// The pool holds exactly one connection that never expires, since every
    /// new in-memory connection would be an empty database.
    pub async fn new_in_memory() -> DatabaseResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(DatabaseError::Connection)?;

        let db = Self {
            pool,
            db_path: ":memory:".to_string(),
        };

        db.migrate().await?;

        Ok(db)
    }

    /// Run database migrations
    async fn migrate(&self) -> DatabaseResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                email TEXT NOT NULL UNIQUE,
                name TEXT,
                is_active BOOLEAN NOT NULL DEFAULT TRUE,
                created_at TEXT NOT NULL
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        self.migrate_add_user_active().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS aliases (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL REFERENCES users(id),
                email TEXT NOT NULL UNIQUE COLLATE NOCASE,
                name TEXT,
                is_active BOOLEAN NOT NULL DEFAULT TRUE,
                -- Remote mailbox credentials; host/port fall back to configured defaults
                imap_host TEXT,
                imap_port INTEGER,
                imap_username TEXT,
                imap_password TEXT,
                created_at TEXT NOT NULL
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                message_id TEXT NOT NULL UNIQUE,
                alias_id INTEGER NOT NULL REFERENCES aliases(id),

                -- Headers
                from_addr TEXT NOT NULL,
                from_name TEXT,
                subject TEXT NOT NULL DEFAULT '',

                -- Content
                body_text TEXT,
                body_html TEXT,
                size INTEGER NOT NULL DEFAULT 0,

                -- Mailbox state
                is_read BOOLEAN NOT NULL DEFAULT FALSE,
                is_starred BOOLEAN NOT NULL DEFAULT FALSE,
                is_deleted BOOLEAN NOT NULL DEFAULT FALSE,
                folder TEXT NOT NULL DEFAULT 'inbox'
                    CHECK (folder IN ('inbox', 'sent', 'drafts', 'trash', 'spam')),

                created_at TEXT NOT NULL,
                received_at TEXT
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS message_recipients (
                message_id INTEGER NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
                kind TEXT NOT NULL CHECK (kind IN ('to', 'cc', 'bcc')),
                position INTEGER NOT NULL,
                address TEXT NOT NULL,
                PRIMARY KEY (message_id, kind, position)
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS attachments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                message_id INTEGER NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
                filename TEXT NOT NULL,
                content_type TEXT NOT NULL,
                size INTEGER NOT NULL,
                blob_name TEXT NOT NULL UNIQUE,
                created_at TEXT NOT NULL
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        // Create indexes for performance
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_aliases_user ON aliases(user_id)").execute(&self.pool).await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_alias_folder ON messages(alias_id, folder, is_deleted)").execute(&self.pool).await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_created ON messages(created_at DESC)").execute(&self.pool).await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_messages_from ON messages(from_addr)").execute(&self.pool).await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_recipients_address ON message_recipients(address)").execute(&self.pool).await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_attachments_message ON attachments(message_id)").execute(&self.pool).await?;

        // Full-text search virtual table
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE IF NOT EXISTS messages_fts USING fts5(
                subject,
                body_text,
                body_html,
                content='messages',
                content_rowid='id'
            )
        "#,
        )
        .execute(&self.pool)
        .await?;

        // Triggers to keep FTS table in sync. Flag and folder updates do not
        // touch indexed columns, so the update trigger is column-scoped.
        sqlx::query(
            r#"
            CREATE TRIGGER IF NOT EXISTS messages_fts_insert AFTER INSERT ON messages BEGIN
                INSERT INTO messages_fts(rowid, subject, body_text, body_html)
                VALUES (new.id, new.subject, new.body_text, new.body_html);
            END
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TRIGGER IF NOT EXISTS messages_fts_delete AFTER DELETE ON messages BEGIN
                INSERT INTO messages_fts(messages_fts, rowid, subject, body_text, body_html)
                VALUES ('delete', old.id, old.subject, old.body_text, old.body_html);
            END
        "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TRIGGER IF NOT EXISTS messages_fts_update
            AFTER UPDATE OF subject, body_text, body_html ON messages BEGIN
                INSERT INTO messages_fts(messages_fts, rowid, subject, body_text, body_html)
                VALUES ('delete', old.id, old.subject, old.body_text, old.body_html);
                INSERT INTO messages_fts(rowid, subject, body_text, body_html)
                VALUES (new.id, new.subject, new.body_text, new.body_html);
            END
        "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Stores created before users could be deactivated lack `users.is_active`
    async fn migrate_add_user_active(&self) -> DatabaseResult<()> {
        let existing = sqlx::query("SELECT is_active FROM users LIMIT 1")
            .fetch_optional(&self.pool)
            .await;
        if existing.is_err() {
            debug!("Migrating database: adding users.is_active");
            if let Err(e) = sqlx::query("ALTER TABLE users ADD COLUMN is_active BOOLEAN NOT NULL DEFAULT TRUE")
                .execute(&self.pool)
                .await
            {
                if !e.to_string().contains("duplicate column") {
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    /// Insert a message and its recipients in one transaction.
    ///
    /// Returns `None` when a row with the same `message_id` already exists;
    /// the UNIQUE constraint is the authoritative duplicate check.
    pub async fn insert_message(&self, message: &NewMessage) -> DatabaseResult<Option<i64>> {
        let mut tx = self.pool.begin().await?;

        let inserted: Option<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO messages (
                message_id, alias_id, from_addr, from_name, subject,
                body_text, body_html, size,
                is_read, is_starred, is_deleted, folder,
                created_at, received_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            ON CONFLICT(message_id) DO NOTHING
            RETURNING id
        "#,
        )
        .bind(&message.message_id)
        .bind(message.alias_id)
        .bind(&message.from_addr)
        .bind(&message.from_name)
        .bind(&message.subject)
        .bind(&message.body_text)
        .bind(&message.body_html)
        .bind(message.size as i64)
        .bind(message.state.is_read)
        .bind(message.state.is_starred)
        .bind(message.state.is_deleted)
        .bind(message.state.folder.as_str())
        .bind(format_timestamp(&Utc::now()))
        .bind(message.received_at.as_ref().map(format_timestamp))
        .fetch_optional(&mut *tx)
        .await?;

        let Some(id) = inserted else {
            tx.rollback().await?;
            return Ok(None);
        };

        let groups = [
            (RecipientKind::To, &message.to_addrs),
            (RecipientKind::Cc, &message.cc_addrs),
            (RecipientKind::Bcc, &message.bcc_addrs),
        ];
        for (kind, addresses) in groups {
            for (position, address) in addresses.iter().enumerate() {
                sqlx::query(
                    "INSERT INTO message_recipients (message_id, kind, position, address) VALUES (?1, ?2, ?3, ?4)",
                )
                .bind(id)
                .bind(kind.as_str())
                .bind(position as i64)
                .bind(address)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(Some(id))
    }

    /// Whether a message with this identity key is already stored
    pub async fn message_exists(&self, message_id: &str) -> DatabaseResult<bool> {
        let found: Option<i64> = sqlx::query_scalar("SELECT id FROM messages WHERE message_id = ?1")
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    /// Insert an attachment row for an existing message
    pub async fn insert_attachment(&self, attachment: &NewAttachment) -> DatabaseResult<StoredAttachment> {
        let created_at = Utc::now();
        let mut tx = self.pool.begin().await?;
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO attachments (message_id, filename, content_type, size, blob_name, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            RETURNING id
        "#,
        )
        .bind(attachment.message_id)
        .bind(&attachment.filename)
        .bind(&attachment.content_type)
        .bind(attachment.size as i64)
        .bind(&attachment.blob_name)
        .bind(format_timestamp(&created_at))
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(StoredAttachment {
            id,
            message_id: attachment.message_id,
            filename: attachment.filename.clone(),
            content_type: attachment.content_type.clone(),
            size: attachment.size,
            blob_name: attachment.blob_name.clone(),
            created_at,
        })
    }

    /// Fetch a message by row id regardless of owner or tombstone state
    pub async fn get_message_by_id(&self, id: i64) -> DatabaseResult<Option<StoredMessage>> {
        let sql = format!(
            "SELECT {} FROM messages m JOIN aliases a ON a.id = m.alias_id WHERE m.id = ?1",
            MESSAGE_COLUMNS
        );
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;

        match row {
            Some(row) => Ok(self.hydrate(vec![row]).await?.pop()),
            None => Ok(None),
        }
    }

    /// Attachments of one message in insertion order
    pub async fn attachments_for_message(&self, message_id: i64) -> DatabaseResult<Vec<StoredAttachment>> {
        let rows = sqlx::query(
            r#"
            SELECT id, message_id, filename, content_type, size, blob_name, created_at
            FROM attachments WHERE message_id = ?1 ORDER BY id
        "#,
        )
        .bind(message_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_attachment).collect()
    }

    /// Every blob name referenced by an attachment row
    pub async fn attachment_blob_names(&self) -> DatabaseResult<HashSet<String>> {
        let names: Vec<String> = sqlx::query_scalar("SELECT blob_name FROM attachments")
            .fetch_all(&self.pool)
            .await?;
        Ok(names.into_iter().collect())
    }

    /// Get database statistics
    pub async fn get_stats(&self) -> DatabaseResult<DatabaseStats> {
        let message_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE is_deleted = FALSE")
            .fetch_one(&self.pool).await?;

        let unread_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE is_deleted = FALSE AND is_read = FALSE")
            .fetch_one(&self.pool).await?;

        let tombstone_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE is_deleted = TRUE")
            .fetch_one(&self.pool).await?;

        let attachment_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM attachments")
            .fetch_one(&self.pool).await?;

        let user_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users")
            .fetch_one(&self.pool).await?;

        let alias_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM aliases")
            .fetch_one(&self.pool).await?;

        let db_size = std::fs::metadata(&self.db_path)
            .map(|metadata| metadata.len())
            .unwrap_or(0);

        Ok(DatabaseStats {
            message_count: message_count as u32,
            unread_count: unread_count as u32,
            tombstone_count: tombstone_count as u32,
            attachment_count: attachment_count as u32,
            user_count: user_count as u32,
            alias_count: alias_count as u32,
            db_size_bytes: db_size,
        })
    }

    /// Turn message rows into full messages, loading recipients and
    /// attachments for the whole batch in two queries. Row order is kept.
    pub(crate) async fn hydrate(&self, rows: Vec<SqliteRow>) -> DatabaseResult<Vec<StoredMessage>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<i64> = rows.iter().map(|row| row.get::<i64, _>("id")).collect();

        let mut recipients: HashMap<i64, [Vec<String>; 3]> = HashMap::new();
        let mut query = QueryBuilder::<Sqlite>::new(
            "SELECT message_id, kind, address FROM message_recipients WHERE message_id IN (",
        );
        let mut separated = query.separated(", ");
        for id in &ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(") ORDER BY message_id, kind, position");
        for row in query.build().fetch_all(&self.pool).await? {
            let entry = recipients.entry(row.get("message_id")).or_default();
            let slot = match row.get::<String, _>("kind").as_str() {
                "to" => 0,
                "cc" => 1,
                "bcc" => 2,
                other => {
                    return Err(DatabaseError::InvalidData(format!("Unknown recipient kind: {}", other)))
                }
            };
            entry[slot].push(row.get("address"));
        }

        let mut attachments: HashMap<i64, Vec<StoredAttachment>> = HashMap::new();
        let mut query = QueryBuilder::<Sqlite>::new(
            "SELECT id, message_id, filename, content_type, size, blob_name, created_at \
             FROM attachments WHERE message_id IN (",
        );
        let mut separated = query.separated(", ");
        for id in &ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(") ORDER BY id");
        for row in query.build().fetch_all(&self.pool).await? {
            let attachment = row_to_attachment(row)?;
            attachments.entry(attachment.message_id).or_default().push(attachment);
        }

        let mut messages = Vec::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row.get("id");
            let [to_addrs, cc_addrs, bcc_addrs] = recipients.remove(&id).unwrap_or_default();
            let attachments = attachments.remove(&id).unwrap_or_default();
            messages.push(row_to_stored_message(row, to_addrs, cc_addrs, bcc_addrs, attachments)?);
        }

        Ok(messages)
    }
}

/// Fixed-width UTC timestamp so text ordering matches time ordering
pub(crate) fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(value: &str) -> DatabaseResult<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)?.with_timezone(&Utc))
}

pub(crate) fn parse_folder(value: &str) -> DatabaseResult<Folder> {
    value.parse::<Folder>().map_err(DatabaseError::InvalidData)
}

pub(crate) fn row_to_attachment(row: SqliteRow) -> DatabaseResult<StoredAttachment> {
    Ok(StoredAttachment {
        id: row.get("id"),
        message_id: row.get("message_id"),
        filename: row.get("filename"),
        content_type: row.get("content_type"),
        size: row.get::<i64, _>("size") as u64,
        blob_name: row.get("blob_name"),
        created_at: parse_timestamp(row.get("created_at"))?,
    })
}

fn row_to_stored_message(
    row: SqliteRow,
    to_addrs: Vec<String>,
    cc_addrs: Vec<String>,
    bcc_addrs: Vec<String>,
    attachments: Vec<StoredAttachment>,
) -> DatabaseResult<StoredMessage> {
    let received_at = match row.get::<Option<String>, _>("received_at") {
        Some(value) => Some(parse_timestamp(&value)?),
        None => None,
    };

    Ok(StoredMessage {
        id: row.get("id"),
        message_id: row.get("message_id"),
        alias_id: row.get("alias_id"),
        alias_email: row.get("alias_email"),
        alias_name: row.get("alias_name"),
        from_addr: row.get("from_addr"),
        from_name: row.get("from_name"),
        to_addrs,
        cc_addrs,
        bcc_addrs,
        subject: row.get("subject"),
        body_text: row.get("body_text"),
        body_html: row.get("body_html"),
        attachments,
        size: row.get::<i64, _>("size") as u64,
        is_read: row.get("is_read"),
        is_starred: row.get("is_starred"),
        is_deleted: row.get("is_deleted"),
        folder: parse_folder(row.get("folder"))?,
        created_at: parse_timestamp(row.get("created_at"))?,
        received_at,
    })
}
