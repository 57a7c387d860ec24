//! Read/star/move/delete transitions on stored messages.
//!
//! Every operation is keyed by `(owner, message)`. A message that does not
//! exist and a message owned by someone else look the same to the caller:
//! the operation returns `Ok(None)`. Each transition is one conditional
//! UPDATE committed in its own transaction, so concurrent operations on one
//! message serialize at the row and are visible to every pool connection
//! once the call returns.

use crate::email::database::{parse_folder, DatabaseResult, EmailDatabase};
use crate::email::message::{Folder, MessageState};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::debug;

const OWNED: &str = "alias_id IN (SELECT id FROM aliases WHERE user_id = ?)";
const RETURNING: &str = "RETURNING folder, is_read, is_starred, is_deleted";

/// State machine over the `messages` table
#[derive(Debug, Clone)]
pub struct MailboxStateMachine {
    db: EmailDatabase,
}

impl MailboxStateMachine {
    pub fn new(db: EmailDatabase) -> Self {
        Self { db }
    }

    pub async fn mark_read(&self, owner: i64, message: i64) -> DatabaseResult<Option<MessageState>> {
        self.set_flag(owner, message, "is_read", true).await
    }

    pub async fn mark_unread(&self, owner: i64, message: i64) -> DatabaseResult<Option<MessageState>> {
        self.set_flag(owner, message, "is_read", false).await
    }

    pub async fn star(&self, owner: i64, message: i64) -> DatabaseResult<Option<MessageState>> {
        self.set_flag(owner, message, "is_starred", true).await
    }

    pub async fn unstar(&self, owner: i64, message: i64) -> DatabaseResult<Option<MessageState>> {
        self.set_flag(owner, message, "is_starred", false).await
    }

    /// Place the message in `folder`
    pub async fn move_to_folder(
        &self,
        owner: i64,
        message: i64,
        folder: Folder,
    ) -> DatabaseResult<Option<MessageState>> {
        let sql = format!(
            "UPDATE messages SET folder = ? WHERE id = ? AND is_deleted = FALSE AND {} {}",
            OWNED, RETURNING
        );
        let mut tx = self.db.pool.begin().await?;
        let row = sqlx::query(&sql)
            .bind(folder.as_str())
            .bind(message)
            .bind(owner)
            .fetch_optional(&mut *tx)
            .await?;
        tx.commit().await?;
        debug!("Moved message {} to {}: {}", message, folder, row.is_some());
        row.as_ref().map(row_to_state).transpose()
    }

    /// Two-stage delete: outside trash the message moves to trash; inside
    /// trash it becomes a tombstone. Deleting a tombstone changes nothing and
    /// returns its state.
    pub async fn delete(&self, owner: i64, message: i64) -> DatabaseResult<Option<MessageState>> {
        let sql = format!(
            "UPDATE messages SET \
                 is_deleted = CASE WHEN folder = 'trash' THEN TRUE ELSE is_deleted END, \
                 folder = 'trash' \
             WHERE id = ? AND {} {}",
            OWNED, RETURNING
        );
        let mut tx = self.db.pool.begin().await?;
        let row = sqlx::query(&sql)
            .bind(message)
            .bind(owner)
            .fetch_optional(&mut *tx)
            .await?;
        tx.commit().await?;
        row.as_ref().map(row_to_state).transpose()
    }

    /// Mark a message read because its owner opened it.
    ///
    /// Returns `Some(true)` if the message was unread and is now read,
    /// `Some(false)` if it already was read, `None` if it is not visible.
    pub async fn mark_read_on_view(&self, owner: i64, message: i64) -> DatabaseResult<Option<bool>> {
        let sql = format!(
            "UPDATE messages SET is_read = TRUE \
             WHERE id = ? AND is_read = FALSE AND is_deleted = FALSE AND {} RETURNING id",
            OWNED
        );
        let mut tx = self.db.pool.begin().await?;
        let flipped = sqlx::query(&sql)
            .bind(message)
            .bind(owner)
            .fetch_optional(&mut *tx)
            .await?
            .is_some();
        tx.commit().await?;
        if flipped {
            return Ok(Some(true));
        }

        Ok(self.current_state(owner, message).await?.map(|_| false))
    }

    /// Current state of a visible (non-tombstoned) message
    pub async fn current_state(&self, owner: i64, message: i64) -> DatabaseResult<Option<MessageState>> {
        let sql = format!(
            "SELECT folder, is_read, is_starred, is_deleted FROM messages \
             WHERE id = ? AND is_deleted = FALSE AND {}",
            OWNED
        );
        let row = sqlx::query(&sql)
            .bind(message)
            .bind(owner)
            .fetch_optional(&self.db.pool)
            .await?;
        row.as_ref().map(row_to_state).transpose()
    }

    async fn set_flag(
        &self,
        owner: i64,
        message: i64,
        column: &'static str,
        value: bool,
    ) -> DatabaseResult<Option<MessageState>> {
        let sql = format!(
            "UPDATE messages SET {} = ? WHERE id = ? AND is_deleted = FALSE AND {} {}",
            column, OWNED, RETURNING
        );
        let mut tx = self.db.pool.begin().await?;
        let row = sqlx::query(&sql)
            .bind(value)
            .bind(message)
            .bind(owner)
            .fetch_optional(&mut *tx)
            .await?;
        tx.commit().await?;
        row.as_ref().map(row_to_state).transpose()
    }
}

fn row_to_state(row: &SqliteRow) -> DatabaseResult<MessageState> {
    Ok(MessageState {
        folder: parse_folder(row.get("folder"))?,
        is_read: row.get("is_read"),
        is_starred: row.get("is_starred"),
        is_deleted: row.get("is_deleted"),
    })
}
