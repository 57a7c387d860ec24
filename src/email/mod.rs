pub mod auto_sync_scheduler;
pub mod blob_store;
pub mod database;
pub mod directory;
pub mod ingest;
pub mod mailbox_state;
pub mod message;
pub mod search;

pub use auto_sync_scheduler::{AutoSyncConfig, AutoSyncScheduler, AutoSyncStats};
pub use blob_store::{BlobError, BlobResult, BlobStore, SweepReport};
pub use database::{DatabaseError, DatabaseResult, DatabaseStats, EmailDatabase};
pub use directory::{AliasDirectory, AliasRecord, MailboxTarget, NewAlias, SqliteAliasDirectory};
pub use ingest::{FailureKind, IngestOutcome, IngestionPipeline, SyncError, SyncFailure, SyncResult};
pub use mailbox_state::MailboxStateMachine;
pub use message::{
    Folder, MessageState, NewAttachment, NewMessage, Page, RecipientKind, SortDirection, SortField,
    StoredAttachment, StoredMessage,
};
pub use search::{ListQuery, MessageQueryEngine};
