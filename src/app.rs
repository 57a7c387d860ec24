//! Wires the storage engine together and exposes its operations.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::{ConfigError, RelayConfig};
use crate::email::{
    AliasDirectory, AutoSyncConfig, AutoSyncScheduler, BlobError, BlobStore, DatabaseError, DatabaseStats,
    EmailDatabase, Folder, IngestOutcome, IngestionPipeline, ListQuery, MailboxStateMachine, MessageQueryEngine,
    MessageState, Page, SqliteAliasDirectory, StoredAttachment, StoredMessage, SweepReport, SyncError, SyncFailure,
    SyncResult,
};
use crate::imap::{ImapMailboxConnector, MailboxConnector};
use crate::smtp::{OutboundService, OutboundTransport, SendError, SendRequest, SmtpClient, SmtpConfig, SmtpError};

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Blob(#[from] BlobError),

    #[error(transparent)]
    Smtp(#[from] SmtpError),

    #[error(transparent)]
    Send(#[from] SendError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("Ingestion failed: {0}")]
    Ingest(#[from] SyncFailure),

    #[error("No alias with address {0}")]
    AliasNotFound(String),
}

pub type AppResult<T> = Result<T, AppError>;

/// The assembled engine
pub struct App {
    config: RelayConfig,
    database: EmailDatabase,
    blobs: BlobStore,
    directory: Arc<SqliteAliasDirectory>,
    pipeline: Arc<IngestionPipeline>,
    scheduler: AutoSyncScheduler,
    states: MailboxStateMachine,
    queries: MessageQueryEngine,
    outbound: OutboundService,
}

impl App {
    /// Open the configured database and blob directory with the real IMAP
    /// and SMTP collaborators
    pub async fn open(config: RelayConfig) -> AppResult<Self> {
        config.validate()?;
        let database = EmailDatabase::new(&config.database_url).await?;
        let blobs = BlobStore::open(config.attachments_dir.clone()).await?;
        let transport = SmtpClient::new(SmtpConfig::from(&config.smtp))?;

        Ok(Self::assemble(
            config,
            database,
            blobs,
            Arc::new(ImapMailboxConnector::new()),
            Arc::new(transport),
        ))
    }

    /// Build the engine around already-opened storage and the given
    /// collaborators
    pub fn assemble(
        config: RelayConfig,
        database: EmailDatabase,
        blobs: BlobStore,
        connector: Arc<dyn MailboxConnector>,
        transport: Arc<dyn OutboundTransport>,
    ) -> Self {
        let directory = Arc::new(SqliteAliasDirectory::new(database.clone(), config.imap.clone()));
        let pipeline = Arc::new(
            IngestionPipeline::new(database.clone(), blobs.clone(), directory.clone(), connector)
                .with_surrogate_identity(config.sync.surrogate_identity),
        );
        let scheduler = AutoSyncScheduler::new(pipeline.clone(), AutoSyncConfig::from(&config.sync));
        let states = MailboxStateMachine::new(database.clone());
        let queries = MessageQueryEngine::new(database.clone(), config.listing);
        let outbound = OutboundService::new(database.clone(), directory.clone(), transport);

        debug!("Engine assembled over {}", config.database_url);
        Self {
            config,
            database,
            blobs,
            directory,
            pipeline,
            scheduler,
            states,
            queries,
            outbound,
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn database(&self) -> &EmailDatabase {
        &self.database
    }

    /// Alias provisioning, for tools and tests; the engine itself only reads
    pub fn directory(&self) -> &SqliteAliasDirectory {
        &self.directory
    }

    pub fn scheduler(&self) -> &AutoSyncScheduler {
        &self.scheduler
    }

    /// One sync pass over every active mailbox
    pub async fn ingest_all_active_mailboxes(&self) -> AppResult<Vec<SyncResult>> {
        Ok(self.scheduler.run_once().await?)
    }

    /// Sync a single alias's mailbox now
    pub async fn ingest(&self, alias_email: &str) -> SyncResult {
        self.pipeline.ingest(alias_email).await
    }

    /// Store a raw RFC 5322 message for an alias without contacting its mailbox
    pub async fn import(&self, alias_email: &str, raw: &[u8]) -> AppResult<IngestOutcome> {
        let alias = self
            .directory
            .resolve_alias_by_address(alias_email)
            .await?
            .ok_or_else(|| AppError::AliasNotFound(alias_email.to_string()))?;
        Ok(self.pipeline.ingest_raw(alias.id, raw).await?)
    }

    pub async fn list(&self, owner: i64, query: &ListQuery) -> AppResult<Page<StoredMessage>> {
        Ok(self.queries.list(owner, query).await?)
    }

    pub async fn search(
        &self,
        owner: i64,
        text: &str,
        page: u32,
        page_size: Option<u32>,
    ) -> AppResult<Page<StoredMessage>> {
        Ok(self.queries.search(owner, text, page, page_size).await?)
    }

    /// Read a message without touching its flags
    pub async fn get_message(&self, owner: i64, message: i64) -> AppResult<Option<StoredMessage>> {
        Ok(self.queries.get_message(owner, message).await?)
    }

    /// Read a message as its owner opening it: an unread message becomes read
    pub async fn open_message(&self, owner: i64, message: i64) -> AppResult<Option<StoredMessage>> {
        let Some(mut stored) = self.queries.get_message(owner, message).await? else {
            return Ok(None);
        };
        if self.states.mark_read_on_view(owner, message).await? == Some(true) {
            stored.is_read = true;
        }
        Ok(Some(stored))
    }

    /// Attachment metadata of a visible message
    pub async fn attachments_for_message(&self, owner: i64, message: i64) -> AppResult<Option<Vec<StoredAttachment>>> {
        Ok(self.queries.get_message(owner, message).await?.map(|m| m.attachments))
    }

    /// Attachment metadata and content, if the owner can see it
    pub async fn read_attachment(&self, owner: i64, attachment: i64) -> AppResult<Option<(StoredAttachment, Vec<u8>)>> {
        let Some(meta) = self.queries.attachment(owner, attachment).await? else {
            return Ok(None);
        };
        let data = self.blobs.read(&meta.blob_name).await?;
        Ok(Some((meta, data)))
    }

    pub async fn mark_read(&self, owner: i64, message: i64) -> AppResult<Option<MessageState>> {
        Ok(self.states.mark_read(owner, message).await?)
    }

    pub async fn mark_unread(&self, owner: i64, message: i64) -> AppResult<Option<MessageState>> {
        Ok(self.states.mark_unread(owner, message).await?)
    }

    pub async fn star(&self, owner: i64, message: i64) -> AppResult<Option<MessageState>> {
        Ok(self.states.star(owner, message).await?)
    }

    pub async fn unstar(&self, owner: i64, message: i64) -> AppResult<Option<MessageState>> {
        Ok(self.states.unstar(owner, message).await?)
    }

    pub async fn move_to_folder(&self, owner: i64, message: i64, folder: Folder) -> AppResult<Option<MessageState>> {
        Ok(self.states.move_to_folder(owner, message, folder).await?)
    }

    pub async fn delete(&self, owner: i64, message: i64) -> AppResult<Option<MessageState>> {
        Ok(self.states.delete(owner, message).await?)
    }

    pub async fn send(&self, owner: i64, request: SendRequest) -> AppResult<StoredMessage> {
        Ok(self.outbound.send(owner, request).await?)
    }

    /// Remove blob files no attachment row refers to
    pub async fn sweep_orphans(&self) -> AppResult<SweepReport> {
        let referenced = self.database.attachment_blob_names().await?;
        let grace = Duration::from_secs(self.config.sync.orphan_grace_seconds);
        let report = self.blobs.sweep_orphans(&referenced, grace).await?;
        info!("Blob sweep: scanned {}, removed {}", report.scanned, report.removed.len());
        Ok(report)
    }

    pub async fn stats(&self) -> AppResult<DatabaseStats> {
        Ok(self.database.get_stats().await?)
    }
}
