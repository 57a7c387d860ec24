//! Ingestion pipeline: remote mailbox -> parser -> dedup -> message store and blob store.
//!
//! Failures are isolated at two levels. A failure on one message is recorded
//! in the mailbox's [`SyncResult`] and the next message is processed; a
//! connection failure ends the mailbox for this run and the scheduler moves
//! on to the next one.

use crate::email::blob_store::BlobStore;
use crate::email::database::{DatabaseError, EmailDatabase};
use crate::email::directory::{AliasDirectory, MailboxTarget};
use crate::email::message::{MessageState, NewAttachment, NewMessage};
use crate::imap::{MailboxConnector, MessageHandle};
use crate::mime::{identity_key, MessageParser, ParsedMessage, SurrogateIdentity};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Errors that abort a whole sync run rather than one mailbox
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Store unavailable: {0}")]
    StoreUnavailable(#[from] DatabaseError),
}

/// Category of a recorded per-mailbox or per-message failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    AliasNotFound,
    Connection,
    Authentication,
    Fetch,
    Parse,
    Storage,
    Attachment,
    /// The mailbox task itself failed (panicked or was cancelled)
    Internal,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::AliasNotFound => "alias not found",
            FailureKind::Connection => "connection",
            FailureKind::Authentication => "authentication",
            FailureKind::Fetch => "fetch",
            FailureKind::Parse => "parse",
            FailureKind::Storage => "storage",
            FailureKind::Attachment => "attachment",
            FailureKind::Internal => "internal",
        };
        f.write_str(name)
    }
}

/// One recorded failure
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind} error{}: {detail}", .context.as_ref().map(|c| format!(" ({})", c)).unwrap_or_default())]
pub struct SyncFailure {
    pub kind: FailureKind,
    /// Subject, identity key or UID of the affected message, when there is one
    pub context: Option<String>,
    pub detail: String,
}

impl SyncFailure {
    pub fn new<S: Into<String>>(kind: FailureKind, detail: S) -> Self {
        Self {
            kind,
            context: None,
            detail: detail.into(),
        }
    }

    pub fn with_context<S: Into<String>>(mut self, context: S) -> Self {
        self.context = Some(context.into());
        self
    }
}

/// Counters and failures for one mailbox
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncResult {
    pub alias_email: String,
    pub alias_id: Option<i64>,
    pub fetched: u32,
    pub stored: u32,
    pub skipped: u32,
    pub errors: Vec<SyncFailure>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl SyncResult {
    pub fn new<S: Into<String>>(alias_email: S, alias_id: Option<i64>) -> Self {
        Self {
            alias_email: alias_email.into(),
            alias_id,
            fetched: 0,
            stored: 0,
            skipped: 0,
            errors: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn record(&mut self, failure: SyncFailure) {
        warn!("{}: {}", self.alias_email, failure);
        self.errors.push(failure);
    }

    /// True when the mailbox could not be synced at all
    pub fn is_failed(&self) -> bool {
        self.errors.iter().any(|e| {
            matches!(
                e.kind,
                FailureKind::AliasNotFound
                    | FailureKind::Connection
                    | FailureKind::Authentication
                    | FailureKind::Internal
            )
        })
    }

    pub(crate) fn finish(mut self) -> Self {
        self.finished_at = Some(Utc::now());
        self
    }
}

/// Result of ingesting one raw message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Stored {
        id: i64,
        message_id: String,
        attachments_stored: usize,
        /// Attachments that could not be kept; the message itself was stored
        attachment_failures: Vec<SyncFailure>,
    },
    Duplicate {
        message_id: String,
    },
}

/// Pulls new messages for mailboxes and persists them
#[derive(Clone)]
pub struct IngestionPipeline {
    db: EmailDatabase,
    blobs: BlobStore,
    directory: Arc<dyn AliasDirectory>,
    connector: Arc<dyn MailboxConnector>,
    parser: MessageParser,
    surrogate: SurrogateIdentity,
}

impl IngestionPipeline {
    pub fn new(
        db: EmailDatabase,
        blobs: BlobStore,
        directory: Arc<dyn AliasDirectory>,
        connector: Arc<dyn MailboxConnector>,
    ) -> Self {
        Self {
            db,
            blobs,
            directory,
            connector,
            parser: MessageParser::new(),
            surrogate: SurrogateIdentity::default(),
        }
    }

    /// Choose how messages without a Message-ID are keyed
    pub fn with_surrogate_identity(mut self, surrogate: SurrogateIdentity) -> Self {
        self.surrogate = surrogate;
        self
    }

    pub fn directory(&self) -> &Arc<dyn AliasDirectory> {
        &self.directory
    }

    /// Sync the mailbox of one alias, looked up by address
    pub async fn ingest(&self, alias_email: &str) -> SyncResult {
        let alias = match self.directory.resolve_alias_by_address(alias_email).await {
            Ok(alias) => alias,
            Err(e) => {
                let mut result = SyncResult::new(alias_email, None);
                result.record(SyncFailure::new(FailureKind::Storage, e.to_string()));
                return result.finish();
            }
        };

        let Some(alias) = alias else {
            let mut result = SyncResult::new(alias_email, None);
            result.record(SyncFailure::new(FailureKind::AliasNotFound, alias_email));
            return result.finish();
        };

        match self.directory.mailbox_target(alias.id).await {
            Ok(Some(target)) => self.ingest_target(&target).await,
            Ok(None) => {
                let mut result = SyncResult::new(alias_email, Some(alias.id));
                result.record(SyncFailure::new(
                    FailureKind::AliasNotFound,
                    "alias is inactive or has no mailbox credentials",
                ));
                result.finish()
            }
            Err(e) => {
                let mut result = SyncResult::new(alias_email, Some(alias.id));
                result.record(SyncFailure::new(FailureKind::Storage, e.to_string()));
                result.finish()
            }
        }
    }

    /// Sync one resolved mailbox target
    pub async fn ingest_target(&self, target: &MailboxTarget) -> SyncResult {
        let mut result = SyncResult::new(target.alias_email.clone(), Some(target.alias_id));
        debug!("Syncing {} from {}", target.alias_email, target.imap.address());

        let mut session = match self.connector.open(&target.imap).await {
            Ok(session) => session,
            Err(e) => {
                let kind = if e.is_auth_error() {
                    FailureKind::Authentication
                } else {
                    FailureKind::Connection
                };
                result.record(SyncFailure::new(kind, e.to_string()));
                return result.finish();
            }
        };

        let handles = match session.list_unseen().await {
            Ok(handles) => handles,
            Err(e) => {
                result.record(SyncFailure::new(FailureKind::Connection, e.to_string()));
                session.close().await;
                return result.finish();
            }
        };

        debug!("{} unseen messages for {}", handles.len(), target.alias_email);

        for handle in handles {
            let raw = match session.fetch_raw(handle).await {
                Ok(raw) => raw,
                Err(e) if e.is_connection_error() => {
                    result.record(
                        SyncFailure::new(FailureKind::Connection, e.to_string()).with_context(uid_context(handle)),
                    );
                    break;
                }
                Err(e) => {
                    result.record(
                        SyncFailure::new(FailureKind::Fetch, e.to_string()).with_context(uid_context(handle)),
                    );
                    continue;
                }
            };
            result.fetched += 1;

            match self.ingest_raw(target.alias_id, &raw).await {
                Ok(IngestOutcome::Stored {
                    attachment_failures, ..
                }) => {
                    result.stored += 1;
                    for failure in attachment_failures {
                        result.record(failure);
                    }
                }
                Ok(IngestOutcome::Duplicate { message_id }) => {
                    debug!("Skipping duplicate {}", message_id);
                    result.skipped += 1;
                }
                Err(failure) => result.record(failure),
            }
        }

        session.close().await;

        let result = result.finish();
        info!(
            "Synced {}: fetched {}, stored {}, skipped {}, errors {}",
            result.alias_email,
            result.fetched,
            result.stored,
            result.skipped,
            result.errors.len()
        );
        result
    }

    /// Parse, deduplicate and persist one raw message for `alias_id`
    pub async fn ingest_raw(&self, alias_id: i64, raw: &[u8]) -> Result<IngestOutcome, SyncFailure> {
        let parsed = self
            .parser
            .parse(raw)
            .map_err(|e| SyncFailure::new(FailureKind::Parse, e.to_string()))?;

        let message_id = identity_key(&parsed, raw, self.surrogate);
        let context = describe(&parsed, &message_id);

        let exists = self
            .db
            .message_exists(&message_id)
            .await
            .map_err(|e| storage_failure(&e, &context))?;
        if exists {
            return Ok(IngestOutcome::Duplicate { message_id });
        }

        let new_message = NewMessage {
            message_id: message_id.clone(),
            alias_id,
            from_addr: parsed.from_addr.clone(),
            from_name: parsed.from_name.clone(),
            to_addrs: parsed.to_addrs.clone(),
            cc_addrs: parsed.cc_addrs.clone(),
            bcc_addrs: parsed.bcc_addrs.clone(),
            subject: parsed.subject.clone(),
            body_text: parsed.body_text.clone(),
            body_html: parsed.body_html.clone(),
            size: parsed.total_size() as u64,
            state: MessageState::ingested(),
            received_at: Some(parsed.date),
        };

        let inserted = self
            .db
            .insert_message(&new_message)
            .await
            .map_err(|e| storage_failure(&e, &context))?;
        let Some(id) = inserted else {
            // Lost a race with a concurrent ingestion of the same message
            return Ok(IngestOutcome::Duplicate { message_id });
        };

        let mut attachments_stored = 0;
        let mut attachment_failures = Vec::new();
        for attachment in &parsed.attachments {
            let blob_name = match self.blobs.write(&attachment.filename, &attachment.data).await {
                Ok(name) => name,
                Err(e) => {
                    attachment_failures.push(
                        SyncFailure::new(FailureKind::Attachment, e.to_string())
                            .with_context(format!("{}: {}", context, attachment.filename)),
                    );
                    continue;
                }
            };

            let row = NewAttachment {
                message_id: id,
                filename: attachment.filename.clone(),
                content_type: attachment.content_type.clone(),
                size: attachment.size() as u64,
                blob_name: blob_name.clone(),
            };
            match self.db.insert_attachment(&row).await {
                Ok(_) => attachments_stored += 1,
                Err(e) => {
                    error!("Failed to record attachment {}: {}", attachment.filename, e);
                    if let Err(remove_err) = self.blobs.remove(&blob_name).await {
                        warn!("Leaving orphaned blob {}: {}", blob_name, remove_err);
                    }
                    attachment_failures.push(
                        SyncFailure::new(FailureKind::Attachment, e.to_string())
                            .with_context(format!("{}: {}", context, attachment.filename)),
                    );
                }
            }
        }

        debug!("Stored {} with {} attachments", message_id, attachments_stored);
        Ok(IngestOutcome::Stored {
            id,
            message_id,
            attachments_stored,
            attachment_failures,
        })
    }
}

fn uid_context(handle: MessageHandle) -> String {
    format!("UID {}", handle.uid)
}

fn describe(parsed: &ParsedMessage, message_id: &str) -> String {
    if parsed.subject.is_empty() {
        message_id.to_string()
    } else {
        format!("{} {}", message_id, parsed.subject)
    }
}

fn storage_failure(e: &DatabaseError, context: &str) -> SyncFailure {
    error!("Storage failure for {}: {}", context, e);
    SyncFailure::new(FailureKind::Storage, e.to_string()).with_context(context)
}
