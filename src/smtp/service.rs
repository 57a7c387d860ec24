//! Outbound send path: submit through a transport, then keep a copy in the
//! sender's `sent` folder.

use crate::email::database::{DatabaseError, EmailDatabase};
use crate::email::directory::{AliasDirectory, AliasRecord};
use crate::email::message::{MessageState, NewMessage, StoredMessage};
use crate::smtp::{OutboundEnvelope, OutboundTransport, SmtpError};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum SendError {
    /// The alias does not exist or belongs to someone else
    #[error("Alias {0} not found")]
    AliasNotFound(i64),

    #[error("Alias {0} is inactive")]
    AliasInactive(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Transport error: {0}")]
    Transport(#[from] SmtpError),

    #[error("Storage error: {0}")]
    Storage(#[from] DatabaseError),
}

/// What the caller wants sent
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendRequest {
    pub alias_id: i64,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub subject: String,
    pub body_text: String,
    pub body_html: String,
}

#[derive(Clone)]
pub struct OutboundService {
    db: EmailDatabase,
    directory: Arc<dyn AliasDirectory>,
    transport: Arc<dyn OutboundTransport>,
}

impl OutboundService {
    pub fn new(db: EmailDatabase, directory: Arc<dyn AliasDirectory>, transport: Arc<dyn OutboundTransport>) -> Self {
        Self {
            db,
            directory,
            transport,
        }
    }

    /// Send from one of `owner`'s aliases and store the message as sent.
    ///
    /// Nothing is stored when the transport rejects the message.
    pub async fn send(&self, owner: i64, request: SendRequest) -> Result<StoredMessage, SendError> {
        if request.to.iter().chain(&request.cc).chain(&request.bcc).all(|a| a.trim().is_empty()) {
            return Err(SendError::InvalidRequest("at least one recipient is required".to_string()));
        }

        let alias = self
            .directory
            .owned_alias(owner, request.alias_id)
            .await?
            .ok_or(SendError::AliasNotFound(request.alias_id))?;
        if !alias.is_active {
            return Err(SendError::AliasInactive(alias.email));
        }

        let envelope = envelope_for(&alias, &request);
        let message_id = self.transport.submit(&envelope).await?;

        let size = if envelope.body_text.is_empty() {
            envelope.body_html.len()
        } else {
            envelope.body_text.len()
        };
        let record = NewMessage {
            message_id: message_id.clone(),
            alias_id: alias.id,
            from_addr: envelope.from_addr,
            from_name: envelope.from_name,
            to_addrs: envelope.to_addrs,
            cc_addrs: envelope.cc_addrs,
            bcc_addrs: envelope.bcc_addrs,
            subject: envelope.subject,
            body_text: Some(envelope.body_text).filter(|b| !b.is_empty()),
            body_html: Some(envelope.body_html).filter(|b| !b.is_empty()),
            size: size as u64,
            state: MessageState::sent(),
            received_at: None,
        };

        let id = match self.db.insert_message(&record).await? {
            Some(id) => id,
            None => {
                warn!("Sent message {} collides with a stored message", message_id);
                return Err(DatabaseError::InvalidData(format!("Duplicate Message-ID {}", message_id)).into());
            }
        };
        info!("Sent {} from {}", message_id, alias.email);

        self.db
            .get_message_by_id(id)
            .await?
            .ok_or_else(|| DatabaseError::InvalidData(format!("Sent message {} vanished", id)).into())
    }
}

fn envelope_for(alias: &AliasRecord, request: &SendRequest) -> OutboundEnvelope {
    let display_name = alias
        .name
        .clone()
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| alias.email.split('@').next().unwrap_or_default().to_string());

    OutboundEnvelope {
        message_id: format!("<{}@{}>", uuid::Uuid::new_v4(), alias.domain()),
        from_addr: alias.email.clone(),
        from_name: Some(display_name),
        to_addrs: clean(&request.to),
        cc_addrs: clean(&request.cc),
        bcc_addrs: clean(&request.bcc),
        subject: request.subject.clone(),
        body_text: request.body_text.clone(),
        body_html: request.body_html.clone(),
    }
}

fn clean(addrs: &[String]) -> Vec<String> {
    addrs
        .iter()
        .map(|a| a.trim())
        .filter(|a| !a.is_empty())
        .map(str::to_string)
        .collect()
}
