//! Transient per-mailbox sessions.
//!
//! The ingestion pipeline only needs four things from a remote mailbox: open
//! it, list the messages that are not yet seen, fetch one message's raw bytes
//! and close it. Those are expressed as the [`MailboxConnector`] and
//! [`MailboxSession`] traits so the pipeline can be exercised against fakes.

use crate::imap::connection::ConnectionState;
use crate::imap::{ImapCapability, ImapConfig, ImapConnection, ImapError, ImapProtocol, ImapResult};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

/// Reference to one message inside an open session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageHandle {
    pub uid: u32,
}

/// An open, authenticated connection to one mailbox
#[async_trait]
pub trait MailboxSession: Send {
    /// Handles of messages without the \Seen flag. Does not change any flags.
    async fn list_unseen(&mut self) -> ImapResult<Vec<MessageHandle>>;

    /// Raw RFC 5322 bytes of one message. Does not set \Seen.
    async fn fetch_raw(&mut self, handle: MessageHandle) -> ImapResult<Vec<u8>>;

    /// Log out and release the connection
    async fn close(&mut self);
}

/// Opens sessions for mailbox targets
#[async_trait]
pub trait MailboxConnector: Send + Sync {
    async fn open(&self, config: &ImapConfig) -> ImapResult<Box<dyn MailboxSession>>;
}

/// Connector that opens real IMAP-over-TLS sessions
#[derive(Debug, Clone, Default)]
pub struct ImapMailboxConnector;

impl ImapMailboxConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MailboxConnector for ImapMailboxConnector {
    async fn open(&self, config: &ImapConfig) -> ImapResult<Box<dyn MailboxSession>> {
        let connection = ImapConnection::connect_tls(config).await?;
        let session = ImapSession::establish(connection, config).await?;
        Ok(Box::new(session))
    }
}

/// IMAP session with the configured mailbox selected
pub struct ImapSession<S> {
    connection: ImapConnection<S>,
    mailbox: String,
}

impl<S> ImapSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap a raw stream and run greeting, login and SELECT on it
    pub async fn over_stream(stream: S, config: &ImapConfig) -> ImapResult<Self> {
        let connection =
            ImapConnection::from_stream(stream, Duration::from_secs(config.timeout_seconds));
        Self::establish(connection, config).await
    }

    /// Greet, authenticate and select the target mailbox
    pub async fn establish(mut connection: ImapConnection<S>, config: &ImapConfig) -> ImapResult<Self> {
        let greeting = connection.read_greeting().await?;

        if !connection.is_authenticated() {
            let response = connection.send_command(&ImapProtocol::format_capability()).await?;
            let mut capabilities = ImapProtocol::parse_capabilities(std::slice::from_ref(&greeting));
            capabilities.extend(ImapProtocol::parse_capabilities(&response.lines));

            let command = if capabilities.contains(&ImapCapability::LoginDisabled)
                && capabilities.contains(&ImapCapability::AuthPlain)
                && capabilities.contains(&ImapCapability::SaslIr)
            {
                ImapProtocol::format_authenticate_plain(&config.username, &config.password)
            } else if capabilities.contains(&ImapCapability::LoginDisabled) {
                return Err(ImapError::authentication(
                    "Server disables LOGIN and offers no usable SASL mechanism",
                ));
            } else {
                ImapProtocol::format_login(&config.username, &config.password)
            };

            connection.send_command(&command).await.map_err(|e| match e {
                ImapError::Server(msg) | ImapError::Protocol(msg) => ImapError::authentication(msg),
                other => other,
            })?;
            connection.set_state(ConnectionState::Authenticated);
            tracing::debug!("Authenticated to {} as {}", config.hostname, config.username);
        }

        connection.send_command(&ImapProtocol::format_select(&config.mailbox)).await?;
        connection.set_state(ConnectionState::Selected(config.mailbox.clone()));

        Ok(Self {
            connection,
            mailbox: config.mailbox.clone(),
        })
    }

    /// Name of the selected mailbox
    pub fn mailbox(&self) -> &str {
        &self.mailbox
    }
}

#[async_trait]
impl<S> MailboxSession for ImapSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn list_unseen(&mut self) -> ImapResult<Vec<MessageHandle>> {
        let response = self
            .connection
            .send_command(&ImapProtocol::format_uid_search_unseen())
            .await?;
        let uids = ImapProtocol::parse_search_response(&response.lines)?;
        Ok(uids.into_iter().map(|uid| MessageHandle { uid }).collect())
    }

    async fn fetch_raw(&mut self, handle: MessageHandle) -> ImapResult<Vec<u8>> {
        let response = self
            .connection
            .send_command(&ImapProtocol::format_uid_fetch_raw(handle.uid))
            .await?;

        response
            .literals
            .into_iter()
            .next()
            .ok_or_else(|| ImapError::message_not_found(format!("UID {} in {}", handle.uid, self.mailbox)))
    }

    async fn close(&mut self) {
        self.connection.logout().await;
    }
}
