pub mod client;
pub mod service;

pub use client::{SmtpClient, SmtpConfig};
pub use service::{OutboundService, SendError, SendRequest};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// SMTP-related errors
#[derive(Error, Debug)]
pub enum SmtpError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Message send failed: {0}")]
    SendFailed(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid email address: {0}")]
    InvalidAddress(String),

    #[error("Address parse error: {0}")]
    AddressParseError(#[from] lettre::address::AddressError),

    #[error("Message build error: {0}")]
    MessageBuildError(#[from] lettre::error::Error),
}

pub type SmtpResult<T> = Result<T, SmtpError>;

/// SMTP connection security
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SmtpSecurity {
    /// No encryption (not recommended)
    None,
    /// STARTTLS (opportunistic encryption)
    #[default]
    StartTls,
    /// Direct TLS connection
    Tls,
}

/// A message ready for submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundEnvelope {
    pub message_id: String,
    pub from_addr: String,
    pub from_name: Option<String>,
    pub to_addrs: Vec<String>,
    pub cc_addrs: Vec<String>,
    pub bcc_addrs: Vec<String>,
    pub subject: String,
    pub body_text: String,
    pub body_html: String,
}

impl OutboundEnvelope {
    /// Every address the message is delivered to
    pub fn recipients(&self) -> impl Iterator<Item = &String> {
        self.to_addrs.iter().chain(&self.cc_addrs).chain(&self.bcc_addrs)
    }
}

/// Hands a composed message to the outside world
#[async_trait]
pub trait OutboundTransport: Send + Sync {
    /// Submit the message; returns the Message-ID it was sent under
    async fn submit(&self, envelope: &OutboundEnvelope) -> SmtpResult<String>;
}
