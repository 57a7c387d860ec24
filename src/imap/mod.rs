pub mod connection;
pub mod error;
pub mod protocol;
pub mod session;

pub use connection::{ImapConnection, ImapResponse};
pub use error::{ImapError, ImapResult};
pub use protocol::ImapProtocol;
pub use session::{ImapMailboxConnector, ImapSession, MailboxConnector, MailboxSession, MessageHandle};

/// IMAP capability flags the session cares about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImapCapability {
    Imap4Rev1,
    LoginDisabled,
    SaslIr,
    AuthPlain,
    Custom(String),
}

impl ImapCapability {
    /// Parse capability string into ImapCapability enum
    pub fn from_str(capability: &str) -> Self {
        match capability.to_uppercase().as_str() {
            "IMAP4REV1" => ImapCapability::Imap4Rev1,
            "LOGINDISABLED" => ImapCapability::LoginDisabled,
            "SASL-IR" => ImapCapability::SaslIr,
            "AUTH=PLAIN" => ImapCapability::AuthPlain,
            _ => ImapCapability::Custom(capability.to_string()),
        }
    }
}

/// Connection parameters for one remote mailbox.
///
/// The transport is always TLS. Certificate validation is off unless
/// explicitly enabled, which matches internal MX hosts with self-signed
/// certificates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImapConfig {
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub mailbox: String,
    pub timeout_seconds: u64,
    pub validate_certificates: bool,
}

impl ImapConfig {
    /// Create a new IMAP configuration with password auth
    pub fn new(hostname: String, port: u16, username: String, password: String) -> Self {
        Self {
            hostname,
            port,
            username,
            password,
            mailbox: "INBOX".to_string(),
            timeout_seconds: 60,
            validate_certificates: false,
        }
    }

    /// Select a different mailbox than INBOX
    pub fn with_mailbox<S: Into<String>>(mut self, mailbox: S) -> Self {
        self.mailbox = mailbox.into();
        self
    }

    /// Set connection and read timeout
    pub fn with_timeout(mut self, timeout_seconds: u64) -> Self {
        self.timeout_seconds = timeout_seconds;
        self
    }

    /// Set certificate validation
    pub fn with_certificate_validation(mut self, validate: bool) -> Self {
        self.validate_certificates = validate;
        self
    }

    /// `host:port`, used for logging and socket resolution
    pub fn address(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = ImapConfig::new(
            "mx.internal".to_string(),
            993,
            "sales@example.com".to_string(),
            "secret".to_string(),
        );
        assert_eq!(config.mailbox, "INBOX");
        assert_eq!(config.timeout_seconds, 60);
        assert!(!config.validate_certificates);
        assert_eq!(config.address(), "mx.internal:993");

        let strict = config.with_certificate_validation(true).with_timeout(5);
        assert!(strict.validate_certificates);
        assert_eq!(strict.timeout_seconds, 5);
    }

    #[test]
    fn test_capability_parsing() {
        assert_eq!(ImapCapability::from_str("auth=plain"), ImapCapability::AuthPlain);
        assert_eq!(ImapCapability::from_str("LOGINDISABLED"), ImapCapability::LoginDisabled);
        assert_eq!(
            ImapCapability::from_str("IDLE"),
            ImapCapability::Custom("IDLE".to_string())
        );
    }
}
