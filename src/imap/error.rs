use std::fmt;
use std::io;
use thiserror::Error;

pub type ImapResult<T> = Result<T, ImapError>;

/// IMAP session errors
#[derive(Error, Debug)]
pub enum ImapError {
    /// IO error (network, file system, etc.)
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Authentication error
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Protocol error (invalid response, etc.)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Server error (NO/BAD response)
    #[error("Server error: {0}")]
    Server(String),

    /// TLS/SSL error
    #[error("TLS error: {0}")]
    Tls(String),

    /// Timeout error
    #[error("Operation timed out")]
    Timeout,

    /// Message not found
    #[error("Message not found: {0}")]
    MessageNotFound(String),

    /// Invalid state for operation
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl ImapError {
    pub fn connection<S: Into<String>>(msg: S) -> Self {
        ImapError::Connection(msg.into())
    }

    pub fn authentication<S: Into<String>>(msg: S) -> Self {
        ImapError::Authentication(msg.into())
    }

    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        ImapError::Protocol(msg.into())
    }

    pub fn server<S: Into<String>>(msg: S) -> Self {
        ImapError::Server(msg.into())
    }

    pub fn tls<S: Into<String>>(msg: S) -> Self {
        ImapError::Tls(msg.into())
    }

    pub fn message_not_found<S: Into<String>>(msg: S) -> Self {
        ImapError::MessageNotFound(msg.into())
    }

    pub fn invalid_state<S: Into<String>>(msg: S) -> Self {
        ImapError::InvalidState(msg.into())
    }

    /// Check if this is a connection-related error.
    ///
    /// Once one of these occurs the session is unusable and the remaining
    /// work for the mailbox has to wait for the next tick.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            ImapError::Io(_) | ImapError::Connection(_) | ImapError::Timeout | ImapError::Tls(_)
        )
    }

    /// Check if this is an authentication error
    pub fn is_auth_error(&self) -> bool {
        matches!(self, ImapError::Authentication(_))
    }
}

/// Status of a tagged IMAP response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseStatus {
    Ok,
    No,
    Bad,
}

impl fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseStatus::Ok => write!(f, "OK"),
            ResponseStatus::No => write!(f, "NO"),
            ResponseStatus::Bad => write!(f, "BAD"),
        }
    }
}

impl ResponseStatus {
    /// Parse the status word that follows a command tag
    pub fn parse(status: &str) -> Option<Self> {
        match status.to_ascii_uppercase().as_str() {
            "OK" => Some(ResponseStatus::Ok),
            "NO" => Some(ResponseStatus::No),
            "BAD" => Some(ResponseStatus::Bad),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ResponseStatus::Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_class_errors() {
        assert!(ImapError::Timeout.is_connection_error());
        assert!(ImapError::connection("reset").is_connection_error());
        assert!(ImapError::tls("bad handshake").is_connection_error());
        assert!(!ImapError::server("NO mailbox").is_connection_error());
        assert!(!ImapError::message_not_found("uid 4").is_connection_error());
        assert!(ImapError::authentication("denied").is_auth_error());
    }

    #[test]
    fn test_response_status_parse() {
        assert_eq!(ResponseStatus::parse("ok"), Some(ResponseStatus::Ok));
        assert_eq!(ResponseStatus::parse("NO"), Some(ResponseStatus::No));
        assert_eq!(ResponseStatus::parse("BAD"), Some(ResponseStatus::Bad));
        assert_eq!(ResponseStatus::parse("BYE"), None);
        assert!(ResponseStatus::Ok.is_success());
        assert!(!ResponseStatus::No.is_success());
    }
}
