use crate::imap::error::ResponseStatus;
use crate::imap::{ImapConfig, ImapError, ImapProtocol, ImapResult};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::{client::TlsStream, TlsConnector};

/// IMAP connection state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    Authenticated,
    Selected(String), // Selected mailbox name
}

/// Everything the server sent for one tagged command
#[derive(Debug, Clone, Default)]
pub struct ImapResponse {
    /// Untagged and continuation lines, CRLF stripped
    pub lines: Vec<String>,
    /// Literal payloads in the order they appeared
    pub literals: Vec<Vec<u8>>,
    /// The final tagged status line
    pub status_line: String,
}

/// IMAP connection over any byte stream.
///
/// Production sessions run over `TlsStream<TcpStream>`; tests drive the same
/// code over an in-memory mock stream.
pub struct ImapConnection<S> {
    stream: BufReader<S>,
    state: ConnectionState,
    tag_counter: u32,
    timeout: Duration,
    greeting: Option<String>,
}

impl ImapConnection<TlsStream<TcpStream>> {
    /// Open a TCP connection and complete the TLS handshake.
    pub async fn connect_tls(config: &ImapConfig) -> ImapResult<Self> {
        let addr = config.address();
        let timeout_duration = Duration::from_secs(config.timeout_seconds);
        tracing::debug!("Attempting TCP connection to {} (timeout: {}s)", addr, config.timeout_seconds);

        let tcp_stream = timeout(timeout_duration, TcpStream::connect(addr.as_str()))
            .await
            .map_err(|_| {
                tracing::warn!("TCP connection to {} timed out after {}s", addr, config.timeout_seconds);
                ImapError::Timeout
            })?
            .map_err(|e| ImapError::connection(format!("Failed to connect to {}: {}", addr, e)))?;

        let tls_config = if config.validate_certificates {
            let mut root_store = RootCertStore::empty();
            root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth()
        } else {
            ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate))
                .with_no_client_auth()
        };

        let connector = TlsConnector::from(Arc::new(tls_config));
        let domain = ServerName::try_from(config.hostname.as_str())
            .map_err(|e| ImapError::tls(format!("Invalid hostname for TLS: {}", e)))?
            .to_owned();

        let tls_stream = timeout(timeout_duration, connector.connect(domain, tcp_stream))
            .await
            .map_err(|_| ImapError::Timeout)?
            .map_err(|e| ImapError::tls(format!("TLS handshake with {} failed: {}", addr, e)))?;

        tracing::debug!("TLS handshake with {} completed", addr);
        Ok(Self::from_stream(tls_stream, timeout_duration))
    }
}

impl<S> ImapConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap an already-established stream
    pub fn from_stream(stream: S, timeout: Duration) -> Self {
        Self {
            stream: BufReader::new(stream),
            state: ConnectionState::Connected,
            tag_counter: 0,
            timeout,
            greeting: None,
        }
    }

    /// Read and validate the server greeting
    pub async fn read_greeting(&mut self) -> ImapResult<String> {
        let greeting = self.read_line().await?;

        if greeting.starts_with("* PREAUTH") {
            self.state = ConnectionState::Authenticated;
        } else if !greeting.starts_with("* OK") {
            return Err(ImapError::server(format!("Invalid greeting: {}", greeting)));
        }

        self.greeting = Some(greeting.clone());
        Ok(greeting)
    }

    /// Send a command and collect the response up to its tagged status line
    pub async fn send_command(&mut self, command: &str) -> ImapResult<ImapResponse> {
        if self.state == ConnectionState::Disconnected {
            return Err(ImapError::invalid_state("Not connected"));
        }

        self.tag_counter += 1;
        let tag = format!("A{:04}", self.tag_counter);

        let verb = command.split_whitespace().next().unwrap_or("");
        if verb.eq_ignore_ascii_case("LOGIN") || verb.eq_ignore_ascii_case("AUTHENTICATE") {
            tracing::debug!("-> {} {} <redacted>", tag, verb);
        } else {
            tracing::debug!("-> {} {}", tag, command);
        }

        let full_command = format!("{} {}\r\n", tag, command);
        let write = async {
            self.stream.write_all(full_command.as_bytes()).await?;
            self.stream.flush().await
        };
        timeout(self.timeout, write)
            .await
            .map_err(|_| ImapError::Timeout)?
            .map_err(|e| ImapError::connection(format!("Failed to send command: {}", e)))?;

        let mut response = ImapResponse::default();
        let tag_prefix = format!("{} ", tag);
        loop {
            let line = self.read_line().await?;

            if let Some(status) = line.strip_prefix(&tag_prefix) {
                let word = status.split_whitespace().next().unwrap_or("");
                response.status_line = line.clone();
                return match ResponseStatus::parse(word) {
                    Some(ResponseStatus::Ok) => Ok(response),
                    Some(ResponseStatus::No) => {
                        Err(ImapError::server(format!("Command failed: {}", line)))
                    }
                    Some(ResponseStatus::Bad) => {
                        Err(ImapError::protocol(format!("Bad command: {}", line)))
                    }
                    None => Err(ImapError::protocol(format!("Unexpected tagged response: {}", line))),
                };
            }

            if let Some(size) = ImapProtocol::extract_literal_size(&line) {
                tracing::trace!("Reading literal of {} bytes", size);
                let literal = self.read_literal(size).await?;
                response.literals.push(literal);
            }

            if line.starts_with("* BYE") && !verb.eq_ignore_ascii_case("LOGOUT") {
                self.state = ConnectionState::Disconnected;
                return Err(ImapError::connection(format!("Server closed session: {}", line)));
            }

            response.lines.push(line);
        }
    }

    /// Send LOGOUT and drop the session state. Errors are logged, not returned,
    /// since the session is being discarded either way.
    pub async fn logout(&mut self) {
        if self.state == ConnectionState::Disconnected {
            return;
        }

        if let Err(e) = self.send_command(&ImapProtocol::format_logout()).await {
            tracing::debug!("LOGOUT failed: {}", e);
        }
        let _ = self.stream.shutdown().await;
        self.state = ConnectionState::Disconnected;
    }

    /// Read a single response line, CRLF stripped
    async fn read_line(&mut self) -> ImapResult<String> {
        let mut buffer = Vec::new();

        let read = timeout(self.timeout, self.stream.read_until(b'\n', &mut buffer))
            .await
            .map_err(|_| ImapError::Timeout)?
            .map_err(|e| ImapError::connection(format!("Failed to read response: {}", e)))?;

        if read == 0 {
            self.state = ConnectionState::Disconnected;
            return Err(ImapError::connection("Connection closed by server"));
        }

        if buffer.ends_with(b"\r\n") {
            buffer.truncate(buffer.len() - 2);
        } else if buffer.ends_with(b"\n") {
            buffer.truncate(buffer.len() - 1);
        }

        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }

    /// Read exact number of bytes from the server (for IMAP literals)
    async fn read_literal(&mut self, byte_count: usize) -> ImapResult<Vec<u8>> {
        let mut buffer = vec![0u8; byte_count];

        timeout(self.timeout, self.stream.read_exact(&mut buffer))
            .await
            .map_err(|_| ImapError::Timeout)?
            .map_err(|e| ImapError::connection(format!("Failed to read literal: {}", e)))?;

        Ok(buffer)
    }

    /// Get current connection state
    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// Get server greeting
    pub fn greeting(&self) -> Option<&String> {
        self.greeting.as_ref()
    }

    /// Check if authenticated
    pub fn is_authenticated(&self) -> bool {
        matches!(self.state, ConnectionState::Authenticated | ConnectionState::Selected(_))
    }

    /// Update connection state
    pub(crate) fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
    }
}

/// Certificate verifier used when validation is disabled for a target.
#[derive(Debug)]
struct AcceptAnyCertificate;

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    #[tokio::test]
    async fn test_send_command_collects_literals() {
        let mock = Builder::new()
            .read(b"* OK IMAP ready\r\n")
            .write(b"A0001 UID FETCH 7 BODY.PEEK[]\r\n")
            .read(b"* 1 FETCH (UID 7 BODY[] {5}\r\n")
            .read(b"hello")
            .read(b")\r\n")
            .read(b"A0001 OK FETCH completed\r\n")
            .build();

        let mut conn = ImapConnection::from_stream(mock, Duration::from_secs(5));
        conn.read_greeting().await.unwrap();
        let response = conn.send_command("UID FETCH 7 BODY.PEEK[]").await.unwrap();

        assert_eq!(response.literals, vec![b"hello".to_vec()]);
        assert_eq!(response.status_line, "A0001 OK FETCH completed");
        assert_eq!(response.lines[0], "* 1 FETCH (UID 7 BODY[] {5}");
    }

    #[tokio::test]
    async fn test_tagged_no_is_server_error() {
        let mock = Builder::new()
            .read(b"* OK ready\r\n")
            .write(b"A0001 SELECT \"Missing\"\r\n")
            .read(b"A0001 NO Mailbox does not exist\r\n")
            .build();

        let mut conn = ImapConnection::from_stream(mock, Duration::from_secs(5));
        conn.read_greeting().await.unwrap();
        let err = conn.send_command("SELECT \"Missing\"").await.unwrap_err();
        assert!(matches!(err, ImapError::Server(_)));
        assert!(!err.is_connection_error());
    }

    #[tokio::test]
    async fn test_invalid_greeting_rejected() {
        let mock = Builder::new().read(b"HTTP/1.1 400 Bad Request\r\n").build();
        let mut conn = ImapConnection::from_stream(mock, Duration::from_secs(5));
        assert!(conn.read_greeting().await.is_err());
    }

    #[tokio::test]
    async fn test_closed_stream_is_connection_error() {
        let mock = Builder::new().read(b"* OK ready\r\n").write(b"A0001 CAPABILITY\r\n").build();
        let mut conn = ImapConnection::from_stream(mock, Duration::from_secs(5));
        conn.read_greeting().await.unwrap();
        let err = conn.send_command("CAPABILITY").await.unwrap_err();
        assert!(err.is_connection_error());
        assert_eq!(conn.state(), &ConnectionState::Disconnected);
    }
}
