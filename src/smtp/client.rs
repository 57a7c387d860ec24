use crate::config::SmtpSettings;
use crate::smtp::{OutboundEnvelope, OutboundTransport, SmtpError, SmtpResult, SmtpSecurity};
use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, Mailbox, MultiPart, SinglePart},
    transport::smtp::{
        authentication::{Credentials, Mechanism},
        client::{Tls, TlsParameters},
        PoolConfig,
    },
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use std::time::Duration;

/// SMTP client configuration
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub server: String,
    pub port: u16,
    pub security: SmtpSecurity,
    pub credentials: Option<(String, String)>,
    pub timeout: Duration,
    pub pool_max_size: u32,
}

impl SmtpConfig {
    pub fn new(server: String, port: u16) -> Self {
        Self {
            server,
            port,
            security: SmtpSecurity::StartTls,
            credentials: None,
            timeout: Duration::from_secs(30),
            pool_max_size: 10,
        }
    }

    pub fn with_security(mut self, security: SmtpSecurity) -> Self {
        self.security = security;
        self
    }

    pub fn with_credentials(mut self, username: String, password: String) -> Self {
        self.credentials = Some((username, password));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_pool_size(mut self, max_size: u32) -> Self {
        self.pool_max_size = max_size;
        self
    }
}

impl From<&SmtpSettings> for SmtpConfig {
    fn from(settings: &SmtpSettings) -> Self {
        let config = SmtpConfig::new(settings.host.clone(), settings.port)
            .with_security(settings.security)
            .with_timeout(Duration::from_secs(settings.timeout_seconds));
        match (&settings.username, &settings.password) {
            (Some(username), Some(password)) => config.with_credentials(username.clone(), password.clone()),
            _ => config,
        }
    }
}

/// Pooled lettre SMTP transport
#[derive(Clone)]
pub struct SmtpClient {
    config: SmtpConfig,
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpClient {
    /// Create a new SMTP client. No connection is made until the first send.
    pub fn new(config: SmtpConfig) -> SmtpResult<Self> {
        let transport = Self::build_transport(&config)?;
        Ok(Self { config, transport })
    }

    /// Build the lettre transport from configuration
    fn build_transport(config: &SmtpConfig) -> SmtpResult<AsyncSmtpTransport<Tokio1Executor>> {
        if config.server.is_empty() {
            return Err(SmtpError::InvalidConfig("SMTP server cannot be empty".to_string()));
        }
        if config.port == 0 {
            return Err(SmtpError::InvalidConfig("SMTP port cannot be zero".to_string()));
        }

        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.server)
            .port(config.port)
            .timeout(Some(config.timeout))
            .pool_config(PoolConfig::new().max_size(config.pool_max_size));

        builder = match config.security {
            SmtpSecurity::None => builder.tls(Tls::None),
            SmtpSecurity::StartTls => builder.tls(Tls::Opportunistic(Self::tls_parameters(config)?)),
            SmtpSecurity::Tls => builder.tls(Tls::Wrapper(Self::tls_parameters(config)?)),
        };

        if let Some((username, password)) = &config.credentials {
            builder = builder
                .credentials(Credentials::new(username.clone(), password.clone()))
                .authentication(vec![Mechanism::Plain, Mechanism::Login]);
        }

        Ok(builder.build())
    }

    fn tls_parameters(config: &SmtpConfig) -> SmtpResult<TlsParameters> {
        TlsParameters::builder(config.server.clone())
            .build()
            .map_err(|e| SmtpError::ConnectionFailed(format!("TLS configuration failed: {}", e)))
    }

    /// Test the SMTP connection
    pub async fn test_connection(&self) -> SmtpResult<()> {
        match self.transport.test_connection().await {
            Ok(true) => {
                tracing::info!("SMTP connection test successful for {}:{}", self.config.server, self.config.port);
                Ok(())
            }
            Ok(false) => Err(SmtpError::ConnectionFailed(format!(
                "{}:{} did not respond",
                self.config.server, self.config.port
            ))),
            Err(e) => {
                tracing::error!("SMTP connection test failed: {}", e);
                Err(SmtpError::ConnectionFailed(e.to_string()))
            }
        }
    }

    /// Get the current configuration
    pub fn config(&self) -> &SmtpConfig {
        &self.config
    }
}

/// Compose a MIME message: multipart/alternative when both bodies are
/// present, otherwise a single part.
pub fn build_message(envelope: &OutboundEnvelope) -> SmtpResult<Message> {
    let from = Mailbox::new(envelope.from_name.clone(), envelope.from_addr.parse()?);

    let mut builder = Message::builder()
        .message_id(Some(envelope.message_id.clone()))
        .from(from)
        .subject(envelope.subject.clone());
    for addr in &envelope.to_addrs {
        builder = builder.to(parse_mailbox(addr)?);
    }
    for addr in &envelope.cc_addrs {
        builder = builder.cc(parse_mailbox(addr)?);
    }
    for addr in &envelope.bcc_addrs {
        builder = builder.bcc(parse_mailbox(addr)?);
    }

    let message = match (envelope.body_text.is_empty(), envelope.body_html.is_empty()) {
        (false, false) => builder.multipart(MultiPart::alternative_plain_html(
            envelope.body_text.clone(),
            envelope.body_html.clone(),
        ))?,
        (true, false) => builder.singlepart(
            SinglePart::builder()
                .header(ContentType::TEXT_HTML)
                .body(envelope.body_html.clone()),
        )?,
        _ => builder.singlepart(
            SinglePart::builder()
                .header(ContentType::TEXT_PLAIN)
                .body(envelope.body_text.clone()),
        )?,
    };
    Ok(message)
}

fn parse_mailbox(addr: &str) -> SmtpResult<Mailbox> {
    addr.trim()
        .parse::<Mailbox>()
        .map_err(|e| SmtpError::InvalidAddress(format!("{}: {}", addr, e)))
}

#[async_trait]
impl OutboundTransport for SmtpClient {
    async fn submit(&self, envelope: &OutboundEnvelope) -> SmtpResult<String> {
        let message = build_message(envelope)?;

        match self.transport.send(message).await {
            Ok(_) => {
                tracing::info!(
                    "Email sent successfully: {} to {} recipients",
                    envelope.message_id,
                    envelope.recipients().count()
                );
                Ok(envelope.message_id.clone())
            }
            Err(e) => {
                tracing::error!("Failed to send email: {}", e);
                Err(SmtpError::SendFailed(e.to_string()))
            }
        }
    }
}
