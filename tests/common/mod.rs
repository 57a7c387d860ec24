//! Shared fixtures: scripted mailboxes, a recording transport and an engine
//! over a throwaway database.

#![allow(dead_code)]

use async_trait::async_trait;
use relaymail::config::RelayConfig;
use relaymail::email::{BlobStore, EmailDatabase, NewAlias};
use relaymail::imap::{ImapConfig, ImapError, ImapResult, MailboxConnector, MailboxSession, MessageHandle};
use relaymail::smtp::{OutboundEnvelope, OutboundTransport, SmtpError, SmtpResult};
use relaymail::App;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// What the fake server does for one mailbox login
#[derive(Debug, Clone)]
pub enum Script {
    Messages(Vec<Vec<u8>>),
    RejectLogin,
    Unreachable,
}

#[derive(Default)]
struct Gauge {
    active: AtomicUsize,
    peak: AtomicUsize,
    opened: AtomicUsize,
}

/// Connector serving scripted mailboxes keyed by login name
#[derive(Default)]
pub struct FakeConnector {
    scripts: Mutex<HashMap<String, Script>>,
    delay: Duration,
    gauge: Arc<Gauge>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every session holds its connection this long before listing
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn script(&self, username: &str, script: Script) {
        self.scripts.lock().unwrap().insert(username.to_string(), script);
    }

    /// Most sessions that were open at the same time
    pub fn peak_sessions(&self) -> usize {
        self.gauge.peak.load(Ordering::SeqCst)
    }

    pub fn sessions_opened(&self) -> usize {
        self.gauge.opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MailboxConnector for FakeConnector {
    async fn open(&self, config: &ImapConfig) -> ImapResult<Box<dyn MailboxSession>> {
        let script = self
            .scripts
            .lock()
            .unwrap()
            .get(&config.username)
            .cloned()
            .unwrap_or(Script::Messages(Vec::new()));

        let messages = match script {
            Script::Messages(messages) => messages,
            Script::RejectLogin => return Err(ImapError::authentication("invalid credentials")),
            Script::Unreachable => return Err(ImapError::connection("connection refused")),
        };

        self.gauge.opened.fetch_add(1, Ordering::SeqCst);
        let now = self.gauge.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.gauge.peak.fetch_max(now, Ordering::SeqCst);

        Ok(Box::new(FakeSession {
            messages,
            delay: self.delay,
            gauge: self.gauge.clone(),
            closed: false,
        }))
    }
}

struct FakeSession {
    messages: Vec<Vec<u8>>,
    delay: Duration,
    gauge: Arc<Gauge>,
    closed: bool,
}

#[async_trait]
impl MailboxSession for FakeSession {
    async fn list_unseen(&mut self) -> ImapResult<Vec<MessageHandle>> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok((1..=self.messages.len() as u32).map(|uid| MessageHandle { uid }).collect())
    }

    async fn fetch_raw(&mut self, handle: MessageHandle) -> ImapResult<Vec<u8>> {
        self.messages
            .get(handle.uid as usize - 1)
            .cloned()
            .ok_or_else(|| ImapError::message_not_found(handle.uid.to_string()))
    }

    async fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.gauge.active.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Transport that records what it was asked to send
#[derive(Default)]
pub struct RecordingTransport {
    pub sent: Mutex<Vec<OutboundEnvelope>>,
    pub fail: bool,
}

impl RecordingTransport {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn sent(&self) -> Vec<OutboundEnvelope> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl OutboundTransport for RecordingTransport {
    async fn submit(&self, envelope: &OutboundEnvelope) -> SmtpResult<String> {
        if self.fail {
            return Err(SmtpError::SendFailed("550 relay denied".to_string()));
        }
        self.sent.lock().unwrap().push(envelope.clone());
        Ok(envelope.message_id.clone())
    }
}

/// An engine over a temp directory, plus the fakes behind it
pub struct Harness {
    pub app: App,
    pub connector: Arc<FakeConnector>,
    pub transport: Arc<RecordingTransport>,
    pub dir: TempDir,
}

impl Harness {
    pub async fn new() -> Self {
        Self::build(FakeConnector::new(), RecordingTransport::default(), |_| {}).await
    }

    pub async fn build<F>(connector: FakeConnector, transport: RecordingTransport, configure: F) -> Self
    where
        F: FnOnce(&mut RelayConfig),
    {
        let dir = TempDir::new().unwrap();
        let mut config = RelayConfig {
            database_url: dir.path().join("relay.db").to_string_lossy().into_owned(),
            attachments_dir: dir.path().join("attachments"),
            ..RelayConfig::default()
        };
        configure(&mut config);

        let database = EmailDatabase::new(&config.database_url).await.unwrap();
        let blobs = BlobStore::open(config.attachments_dir.clone()).await.unwrap();
        let connector = Arc::new(connector);
        let transport = Arc::new(transport);
        let app = App::assemble(config, database, blobs, connector.clone(), transport.clone());

        Self {
            app,
            connector,
            transport,
            dir,
        }
    }

    /// A separate pool on the same database file
    pub async fn second_handle(&self) -> EmailDatabase {
        EmailDatabase::new(&self.app.config().database_url).await.unwrap()
    }

    pub async fn user(&self, email: &str) -> i64 {
        self.app.directory().create_user(email, None).await.unwrap()
    }

    /// Active alias with mailbox credentials; its login name is its address
    pub async fn alias(&self, owner: i64, email: &str) -> i64 {
        self.app
            .directory()
            .create_alias(&NewAlias {
                user_id: owner,
                email: email.to_string(),
                name: None,
                imap_password: Some("pw".to_string()),
                ..NewAlias::default()
            })
            .await
            .unwrap()
            .id
    }
}

/// A plain-text RFC 5322 message
pub fn raw_message(message_id: Option<&str>, from: &str, to: &[&str], subject: &str, body: &str) -> Vec<u8> {
    raw_message_dated(message_id, from, to, subject, body, "Mon, 06 Jan 2020 09:30:00 +0000")
}

pub fn raw_message_dated(
    message_id: Option<&str>,
    from: &str,
    to: &[&str],
    subject: &str,
    body: &str,
    date: &str,
) -> Vec<u8> {
    let mut raw = String::new();
    if let Some(id) = message_id {
        raw.push_str(&format!("Message-ID: {}\r\n", id));
    }
    raw.push_str(&format!("From: {}\r\n", from));
    raw.push_str(&format!("To: {}\r\n", to.join(", ")));
    raw.push_str(&format!("Subject: {}\r\n", subject));
    raw.push_str(&format!("Date: {}\r\n", date));
    raw.push_str("Content-Type: text/plain; charset=utf-8\r\n\r\n");
    raw.push_str(body);
    raw.push_str("\r\n");
    raw.into_bytes()
}

/// A message with a text body and two attachments: 8 bytes of PDF and 5 bytes
/// of CSV
pub fn raw_with_attachments(message_id: &str) -> Vec<u8> {
    format!(
        "Message-ID: {}\r\n\
From: billing@vendor.test\r\n\
To: sales@relay.test\r\n\
Subject: Invoice\r\n\
Date: Tue, 01 Jul 2025 10:00:00 +0000\r\n\
MIME-Version: 1.0\r\n\
Content-Type: multipart/mixed; boundary=\"XYZ\"\r\n\
\r\n\
--XYZ\r\n\
Content-Type: text/plain\r\n\
\r\n\
See attached\r\n\
--XYZ\r\n\
Content-Type: application/pdf; name=\"invoice.pdf\"\r\n\
Content-Disposition: attachment; filename=\"invoice.pdf\"\r\n\
Content-Transfer-Encoding: base64\r\n\
\r\n\
JVBERi0xLjQ=\r\n\
--XYZ\r\n\
Content-Type: text/csv; name=\"lines.csv\"\r\n\
Content-Disposition: attachment; filename=\"lines.csv\"\r\n\
\r\n\
a,b,c\r\n\
--XYZ--\r\n",
        message_id
    )
    .into_bytes()
}
