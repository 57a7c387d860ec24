//! Raw RFC 5322 / MIME bytes to structured message fields.
//!
//! Decoding is delegated to `mail-parser`; this module decides what the store
//! keeps from it and which defaults apply when headers are missing.

use chrono::{DateTime, TimeZone, Utc};
use mail_parser::{Address, MimeHeaders, PartType};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

/// Raised when no header block can be located in the input at all
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Message is empty")]
    Empty,

    #[error("No header block found")]
    MissingHeaders,

    #[error("Malformed message: {0}")]
    Malformed(String),
}

/// One attachment pulled out of a parsed message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedAttachment {
    pub filename: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

impl ParsedAttachment {
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// Normalized view of a raw message
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedMessage {
    /// Message-ID in angle brackets, if the header was present and non-empty
    pub message_id: Option<String>,
    pub from_addr: String,
    pub from_name: Option<String>,
    pub to_addrs: Vec<String>,
    pub cc_addrs: Vec<String>,
    pub bcc_addrs: Vec<String>,
    pub subject: String,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    /// Date header, or parse time when it is missing or unreadable
    pub date: DateTime<Utc>,
    pub attachments: Vec<ParsedAttachment>,
}

impl ParsedMessage {
    /// Byte length of the body the store keeps for size accounting:
    /// plain text when present, otherwise HTML.
    pub fn body_size(&self) -> usize {
        match (&self.body_text, &self.body_html) {
            (Some(text), _) if !text.is_empty() => text.len(),
            (_, Some(html)) => html.len(),
            (Some(text), None) => text.len(),
            (None, None) => 0,
        }
    }

    /// Body size plus the size of every attachment
    pub fn total_size(&self) -> usize {
        self.body_size() + self.attachments.iter().map(|a| a.size()).sum::<usize>()
    }
}

/// How a message without a Message-ID is keyed for deduplication
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SurrogateIdentity {
    /// Fresh random key per ingestion; re-fetching the same message stores it again
    #[default]
    Random,
    /// SHA-256 of the raw bytes, so identical raw messages collapse to one row
    ContentHash,
}

/// Parser with the store's defaults baked in
#[derive(Debug, Clone, Default)]
pub struct MessageParser;

impl MessageParser {
    pub fn new() -> Self {
        Self
    }

    /// Parse raw message bytes
    pub fn parse(&self, raw: &[u8]) -> Result<ParsedMessage, ParseError> {
        let raw = strip_mbox_separator(raw);
        if raw.iter().all(|b| b.is_ascii_whitespace()) {
            return Err(ParseError::Empty);
        }
        if !has_header_block(raw) {
            return Err(ParseError::MissingHeaders);
        }

        let message = mail_parser::MessageParser::default()
            .parse(raw)
            .ok_or_else(|| ParseError::Malformed("unable to decode MIME structure".to_string()))?;

        if message.root_part().headers.is_empty() {
            return Err(ParseError::MissingHeaders);
        }

        let (from_addr, from_name) = message
            .from()
            .and_then(first_mailbox)
            .unwrap_or_default();

        let date = message
            .date()
            .and_then(|d| Utc.timestamp_opt(d.to_timestamp(), 0).single())
            .unwrap_or_else(Utc::now);

        let mut attachments = Vec::new();
        for part in message.attachments() {
            // Attached messages keep their raw form
            let data = match &part.body {
                PartType::Message(inner) => inner.raw_message.to_vec(),
                _ => part.contents().to_vec(),
            };
            let filename = part
                .attachment_name()
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| format!("attachment_{}", Uuid::new_v4()));
            let content_type = part
                .content_type()
                .map(|ct| match ct.subtype() {
                    Some(subtype) => format!("{}/{}", ct.ctype(), subtype),
                    None => ct.ctype().to_string(),
                })
                .unwrap_or_else(|| "application/octet-stream".to_string());

            attachments.push(ParsedAttachment {
                filename,
                content_type,
                data,
            });
        }

        Ok(ParsedMessage {
            message_id: message.message_id().and_then(normalize_message_id),
            from_addr,
            from_name,
            to_addrs: message.to().map(bare_addresses).unwrap_or_default(),
            cc_addrs: message.cc().map(bare_addresses).unwrap_or_default(),
            bcc_addrs: message.bcc().map(bare_addresses).unwrap_or_default(),
            subject: message.subject().unwrap_or_default().to_string(),
            body_text: message.body_text(0).map(|b| b.into_owned()),
            body_html: message.body_html(0).map(|b| b.into_owned()),
            date,
            attachments,
        })
    }
}

/// Wrap a Message-ID in angle brackets. Empty IDs yield `None`.
pub fn normalize_message_id(id: &str) -> Option<String> {
    let trimmed = id.trim().trim_start_matches('<').trim_end_matches('>').trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(format!("<{}>", trimmed))
    }
}

/// Deduplication key for a parsed message.
///
/// Uses the Message-ID when present, otherwise a surrogate in the
/// `<...@imported>` namespace.
pub fn identity_key(parsed: &ParsedMessage, raw: &[u8], surrogate: SurrogateIdentity) -> String {
    if let Some(id) = &parsed.message_id {
        return id.clone();
    }

    match surrogate {
        SurrogateIdentity::Random => format!("<{}@imported>", Uuid::new_v4()),
        SurrogateIdentity::ContentHash => {
            let digest = Sha256::digest(raw);
            let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
            format!("<{}@imported>", hex)
        }
    }
}

/// mbox exports start each message with a `From sender date` envelope line
/// that is not a header.
fn strip_mbox_separator(raw: &[u8]) -> &[u8] {
    if !raw.starts_with(b"From ") {
        return raw;
    }
    match raw.iter().position(|&b| b == b'\n') {
        Some(end) => &raw[end + 1..],
        None => &[],
    }
}

/// The first line must look like `Name: value` (or be a folded continuation
/// of a header, which cannot come first).
fn has_header_block(raw: &[u8]) -> bool {
    let text = String::from_utf8_lossy(&raw[..raw.len().min(4096)]);
    let Some(first) = text.lines().find(|l| !l.trim().is_empty()) else {
        return false;
    };
    if first.starts_with(' ') || first.starts_with('\t') {
        return false;
    }
    match first.split_once(':') {
        Some((name, _)) => {
            !name.is_empty() && name.bytes().all(|b| b.is_ascii_graphic() && b != b':')
        }
        None => false,
    }
}

fn first_mailbox(address: &Address<'_>) -> Option<(String, Option<String>)> {
    let addr = match address {
        Address::List(list) => list.first()?,
        Address::Group(groups) => groups.iter().flat_map(|g| g.addresses.iter()).next()?,
    };
    let email = addr.address.as_deref().unwrap_or_default().to_string();
    let name = addr
        .name
        .as_deref()
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(str::to_string);
    Some((email, name))
}

fn bare_addresses(address: &Address<'_>) -> Vec<String> {
    let addrs: Vec<_> = match address {
        Address::List(list) => list.iter().collect(),
        Address::Group(groups) => groups.iter().flat_map(|g| g.addresses.iter()).collect(),
    };
    addrs
        .into_iter()
        .filter_map(|a| a.address.as_deref())
        .map(|a| a.trim().to_string())
        .filter(|a| !a.is_empty())
        .collect()
}
