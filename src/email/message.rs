use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Folder a stored message is placed in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Folder {
    Inbox,
    Sent,
    Drafts,
    Trash,
    Spam,
}

impl Folder {
    pub const ALL: [Folder; 5] = [
        Folder::Inbox,
        Folder::Sent,
        Folder::Drafts,
        Folder::Trash,
        Folder::Spam,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Folder::Inbox => "inbox",
            Folder::Sent => "sent",
            Folder::Drafts => "drafts",
            Folder::Trash => "trash",
            Folder::Spam => "spam",
        }
    }
}

impl fmt::Display for Folder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Folder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "inbox" => Ok(Folder::Inbox),
            "sent" => Ok(Folder::Sent),
            "drafts" => Ok(Folder::Drafts),
            "trash" => Ok(Folder::Trash),
            "spam" => Ok(Folder::Spam),
            other => Err(format!("Invalid folder: {}", other)),
        }
    }
}

/// Mutable mailbox state of one message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageState {
    pub folder: Folder,
    pub is_read: bool,
    pub is_starred: bool,
    pub is_deleted: bool,
}

impl MessageState {
    /// State of a freshly ingested message
    pub fn ingested() -> Self {
        Self {
            folder: Folder::Inbox,
            is_read: false,
            is_starred: false,
            is_deleted: false,
        }
    }

    /// State of a message written by the send path
    pub fn sent() -> Self {
        Self {
            folder: Folder::Sent,
            is_read: true,
            is_starred: false,
            is_deleted: false,
        }
    }
}

/// Attachment metadata row; the bytes live in the blob store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredAttachment {
    pub id: i64,
    pub message_id: i64,
    pub filename: String,
    pub content_type: String,
    pub size: u64,
    pub blob_name: String,
    pub created_at: DateTime<Utc>,
}

/// Message as read back from the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: i64,
    pub message_id: String,
    pub alias_id: i64,
    /// Owning alias address and display name, joined in on read
    pub alias_email: String,
    pub alias_name: Option<String>,
    pub from_addr: String,
    pub from_name: Option<String>,
    pub to_addrs: Vec<String>,
    pub cc_addrs: Vec<String>,
    pub bcc_addrs: Vec<String>,
    pub subject: String,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    pub attachments: Vec<StoredAttachment>,
    pub size: u64,
    pub is_read: bool,
    pub is_starred: bool,
    pub is_deleted: bool,
    pub folder: Folder,
    /// Local ingestion/creation time
    pub created_at: DateTime<Utc>,
    /// Date the remote protocol reported; `None` for locally sent messages
    pub received_at: Option<DateTime<Utc>>,
}

impl StoredMessage {
    pub fn state(&self) -> MessageState {
        MessageState {
            folder: self.folder,
            is_read: self.is_read,
            is_starred: self.is_starred,
            is_deleted: self.is_deleted,
        }
    }
}

/// Insert payload for a message row and its recipients
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub message_id: String,
    pub alias_id: i64,
    pub from_addr: String,
    pub from_name: Option<String>,
    pub to_addrs: Vec<String>,
    pub cc_addrs: Vec<String>,
    pub bcc_addrs: Vec<String>,
    pub subject: String,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    pub size: u64,
    pub state: MessageState,
    pub received_at: Option<DateTime<Utc>>,
}

/// Insert payload for one attachment row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAttachment {
    pub message_id: i64,
    pub filename: String,
    pub content_type: String,
    pub size: u64,
    pub blob_name: String,
}

/// Recipient kind in the `message_recipients` table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecipientKind {
    To,
    Cc,
    Bcc,
}

impl RecipientKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecipientKind::To => "to",
            RecipientKind::Cc => "cc",
            RecipientKind::Bcc => "bcc",
        }
    }
}

/// Column a listing can be ordered by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    #[default]
    CreatedAt,
    Subject,
    FromAddr,
}

impl SortField {
    pub fn column(&self) -> &'static str {
        match self {
            SortField::CreatedAt => "m.created_at",
            SortField::Subject => "m.subject",
            SortField::FromAddr => "m.from_addr",
        }
    }
}

impl FromStr for SortField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created_at" => Ok(SortField::CreatedAt),
            "subject" => Ok(SortField::Subject),
            // Older clients send the sender column as from_email
            "from_addr" | "from_email" => Ok(SortField::FromAddr),
            other => Err(format!("Unsupported sort field: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    #[default]
    Desc,
}

impl SortDirection {
    pub fn keyword(&self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

impl FromStr for SortDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "asc" => Ok(SortDirection::Asc),
            "desc" => Ok(SortDirection::Desc),
            other => Err(format!("Unsupported sort direction: {}", other)),
        }
    }
}

/// One page of a listing or search
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
    pub total_pages: u32,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, total: u64, page: u32, page_size: u32) -> Self {
        let total_pages = if page_size == 0 {
            0
        } else {
            total.div_ceil(page_size as u64) as u32
        };
        Self {
            items,
            total,
            page,
            page_size,
            total_pages,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_folder_parsing() {
        for folder in Folder::ALL {
            assert_eq!(folder.as_str().parse::<Folder>().unwrap(), folder);
        }
        assert_eq!("INBOX".parse::<Folder>().unwrap(), Folder::Inbox);
        assert!("archive".parse::<Folder>().is_err());
        assert_eq!(serde_json::to_string(&Folder::Trash).unwrap(), "\"trash\"");
    }

    #[test]
    fn test_sort_field_allow_list() {
        assert_eq!("subject".parse::<SortField>().unwrap(), SortField::Subject);
        assert_eq!("from_email".parse::<SortField>().unwrap(), SortField::FromAddr);
        assert!("body_text; DROP TABLE messages".parse::<SortField>().is_err());
        assert_eq!(SortField::default().column(), "m.created_at");
        assert_eq!(SortDirection::default().keyword(), "DESC");
    }

    #[test]
    fn test_page_math() {
        let page: Page<u8> = Page::new(vec![], 45, 3, 20);
        assert_eq!(page.total_pages, 3);
        assert_eq!(Page::<u8>::new(vec![], 40, 1, 20).total_pages, 2);
        assert_eq!(Page::<u8>::new(vec![], 0, 1, 20).total_pages, 0);
    }
}
