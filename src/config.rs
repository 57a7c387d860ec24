//! Relay configuration.
//!
//! Settings are read from a TOML file (missing file means defaults) and then
//! selectively overridden from `RELAYMAIL_*` environment variables.

use crate::mime::SurrogateIdentity;
use crate::smtp::SmtpSecurity;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {var}: {value}")]
    Env { var: String, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Scheduler settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Whether the periodic scheduler runs at all
    pub enabled: bool,
    /// Seconds between ticks
    pub interval_seconds: u64,
    /// Maximum number of mailboxes synced at the same time
    pub max_concurrent_syncs: usize,
    /// Run one tick immediately when the scheduler starts
    pub sync_on_startup: bool,
    /// Keying for messages that carry no Message-ID
    pub surrogate_identity: SurrogateIdentity,
    /// Orphaned blobs younger than this are not swept
    pub orphan_grace_seconds: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_seconds: 60,
            max_concurrent_syncs: 4,
            sync_on_startup: true,
            surrogate_identity: SurrogateIdentity::Random,
            orphan_grace_seconds: 3600,
        }
    }
}

/// Defaults applied to every alias's remote mailbox
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImapSettings {
    pub host: String,
    pub port: u16,
    pub validate_certificates: bool,
    pub timeout_seconds: u64,
    pub mailbox: String,
    /// Used for aliases that have no password of their own
    pub default_password: Option<String>,
}

impl Default for ImapSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 993,
            validate_certificates: false,
            timeout_seconds: 60,
            mailbox: "INBOX".to_string(),
            default_password: None,
        }
    }
}

/// Outbound submission server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub security: SmtpSecurity,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout_seconds: u64,
}

impl Default for SmtpSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 587,
            security: SmtpSecurity::StartTls,
            username: None,
            password: None,
            timeout_seconds: 30,
        }
    }
}

/// Pagination limits for list and search
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListingSettings {
    pub default_page_size: u32,
    pub max_page_size: u32,
}

impl Default for ListingSettings {
    fn default() -> Self {
        Self {
            default_page_size: 20,
            max_page_size: 100,
        }
    }
}

/// Top-level relay configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// SQLite file path or `sqlite:` URL
    pub database_url: String,
    /// Directory holding attachment blobs
    pub attachments_dir: PathBuf,
    pub sync: SyncSettings,
    pub imap: ImapSettings,
    pub smtp: SmtpSettings,
    pub listing: ListingSettings,
}

impl Default for RelayConfig {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            database_url: data_dir.join("relay.db").to_string_lossy().into_owned(),
            attachments_dir: data_dir.join("attachments"),
            sync: SyncSettings::default(),
            imap: ImapSettings::default(),
            smtp: SmtpSettings::default(),
            listing: ListingSettings::default(),
        }
    }
}

impl RelayConfig {
    /// Load from `path` (or the default location), apply environment
    /// overrides and validate.
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(default_config_path);

        let mut config = if path.exists() {
            Self::from_file(&path)?
        } else {
            info!("No config file at {}, using defaults", path.display());
            Self::default()
        };

        config.apply_overrides(|var| std::env::var(var).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML file without applying overrides
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: RelayConfig = toml::from_str(&content)?;
        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Apply `RELAYMAIL_*` overrides from a variable lookup
    pub fn apply_overrides<F>(&mut self, lookup: F) -> ConfigResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("RELAYMAIL_DATABASE_URL") {
            self.database_url = value;
        }
        if let Some(value) = lookup("RELAYMAIL_ATTACHMENTS_DIR") {
            self.attachments_dir = PathBuf::from(value);
        }
        if let Some(value) = lookup("RELAYMAIL_IMAP_HOST") {
            self.imap.host = value;
        }
        if let Some(value) = lookup("RELAYMAIL_IMAP_PORT") {
            self.imap.port = parse_env("RELAYMAIL_IMAP_PORT", &value)?;
        }
        if let Some(value) = lookup("RELAYMAIL_SYNC_INTERVAL") {
            self.sync.interval_seconds = parse_env("RELAYMAIL_SYNC_INTERVAL", &value)?;
        }
        if let Some(value) = lookup("RELAYMAIL_SMTP_HOST") {
            self.smtp.host = value;
        }
        if let Some(value) = lookup("RELAYMAIL_SMTP_PORT") {
            self.smtp.port = parse_env("RELAYMAIL_SMTP_PORT", &value)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.sync.interval_seconds == 0 {
            return Err(ConfigError::Invalid("sync.interval_seconds must be greater than 0".to_string()));
        }
        if self.sync.max_concurrent_syncs == 0 {
            return Err(ConfigError::Invalid("sync.max_concurrent_syncs must be greater than 0".to_string()));
        }
        if self.listing.default_page_size == 0 || self.listing.max_page_size == 0 {
            return Err(ConfigError::Invalid("listing page sizes must be greater than 0".to_string()));
        }
        if self.listing.default_page_size > self.listing.max_page_size {
            return Err(ConfigError::Invalid(
                "listing.default_page_size cannot exceed listing.max_page_size".to_string(),
            ));
        }
        if self.database_url.trim().is_empty() {
            return Err(ConfigError::Invalid("database_url is empty".to_string()));
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(var: &str, value: &str) -> ConfigResult<T> {
    value.trim().parse::<T>().map_err(|_| ConfigError::Env {
        var: var.to_string(),
        value: value.to_string(),
    })
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("relaymail")
}

/// `<config dir>/relaymail/config.toml`
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("relaymail")
        .join("config.toml")
}
