//! Attachment bytes on disk.
//!
//! Every blob gets a generated `<uuid>_<sanitized filename>` name, so two
//! attachments never share a file even when their filenames match. Writes go
//! through a temporary file in the same directory and are renamed into place,
//! so a reader never observes a partially written blob.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

static UNSAFE_FILENAME_CHARS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^A-Za-z0-9._-]+").expect("valid filename regex"));

const TEMP_PREFIX: &str = ".tmp";
const MAX_FILENAME_LEN: usize = 100;

#[derive(Error, Debug)]
pub enum BlobError {
    #[error("Blob I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid blob name: {0}")]
    InvalidName(String),

    #[error("Blob not found: {0}")]
    NotFound(String),

    #[error("Blob task failed: {0}")]
    Task(String),
}

pub type BlobResult<T> = Result<T, BlobError>;

/// Outcome of an orphan sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    pub removed: Vec<String>,
}

/// Directory of attachment blobs
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    /// Open the store, creating the directory if needed
    pub async fn open<P: Into<PathBuf>>(root: P) -> BlobResult<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write `data` under a freshly generated name and return that name
    pub async fn write(&self, filename: &str, data: &[u8]) -> BlobResult<String> {
        let blob_name = generate_blob_name(filename);
        let target = self.root.join(&blob_name);
        let root = self.root.clone();
        let data = data.to_vec();

        tokio::task::spawn_blocking(move || -> BlobResult<()> {
            let mut temp = tempfile::Builder::new().prefix(TEMP_PREFIX).tempfile_in(&root)?;
            temp.write_all(&data)?;
            temp.as_file().sync_all()?;
            temp.persist_noclobber(&target).map_err(|e| BlobError::Io(e.error))?;
            Ok(())
        })
        .await
        .map_err(|e| BlobError::Task(e.to_string()))??;

        debug!("Stored blob {}", blob_name);
        Ok(blob_name)
    }

    /// Read a blob's bytes
    pub async fn read(&self, blob_name: &str) -> BlobResult<Vec<u8>> {
        let path = self.path_for(blob_name)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(BlobError::NotFound(blob_name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Remove a blob. Returns false if it was already gone.
    pub async fn remove(&self, blob_name: &str) -> BlobResult<bool> {
        let path = self.path_for(blob_name)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether a blob with this name exists on disk
    pub async fn exists(&self, blob_name: &str) -> BlobResult<bool> {
        let path = self.path_for(blob_name)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }

    /// Delete blobs that no attachment row references.
    ///
    /// Files younger than `min_age` are left alone: an ingestion may have
    /// written the blob and not yet inserted its row. Temporary files are
    /// never touched.
    pub async fn sweep_orphans(&self, referenced: &HashSet<String>, min_age: Duration) -> BlobResult<SweepReport> {
        let mut report = SweepReport::default();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        let now = SystemTime::now();

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(TEMP_PREFIX) {
                continue;
            }
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            report.scanned += 1;

            if referenced.contains(&name) {
                continue;
            }
            let age = metadata
                .modified()
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .unwrap_or_default();
            if age < min_age {
                continue;
            }

            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => report.removed.push(name),
                Err(e) => warn!("Failed to remove orphaned blob {}: {}", name, e),
            }
        }

        Ok(report)
    }

    fn path_for(&self, blob_name: &str) -> BlobResult<PathBuf> {
        let valid = !blob_name.is_empty()
            && !blob_name.starts_with('.')
            && !blob_name.contains(['/', '\\'])
            && blob_name != "..";
        if !valid {
            return Err(BlobError::InvalidName(blob_name.to_string()));
        }
        Ok(self.root.join(blob_name))
    }
}

/// Reduce a user-supplied filename to a safe single path component
pub fn sanitize_filename(filename: &str) -> String {
    let base = filename.rsplit(['/', '\\']).next().unwrap_or(filename);
    let cleaned = UNSAFE_FILENAME_CHARS.replace_all(base.trim(), "_");
    let cleaned = cleaned.trim_start_matches('.');
    let truncated: String = cleaned.chars().take(MAX_FILENAME_LEN).collect();
    if truncated.is_empty() {
        "attachment".to_string()
    } else {
        truncated
    }
}

/// Unique storage name for an attachment
pub fn generate_blob_name(filename: &str) -> String {
    format!("{}_{}", Uuid::new_v4(), sanitize_filename(filename))
}
