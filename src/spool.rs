//! Disk-backed spool of pending readings.
//!
//! One file per not-yet-delivered reading, named `{deviceName}_{when}`.
//! File presence in the spool directory is the single ground truth for
//! "pending delivery"; no manifest or index is kept, so the store survives
//! crashes and restarts for free. Sweeps list names only; content is read
//! lazily by the upload worker.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::device::Reading;

/// Errors from spool operations.
#[derive(Debug, Error)]
pub enum SpoolError {
    /// Filesystem failure (create, write, list, remove).
    #[error("spool i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to serialize a reading for persistence.
    #[error("failed to serialize reading: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Handle to one pending reading on disk.
///
/// Carries the name and path only; the content is opened on demand so
/// sweeps over large spools stay cheap.
#[derive(Debug, Clone)]
pub struct SpoolEntry {
    name: String,
    path: PathBuf,
}

impl SpoolEntry {
    /// The deterministic entry name, which doubles as the upload `name`
    /// form field.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Read the serialized reading bytes.
    ///
    /// A `NotFound` here after a sweep means a concurrent duplicate
    /// enqueue already delivered the entry; callers treat that as a skip,
    /// not a failure.
    pub async fn read(&self) -> std::io::Result<Vec<u8>> {
        tokio::fs::read(&self.path).await
    }
}

/// The spool directory.
#[derive(Debug, Clone)]
pub struct SpoolStore {
    dir: PathBuf,
}

impl SpoolStore {
    /// Open a spool rooted at `dir`, creating the directory if needed.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, SpoolError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    /// Persist a reading under its deterministic name, overwriting any
    /// existing entry with the same identity. Returns the entry name.
    pub async fn put(&self, reading: &Reading) -> Result<String, SpoolError> {
        let name = reading.entry_name();
        let bytes = serde_json::to_vec(reading)?;
        tokio::fs::write(self.dir.join(&name), bytes).await?;
        Ok(name)
    }

    /// List all pending entries, in directory order (unspecified, not
    /// chronological).
    pub async fn list(&self) -> Result<Vec<SpoolEntry>, SpoolError> {
        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.dir).await?;
        while let Some(item) = dir.next_entry().await? {
            if !item.file_type().await?.is_file() {
                continue;
            }
            entries.push(SpoolEntry {
                name: item.file_name().to_string_lossy().into_owned(),
                path: item.path(),
            });
        }
        Ok(entries)
    }

    /// Handle for a known entry name.
    pub fn entry(&self, name: &str) -> SpoolEntry {
        SpoolEntry {
            name: name.to_string(),
            path: self.dir.join(name),
        }
    }

    /// Delete an entry's backing file.
    ///
    /// Removing an already-removed entry returns a `NotFound` I/O error;
    /// callers log it and move on (the effect is idempotent).
    pub async fn remove(&self, name: &str) -> Result<(), SpoolError> {
        tokio::fs::remove_file(self.dir.join(name)).await?;
        Ok(())
    }

    /// The spool directory path.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}
