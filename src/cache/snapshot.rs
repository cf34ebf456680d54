//! Snapshot persistence for the response cache.
//!
//! The cache can serialise its entries to durable storage on shutdown and
//! reload them on startup. [`SnapshotStore`] is the collaborator seam; the
//! bundled [`FileSnapshotStore`] encodes snapshots with `bincode` and writes
//! them atomically (write to a temporary file, then rename).

use std::{
    io,
    path::PathBuf,
    time::{Duration, SystemTime},
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::{command::CommandKey, response::StructuredResponse};

/// Point-in-time copy of the cache's persistable state.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheSnapshot {
    entries: Vec<SnapshotEntry>,
}

impl CacheSnapshot {
    /// Build a snapshot from entries.
    #[must_use]
    pub fn new(entries: Vec<SnapshotEntry>) -> Self { Self { entries } }

    /// The persisted entries.
    #[must_use]
    pub fn entries(&self) -> &[SnapshotEntry] { &self.entries }

    /// Number of persisted entries.
    #[must_use]
    pub fn len(&self) -> usize { self.entries.len() }

    /// Whether the snapshot holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    pub(super) fn into_entries(self) -> Vec<SnapshotEntry> { self.entries }
}

/// One persisted cache entry.
///
/// Freshness travels as wall-clock time; on restore, entries whose TTL
/// elapsed while persisted are dropped rather than served stale.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    key: CommandKey,
    response: StructuredResponse,
    refreshed_at: SystemTime,
    ttl: Duration,
}

impl SnapshotEntry {
    /// Build a persisted entry from its parts.
    #[must_use]
    pub fn new(
        key: CommandKey,
        response: StructuredResponse,
        refreshed_at: SystemTime,
        ttl: Duration,
    ) -> Self {
        Self {
            key,
            response,
            refreshed_at,
            ttl,
        }
    }

    /// The command this entry caches.
    #[must_use]
    pub fn key(&self) -> &CommandKey { &self.key }

    /// The persisted response.
    #[must_use]
    pub fn response(&self) -> &StructuredResponse { &self.response }

    /// Wall-clock time of the refresh that produced the response.
    #[must_use]
    pub fn refreshed_at(&self) -> SystemTime { self.refreshed_at }

    /// TTL the entry carried when snapshotted.
    #[must_use]
    pub fn ttl(&self) -> Duration { self.ttl }

    pub(super) fn into_parts(self) -> (CommandKey, StructuredResponse, SystemTime, Duration) {
        (self.key, self.response, self.refreshed_at, self.ttl)
    }
}

/// Errors raised while saving or loading snapshots.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SnapshotError {
    /// Reading or writing the backing storage failed.
    #[error("snapshot I/O error: {0}")]
    Io(#[from] io::Error),
    /// Encoding the snapshot failed.
    #[error("snapshot encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),
    /// Decoding a persisted snapshot failed.
    #[error("snapshot decode error: {0}")]
    Decode(#[from] bincode::error::DecodeError),
}

/// Durable storage collaborator for cache snapshots.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Persist a snapshot, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns a [`SnapshotError`] when the snapshot cannot be written.
    async fn save(&self, snapshot: &CacheSnapshot) -> Result<(), SnapshotError>;

    /// Load the most recent snapshot, `None` when none was ever saved.
    ///
    /// # Errors
    ///
    /// Returns a [`SnapshotError`] when a stored snapshot cannot be read or
    /// decoded.
    async fn load(&self) -> Result<Option<CacheSnapshot>, SnapshotError>;
}

/// File-backed snapshot store using `bincode` encoding.
#[derive(Clone, Debug)]
pub struct FileSnapshotStore {
    path: PathBuf,
}

impl FileSnapshotStore {
    /// Store snapshots at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self { Self { path: path.into() } }

    fn temp_path(&self) -> PathBuf {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        PathBuf::from(tmp)
    }
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
    async fn save(&self, snapshot: &CacheSnapshot) -> Result<(), SnapshotError> {
        let encoded = bincode::serde::encode_to_vec(snapshot, bincode::config::standard())?;
        let tmp = self.temp_path();
        tokio::fs::write(&tmp, &encoded).await?;
        // Rename is atomic on the filesystems we target; a crash mid-save
        // leaves the previous snapshot intact.
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(path = %self.path.display(), entries = snapshot.len(), "snapshot saved");
        Ok(())
    }

    async fn load(&self) -> Result<Option<CacheSnapshot>, SnapshotError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let (snapshot, _) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard())?;
        Ok(Some(snapshot))
    }
}
