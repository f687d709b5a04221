//! Disk cache of transformed images.
//!
//! Entries are immutable once committed and never deleted by this process.
//! Writers stage into a private directory and promote with renames, so a
//! reader that sees a payload always sees a complete entry.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use thiserror::Error;
use tokio::fs as async_fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{trace, warn};

mod entry;
mod key;
mod maintenance;
mod store;
mod writer;

pub use entry::{CachedEntry, EntryMetadata};
pub use key::CacheKey;
pub use writer::StagedEntry;

use maintenance::{prepare_cache_dirs, spawn_cache_dir_cleanup};
use store::{CacheLayout, read_metadata_async};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("no committed cache entry {0}")]
    NotFound(String),
    #[error("cache entry {key} is corrupt: {reason}")]
    CorruptEntry { key: String, reason: String },
    #[error("cache I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

impl CacheError {
    pub(crate) fn corrupt(key: &CacheKey, reason: impl Into<String>) -> Self {
        CacheError::CorruptEntry {
            key: key.file_stem().to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheStore {
    layout: Arc<CacheLayout>,
    /// Serializes the rename pair of concurrent commits so a sidecar is never
    /// paired with another writer's payload.
    commit_lock: Arc<Mutex<()>>,
}

impl CacheStore {
    /// Opens (creating if needed) the cache rooted at `root`. Staging debris
    /// from an earlier process is removed in the background.
    pub async fn open(root: PathBuf) -> Result<Self> {
        let layout = CacheLayout::new(root);
        let cleanup_dirs = prepare_cache_dirs(&layout).await?;
        spawn_cache_dir_cleanup(cleanup_dirs);
        Ok(Self {
            layout: Arc::new(layout),
            commit_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn root(&self) -> &Path {
        self.layout.root()
    }

    pub fn payload_path(&self, key: &CacheKey) -> PathBuf {
        self.layout.payload_path(key)
    }

    pub fn metadata_path(&self, key: &CacheKey) -> PathBuf {
        self.layout.metadata_path(key)
    }

    /// True once a committed payload for `key` exists and can be opened.
    pub async fn exists(&self, key: &CacheKey) -> bool {
        match async_fs::File::open(self.layout.payload_path(key)).await {
            Ok(file) => file.metadata().await.map(|m| m.is_file()).unwrap_or(false),
            Err(err) => {
                if err.kind() != ErrorKind::NotFound {
                    warn!(key = %key, error = %err, "cache payload not readable");
                }
                false
            }
        }
    }

    /// Opens the committed payload, then its sidecar. A payload without a
    /// usable sidecar is reported as corrupt rather than as a miss.
    pub async fn read(&self, key: &CacheKey) -> Result<CachedEntry, CacheError> {
        let payload_path = self.layout.payload_path(key);
        let file = match async_fs::File::open(&payload_path).await {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(CacheError::NotFound(key.file_stem().to_string()));
            }
            Err(err) => return Err(CacheError::Io(err)),
        };
        let content_length = file.metadata().await?.len();

        let metadata = read_metadata_async(key, &self.layout.metadata_path(key)).await?;
        if let Some(expected) = metadata.content_length
            && expected != content_length
        {
            return Err(CacheError::corrupt(
                key,
                format!("payload is {content_length} bytes, metadata records {expected}"),
            ));
        }

        Ok(CachedEntry {
            file,
            metadata,
            content_length,
        })
    }

    /// Allocates a fresh private staging directory. Every call gets its own,
    /// including concurrent calls for the same key.
    pub async fn stage(&self) -> Result<StagedEntry> {
        let name = uuid::Uuid::new_v4().to_string();
        StagedEntry::create(self.layout.staging_path(&name)).await
    }

    /// Promotes `staged` to be the committed entry for `key`. On failure the
    /// staging directory is removed and nothing becomes visible.
    pub async fn commit(&self, mut staged: StagedEntry, key: &CacheKey) -> Result<()> {
        let payload_dest = self.layout.payload_path(key);
        let metadata_dest = self.layout.metadata_path(key);
        let promoted = async {
            staged.seal().await?;
            let _guard = self.commit_lock.lock().await;
            staged.promote(&payload_dest, &metadata_dest).await
        }
        .await;
        match promoted {
            Ok(()) => {
                trace!(key = %key, bytes = staged.bytes_written(), "committed cache entry");
                Ok(())
            }
            Err(err) => {
                staged.remove().await;
                Err(err)
            }
        }
    }

    #[cfg(test)]
    pub(crate) async fn stage_failing_after(&self, fail_after: usize) -> Result<StagedEntry> {
        let name = uuid::Uuid::new_v4().to_string();
        StagedEntry::create_failing(self.layout.staging_path(&name), fail_after).await
    }

    pub async fn discard(&self, staged: StagedEntry) {
        trace!(path = %staged.dir().display(), "discarding staged cache entry");
        staged.remove().await;
    }

    /// Stages and commits a complete payload in one call.
    pub async fn store(&self, key: &CacheKey, metadata: EntryMetadata, body: &[u8]) -> Result<()> {
        let mut staged = self.stage().await?;
        let written = async {
            staged.write_metadata(metadata).await?;
            staged.write_all(body).await?;
            anyhow::Ok(())
        }
        .await;
        match written {
            Ok(()) => self.commit(staged, key).await,
            Err(err) => {
                self.discard(staged).await;
                Err(err)
            }
        }
    }
}
