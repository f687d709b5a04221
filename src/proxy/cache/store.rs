use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs as async_fs;
use tokio::io::AsyncWriteExt;

use super::{CacheError, CacheKey, EntryMetadata};

pub(super) const ENTRIES_DIR: &str = "entries";
pub(super) const STAGING_DIR: &str = "staging";
pub(super) const METADATA_EXTENSION: &str = "json";
pub(super) const PAYLOAD_FILE: &str = "payload";
pub(super) const STAGED_METADATA_FILE: &str = "payload.json";

/// On-disk layout of the cache root:
///
/// ```text
/// <root>/entries/<stem>        committed payload
/// <root>/entries/<stem>.json   committed metadata sidecar
/// <root>/staging/<uuid>/       one private directory per staging attempt
/// ```
///
/// Staging lives under the same root as the entries so promotion is a
/// same-filesystem rename.
#[derive(Debug, Clone)]
pub(super) struct CacheLayout {
    root: PathBuf,
    entries_dir: PathBuf,
    staging_dir: PathBuf,
}

impl CacheLayout {
    pub(super) fn new(root: PathBuf) -> Self {
        let entries_dir = root.join(ENTRIES_DIR);
        let staging_dir = root.join(STAGING_DIR);
        Self {
            root,
            entries_dir,
            staging_dir,
        }
    }

    pub(super) fn root(&self) -> &Path {
        &self.root
    }

    pub(super) fn entries_dir(&self) -> &Path {
        &self.entries_dir
    }

    pub(super) fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    pub(super) fn payload_path(&self, key: &CacheKey) -> PathBuf {
        self.entries_dir.join(key.file_stem())
    }

    pub(super) fn metadata_path(&self, key: &CacheKey) -> PathBuf {
        self.entries_dir
            .join(format!("{}.{METADATA_EXTENSION}", key.file_stem()))
    }

    pub(super) fn staging_path(&self, name: &str) -> PathBuf {
        self.staging_dir.join(name)
    }
}

pub(super) async fn write_metadata_async(path: &Path, metadata: &EntryMetadata) -> Result<()> {
    let data = serde_json::to_vec(metadata)?;
    let mut options = async_fs::OpenOptions::new();
    options.create(true).truncate(true).write(true);
    #[cfg(unix)]
    {
        options.mode(0o600);
    }
    let mut file = options
        .open(path)
        .await
        .with_context(|| format!("failed to write cache metadata {}", path.display()))?;
    file.write_all(&data).await?;
    file.flush().await?;
    file.sync_all().await?;
    Ok(())
}

pub(super) async fn read_metadata_async(
    key: &CacheKey,
    path: &Path,
) -> Result<EntryMetadata, CacheError> {
    let data = match async_fs::read(path).await {
        Ok(data) => data,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Err(CacheError::corrupt(key, "metadata sidecar missing"));
        }
        Err(err) => {
            return Err(CacheError::corrupt(
                key,
                format!("metadata sidecar unreadable: {err}"),
            ));
        }
    };
    serde_json::from_slice(&data)
        .map_err(|err| CacheError::corrupt(key, format!("metadata sidecar invalid: {err}")))
}
