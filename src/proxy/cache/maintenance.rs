use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs as async_fs;
use tracing::{debug, warn};

use super::store::CacheLayout;

const STAGING_TOMBSTONE_PREFIX: &str = "tombstone-staging-";

fn tombstone_dir_name() -> String {
    format!("{STAGING_TOMBSTONE_PREFIX}{}", uuid::Uuid::new_v4())
}

/// Creates the entries and staging directories. A staging directory left by a
/// previous process is renamed to a tombstone so the fresh one starts empty;
/// the returned tombstones still need removing.
pub(super) async fn prepare_cache_dirs(layout: &CacheLayout) -> Result<Vec<PathBuf>> {
    let root = layout.root();
    async_fs::create_dir_all(root)
        .await
        .with_context(|| format!("failed to create cache root {}", root.display()))?;
    async_fs::create_dir_all(layout.entries_dir())
        .await
        .with_context(|| {
            format!(
                "failed to create cache entries dir {}",
                layout.entries_dir().display()
            )
        })?;

    let mut cleanup_dirs = Vec::new();
    match async_fs::metadata(layout.staging_dir()).await {
        Ok(meta) if meta.is_dir() => {
            let tombstone = root.join(tombstone_dir_name());
            async_fs::rename(layout.staging_dir(), &tombstone)
                .await
                .with_context(|| {
                    format!(
                        "failed to retire staging dir {}",
                        layout.staging_dir().display()
                    )
                })?;
            cleanup_dirs.push(tombstone);
        }
        Ok(_) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => return Err(err.into()),
    }
    async_fs::create_dir_all(layout.staging_dir())
        .await
        .with_context(|| {
            format!(
                "failed to create staging dir {}",
                layout.staging_dir().display()
            )
        })?;

    cleanup_dirs.extend(find_tombstones(root, &cleanup_dirs).await?);
    Ok(cleanup_dirs)
}

async fn find_tombstones(root: &Path, known: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    let mut entries = async_fs::read_dir(root).await?;
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_dir() {
            continue;
        }
        let path = entry.path();
        if entry
            .file_name()
            .to_string_lossy()
            .starts_with(STAGING_TOMBSTONE_PREFIX)
            && !known.contains(&path)
        {
            found.push(path);
        }
    }
    Ok(found)
}

pub(super) fn spawn_cache_dir_cleanup(dirs: Vec<PathBuf>) {
    for dir in dirs {
        tokio::spawn(async move {
            remove_tombstone(&dir).await;
        });
    }
}

async fn remove_tombstone(dir: &Path) {
    match async_fs::remove_dir_all(dir).await {
        Ok(()) => {
            debug!(path = %dir.display(), "removed abandoned staging entries");
            crate::metrics::record_cache_cleanup_dir();
        }
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => {
            warn!(
                error = %err,
                path = %dir.display(),
                "failed to remove abandoned staging dir"
            );
        }
    }
}
