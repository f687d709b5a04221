use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};

use anyhow::{Context, Result, anyhow};
use tokio::fs as async_fs;
use tokio::fs::File as AsyncFile;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{trace, warn};

use super::EntryMetadata;
use super::store::{PAYLOAD_FILE, STAGED_METADATA_FILE, write_metadata_async};

enum StagedFile {
    File(AsyncFile),
    #[cfg(test)]
    Partial(PartialWrite<AsyncFile>),
}

impl AsyncWrite for StagedFile {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            StagedFile::File(file) => Pin::new(file).poll_write(cx, buf),
            #[cfg(test)]
            StagedFile::Partial(file) => Pin::new(file).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            StagedFile::File(file) => Pin::new(file).poll_flush(cx),
            #[cfg(test)]
            StagedFile::Partial(file) => Pin::new(file).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            StagedFile::File(file) => Pin::new(file).poll_shutdown(cx),
            #[cfg(test)]
            StagedFile::Partial(file) => Pin::new(file).poll_shutdown(cx),
        }
    }
}

impl StagedFile {
    async fn sync_all(&mut self) -> std::io::Result<()> {
        match self {
            StagedFile::File(file) => file.sync_all().await,
            #[cfg(test)]
            StagedFile::Partial(file) => file.inner.sync_all().await,
        }
    }
}

/// Test writer that accepts at most `max_write` bytes per call and, when
/// `fail_after` is set, errors once that many bytes have gone through.
#[cfg(test)]
struct PartialWrite<W> {
    inner: W,
    max_write: usize,
    fail_after: Option<usize>,
    written: usize,
}

#[cfg(test)]
impl<W> AsyncWrite for PartialWrite<W>
where
    W: AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let mut limit = self.max_write.min(buf.len());
        if let Some(fail_after) = self.fail_after {
            let remaining = fail_after.saturating_sub(self.written);
            if remaining == 0 && !buf.is_empty() {
                return Poll::Ready(Err(std::io::Error::other("simulated disk failure")));
            }
            limit = limit.min(remaining);
        }
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_write(cx, &buf[..limit]) {
            Poll::Ready(Ok(written)) => {
                this.written += written;
                Poll::Ready(Ok(written))
            }
            other => other,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// A cache entry being written in a private staging directory.
///
/// Nothing under the staging directory is visible to readers. The entry
/// leaves this state exactly once, through `CacheStore::commit` or
/// `CacheStore::discard`; dropping it unfinished removes the directory in the
/// background.
pub struct StagedEntry {
    dir: PathBuf,
    payload_path: PathBuf,
    metadata_path: PathBuf,
    file: StagedFile,
    metadata: Option<EntryMetadata>,
    bytes_written: u64,
    finished: bool,
}

impl StagedEntry {
    pub(super) async fn create(dir: PathBuf) -> Result<Self> {
        Self::create_with(dir, StagedFile::File).await
    }

    #[cfg(test)]
    pub(super) async fn create_partial(dir: PathBuf, max_write: usize) -> Result<Self> {
        Self::create_with(dir, |inner| {
            StagedFile::Partial(PartialWrite {
                inner,
                max_write,
                fail_after: None,
                written: 0,
            })
        })
        .await
    }

    #[cfg(test)]
    pub(super) async fn create_failing(dir: PathBuf, fail_after: usize) -> Result<Self> {
        Self::create_with(dir, |inner| {
            StagedFile::Partial(PartialWrite {
                inner,
                max_write: usize::MAX,
                fail_after: Some(fail_after),
                written: 0,
            })
        })
        .await
    }

    async fn create_with(
        dir: PathBuf,
        wrap: impl FnOnce(AsyncFile) -> StagedFile,
    ) -> Result<Self> {
        async_fs::create_dir(&dir)
            .await
            .with_context(|| format!("failed to create staging dir {}", dir.display()))?;
        let payload_path = dir.join(PAYLOAD_FILE);
        let metadata_path = dir.join(STAGED_METADATA_FILE);

        let mut options = async_fs::OpenOptions::new();
        options.create_new(true).write(true);
        #[cfg(unix)]
        {
            options.mode(0o600);
        }
        let file = match options.open(&payload_path).await {
            Ok(file) => file,
            Err(err) => {
                let _ = async_fs::remove_dir_all(&dir).await;
                return Err(anyhow!(err))
                    .with_context(|| format!("failed to open {}", payload_path.display()));
            }
        };

        Ok(Self {
            dir,
            payload_path,
            metadata_path,
            file: wrap(file),
            metadata: None,
            bytes_written: 0,
            finished: false,
        })
    }

    /// The private staging directory of this attempt.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn metadata(&self) -> Option<&EntryMetadata> {
        self.metadata.as_ref()
    }

    pub async fn write_metadata(&mut self, metadata: EntryMetadata) -> Result<()> {
        write_metadata_async(&self.metadata_path, &metadata).await?;
        self.metadata = Some(metadata);
        Ok(())
    }

    /// Flushes the payload to disk and records its final length in the staged
    /// sidecar.
    pub(super) async fn seal(&mut self) -> Result<()> {
        let mut metadata = self
            .metadata
            .clone()
            .ok_or_else(|| anyhow!("staged entry has no metadata"))?;

        self.file.flush().await?;
        self.file.sync_all().await?;

        metadata.content_length = Some(self.bytes_written);
        write_metadata_async(&self.metadata_path, &metadata).await?;
        self.metadata = Some(metadata);
        Ok(())
    }

    /// Renames the sidecar first and the payload second. Payload presence is
    /// what readers test, so a visible payload always has its metadata. If the
    /// payload cannot be moved, whatever sits at the destination is removed
    /// so the key reads as a miss instead of a mismatched pair.
    pub(super) async fn promote(
        &mut self,
        payload_dest: &Path,
        metadata_dest: &Path,
    ) -> Result<()> {
        async_fs::rename(&self.metadata_path, metadata_dest)
            .await
            .with_context(|| format!("failed to promote {}", metadata_dest.display()))?;
        if let Err(err) = async_fs::rename(&self.payload_path, payload_dest).await {
            for path in [payload_dest, metadata_dest] {
                if let Err(remove_err) = async_fs::remove_file(path).await
                    && remove_err.kind() != std::io::ErrorKind::NotFound
                {
                    warn!(
                        error = %remove_err,
                        path = %path.display(),
                        "failed to roll back cache entry"
                    );
                }
            }
            return Err(anyhow!(err))
                .with_context(|| format!("failed to promote {}", payload_dest.display()));
        }

        self.finished = true;
        if let Err(err) = async_fs::remove_dir(&self.dir).await {
            trace!(error = %err, path = %self.dir.display(), "staging dir not removed");
        }
        Ok(())
    }

    pub(super) async fn remove(mut self) {
        self.finished = true;
        if let Err(err) = async_fs::remove_dir_all(&self.dir).await {
            trace!(error = %err, path = %self.dir.display(), "staging dir not removed");
        }
    }
}

impl AsyncWrite for StagedEntry {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match Pin::new(&mut self.file).poll_write(cx, buf) {
            Poll::Ready(Ok(written)) => {
                self.bytes_written = self.bytes_written.saturating_add(written as u64);
                Poll::Ready(Ok(written))
            }
            other => other,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.file).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.file).poll_shutdown(cx)
    }
}

impl Drop for StagedEntry {
    fn drop(&mut self) {
        if self.finished {
            return;
        }

        let dir = self.dir.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = async_fs::remove_dir_all(dir).await;
            });
        } else {
            let _ = std::fs::remove_dir_all(&dir);
        }
    }
}
