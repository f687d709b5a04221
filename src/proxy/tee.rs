//! Fans one transform output out to the client and to a staged cache entry.
//!
//! A pump task drives the transform and hands every chunk to two unbounded
//! queues: one read by the stage task, one read by a relay task that feeds the
//! bounded client channel. Neither side can stall the pump, so a slow disk
//! never delays the client and a client that stops reading never holds up the
//! commit. The backlog is bounded by the transform output, which is already
//! held in memory. A client that goes away only closes its side. A transform
//! error aborts the stage and is forwarded to the client, which then sees a
//! truncated body.

use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::cache::{CacheKey, CacheStore, EntryMetadata, StagedEntry};
use super::transform::{TransformError, TransformStream};
use crate::metrics;

type ClientItem = Result<Bytes, TransformError>;

pub type ClientStream = BoxStream<'static, ClientItem>;

/// Where the staged copy of the output goes.
pub struct StageTarget {
    pub store: CacheStore,
    pub staged: StagedEntry,
    pub key: CacheKey,
    pub metadata: EntryMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    Transform,
    Write,
    Commit,
}

impl DiscardReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DiscardReason::Transform => "transform",
            DiscardReason::Write => "write",
            DiscardReason::Commit => "commit",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    Committed { bytes: u64 },
    Discarded(DiscardReason),
}

pub struct StreamTee {
    pub client: ClientStream,
    /// Resolves once the staged entry has been committed or discarded.
    pub stage: Option<JoinHandle<StageOutcome>>,
}

enum StageMessage {
    Chunk(Bytes),
    Finish,
    Abort,
}

/// Starts the pump, the client relay and (when `target` is set) the stage
/// task. Must be called from within a Tokio runtime.
pub fn spawn_tee(
    source: TransformStream,
    target: Option<StageTarget>,
    url: String,
    client_buffer: usize,
) -> StreamTee {
    let (client_tx, mut client_rx) = mpsc::channel(client_buffer.max(1));
    let (relay_tx, relay_rx) = mpsc::unbounded_channel();
    let (stage_tx, stage) = match target {
        Some(target) => {
            let (tx, rx) = mpsc::unbounded_channel();
            let handle = tokio::spawn(run_stage(rx, target, url.clone()));
            (Some(tx), Some(handle))
        }
        None => (None, None),
    };

    tokio::spawn(relay(relay_rx, client_tx, url.clone()));
    tokio::spawn(pump(source, relay_tx, stage_tx, url));

    let client = stream::poll_fn(move |cx| client_rx.poll_recv(cx)).boxed();
    StreamTee { client, stage }
}

async fn pump(
    mut source: TransformStream,
    relay_tx: mpsc::UnboundedSender<ClientItem>,
    stage_tx: Option<mpsc::UnboundedSender<StageMessage>>,
    url: String,
) {
    let send_stage = |message: StageMessage| {
        if let Some(tx) = &stage_tx {
            // A closed stage already discarded its entry.
            let _ = tx.send(message);
        }
    };
    // A closed relay means the client is gone.
    let send_client = |item: ClientItem| {
        let _ = relay_tx.send(item);
    };

    while let Some(item) = source.next().await {
        match item {
            Ok(chunk) => {
                send_stage(StageMessage::Chunk(chunk.clone()));
                send_client(Ok(chunk));
            }
            Err(err) => {
                warn!(url = %url, stage = err.stage(), error = %err, "image transform failed");
                metrics::record_transform_error();
                send_stage(StageMessage::Abort);
                send_client(Err(err));
                return;
            }
        }
    }
    send_stage(StageMessage::Finish);
}

/// Moves queued chunks into the bounded client channel at the client's pace.
async fn relay(
    mut rx: mpsc::UnboundedReceiver<ClientItem>,
    client_tx: mpsc::Sender<ClientItem>,
    url: String,
) {
    while let Some(item) = rx.recv().await {
        if client_tx.send(item).await.is_err() {
            debug!(url = %url, "client disconnected; finishing cache population");
            return;
        }
    }
}

async fn run_stage(
    mut rx: mpsc::UnboundedReceiver<StageMessage>,
    target: StageTarget,
    url: String,
) -> StageOutcome {
    let StageTarget {
        store,
        mut staged,
        key,
        metadata,
    } = target;

    if let Err(err) = staged.write_metadata(metadata).await {
        return discard(&store, staged, &key, &url, DiscardReason::Write, Some(err)).await;
    }

    loop {
        match rx.recv().await {
            Some(StageMessage::Chunk(chunk)) => {
                if let Err(err) = staged.write_all(&chunk).await {
                    let reason = DiscardReason::Write;
                    return discard(&store, staged, &key, &url, reason, Some(err.into())).await;
                }
            }
            Some(StageMessage::Finish) => break,
            Some(StageMessage::Abort) | None => {
                return discard(&store, staged, &key, &url, DiscardReason::Transform, None).await;
            }
        }
    }

    let bytes = staged.bytes_written();
    match store.commit(staged, &key).await {
        Ok(()) => {
            debug!(url = %url, key = %key, bytes, "cache entry committed");
            metrics::record_cache_commit();
            StageOutcome::Committed { bytes }
        }
        Err(err) => {
            warn!(
                url = %url,
                key = %key,
                stage = "cache_write",
                error = ?err,
                "cache commit failed"
            );
            metrics::record_cache_discard(DiscardReason::Commit.as_str());
            StageOutcome::Discarded(DiscardReason::Commit)
        }
    }
}

async fn discard(
    store: &CacheStore,
    staged: StagedEntry,
    key: &CacheKey,
    url: &str,
    reason: DiscardReason,
    error: Option<anyhow::Error>,
) -> StageOutcome {
    match error {
        Some(err) => {
            warn!(url, key = %key, stage = "cache_write", error = ?err, "cache write failed")
        }
        None => debug!(url, key = %key, reason = reason.as_str(), "staged cache entry discarded"),
    }
    store.discard(staged).await;
    metrics::record_cache_discard(reason.as_str());
    StageOutcome::Discarded(reason)
}
