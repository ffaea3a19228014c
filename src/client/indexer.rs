//! Staged indexing pipeline.
//!
//! Stage 1 decodes log records in order, stage 2 enriches them with
//! size/mtime/SHA-256 on a bounded worker pool, and the sink serializes
//! index updates, resolving out-of-order events by timestamp.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::client::ops::{FileOp, Op};
use crate::wal::{Entry, Wal, WalError};

const DEFAULT_INDEX_CAPACITY: usize = 100;
const HASH_CHUNK: usize = 64 * 1024;

/// An indexed file. For `Removed` ops only `path`, `op` and `timestamp`
/// carry meaning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    pub path: String,
    pub size: i64,
    pub sha256: String,
    pub mtime: i64,
    pub op: Op,
    pub timestamp: DateTime<Utc>,
}

pub struct Indexer {
    root: PathBuf,
    workers: usize,
    index: RwLock<HashMap<String, FileMetadata>>,
    mailbox: mpsc::Sender<FileOp>,
    queued: Mutex<Option<mpsc::Receiver<FileOp>>>,
    inflight: AtomicUsize,
    idle: Notify,
}

impl Indexer {
    /// `root` anchors the relative paths carried by the records; `workers`
    /// bounds the hashing stage (one per CPU is the usual choice).
    pub fn new(root: PathBuf, workers: usize) -> Self {
        let workers = workers.max(1);
        let (tx, rx) = mpsc::channel(workers);
        Self {
            root,
            workers,
            index: RwLock::new(HashMap::with_capacity(DEFAULT_INDEX_CAPACITY)),
            mailbox: tx,
            queued: Mutex::new(Some(rx)),
            inflight: AtomicUsize::new(0),
            idle: Notify::new(),
        }
    }

    /// Runs the hashing pool and the sink until cancellation.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let mut rx = self
            .queued
            .lock()
            .unwrap()
            .take()
            .context("indexer is already running")?;

        let (sink_tx, mut sink_rx) = mpsc::channel::<FileMetadata>(self.workers);
        let sink_self = self.clone();
        tokio::spawn(async move {
            while let Some(md) = sink_rx.recv().await {
                sink_self.upsert(md);
                sink_self.done_one();
            }
        });

        let pool = Arc::new(Semaphore::new(self.workers));
        loop {
            let op = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                msg = rx.recv() => match msg {
                    Some(op) => op,
                    None => return Ok(()),
                },
            };

            let permit = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                permit = pool.clone().acquire_owned() => {
                    permit.map_err(|_| anyhow!("indexer worker pool closed"))?
                }
            };

            let me = self.clone();
            let sink = sink_tx.clone();
            tokio::spawn(async move {
                match me.extract_metadata(op).await {
                    Some(md) => {
                        if sink.send(md).await.is_err() {
                            me.done_one();
                        }
                    }
                    None => me.done_one(),
                }
                drop(permit);
            });
        }
    }

    /// Stage 1: decodes records off `wal` in FIFO order and queues them for
    /// enrichment. Returns cleanly on end-of-stream, on a matching `stop`
    /// predicate (the log rewinds, see [`Wal::next_where`]) and on
    /// cancellation.
    pub async fn index_wal<F>(
        &self,
        wal: &Wal,
        cancel: &CancellationToken,
        stop: F,
    ) -> Result<()>
    where
        F: Fn(&Entry) -> bool,
    {
        loop {
            let entry = match wal.next_where(cancel, |entry| stop(entry)).await {
                Ok(Some(entry)) => entry,
                Ok(None) => return Ok(()),
                Err(WalError::Canceled) => return Ok(()),
                Err(err) => return Err(err).context("consume wal"),
            };

            if let Some(error) = &entry.error {
                warn!(error = %error, bytes = ?String::from_utf8_lossy(&entry.bytes), "malformed log record, dropping");
                continue;
            }
            let op: FileOp = match serde_json::from_slice(&entry.bytes) {
                Ok(op) => op,
                Err(err) => {
                    warn!(error = %err, "could not decode file op, dropping");
                    continue;
                }
            };

            self.enqueue(op, cancel).await?;
        }
    }

    async fn enqueue(&self, op: FileOp, cancel: &CancellationToken) -> Result<()> {
        self.inflight.fetch_add(1, Ordering::AcqRel);
        tokio::select! {
            _ = cancel.cancelled() => {
                self.done_one();
                Ok(())
            }
            sent = self.mailbox.send(op) => {
                if sent.is_err() {
                    self.done_one();
                    return Err(anyhow!("indexer mailbox closed"));
                }
                Ok(())
            }
        }
    }

    /// Blocks until every queued record has reached the index or been
    /// dropped.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inflight.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Atomically clones the index out and replaces it with an empty map of
    /// the initial capacity.
    pub fn snapshot_and_purge(&self) -> HashMap<String, FileMetadata> {
        let mut idx = self.index.write().unwrap();
        std::mem::replace(&mut *idx, HashMap::with_capacity(DEFAULT_INDEX_CAPACITY))
    }

    // Stage 2. Removals pass through untouched; anything that cannot be
    // opened or hashed is dropped, because the file may legitimately have
    // disappeared between the event and now.
    async fn extract_metadata(&self, op: FileOp) -> Option<FileMetadata> {
        if op.op == Op::Removed {
            return Some(FileMetadata {
                path: op.path,
                size: 0,
                sha256: String::new(),
                mtime: 0,
                op: op.op,
                timestamp: op.timestamp,
            });
        }

        let abs = self.root.join(&op.path);
        let mut file = match tokio::fs::File::open(&abs).await {
            Ok(file) => file,
            Err(err) => {
                warn!(path = %op.path, error = %err, "could not open file to extract metadata, dropping");
                return None;
            }
        };
        let meta = match file.metadata().await {
            Ok(meta) => meta,
            Err(err) => {
                warn!(path = %op.path, error = %err, "could not stat file to extract metadata, dropping");
                return None;
            }
        };
        if meta.is_dir() {
            warn!(path = %op.path, "directory queued for indexing, dropping");
            return None;
        }
        let mtime = match meta.modified() {
            Ok(mtime) => DateTime::<Utc>::from(mtime).timestamp(),
            Err(err) => {
                warn!(path = %op.path, error = %err, "no modification time available, dropping");
                return None;
            }
        };

        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; HASH_CHUNK];
        loop {
            let n = match file.read(&mut buf).await {
                Ok(n) => n,
                Err(err) => {
                    warn!(path = %op.path, error = %err, "could not hash file, dropping");
                    return None;
                }
            };
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }

        Some(FileMetadata {
            path: op.path,
            size: meta.len() as i64,
            sha256: hex::encode(hasher.finalize()),
            mtime,
            op: op.op,
            timestamp: op.timestamp,
        })
    }

    // Sink. Per-path updates are serialized here; an entry only ever moves
    // forward in event time.
    fn upsert(&self, md: FileMetadata) {
        let mut idx = self.index.write().unwrap();
        if let Some(existing) = idx.get(&md.path) {
            if existing.timestamp > md.timestamp {
                debug!(
                    path = %md.path,
                    existing = %existing.timestamp,
                    incoming = %md.timestamp,
                    "record with an older event timestamp, dropping"
                );
                return;
            }
        }
        debug!(path = %md.path, op = ?md.op, "updating index");
        idx.insert(md.path.clone(), md);
    }

    fn done_one(&self) {
        if self.inflight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }
}
