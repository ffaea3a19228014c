//! Wraps the OS change-notification backend and turns its events into
//! [`FileOp`] records on the watch log.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::client::is_ignored_name;
use crate::client::ops::{FileOp, Op};
use crate::wal::Wal;

pub struct Watcher {
    root: PathBuf,
    wal: Arc<Wal>,
    inner: Mutex<RecommendedWatcher>,
    events: Mutex<Option<mpsc::Receiver<notify::Result<notify::Event>>>>,
    stage_num: AtomicU64,
}

impl Watcher {
    /// `root` must be canonical; recorded paths are relativized against it.
    pub fn new(root: PathBuf, wal: Arc<Wal>) -> Result<Self> {
        let (tx, rx) = mpsc::channel(1024);
        let inner = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            // Called on the backend's own thread; block it for backpressure
            // rather than dropping events.
            let _ = tx.blocking_send(res);
        })
        .context("create filesystem watcher")?;

        Ok(Self {
            root,
            wal,
            inner: Mutex::new(inner),
            events: Mutex::new(Some(rx)),
            stage_num: AtomicU64::new(0),
        })
    }

    /// Registers a single directory (non-recursive, like the scanner does).
    pub fn watch(&self, dir: &Path) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .watch(dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("add {} to watcher", dir.display()))?;
        debug!(dir = %dir.display(), "watching directory");
        Ok(())
    }

    pub fn inc_stage_num(&self) {
        self.stage_num.fetch_add(1, Ordering::AcqRel);
    }

    pub fn stage_num(&self) -> u64 {
        self.stage_num.load(Ordering::Acquire)
    }

    /// Drains backend events until cancellation, appending one or more
    /// records per event. Log-append failures are fatal.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let mut rx = self
            .events
            .lock()
            .unwrap()
            .take()
            .context("watcher is already running")?;

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                ev = rx.recv() => match ev {
                    Some(Ok(ev)) => ev,
                    Some(Err(err)) => {
                        warn!(error = %err, "watch backend reported an error");
                        continue;
                    }
                    None => return Ok(()),
                },
            };
            self.handle_event(event).await?;
        }
    }

    async fn handle_event(&self, event: notify::Event) -> Result<()> {
        // A rename reported with both names: the old one ceases to exist,
        // the new one surfaces as a create.
        if matches!(
            event.kind,
            EventKind::Modify(ModifyKind::Name(RenameMode::Both))
        ) {
            if let [from, to] = event.paths.as_slice() {
                if !ignored(from) {
                    self.record(from, Op::Removed).await?;
                }
                if !ignored(to) {
                    self.record_create(to).await?;
                }
                return Ok(());
            }
        }

        for path in &event.paths {
            if ignored(path) {
                continue;
            }
            match &event.kind {
                EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
                    self.record_create(path).await?;
                }
                EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(_)) => {
                    self.record(path, Op::Removed).await?;
                }
                EventKind::Modify(ModifyKind::Data(_)) | EventKind::Modify(ModifyKind::Any) => {
                    self.record(path, Op::Modified).await?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    async fn record_create(&self, path: &Path) -> Result<()> {
        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_dir() => {
                // A newly created directory is registered as if the initial
                // scan had seen it, nested subdirectories included.
                if let Err(err) = self.register_tree(path).await {
                    warn!(path = %path.display(), error = %err, "failed to register created directory, ignoring");
                }
                return Ok(());
            }
            Ok(_) => {}
            Err(err) => {
                warn!(path = %path.display(), error = %err, "failed to stat watch event path, ignoring");
                return Ok(());
            }
        }
        self.record(path, Op::Created).await
    }

    async fn register_tree(&self, dir: &Path) -> Result<()> {
        let mut stack = vec![dir.to_path_buf()];
        while let Some(d) = stack.pop() {
            self.watch(&d)?;
            let mut entries = tokio::fs::read_dir(&d).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if ignored(&path) {
                    continue;
                }
                let meta = tokio::fs::symlink_metadata(&path).await?;
                if meta.is_dir() {
                    stack.push(path);
                }
            }
        }
        Ok(())
    }

    async fn record(&self, path: &Path, op: Op) -> Result<()> {
        let Some(rel) = self.relativize(path) else {
            return Ok(());
        };
        let file_op = FileOp::new(rel, op, self.stage_num());
        debug!(path = %file_op.path, op = ?file_op.op, stage = file_op.stage, "file event");

        let bytes = serde_json::to_vec(&file_op).context("marshal watch event")?;
        self.wal
            .append(&bytes)
            .await
            .context("append watch event to wal")?;
        Ok(())
    }

    fn relativize(&self, path: &Path) -> Option<String> {
        match path.strip_prefix(&self.root) {
            Ok(rel) if !rel.as_os_str().is_empty() => {
                Some(rel.to_string_lossy().replace('\\', "/"))
            }
            _ => {
                debug!(path = %path.display(), "event outside the sync root, skipping");
                None
            }
        }
    }
}

fn ignored(path: &Path) -> bool {
    path.file_name()
        .map(|n| is_ignored_name(&n.to_string_lossy()))
        .unwrap_or(false)
}
