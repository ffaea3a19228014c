//! Deletion-event handoff between the metadata store and the janitor.
//!
//! The channel is bounded at one slot so the store can never run far ahead
//! of cleanup. `emit` blocks until the event is handed over or the emitter
//! shuts down.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

use crate::server::store::ObjectMetadata;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EmitError {
    #[error("emitter closed")]
    Closed,
    #[error("emit canceled")]
    Canceled,
}

pub struct Emitter {
    tx: Mutex<Option<mpsc::Sender<ObjectMetadata>>>,
    rx: Mutex<Option<mpsc::Receiver<ObjectMetadata>>>,
    closed: AtomicBool,
    done: CancellationToken,
    inflight: AtomicUsize,
    drained: Notify,
}

impl Default for Emitter {
    fn default() -> Self {
        Self::new()
    }
}

impl Emitter {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
            closed: AtomicBool::new(false),
            done: CancellationToken::new(),
            inflight: AtomicUsize::new(0),
            drained: Notify::new(),
        }
    }

    /// Hands out the consumer end. Returns `None` after the first call.
    pub fn take_receiver(&self) -> Option<mpsc::Receiver<ObjectMetadata>> {
        self.rx.lock().unwrap().take()
    }

    /// Blocks until the event is delivered, the emitter closes, or the
    /// caller's context is canceled.
    pub async fn emit(
        &self,
        cancel: &CancellationToken,
        obj: ObjectMetadata,
    ) -> Result<(), EmitError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EmitError::Closed);
        }
        let Some(tx) = self.tx.lock().unwrap().clone() else {
            return Err(EmitError::Closed);
        };

        self.inflight.fetch_add(1, Ordering::AcqRel);
        let result = tokio::select! {
            _ = self.done.cancelled() => Err(EmitError::Closed),
            _ = cancel.cancelled() => Err(EmitError::Canceled),
            sent = tx.send(obj) => sent.map_err(|_| EmitError::Closed),
        };
        if self.inflight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.drained.notify_waiters();
        }
        result
    }

    /// Signals blocked emits, waits for the in-flight ones to finish, then
    /// closes the channel so the consumer drains and stops. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.done.cancel();

        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.inflight.load(Ordering::Acquire) == 0 {
                break;
            }
            notified.await;
        }

        *self.tx.lock().unwrap() = None;
    }
}
