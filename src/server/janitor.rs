//! Consumes deletion events and physically removes superseded blobs.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::retry::{self, Backoff};
use crate::server::blobstore::BlobStorage;
use crate::server::metrics;
use crate::server::store::ObjectMetadata;

pub struct Janitor {
    storage: Arc<dyn BlobStorage>,
}

impl Janitor {
    pub fn new(storage: Arc<dyn BlobStorage>) -> Self {
        Self { storage }
    }

    /// Drains `events` until the channel closes or `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken, mut events: mpsc::Receiver<ObjectMetadata>) {
        info!("running janitor");
        loop {
            let md = tokio::select! {
                _ = cancel.cancelled() => return,
                md = events.recv() => match md {
                    Some(md) => md,
                    None => return,
                },
            };
            self.cleanup(&cancel, md).await;
        }
    }

    async fn cleanup(&self, cancel: &CancellationToken, md: ObjectMetadata) {
        debug!(object_id = %md.object_id, key = %md.key, "cleaning up object");

        let result = retry::retry(cancel, Backoff::default(), || {
            self.storage.delete_object(&md.object_id)
        })
        .await;

        match result {
            Ok(()) => {
                metrics::inc(&metrics::JANITOR_CLEANUPS_TOTAL);
                debug!(object_id = %md.object_id, "object cleaned up");
            }
            Err(err) if cancel.is_cancelled() => {
                // the emitter does not persist, so this event is gone; the
                // blob stays behind
                error!(object_id = %md.object_id, error = %err, "canceled while cleaning up object");
            }
            Err(err) => {
                metrics::inc(&metrics::JANITOR_FAILURES_TOTAL);
                error!(object_id = %md.object_id, error = %err, "failed to clean up object");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use bytes::Bytes;
    use chrono::Utc;

    use crate::server::blobstore::{BlobStorage as _, ByteStream, FsStore};

    fn body(data: &'static [u8]) -> ByteStream {
        Box::pin(futures_util::stream::iter([anyhow::Ok(
            Bytes::from_static(data),
        )]))
    }

    fn event(object_id: &str) -> ObjectMetadata {
        ObjectMetadata {
            key: "k".to_string(),
            object_id: object_id.to_string(),
            sha256_checksum: String::new(),
            size: 1,
            mtime: 0,
            created_at: Utc::now(),
            completed_at: Some(Utc::now()),
        }
    }

    #[tokio::test]
    async fn removes_the_blob_for_each_event() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(FsStore::new(dir.path()).await.unwrap());
        storage.put_object(body(b"old"), "stale").await.unwrap();

        let (tx, rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let janitor = Janitor::new(storage);
        let run_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            janitor.run(run_cancel, rx).await;
        });

        tx.send(event("stale")).await.unwrap();
        // a blob that never existed is fine too
        tx.send(event("already-gone")).await.unwrap();
        drop(tx);

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(!dir.path().join("stale").exists());
    }

    #[tokio::test]
    async fn stops_on_cancellation() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(FsStore::new(dir.path()).await.unwrap());

        let (_tx, rx) = mpsc::channel::<ObjectMetadata>(1);
        let cancel = CancellationToken::new();
        let janitor = Janitor::new(storage);
        let run_cancel = cancel.clone();
        let handle = tokio::spawn(async move {
            janitor.run(run_cancel, rx).await;
        });

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
