//! In-memory object metadata with in-flight upload semantics.
//!
//! A key maps to at most one completed object plus any number of concurrent
//! in-flight uploads. While an upload is in flight the previously completed
//! object stays visible; completion supersedes it and queues it for
//! deletion.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::server::emitter::{EmitError, Emitter};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMetadata {
    pub key: String,
    pub object_id: String,
    pub sha256_checksum: String,
    pub size: i64,
    pub mtime: i64,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
    #[error("key is required for storing metadata")]
    MissingKey,
    #[error("object id is required for storing metadata")]
    MissingObjectId,
    #[error("could not emit object deletion event: {0}")]
    Emit(#[from] EmitError),
}

#[derive(Default)]
struct Inner {
    completed: HashMap<String, ObjectMetadata>,
    inflight: HashMap<String, Vec<ObjectMetadata>>,
}

pub struct MetadataStore {
    emitter: Arc<Emitter>,
    inner: Mutex<Inner>,
}

impl MetadataStore {
    pub fn new(emitter: Arc<Emitter>) -> Self {
        Self {
            emitter,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// A by-value copy of the completed objects.
    pub async fn snapshot(&self) -> HashMap<String, ObjectMetadata> {
        self.inner.lock().await.completed.clone()
    }

    /// Records the start of an upload. The entry stays in flight until
    /// [`MetadataStore::put_object_completed`] promotes it.
    pub async fn create(&self, md: ObjectMetadata) -> Result<(), StoreError> {
        if md.key.is_empty() {
            return Err(StoreError::MissingKey);
        }
        if md.object_id.is_empty() {
            return Err(StoreError::MissingObjectId);
        }

        let mut inner = self.inner.lock().await;
        let key = md.key.clone();
        inner.inflight.entry(key).or_default().push(ObjectMetadata {
            completed_at: None,
            ..md
        });
        Ok(())
    }

    /// Promotes the in-flight upload `object_id` under `key` to the
    /// completed slot. If another object already held the slot, a deletion
    /// event carrying it goes out first.
    ///
    /// The emitter is awaited while the store lock is held so deletion
    /// events observe transitions in order; consumers must not call back
    /// into the store. Nothing mutates if the emitter fails.
    pub async fn put_object_completed(
        &self,
        cancel: &CancellationToken,
        key: &str,
        object_id: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;

        let pos = inner
            .inflight
            .get(key)
            .and_then(|uploads| uploads.iter().position(|o| o.object_id == object_id))
            .ok_or(StoreError::NotFound)?;

        if let Some(existing) = inner.completed.get(key).cloned() {
            self.emitter.emit(cancel, existing).await?;
        }

        let uploads = inner.inflight.get_mut(key).ok_or(StoreError::NotFound)?;
        let mut entry = uploads.remove(pos);
        let drained = uploads.is_empty();
        entry.completed_at = Some(Utc::now());
        if drained {
            inner.inflight.remove(key);
        }
        inner.completed.insert(key.to_string(), entry);
        Ok(())
    }

    /// Removes the completed object under `key`, emitting a deletion event
    /// for it. Deleting an absent key succeeds without emitting; in-flight
    /// uploads are untouched either way.
    pub async fn delete(&self, cancel: &CancellationToken, key: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;

        let Some(existing) = inner.completed.get(key).cloned() else {
            return Ok(());
        };
        self.emitter.emit(cancel, existing).await?;
        inner.completed.remove(key);
        Ok(())
    }
}
