//! Blob storage: raw object bytes under opaque IDs.

use std::path::PathBuf;
use std::pin::Pin;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::info;

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

#[async_trait]
pub trait BlobStorage: Send + Sync {
    /// Streams `body` into the blob named `object_id`, hashing along the
    /// way. Returns the hex SHA-256 of the data and the bytes written.
    async fn put_object(&self, body: ByteStream, object_id: &str) -> Result<(String, i64)>;

    /// Removes the blob. Deleting a missing object is not an error.
    async fn delete_object(&self, object_id: &str) -> Result<()>;
}

/// Filesystem-backed storage scoped to a single directory.
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub async fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        info!(root = %root.display(), "using directory-scoped blob storage");
        tokio::fs::create_dir_all(&root)
            .await
            .with_context(|| format!("create blob root {}", root.display()))?;
        Ok(Self { root })
    }

    // Object IDs are server-generated, but the scoping holds regardless of
    // the caller: an id must be a single path component.
    fn object_path(&self, object_id: &str) -> Result<PathBuf> {
        if object_id.is_empty()
            || object_id == "."
            || object_id == ".."
            || object_id.contains(['/', '\\'])
        {
            bail!("invalid object id {object_id:?}");
        }
        Ok(self.root.join(object_id))
    }
}

#[async_trait]
impl BlobStorage for FsStore {
    async fn put_object(&self, mut body: ByteStream, object_id: &str) -> Result<(String, i64)> {
        let path = self.object_path(object_id)?;
        let file = tokio::fs::File::create(&path)
            .await
            .context("create object file")?;
        let mut writer = tokio::io::BufWriter::with_capacity(256 * 1024, file);

        let mut hasher = Sha256::new();
        let mut written: i64 = 0;
        while let Some(chunk) = body.next().await {
            let chunk = chunk.context("read body chunk")?;
            hasher.update(&chunk);
            writer
                .write_all(&chunk)
                .await
                .context("write to object file")?;
            written += chunk.len() as i64;
        }
        writer.flush().await.context("flush object file")?;

        Ok((hex::encode(hasher.finalize()), written))
    }

    async fn delete_object(&self, object_id: &str) -> Result<()> {
        let path = self.object_path(object_id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("remove object {object_id}")),
        }
    }
}
