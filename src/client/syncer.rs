//! Applies plans against the server and keeps reconciling on an interval.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use futures_util::TryStreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::indexer::{FileMetadata, Indexer};
use crate::client::planner::{self, Plan, PlanRequest};
use crate::client::rest::Client;
use crate::psurl::{self, UrlData};

const PRESIGNED_TTL: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_key: String,
}

/// Executes every request in `plan` on a worker pool of `workers` tasks.
/// The first failing request aborts the batch.
pub async fn apply(
    cancel: &CancellationToken,
    client: &Client,
    root: &Path,
    plan: Plan,
    workers: usize,
    creds: &Credentials,
) -> Result<()> {
    let upload_url = client.upload_url()?;

    futures_util::stream::iter(plan.requests.into_iter().map(anyhow::Ok))
        .try_for_each_concurrent(workers.max(1), |request| {
            let upload_url = upload_url.clone();
            async move {
                match request {
                    PlanRequest::Upload(md) => {
                        upload_one(cancel, client, root, &upload_url, md, creds).await
                    }
                    PlanRequest::Delete(key) => {
                        client
                            .delete(cancel, &key)
                            .await
                            .with_context(|| format!("delete {key:?} via rest client"))?;
                        info!(key, "delete applied");
                        Ok(())
                    }
                }
            }
        })
        .await
}

async fn upload_one(
    cancel: &CancellationToken,
    client: &Client,
    root: &Path,
    upload_url: &str,
    md: FileMetadata,
    creds: &Credentials,
) -> Result<()> {
    let abs = root.join(&md.path);
    if let Err(err) = tokio::fs::File::open(&abs).await {
        // must have been deleted since it was indexed; ignore
        warn!(path = %md.path, error = %err, "failed to open file for upload, ignoring");
        return Ok(());
    }

    let url_data = UrlData {
        object_key: md.path.clone(),
        sha256_checksum: md.sha256.clone(),
        size: md.size,
        mtime: md.mtime,
        expiry: Utc::now().timestamp() + PRESIGNED_TTL.as_secs() as i64,
        access_key_id: creds.access_key_id.clone(),
    };
    let presigned = psurl::generate(&url_data, upload_url, &creds.secret_key);

    client
        .upload(cancel, &abs, &presigned, md.size)
        .await
        .with_context(|| format!("upload {:?} via presigned url", md.path))?;
    info!(path = %md.path, size = md.size, "upload applied");
    Ok(())
}

pub struct Syncer {
    client: Client,
    creds: Credentials,
    root: PathBuf,
    workers: usize,
    interval: Duration,
}

impl Syncer {
    pub fn new(
        client: Client,
        creds: Credentials,
        root: PathBuf,
        workers: usize,
        interval: Duration,
    ) -> Self {
        Self {
            client,
            creds,
            root,
            workers,
            interval,
        }
    }

    /// The initial reconcile diffs against a server snapshot; subsequent
    /// rounds only push the changes accumulated since the last purge.
    pub async fn run(&self, cancel: CancellationToken, indexer: Arc<Indexer>) -> Result<()> {
        let server = self
            .client
            .snapshot(&cancel)
            .await
            .context("get initial server snapshot")?;
        let local = indexer.snapshot_and_purge();
        let plan = planner::generate(local, Some(&server));
        info!(requests = plan.requests.len(), "applying initial plan");
        apply(&cancel, &self.client, &self.root, plan, self.workers, &self.creds).await?;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.interval) => {}
            }

            let local = indexer.snapshot_and_purge();
            if local.is_empty() {
                continue;
            }
            let plan = planner::generate(local, None);
            debug!(requests = plan.requests.len(), "applying periodic plan");
            apply(&cancel, &self.client, &self.root, plan, self.workers, &self.creds).await?;
        }
    }
}
