//! HTTP client for the mirror server.
//!
//! Transport failures are retried with exponential backoff; non-2xx
//! responses are not, they fail the call with the status in the error.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use reqwest::header::CONTENT_LENGTH;
use serde::Deserialize;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::retry::{self, Backoff};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Server-side view of a synced file, as returned by the snapshot endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RemoteFile {
    pub key: String,
    pub size: i64,
    pub sha256_checksum: String,
}

#[derive(Debug, Deserialize)]
struct SnapshotResponse {
    key_to_metadata: HashMap<String, RemoteFile>,
}

pub struct Client {
    http: reqwest::Client,
    base_url: Url,
    upload_endpoint: String,
}

impl Client {
    pub fn new(base_url: &str, upload_endpoint: &str) -> Result<Self> {
        let base_url = Url::parse(base_url).context("parse server address")?;
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("build http client")?;
        Ok(Self {
            http,
            base_url,
            upload_endpoint: upload_endpoint.to_string(),
        })
    }

    /// Base URL for presigned uploads.
    pub fn upload_url(&self) -> Result<String> {
        let url = self
            .base_url
            .join(&self.upload_endpoint)
            .context("join upload endpoint")?;
        Ok(url.to_string())
    }

    pub async fn snapshot(
        &self,
        cancel: &CancellationToken,
    ) -> Result<HashMap<String, RemoteFile>> {
        let url = self.base_url.join("/v1/snapshot")?;

        let resp = retry::retry(cancel, Backoff::default(), || {
            let url = url.clone();
            async move { self.http.get(url).send().await.context("http request failed") }
        })
        .await
        .context("get snapshot with retrying")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("http get snapshot failed: {status}: {body:?}"));
        }

        let body: SnapshotResponse = resp.json().await.context("decode snapshot response")?;
        Ok(body.key_to_metadata)
    }

    /// PUTs the file at `path` against a presigned URL. The file is
    /// reopened on every attempt so retries stream from the start.
    pub async fn upload(
        &self,
        cancel: &CancellationToken,
        path: &Path,
        presigned_url: &str,
        size: i64,
    ) -> Result<()> {
        let resp = retry::retry(cancel, Backoff::default(), || async move {
            let file = tokio::fs::File::open(path)
                .await
                .context("open file for upload")?;
            let body = reqwest::Body::wrap_stream(ReaderStream::new(file));
            self.http
                .put(presigned_url)
                .header(CONTENT_LENGTH, size)
                .body(body)
                .send()
                .await
                .context("http request failed")
        })
        .await
        .context("upload with retrying")?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("http upload failed: {status}: {body:?}"));
        }
        Ok(())
    }

    pub async fn delete(&self, cancel: &CancellationToken, key: &str) -> Result<()> {
        let url = self.delete_url(key)?;

        let resp = retry::retry(cancel, Backoff::default(), || {
            let url = url.clone();
            async move {
                self.http
                    .delete(url)
                    .send()
                    .await
                    .context("http request failed")
            }
        })
        .await
        .context("delete with retrying")?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow!("http delete failed: {status}: {body:?}"));
        }
        Ok(())
    }

    // Keys may contain slashes; they travel as a single escaped path
    // segment.
    fn delete_url(&self, key: &str) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow!("server address cannot be a base url"))?
            .pop_if_empty()
            .push("v1")
            .push("files")
            .push(key);
        Ok(url)
    }
}
