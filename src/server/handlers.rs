//! HTTP surface of the mirror server.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path as UrlPath, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, put};
use axum::{Json, Router};
use chrono::Utc;
use futures_util::TryStreamExt;
use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::psurl::{self, UrlError};
use crate::server::auth::Auth;
use crate::server::blobstore::BlobStorage;
use crate::server::metrics;
use crate::server::store::{MetadataStore, ObjectMetadata};

/// Shared state behind every handler.
#[derive(Clone)]
pub struct AppState {
    pub auth: Arc<Auth>,
    pub store: Arc<MetadataStore>,
    pub storage: Arc<dyn BlobStorage>,
    /// Process-wide shutdown token, threaded into store emits.
    pub cancel: CancellationToken,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/files/upload", put(upload_file))
        .route("/v1/files/{key}", delete(delete_file))
        .route("/v1/snapshot", get(snapshot))
        .route("/metrics", get(render_metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: message.into(),
        }
    }

    fn forbidden(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

/// `PUT /v1/files/upload?key&sha256&size&mtime&exp&aki&sig`
///
/// Validates the presigned parameters, streams the body into blob storage
/// under a fresh object id, cross-checks size and checksum, then commits
/// the metadata.
async fn upload_file(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Body,
) -> Result<StatusCode, AppError> {
    let access_key_id = params
        .get(psurl::ACCESS_KEY_ID)
        .cloned()
        .unwrap_or_default();
    let Some(secret_key) = state.auth.secret_key_by_id(&access_key_id) else {
        warn!(access_key_id, "could not authorize upload request");
        return Err(AppError::unauthorized("invalid access key id"));
    };

    let url_data = psurl::validate(&params, &secret_key).map_err(|err| {
        warn!(error = %err, "failed to validate presigned url while uploading file");
        match err {
            UrlError::Expired | UrlError::SignatureMismatch => AppError::forbidden(err.to_string()),
            other => AppError::bad_request(format!("invalid presigned url: {other}")),
        }
    })?;

    // Fail early if the Content-Length disagrees with the signed size; no
    // point streaming a request that cannot commit.
    let content_length = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<i64>().ok())
        .unwrap_or(-1);
    if content_length != url_data.size {
        warn!(
            content_length,
            size = url_data.size,
            key = %url_data.object_key,
            "mismatched content-length with presigned url size while uploading file"
        );
        metrics::inc(&metrics::UPLOAD_FAILURES_TOTAL);
        return Err(AppError::bad_request("mismatched Content-Length and size"));
    }

    let object_id = Uuid::now_v7().to_string();
    state
        .store
        .create(ObjectMetadata {
            key: url_data.object_key.clone(),
            object_id: object_id.clone(),
            sha256_checksum: url_data.sha256_checksum.clone(),
            size: url_data.size,
            mtime: url_data.mtime,
            created_at: Utc::now(),
            completed_at: None,
        })
        .await
        .map_err(|err| {
            error!(error = %err, "failed to create object metadata in store");
            AppError::internal(format!("could not create object metadata in store: {err}"))
        })?;

    let stream = body.into_data_stream().map_err(anyhow::Error::from);
    let (checksum, written) = state
        .storage
        .put_object(Box::pin(stream), &object_id)
        .await
        .map_err(|err| {
            error!(error = %err, object_id, "failed to save file to storage");
            metrics::inc(&metrics::UPLOAD_FAILURES_TOTAL);
            AppError::internal(format!("failed to save file to storage: {err}"))
        })?;

    // TODO: a mismatch below strands both the written blob and the
    // in-flight record; emit a cleanup event for them once the deletion
    // queue is durable.
    if checksum != url_data.sha256_checksum {
        warn!(key = %url_data.object_key, "provided checksum did not match what was uploaded");
        metrics::inc(&metrics::UPLOAD_FAILURES_TOTAL);
        return Err(AppError::bad_request(
            "provided checksum did not match what was uploaded",
        ));
    }
    if written != url_data.size {
        warn!(
            size = url_data.size,
            written,
            key = %url_data.object_key,
            "provided file size did not match what was uploaded"
        );
        metrics::inc(&metrics::UPLOAD_FAILURES_TOTAL);
        return Err(AppError::bad_request(
            "provided file size did not match what was uploaded",
        ));
    }

    state
        .store
        .put_object_completed(&state.cancel, &url_data.object_key, &object_id)
        .await
        .map_err(|err| {
            error!(error = %err, key = %url_data.object_key, "failed to mark object metadata as completed");
            AppError::internal(format!(
                "failed to mark object metadata as completed: {err}"
            ))
        })?;

    metrics::inc(&metrics::UPLOADS_TOTAL);
    metrics::add(&metrics::UPLOAD_BYTES_TOTAL, written as u64);
    debug!(key = %url_data.object_key, object_id, "successfully uploaded file to storage");
    Ok(StatusCode::CREATED)
}

/// `DELETE /v1/files/{key}`
async fn delete_file(
    State(state): State<AppState>,
    UrlPath(key): UrlPath<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let key = key.trim();
    if key.is_empty() {
        warn!("empty file key provided in file deletion request");
        return Err(AppError::bad_request("invalid request: 'key' is required"));
    }

    state.store.delete(&state.cancel, key).await.map_err(|err| {
        error!(error = %err, key, "failed to delete file metadata in store");
        AppError::internal(format!("could not delete file metadata: {err}"))
    })?;

    metrics::inc(&metrics::DELETES_TOTAL);
    debug!(key, "object marked as deleted");
    Ok(Json(json!({})))
}

#[derive(Debug, Serialize)]
struct FileSummary {
    key: String,
    size: i64,
    sha256_checksum: String,
}

#[derive(Debug, Serialize)]
struct SnapshotResponse {
    key_to_metadata: HashMap<String, FileSummary>,
}

/// `GET /v1/snapshot`
async fn snapshot(State(state): State<AppState>) -> Json<SnapshotResponse> {
    let snapshot = state.store.snapshot().await;
    let key_to_metadata = snapshot
        .into_iter()
        .map(|(key, md)| {
            let summary = FileSummary {
                key: key.clone(),
                size: md.size,
                sha256_checksum: md.sha256_checksum,
            };
            (key, summary)
        })
        .collect();
    Json(SnapshotResponse { key_to_metadata })
}

/// `GET /metrics`
async fn render_metrics() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::render(),
    )
}
