//! Scenario tests against the server router: presigned uploads, snapshot,
//! deletion and janitor cleanup.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use chrono::Utc;
use http_body_util::BodyExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use dirsync::psurl::{self, UrlData};
use dirsync::server::auth::{AccessKey, Auth};
use dirsync::server::blobstore::FsStore;
use dirsync::server::emitter::Emitter;
use dirsync::server::handlers::{router, AppState};
use dirsync::server::janitor::Janitor;
use dirsync::server::store::{MetadataStore, ObjectMetadata};

const HELLO_SHA256: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

struct Harness {
    app: axum::Router,
    key: AccessKey,
    blob_dir: tempfile::TempDir,
    events: mpsc::UnboundedReceiver<ObjectMetadata>,
}

/// Builds a router over fresh state. Deletion events are drained into an
/// unbounded channel so capacity-1 emits never block a request.
async fn harness() -> Harness {
    let auth = Arc::new(Auth::new());
    let key = auth.generate_access_key();

    let emitter = Arc::new(Emitter::new());
    let mut raw_events = emitter.take_receiver().unwrap();
    let (ev_tx, events) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(event) = raw_events.recv().await {
            let _ = ev_tx.send(event);
        }
    });

    let store = Arc::new(MetadataStore::new(emitter));
    let blob_dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(FsStore::new(blob_dir.path()).await.unwrap());

    let state = AppState {
        auth,
        store,
        storage,
        cancel: CancellationToken::new(),
    };

    Harness {
        app: router(state),
        key,
        blob_dir,
        events,
    }
}

fn signed_url(key: &AccessKey, object_key: &str, sha256: &str, size: i64, expiry: i64) -> String {
    let data = UrlData {
        object_key: object_key.to_string(),
        sha256_checksum: sha256.to_string(),
        size,
        mtime: 1_700_000_000,
        expiry,
        access_key_id: key.access_key_id.clone(),
    };
    psurl::generate(&data, "/v1/files/upload", &key.secret_key)
}

fn upload_request(url: &str, body: &'static str) -> Request<Body> {
    Request::builder()
        .method(Method::PUT)
        .uri(url)
        .header(header::CONTENT_LENGTH, body.len().to_string())
        .body(Body::from(body))
        .unwrap()
}

async fn body_json(resp: axum::response::Response) -> serde_json::Value {
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

async fn snapshot_json(app: &axum::Router) -> serde_json::Value {
    let resp = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/v1/snapshot")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(StatusCode::OK, resp.status());
    body_json(resp).await
}

#[tokio::test]
async fn happy_upload_lands_in_the_snapshot() {
    let mut h = harness().await;

    let url = signed_url(
        &h.key,
        "hello.txt",
        HELLO_SHA256,
        11,
        Utc::now().timestamp() + 600,
    );
    let resp = h.app.clone().oneshot(upload_request(&url, "hello world")).await.unwrap();
    assert_eq!(StatusCode::CREATED, resp.status());

    let snapshot = snapshot_json(&h.app).await;
    let entry = &snapshot["key_to_metadata"]["hello.txt"];
    assert_eq!("hello.txt", entry["key"]);
    assert_eq!(11, entry["size"]);
    assert_eq!(HELLO_SHA256, entry["sha256_checksum"]);

    // first upload of a key supersedes nothing
    assert!(h.events.try_recv().is_err());
}

#[tokio::test]
async fn content_length_mismatch_is_rejected() {
    let h = harness().await;

    let url = signed_url(
        &h.key,
        "hello.txt",
        HELLO_SHA256,
        11,
        Utc::now().timestamp() + 600,
    );
    // 10 bytes on the wire against a signed size of 11
    let resp = h.app.clone().oneshot(upload_request(&url, "hello worl")).await.unwrap();
    assert_eq!(StatusCode::BAD_REQUEST, resp.status());
    let body = body_json(resp).await;
    assert_eq!("mismatched Content-Length and size", body["error"]);

    let snapshot = snapshot_json(&h.app).await;
    assert!(snapshot["key_to_metadata"]
        .as_object()
        .unwrap()
        .is_empty());
    // rejected before anything was streamed
    assert_eq!(0, std::fs::read_dir(h.blob_dir.path()).unwrap().count());
}

#[tokio::test]
async fn checksum_mismatch_is_rejected_after_streaming() {
    let h = harness().await;

    let url = signed_url(
        &h.key,
        "hello.txt",
        // signed checksum does not match the body below
        "0000000000000000000000000000000000000000000000000000000000000000",
        11,
        Utc::now().timestamp() + 600,
    );
    let resp = h.app.clone().oneshot(upload_request(&url, "hello world")).await.unwrap();
    assert_eq!(StatusCode::BAD_REQUEST, resp.status());
    let body = body_json(resp).await;
    assert_eq!(
        "provided checksum did not match what was uploaded",
        body["error"]
    );

    // the blob was written regardless; only the metadata commit is skipped
    let snapshot = snapshot_json(&h.app).await;
    assert!(snapshot["key_to_metadata"].as_object().unwrap().is_empty());
    assert_eq!(1, std::fs::read_dir(h.blob_dir.path()).unwrap().count());
}

#[tokio::test]
async fn expired_url_is_forbidden() {
    let h = harness().await;

    let url = signed_url(
        &h.key,
        "hello.txt",
        HELLO_SHA256,
        11,
        Utc::now().timestamp() - 1,
    );
    let resp = h.app.clone().oneshot(upload_request(&url, "hello world")).await.unwrap();
    assert_eq!(StatusCode::FORBIDDEN, resp.status());
    let body = body_json(resp).await;
    assert_eq!("url expired", body["error"]);

    let snapshot = snapshot_json(&h.app).await;
    assert!(snapshot["key_to_metadata"].as_object().unwrap().is_empty());
}

#[tokio::test]
async fn tampered_signature_is_forbidden() {
    let h = harness().await;

    let url = signed_url(
        &h.key,
        "hello.txt",
        HELLO_SHA256,
        11,
        Utc::now().timestamp() + 600,
    );
    // smuggle a different key into the signed query
    let url = url.replace("hello.txt", "other.txt");
    let resp = h.app.clone().oneshot(upload_request(&url, "hello world")).await.unwrap();
    assert_eq!(StatusCode::FORBIDDEN, resp.status());
    let body = body_json(resp).await;
    assert_eq!("signature mismatch", body["error"]);
}

#[tokio::test]
async fn unknown_access_key_is_unauthorized() {
    let h = harness().await;

    let rogue = AccessKey {
        access_key_id: "UNKNOWNKEYID00000000".to_string(),
        secret_key: h.key.secret_key.clone(),
    };
    let url = signed_url(
        &rogue,
        "hello.txt",
        HELLO_SHA256,
        11,
        Utc::now().timestamp() + 600,
    );
    let resp = h.app.clone().oneshot(upload_request(&url, "hello world")).await.unwrap();
    assert_eq!(StatusCode::UNAUTHORIZED, resp.status());
}

#[tokio::test]
async fn supersession_emits_one_deletion_event_for_the_old_object() {
    let mut h = harness().await;

    let first = signed_url(
        &h.key,
        "doc.txt",
        HELLO_SHA256,
        11,
        Utc::now().timestamp() + 600,
    );
    let resp = h.app.clone().oneshot(upload_request(&first, "hello world")).await.unwrap();
    assert_eq!(StatusCode::CREATED, resp.status());

    let second_body = "hello again";
    let second_sha = {
        use sha2::{Digest, Sha256};
        hex::encode(Sha256::digest(second_body.as_bytes()))
    };
    let second = signed_url(
        &h.key,
        "doc.txt",
        &second_sha,
        second_body.len() as i64,
        Utc::now().timestamp() + 600,
    );
    let resp = h.app.clone().oneshot(upload_request(&second, second_body)).await.unwrap();
    assert_eq!(StatusCode::CREATED, resp.status());

    let snapshot = snapshot_json(&h.app).await;
    assert_eq!(second_sha, snapshot["key_to_metadata"]["doc.txt"]["sha256_checksum"]);

    let event = tokio::time::timeout(Duration::from_millis(500), h.events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!("doc.txt", event.key);
    assert_eq!(HELLO_SHA256, event.sha256_checksum);
    assert!(h.events.try_recv().is_err());
}

#[tokio::test]
async fn janitor_removes_superseded_blobs() {
    // Same flow as above, but with the janitor consuming events directly.
    let auth = Arc::new(Auth::new());
    let key = auth.generate_access_key();
    let emitter = Arc::new(Emitter::new());
    let events = emitter.take_receiver().unwrap();
    let store = Arc::new(MetadataStore::new(emitter));
    let blob_dir = tempfile::tempdir().unwrap();
    let storage = Arc::new(FsStore::new(blob_dir.path()).await.unwrap());

    let cancel = CancellationToken::new();
    let janitor_storage = storage.clone();
    let janitor_cancel = cancel.clone();
    tokio::spawn(async move {
        Janitor::new(janitor_storage).run(janitor_cancel, events).await;
    });

    let app = router(AppState {
        auth,
        store,
        storage,
        cancel,
    });

    let first = signed_url(&key, "doc.txt", HELLO_SHA256, 11, Utc::now().timestamp() + 600);
    let resp = app.clone().oneshot(upload_request(&first, "hello world")).await.unwrap();
    assert_eq!(StatusCode::CREATED, resp.status());

    let second_body = "hello again";
    let second_sha = {
        use sha2::{Digest, Sha256};
        hex::encode(Sha256::digest(second_body.as_bytes()))
    };
    let second = signed_url(
        &key,
        "doc.txt",
        &second_sha,
        second_body.len() as i64,
        Utc::now().timestamp() + 600,
    );
    let resp = app.clone().oneshot(upload_request(&second, second_body)).await.unwrap();
    assert_eq!(StatusCode::CREATED, resp.status());

    // the superseded blob disappears; the current one stays
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let blobs: Vec<_> = std::fs::read_dir(blob_dir.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        if blobs.len() == 1 {
            let remaining = std::fs::read(&blobs[0]).unwrap();
            assert_eq!(second_body.as_bytes(), remaining.as_slice());
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "janitor did not clean up the superseded blob"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn delete_of_a_nonexistent_key_succeeds_without_events() {
    let mut h = harness().await;

    let resp = h
        .app
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::DELETE)
                .uri("/v1/files/absent")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(StatusCode::OK, resp.status());
    assert_eq!(serde_json::json!({}), body_json(resp).await);
    assert!(h.events.try_recv().is_err());
}

#[tokio::test]
async fn delete_removes_the_key_from_the_snapshot() {
    let mut h = harness().await;

    let url = signed_url(
        &h.key,
        "dir/nested.txt",
        HELLO_SHA256,
        11,
        Utc::now().timestamp() + 600,
    );
    let resp = h.app.clone().oneshot(upload_request(&url, "hello world")).await.unwrap();
    assert_eq!(StatusCode::CREATED, resp.status());

    // keys with slashes travel as one escaped segment
    let resp = h
        .app
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::DELETE)
                .uri("/v1/files/dir%2Fnested.txt")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(StatusCode::OK, resp.status());

    let snapshot = snapshot_json(&h.app).await;
    assert!(snapshot["key_to_metadata"].as_object().unwrap().is_empty());

    let event = tokio::time::timeout(Duration::from_millis(500), h.events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!("dir/nested.txt", event.key);
}

#[tokio::test]
async fn blank_keys_are_rejected() {
    let h = harness().await;

    let resp = h
        .app
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::DELETE)
                .uri("/v1/files/%20%20")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(StatusCode::BAD_REQUEST, resp.status());
}

#[tokio::test]
async fn metrics_render_in_prometheus_text_format() {
    let h = harness().await;

    let resp = h
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(StatusCode::OK, resp.status());
    let text = String::from_utf8(
        resp.into_body().collect().await.unwrap().to_bytes().to_vec(),
    )
    .unwrap();
    assert!(text.contains("# TYPE dirsync_uploads_total counter"));
}
