//! Continuous directory mirroring to a remote object store over HTTP.
//!
//! Two processes cooperate: a client that observes a local tree through a
//! write-ahead log of filesystem events, maintains a content-addressed
//! index, and reconciles it against the server by uploading and deleting
//! through presigned URLs; and a server that stores blobs under opaque
//! object IDs, tracks per-key metadata with in-flight upload semantics, and
//! reclaims superseded blobs asynchronously.

pub mod client;
pub mod psurl;
pub mod retry;
pub mod server;
pub mod wal;
