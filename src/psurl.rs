//! Presigned URL codec shared by the client and the server.
//!
//! A URL carries the intended operation (key, checksum, size, mtime) plus an
//! expiry and the access key id, authenticated by an HMAC-SHA256 over the
//! lexicographically sorted `key=value` lines of every parameter except the
//! signature itself.

use std::collections::HashMap;

use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

pub const OBJECT_KEY: &str = "key";
pub const SHA256_CHECKSUM: &str = "sha256";
pub const SIZE: &str = "size";
pub const MTIME: &str = "mtime";
pub const EXPIRY: &str = "exp";
pub const ACCESS_KEY_ID: &str = "aki";
pub const SIGNATURE: &str = "sig";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum UrlError {
    #[error("url expired")]
    Expired,
    #[error("signature mismatch")]
    SignatureMismatch,
    #[error("missing signature")]
    MissingSignature,
    #[error("invalid signature encoding: {0}")]
    SignatureEncoding(#[from] hex::FromHexError),
    #[error("invalid or missing {field}")]
    InvalidField { field: &'static str },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlData {
    pub object_key: String,
    pub sha256_checksum: String,
    pub size: i64,
    pub mtime: i64,
    pub expiry: i64,
    pub access_key_id: String,
}

/// Builds the signed URL for `data` against `base_url`.
pub fn generate(data: &UrlData, base_url: &str, secret_key: &str) -> String {
    let params = [
        (OBJECT_KEY, data.object_key.clone()),
        (SHA256_CHECKSUM, data.sha256_checksum.clone()),
        (SIZE, data.size.to_string()),
        (MTIME, data.mtime.to_string()),
        (EXPIRY, data.expiry.to_string()),
        (ACCESS_KEY_ID, data.access_key_id.clone()),
    ];

    let input = signing_input(params.iter().map(|(k, v)| (*k, v.as_str())));
    let sig = hex::encode(sign(&input, secret_key));

    let mut query = url::form_urlencoded::Serializer::new(String::new());
    for (k, v) in &params {
        query.append_pair(k, v);
    }
    query.append_pair(SIGNATURE, &sig);

    format!("{}?{}", base_url, query.finish())
}

/// Checks expiry and signature over the decoded query parameters and
/// returns the parsed payload. Expiry is checked first so an expired URL is
/// rejected as such even if it was also tampered with.
pub fn validate(values: &HashMap<String, String>, secret_key: &str) -> Result<UrlData, UrlError> {
    let expiry: i64 = values
        .get(EXPIRY)
        .and_then(|v| v.parse().ok())
        .ok_or(UrlError::InvalidField { field: EXPIRY })?;
    if Utc::now().timestamp() > expiry {
        return Err(UrlError::Expired);
    }

    let provided = values
        .get(SIGNATURE)
        .filter(|s| !s.is_empty())
        .ok_or(UrlError::MissingSignature)?;
    let provided = hex::decode(provided)?;

    let input = signing_input(values.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes())
        .expect("hmac accepts keys of any length");
    mac.update(input.as_bytes());
    // verify_slice compares in constant time.
    mac.verify_slice(&provided)
        .map_err(|_| UrlError::SignatureMismatch)?;

    let size: i64 = values
        .get(SIZE)
        .and_then(|v| v.parse().ok())
        .ok_or(UrlError::InvalidField { field: SIZE })?;
    let mtime: i64 = values
        .get(MTIME)
        .and_then(|v| v.parse().ok())
        .ok_or(UrlError::InvalidField { field: MTIME })?;

    Ok(UrlData {
        object_key: values.get(OBJECT_KEY).cloned().unwrap_or_default(),
        sha256_checksum: values.get(SHA256_CHECKSUM).cloned().unwrap_or_default(),
        size,
        mtime,
        expiry,
        access_key_id: values.get(ACCESS_KEY_ID).cloned().unwrap_or_default(),
    })
}

// The signature must be deterministic across generation and validation, so
// every parameter except `sig` goes in sorted by name.
fn signing_input<'a>(params: impl Iterator<Item = (&'a str, &'a str)>) -> String {
    let mut pairs: Vec<(&str, &str)> = params.filter(|(k, _)| *k != SIGNATURE).collect();
    pairs.sort_by_key(|(k, _)| *k);

    let mut input = String::new();
    for (k, v) in pairs {
        input.push_str(k);
        input.push('=');
        input.push_str(v);
        input.push('\n');
    }
    input
}

fn sign(input: &str, secret_key: &str) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes())
        .expect("hmac accepts keys of any length");
    mac.update(input.as_bytes());
    mac.finalize().into_bytes().to_vec()
}
