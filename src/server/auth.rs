//! Access key issuance and lookup.
//!
//! Raw secrets stay in memory for the lifetime of the process; they are not
//! hashed because validating presigned URLs needs the raw value.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use dashmap::DashMap;
use data_encoding::BASE32;
use rand::rngs::OsRng;
use rand::RngCore;

const ACCESS_KEY_ID_LEN: usize = 20;
const SECRET_KEY_LEN: usize = 40;

#[derive(Debug, Clone)]
pub struct AccessKey {
    pub access_key_id: String,
    pub secret_key: String,
}

#[derive(Default)]
pub struct Auth {
    keys: DashMap<String, String>,
}

impl Auth {
    pub fn new() -> Self {
        Self {
            keys: DashMap::new(),
        }
    }

    /// Generates an AWS-style pair. The key id is base32 (upper case and
    /// digits, pleasant to share); the secret is base64.
    pub fn generate_access_key(&self) -> AccessKey {
        let mut id_bytes = [0u8; 12];
        OsRng.fill_bytes(&mut id_bytes);
        let access_key_id = BASE32.encode(&id_bytes)[..ACCESS_KEY_ID_LEN].to_string();

        let mut secret_bytes = [0u8; 30];
        OsRng.fill_bytes(&mut secret_bytes);
        let secret_key = BASE64.encode(secret_bytes)[..SECRET_KEY_LEN].to_string();

        self.keys
            .insert(access_key_id.clone(), secret_key.clone());

        AccessKey {
            access_key_id,
            secret_key,
        }
    }

    pub fn secret_key_by_id(&self, key_id: &str) -> Option<String> {
        self.keys.get(key_id).map(|secret| secret.clone())
    }
}
