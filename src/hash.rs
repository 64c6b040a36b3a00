//! Pluggable dedup key hashing (§4.3, §9). Defaults to SHA-256 over the
//! envelope's decoded `message` field, so trace-context variation (which
//! only touches the `trace` field) never defeats dedup.

use sha2::{Digest, Sha256};

pub type KeyHasher = std::sync::Arc<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;

pub fn sha256_hasher() -> KeyHasher {
    std::sync::Arc::new(|bytes: &[u8]| -> Vec<u8> { Sha256::digest(bytes).to_vec() })
}
