//! Content hashing for the attachment store.
//!
//! Stored blobs are addressed by the lowercase sha256 hex of their bytes.
//! Attachments whose bytes have not been fetched yet carry a placeholder
//! of the form `URL:<sha256 of the source URL>` instead.

use sha2::{Digest, Sha256};

/// Prefix marking a hash that does not address a stored blob yet.
pub const URL_HASH_PREFIX: &str = "URL:";

/// Lowercase hex sha256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Placeholder hash for an attachment backed by a remote URL.
pub fn placeholder_hash(url: &str) -> String {
    format!("{}{}", URL_HASH_PREFIX, sha256_hex(url.as_bytes()))
}

pub fn is_placeholder(hash: &str) -> bool {
    hash.starts_with(URL_HASH_PREFIX)
}

/// Whether `hash` is safe to use as a file name under the blob root.
///
/// Accepts 64 lowercase hex characters only, so a request can never walk
/// out of the storage directory.
pub fn is_content_hash(hash: &str) -> bool {
    hash.len() == 64 && hash.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}
