//! Payload digests used for change detection.

use sha2::{Digest, Sha256};

/// SHA-256 hex digest of a response payload.
pub fn compute_digest(payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hex::encode(hasher.finalize())
}
