//! Password digest helpers shared by the hub and its tooling.
//!
//! Credentials travel inside `register`/`login` frames and are stored as
//! SHA-256 hex digests in the user registry. This is the protocol's whole
//! credential scheme; session state stays on the hub side.
//!
use sha2::{Digest, Sha256};

/// Digest a password for storage and comparison.
pub fn hash_password(password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Check a presented password against a stored digest.
pub fn verify_password(password: &str, stored_digest: &str) -> bool {
    hash_password(password) == stored_digest
}
