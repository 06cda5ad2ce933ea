//! Checksum utilities for object verification

use crate::error::{Result, VaultError};
use sha2::{Digest, Sha256};

/// Compute the hex SHA-256 digest of an in-memory buffer
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Verify that a buffer hashes to the expected digest
pub fn verify_sha256(data: &[u8], expected: &str) -> Result<()> {
    let actual = sha256_hex(data);
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(VaultError::ChecksumMismatch {
            expected: expected.to_string(),
            actual,
        })
    }
}
