//! SHA-256 checksum utilities for content addressing and verification

use crate::error::{HarvestError, Result};
use sha2::{Digest, Sha256};

/// Length of a hex-encoded SHA-256 digest
pub const SHA256_HEX_LEN: usize = 64;

/// Compute the lowercase hex SHA-256 digest of a byte slice
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Compute the SHA-256 digest of several parts, separated by `separator`
///
/// Used for keys derived from more than one value, where plain concatenation
/// would make `("ab", "c")` and `("a", "bc")` collide.
pub fn sha256_hex_parts<I, S>(parts: I, separator: u8) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<[u8]>,
{
    let mut hasher = Sha256::new();
    for (index, part) in parts.into_iter().enumerate() {
        if index > 0 {
            hasher.update([separator]);
        }
        hasher.update(part.as_ref());
    }
    hex::encode(hasher.finalize())
}

/// Verify that `data` hashes to `expected` (case-insensitive)
pub fn verify_checksum(data: &[u8], expected: &str) -> Result<()> {
    let actual = sha256_hex(data);
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(HarvestError::ChecksumMismatch {
            expected: expected.to_string(),
            actual,
        })
    }
}

/// Check that a string is a well-formed hex SHA-256 digest
pub fn parse_sha256_hex(value: &str) -> Result<String> {
    if value.len() == SHA256_HEX_LEN && value.bytes().all(|b| b.is_ascii_hexdigit()) {
        Ok(value.to_ascii_lowercase())
    } else {
        Err(HarvestError::InvalidChecksum(value.to_string()))
    }
}
