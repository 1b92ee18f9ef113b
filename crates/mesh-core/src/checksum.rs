//! BLAKE3 content fingerprints.
//!
//! The checksum recorded on every staged file is the lowercase hex BLAKE3
//! digest of the bytes held in local storage. Reconciliation compares these
//! digests against the mesh copy, so a collision-resistant hash is required.

use anyhow::Result;

/// A BLAKE3 hash digest (32 bytes), displayed as 64 hex chars
pub type Hash = blake3::Hash;

/// Hash a byte slice in memory.
pub fn hash_bytes(data: &[u8]) -> Hash {
    blake3::hash(data)
}

/// Hex checksum of a byte slice.
pub fn checksum_hex(data: &[u8]) -> String {
    hash_to_hex(&hash_bytes(data))
}

/// Format a hash as lowercase hex string (64 chars)
pub fn hash_to_hex(hash: &Hash) -> String {
    hash.to_hex().to_string()
}

/// Parse a 64-char hex string into a Hash
pub fn hash_from_hex(hex: &str) -> Result<Hash> {
    blake3::Hash::from_hex(hex)
        .map_err(|e| anyhow::anyhow!("invalid BLAKE3 hex '{}': {}", hex, e))
}

/// True when `data` hashes to `expected_hex`.
pub fn verify(data: &[u8], expected_hex: &str) -> bool {
    match hash_from_hex(expected_hex) {
        Ok(expected) => hash_bytes(data) == expected,
        Err(_) => false,
    }
}

/// Storage key for a logical path: a flat, filesystem-safe name.
pub fn blob_key(logical_path: &str) -> String {
    format!("blobs/{}", checksum_hex(logical_path.as_bytes()))
}
