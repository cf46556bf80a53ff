//! Content-hash primitives
//!
//! BLAKE3 is the canonical content hash for everything the engine touches:
//! block hashes, preimage keys, and the base-machine snapshot identifier.

use serde::{Deserialize, Serialize};

/// 32-byte content identifier.
///
/// Used for block hashes, preimage keys and the machine program hash.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, std::hash::Hash, Default, Serialize, Deserialize)]
pub struct Hash([u8; 32]);

impl Hash {
    /// The all-zero hash (genesis parent, empty commitments).
    pub const ZERO: Hash = Hash([0u8; 32]);

    pub fn new(bytes: [u8; 32]) -> Self {
        Hash(bytes)
    }

    /// Build a hash from a byte slice, truncating or zero-padding to 32 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut out = [0u8; 32];
        let n = bytes.len().min(32);
        out[..n].copy_from_slice(&bytes[..n]);
        Hash(out)
    }

    pub fn as_array(&self) -> [u8; 32] {
        self.0
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl std::fmt::Display for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl std::fmt::Debug for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash({})", hex::encode(self.0))
    }
}

impl From<[u8; 32]> for Hash {
    fn from(bytes: [u8; 32]) -> Self {
        Hash(bytes)
    }
}

/// Canonical BLAKE3 hash of a byte string.
pub fn blake3_hash(data: &[u8]) -> Hash {
    Hash(blake3::hash(data).into())
}

/// Canonical BLAKE3 hash over multiple segments, equivalent to hashing
/// their concatenation.
pub fn blake3_hash_multiple(segments: &[&[u8]]) -> Hash {
    let mut hasher = blake3::Hasher::new();
    for segment in segments {
        hasher.update(segment);
    }
    Hash(hasher.finalize().into())
}
