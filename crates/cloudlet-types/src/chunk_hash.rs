use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use serde::{Deserialize, Serialize};
use std::fmt;

type Blake2b256 = Blake2b<U32>;

/// Width of a chunk content digest in bytes.
pub const HASH_LEN: usize = 32;

/// A 32-byte content hash of one chunk, computed as unkeyed BLAKE2b-256.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkHash(pub [u8; HASH_LEN]);

impl ChunkHash {
    /// Hash raw chunk content.
    pub fn compute(data: &[u8]) -> Self {
        let mut hasher = Blake2b256::new();
        hasher.update(data);
        let mut out = [0u8; HASH_LEN];
        out.copy_from_slice(&hasher.finalize());
        ChunkHash(out)
    }

    /// Hex-encode the full digest.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for ChunkHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkHash({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for ChunkHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.to_hex()[..16])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compute_deterministic() {
        let data = [0xAAu8; 4096];
        assert_eq!(ChunkHash::compute(&data), ChunkHash::compute(&data));
    }

    #[test]
    fn compute_different_data_different_hash() {
        let a = ChunkHash::compute(&[0u8; 4096]);
        let b = ChunkHash::compute(&[1u8; 4096]);
        assert_ne!(a, b);
    }

    #[test]
    fn to_hex_length() {
        let id = ChunkHash::compute(b"test");
        assert_eq!(id.to_hex().len(), 64);
    }

    #[test]
    fn display_is_prefix_of_hex() {
        let id = ChunkHash([0xAB; 32]);
        assert_eq!(id.to_string(), "abababababababab");
        assert!(format!("{id:?}").starts_with("ChunkHash(abab"));
    }

    #[test]
    fn serde_roundtrip() {
        let id = ChunkHash::compute(b"roundtrip test");
        let serialized = rmp_serde::to_vec(&id).unwrap();
        let deserialized: ChunkHash = rmp_serde::from_slice(&serialized).unwrap();
        assert_eq!(id, deserialized);
    }
}
