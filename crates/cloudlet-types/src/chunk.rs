use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{CloudletError, Result};

/// Fixed size of every comparison unit, for both disk sectors and memory pages.
pub const CHUNK_SIZE: usize = 4096;

/// Which device of the VM a chunk belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum ChunkKind {
    Disk = 0,
    Memory = 1,
}

impl ChunkKind {
    pub const ALL: [ChunkKind; 2] = [ChunkKind::Disk, ChunkKind::Memory];

    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(Self::Disk),
            1 => Ok(Self::Memory),
            _ => Err(CloudletError::CorruptContainer(format!(
                "unknown chunk kind tag: {v}"
            ))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChunkKind::Disk => "disk",
            ChunkKind::Memory => "memory",
        }
    }
}

impl fmt::Display for ChunkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a chunk: device kind plus chunk ordinal within that device.
///
/// The byte offset of a chunk is `index * CHUNK_SIZE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkAddr {
    pub kind: ChunkKind,
    pub index: u64,
}

impl ChunkAddr {
    pub const fn new(kind: ChunkKind, index: u64) -> Self {
        Self { kind, index }
    }

    pub const fn disk(index: u64) -> Self {
        Self::new(ChunkKind::Disk, index)
    }

    pub const fn memory(index: u64) -> Self {
        Self::new(ChunkKind::Memory, index)
    }

    pub fn byte_offset(&self) -> u64 {
        self.index * CHUNK_SIZE as u64
    }
}

impl fmt::Display for ChunkAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.index)
    }
}

/// Lifecycle of a single chunk during capture or synthesis.
///
/// Variants are ordered; a chunk only ever moves to a later state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum ChunkState {
    #[default]
    Unmodified = 0,
    Modified = 1,
    Decompressed = 2,
    DeltaApplied = 3,
}

impl ChunkState {
    /// Move to `next` if it is later than the current state.
    /// Returns `true` if a transition happened.
    pub fn advance(&mut self, next: ChunkState) -> bool {
        if next > *self {
            *self = next;
            true
        } else {
            false
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ChunkState::Unmodified => "Unmodified",
            ChunkState::Modified => "Modified",
            ChunkState::Decompressed => "Decompressed",
            ChunkState::DeltaApplied => "Delta Applied",
        }
    }
}

/// Number of whole chunks in a device of `capacity` bytes.
///
/// Fails with `InvalidSize` unless the capacity is chunk-aligned.
pub fn chunk_count(kind: ChunkKind, capacity: u64) -> Result<u64> {
    if capacity % CHUNK_SIZE as u64 != 0 {
        return Err(CloudletError::InvalidSize { kind, size: capacity });
    }
    Ok(capacity / CHUNK_SIZE as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advance_is_monotonic() {
        let mut state = ChunkState::default();
        assert!(state.advance(ChunkState::Modified));
        assert!(state.advance(ChunkState::DeltaApplied));
        assert!(!state.advance(ChunkState::Modified));
        assert!(!state.advance(ChunkState::DeltaApplied));
        assert_eq!(state, ChunkState::DeltaApplied);
    }

    #[test]
    fn kind_tag_roundtrip() {
        for kind in ChunkKind::ALL {
            assert_eq!(ChunkKind::from_u8(kind as u8).unwrap(), kind);
        }
        assert!(ChunkKind::from_u8(7).is_err());
    }

    #[test]
    fn chunk_count_requires_alignment() {
        assert_eq!(chunk_count(ChunkKind::Disk, 8192).unwrap(), 2);
        assert_eq!(chunk_count(ChunkKind::Memory, 0).unwrap(), 0);
        match chunk_count(ChunkKind::Disk, 4097) {
            Err(CloudletError::InvalidSize { kind, size }) => {
                assert_eq!(kind, ChunkKind::Disk);
                assert_eq!(size, 4097);
            }
            other => panic!("expected InvalidSize, got {other:?}"),
        }
    }

    #[test]
    fn addr_byte_offset() {
        assert_eq!(ChunkAddr::memory(3).byte_offset(), 3 * 4096);
        assert_eq!(ChunkAddr::disk(1).to_string(), "disk:1");
    }
}
