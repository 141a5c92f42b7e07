use thiserror::Error;

use crate::chunk::{ChunkAddr, ChunkKind};

pub type Result<T> = std::result::Result<T, CloudletError>;

#[derive(Debug, Error)]
pub enum CloudletError {
    #[error("{kind} image size {size} is not a multiple of the chunk size")]
    InvalidSize { kind: ChunkKind, size: u64 },

    #[error("{kind} capacity mismatch: expected {expected} bytes, found {actual}")]
    GeometryMismatch {
        kind: ChunkKind,
        expected: u64,
        actual: u64,
    },

    #[error("chunk address {0} exceeds the declared capacity")]
    AddressOutOfRange(ChunkAddr),

    #[error("corrupt overlay container: {0}")]
    CorruptContainer(String),

    #[error("capture produced no delta records")]
    EmptyOverlay,

    #[error("synthesis failed: {0}")]
    SynthesisFailed(String),

    #[error("failed to resolve chunk {addr}: {reason}")]
    ResolveFailed { addr: ChunkAddr, reason: String },

    #[error("record {0} references the base image; open it with a base accessor")]
    BaseImageRequired(usize),

    #[error("session cancelled")]
    Cancelled,

    #[error("decompression error: {0}")]
    Decompression(String),

    #[error("unknown compression tag: {0}")]
    UnknownCompressionTag(u8),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl CloudletError {
    /// `EmptyOverlay` means "no delta", which callers may choose to treat as success.
    pub fn is_empty_overlay(&self) -> bool {
        matches!(self, CloudletError::EmptyOverlay)
    }
}
