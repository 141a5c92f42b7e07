//! Overlay container format.
//!
//! ```text
//! [41-byte preamble][record_count x 54-byte record headers][blob section]
//! ```
//!
//! Preamble: `magic(8) version(1) disk_capacity(u64) memory_capacity(u64)
//! record_count(u64) blob_length(u64)`.
//!
//! Record header: `kind(1) address(u64) hash(32) payload_kind(1)
//! payload_offset(u64) payload_length(u32)`.
//!
//! All integers are little-endian. Compressed payloads are addressed by
//! offset/length inside the blob section; self-references store the index
//! of an earlier record in `payload_offset`; base references store the base
//! chunk ordinal (disk chunks first). References always have length 0.

mod reader;
mod spool;
mod writer;

use cloudlet_types::{ChunkAddr, ChunkHash, ChunkKind, HASH_LEN};

use crate::error::{CloudletError, Result};
use crate::image::Geometry;

pub use reader::{OverlayContainer, RangeRead};
pub use spool::BlobSpool;
pub use writer::OverlayWriter;

/// Magic bytes at the start of every overlay container.
pub const OVERLAY_MAGIC: &[u8; 8] = b"CLDOVRLY";
/// Container format version.
pub const OVERLAY_VERSION: u8 = 1;
/// Size of the preamble preceding the record headers.
pub const PREAMBLE_SIZE: usize = 8 + 1 + 8 + 8 + 8 + 8;
/// Size of one fixed-width record header.
pub const RECORD_HEADER_SIZE: usize = 1 + 8 + HASH_LEN + 1 + 8 + 4;

const PAYLOAD_COMPRESSED: u8 = 0;
const PAYLOAD_SELF_REF: u8 = 1;
const PAYLOAD_BASE_REF: u8 = 2;

/// Where a record's chunk content comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Payload {
    /// Codec-tagged bytes at `offset..offset + length` of the blob section.
    Compressed { offset: u64, length: u32 },
    /// Same content as the earlier record at index `target`.
    SelfRef { target: usize },
    /// Same content as the base chunk with this ordinal.
    BaseRef { ordinal: u64 },
}

impl Payload {
    pub fn is_reference(&self) -> bool {
        !matches!(self, Payload::Compressed { .. })
    }

    fn tag(&self) -> u8 {
        match self {
            Payload::Compressed { .. } => PAYLOAD_COMPRESSED,
            Payload::SelfRef { .. } => PAYLOAD_SELF_REF,
            Payload::BaseRef { .. } => PAYLOAD_BASE_REF,
        }
    }
}

/// Header of one entry in the delta stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeltaRecord {
    pub addr: ChunkAddr,
    pub hash: ChunkHash,
    pub payload: Payload,
}

impl DeltaRecord {
    pub fn encode(&self) -> [u8; RECORD_HEADER_SIZE] {
        let (offset, length) = match self.payload {
            Payload::Compressed { offset, length } => (offset, length),
            Payload::SelfRef { target } => (target as u64, 0),
            Payload::BaseRef { ordinal } => (ordinal, 0),
        };
        let mut out = [0u8; RECORD_HEADER_SIZE];
        out[0] = self.addr.kind as u8;
        out[1..9].copy_from_slice(&self.addr.index.to_le_bytes());
        out[9..41].copy_from_slice(&self.hash.0);
        out[41] = self.payload.tag();
        out[42..50].copy_from_slice(&offset.to_le_bytes());
        out[50..54].copy_from_slice(&length.to_le_bytes());
        out
    }

    /// Decode one header. Only tag values are checked here; cross-record
    /// consistency is validated by [`OverlayContainer`].
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != RECORD_HEADER_SIZE {
            return Err(CloudletError::CorruptContainer(format!(
                "record header must be {RECORD_HEADER_SIZE} bytes, got {}",
                bytes.len()
            )));
        }
        let kind = ChunkKind::from_u8(bytes[0])?;
        let index = read_u64(&bytes[1..9]);
        let mut hash = [0u8; HASH_LEN];
        hash.copy_from_slice(&bytes[9..41]);
        let offset = read_u64(&bytes[42..50]);
        let length = u32::from_le_bytes([bytes[50], bytes[51], bytes[52], bytes[53]]);

        let payload = match bytes[41] {
            PAYLOAD_COMPRESSED => Payload::Compressed { offset, length },
            tag @ (PAYLOAD_SELF_REF | PAYLOAD_BASE_REF) => {
                if length != 0 {
                    return Err(CloudletError::CorruptContainer(format!(
                        "reference record for {kind}:{index} has non-zero length {length}"
                    )));
                }
                if tag == PAYLOAD_SELF_REF {
                    let target = usize::try_from(offset).map_err(|_| {
                        CloudletError::CorruptContainer(format!(
                            "self-reference target {offset} out of range"
                        ))
                    })?;
                    Payload::SelfRef { target }
                } else {
                    Payload::BaseRef { ordinal: offset }
                }
            }
            other => {
                return Err(CloudletError::CorruptContainer(format!(
                    "unknown payload kind tag: {other}"
                )));
            }
        };

        Ok(Self {
            addr: ChunkAddr::new(kind, index),
            hash: ChunkHash(hash),
            payload,
        })
    }
}

/// Fixed-size container preamble.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preamble {
    pub geometry: Geometry,
    pub record_count: u64,
    pub blob_length: u64,
}

impl Preamble {
    pub fn encode(&self) -> [u8; PREAMBLE_SIZE] {
        let mut out = [0u8; PREAMBLE_SIZE];
        out[..8].copy_from_slice(OVERLAY_MAGIC);
        out[8] = OVERLAY_VERSION;
        out[9..17].copy_from_slice(&self.geometry.disk_capacity.to_le_bytes());
        out[17..25].copy_from_slice(&self.geometry.memory_capacity.to_le_bytes());
        out[25..33].copy_from_slice(&self.record_count.to_le_bytes());
        out[33..41].copy_from_slice(&self.blob_length.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < PREAMBLE_SIZE {
            return Err(CloudletError::CorruptContainer("container too small".into()));
        }
        if &bytes[..8] != OVERLAY_MAGIC {
            return Err(CloudletError::CorruptContainer("invalid overlay magic".into()));
        }
        if bytes[8] != OVERLAY_VERSION {
            return Err(CloudletError::CorruptContainer(format!(
                "unsupported overlay version: {}",
                bytes[8]
            )));
        }
        let geometry = Geometry::new(read_u64(&bytes[9..17]), read_u64(&bytes[17..25]))
            .map_err(|e| CloudletError::CorruptContainer(format!("declared capacity: {e}")))?;
        Ok(Self {
            geometry,
            record_count: read_u64(&bytes[25..33]),
            blob_length: read_u64(&bytes[33..41]),
        })
    }

    /// Total container length implied by this preamble, if it fits in a u64.
    pub fn expected_len(&self) -> Option<u64> {
        self.record_count
            .checked_mul(RECORD_HEADER_SIZE as u64)?
            .checked_add(PREAMBLE_SIZE as u64)?
            .checked_add(self.blob_length)
    }
}

/// Record counts and sizes of a sealed overlay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OverlaySummary {
    pub records: usize,
    pub compressed: usize,
    pub self_refs: usize,
    pub base_refs: usize,
    pub blob_bytes: u64,
    pub container_bytes: u64,
}

impl OverlaySummary {
    pub(crate) fn from_records(records: &[DeltaRecord], blob_bytes: u64) -> Self {
        let mut summary = Self {
            records: records.len(),
            blob_bytes,
            container_bytes: PREAMBLE_SIZE as u64
                + (records.len() * RECORD_HEADER_SIZE) as u64
                + blob_bytes,
            ..Self::default()
        };
        for record in records {
            match record.payload {
                Payload::Compressed { .. } => summary.compressed += 1,
                Payload::SelfRef { .. } => summary.self_refs += 1,
                Payload::BaseRef { .. } => summary.base_refs += 1,
            }
        }
        summary
    }
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(buf)
}
