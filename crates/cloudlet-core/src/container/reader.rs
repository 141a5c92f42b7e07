use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

use tracing::debug;

use cloudlet_types::{ChunkAddr, ChunkHash, CHUNK_SIZE};

use super::{
    DeltaRecord, OverlaySummary, Payload, Preamble, PREAMBLE_SIZE, RECORD_HEADER_SIZE,
};
use crate::compress;
use crate::error::{CloudletError, Result};
use crate::image::file::read_exact_at;
use crate::image::{read_chunk_vec, ChunkSource, Geometry};

/// Random-access byte storage behind an opened container.
pub trait RangeRead: Send + Sync {
    /// Total size in bytes.
    fn size(&self) -> u64;

    fn read_range(&self, offset: u64, length: u64) -> Result<Vec<u8>>;
}

impl RangeRead for Vec<u8> {
    fn size(&self) -> u64 {
        self.len() as u64
    }

    fn read_range(&self, offset: u64, length: u64) -> Result<Vec<u8>> {
        let start = offset as usize;
        let end = start.checked_add(length as usize).ok_or_else(|| {
            CloudletError::CorruptContainer(format!(
                "range at offset {offset}: offset + length overflows usize"
            ))
        })?;
        self.get(start..end).map(<[u8]>::to_vec).ok_or_else(|| {
            CloudletError::CorruptContainer(format!(
                "short read at offset {offset}: expected {length} bytes, got {}",
                self.len().saturating_sub(start)
            ))
        })
    }
}

struct FileRange {
    file: File,
    len: u64,
}

impl RangeRead for FileRange {
    fn size(&self) -> u64 {
        self.len
    }

    fn read_range(&self, offset: u64, length: u64) -> Result<Vec<u8>> {
        if offset.checked_add(length).is_none_or(|end| end > self.len) {
            return Err(CloudletError::CorruptContainer(format!(
                "short read at offset {offset}: expected {length} bytes"
            )));
        }
        let mut buf = vec![0u8; length as usize];
        read_exact_at(&self.file, &mut buf, offset)?;
        Ok(buf)
    }
}

/// An opened overlay: all record headers loaded and validated up front,
/// payloads read individually and in any order.
pub struct OverlayContainer {
    source: Box<dyn RangeRead>,
    geometry: Geometry,
    records: Vec<DeltaRecord>,
    by_addr: HashMap<ChunkAddr, usize>,
    blob_start: u64,
    blob_length: u64,
}

impl std::fmt::Debug for OverlayContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverlayContainer")
            .field("geometry", &self.geometry)
            .field("records", &self.records.len())
            .field("blob_length", &self.blob_length)
            .finish()
    }
}

impl OverlayContainer {
    /// Open a container held in memory.
    pub fn open(bytes: Vec<u8>) -> Result<Self> {
        Self::from_source(Box::new(bytes))
    }

    /// Open a container file; payloads are read from disk on demand.
    pub fn open_file(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        Self::from_source(Box::new(FileRange { file, len }))
    }

    /// Load and validate the metadata section from any range source.
    pub fn from_source(source: Box<dyn RangeRead>) -> Result<Self> {
        let total = source.size();
        if total < PREAMBLE_SIZE as u64 {
            return Err(CloudletError::CorruptContainer("container too small".into()));
        }
        let preamble = Preamble::decode(&source.read_range(0, PREAMBLE_SIZE as u64)?)?;
        let expected = preamble.expected_len().ok_or_else(|| {
            CloudletError::CorruptContainer("declared sizes overflow".into())
        })?;
        if expected != total {
            return Err(CloudletError::CorruptContainer(format!(
                "declared size {expected} does not match container size {total}"
            )));
        }
        // Unique in-range addresses bound the record count by the capacity.
        if preamble.record_count > preamble.geometry.total_chunks() {
            return Err(CloudletError::CorruptContainer(format!(
                "{} records exceed the {} chunks of the declared capacity",
                preamble.record_count,
                preamble.geometry.total_chunks()
            )));
        }

        let header_len = preamble.record_count * RECORD_HEADER_SIZE as u64;
        let headers = source.read_range(PREAMBLE_SIZE as u64, header_len)?;
        let records = headers
            .chunks_exact(RECORD_HEADER_SIZE)
            .map(DeltaRecord::decode)
            .collect::<Result<Vec<_>>>()?;

        let by_addr = validate_records(&records, &preamble)?;
        debug!(
            records = records.len(),
            blob_bytes = preamble.blob_length,
            "opened overlay container"
        );
        Ok(Self {
            source,
            geometry: preamble.geometry,
            records,
            by_addr,
            blob_start: PREAMBLE_SIZE as u64 + header_len,
            blob_length: preamble.blob_length,
        })
    }

    /// Declared base image capacities.
    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    /// Record headers in stream order.
    pub fn records(&self) -> &[DeltaRecord] {
        &self.records
    }

    pub fn record(&self, index: usize) -> Option<&DeltaRecord> {
        self.records.get(index)
    }

    /// Stream index of the record for `addr`, if the overlay covers it.
    pub fn find(&self, addr: ChunkAddr) -> Option<usize> {
        self.by_addr.get(&addr).copied()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn blob_length(&self) -> u64 {
        self.blob_length
    }

    pub fn summary(&self) -> OverlaySummary {
        OverlaySummary::from_records(&self.records, self.blob_length)
    }

    /// Follow self-references from `index` to the record that owns the payload.
    ///
    /// Every hop must move strictly backward, so the walk ends within
    /// `len()` steps; anything else is a forward or cyclic reference.
    pub fn resolve_source(&self, index: usize) -> Result<usize> {
        let mut current = index;
        for _ in 0..=self.records.len() {
            let record = self.records.get(current).ok_or_else(|| {
                CloudletError::CorruptContainer(format!("record {current} does not exist"))
            })?;
            match record.payload {
                Payload::SelfRef { target } => {
                    if target >= current {
                        return Err(CloudletError::CorruptContainer(format!(
                            "record {current} references record {target} which is not earlier"
                        )));
                    }
                    current = target;
                }
                _ => return Ok(current),
            }
        }
        Err(CloudletError::CorruptContainer(format!(
            "self-reference chain from record {index} does not terminate"
        )))
    }

    /// Decompressed chunk content of record `index`.
    ///
    /// Fails with `BaseImageRequired` if the content lives in the base image;
    /// use [`OverlayContainer::read_payload_with_base`] for such overlays.
    pub fn read_payload(&self, index: usize) -> Result<Vec<u8>> {
        let source = self.resolve_source(index)?;
        let record = &self.records[source];
        match record.payload {
            Payload::Compressed { offset, length } => {
                self.read_compressed(index, record.hash, offset, length)
            }
            Payload::BaseRef { .. } => Err(CloudletError::BaseImageRequired(index)),
            Payload::SelfRef { .. } => Err(CloudletError::CorruptContainer(format!(
                "record {source} is an unresolved self-reference"
            ))),
        }
    }

    /// Like [`OverlayContainer::read_payload`], resolving base references
    /// against `base`.
    pub fn read_payload_with_base(&self, index: usize, base: &dyn ChunkSource) -> Result<Vec<u8>> {
        let source = self.resolve_source(index)?;
        let record = &self.records[source];
        match record.payload {
            Payload::BaseRef { ordinal } => {
                let addr = self.geometry.addr_at(ordinal).ok_or_else(|| {
                    CloudletError::CorruptContainer(format!(
                        "base reference {ordinal} outside the declared capacity"
                    ))
                })?;
                let data = read_chunk_vec(base, addr)?;
                if ChunkHash::compute(&data) != record.hash {
                    return Err(CloudletError::CorruptContainer(format!(
                        "base chunk {addr} does not match record {index}; wrong base image?"
                    )));
                }
                Ok(data)
            }
            _ => self.read_payload(index),
        }
    }

    fn read_compressed(
        &self,
        index: usize,
        hash: ChunkHash,
        offset: u64,
        length: u32,
    ) -> Result<Vec<u8>> {
        let raw = self
            .source
            .read_range(self.blob_start + offset, length as u64)?;
        let data = compress::decompress(&raw).map_err(|e| {
            CloudletError::CorruptContainer(format!("record {index}: {e}"))
        })?;
        if data.len() != CHUNK_SIZE {
            return Err(CloudletError::CorruptContainer(format!(
                "record {index} decompressed to {} bytes, expected {CHUNK_SIZE}",
                data.len()
            )));
        }
        if ChunkHash::compute(&data) != hash {
            return Err(CloudletError::CorruptContainer(format!(
                "record {index} content does not match its hash"
            )));
        }
        Ok(data)
    }
}

fn validate_records(
    records: &[DeltaRecord],
    preamble: &Preamble,
) -> Result<HashMap<ChunkAddr, usize>> {
    let geometry = preamble.geometry;
    let mut by_addr = HashMap::with_capacity(records.len());
    for (i, record) in records.iter().enumerate() {
        geometry.check(record.addr).map_err(|_| {
            CloudletError::CorruptContainer(format!(
                "record {i} address {} outside the declared capacity",
                record.addr
            ))
        })?;
        if by_addr.insert(record.addr, i).is_some() {
            return Err(CloudletError::CorruptContainer(format!(
                "record {i} duplicates chunk {}",
                record.addr
            )));
        }
        match record.payload {
            Payload::Compressed { offset, length } => {
                if length == 0 {
                    return Err(CloudletError::CorruptContainer(format!(
                        "record {i} has an empty payload"
                    )));
                }
                let in_blob = offset
                    .checked_add(length as u64)
                    .is_some_and(|end| end <= preamble.blob_length);
                if !in_blob {
                    return Err(CloudletError::CorruptContainer(format!(
                        "record {i} payload {offset}+{length} exceeds blob of {} bytes",
                        preamble.blob_length
                    )));
                }
            }
            Payload::SelfRef { target } => {
                if target >= i {
                    return Err(CloudletError::CorruptContainer(format!(
                        "record {i} references record {target} which is not earlier"
                    )));
                }
                if records[target].hash != record.hash {
                    return Err(CloudletError::CorruptContainer(format!(
                        "record {i} references record {target} with a different hash"
                    )));
                }
            }
            Payload::BaseRef { ordinal } => {
                if ordinal >= geometry.total_chunks() {
                    return Err(CloudletError::CorruptContainer(format!(
                        "record {i} base reference {ordinal} outside the declared capacity"
                    )));
                }
            }
        }
    }
    Ok(by_addr)
}
