use std::collections::HashSet;
use std::io::Write;

use tracing::debug;

use cloudlet_types::{ChunkAddr, ChunkHash};

use super::{BlobSpool, DeltaRecord, OverlaySummary, Payload, Preamble};
use crate::error::{CloudletError, Result};
use crate::image::Geometry;

/// Builds an overlay container from records in emission order.
///
/// Payload bytes go straight to a [`BlobSpool`]; only the fixed-size record
/// headers stay in memory until [`OverlayWriter::finish`] lays out the
/// container.
#[derive(Debug)]
pub struct OverlayWriter {
    geometry: Geometry,
    records: Vec<DeltaRecord>,
    written: HashSet<ChunkAddr>,
    spool: BlobSpool,
}

impl OverlayWriter {
    pub fn new(geometry: Geometry) -> Result<Self> {
        Ok(Self {
            geometry,
            records: Vec::new(),
            written: HashSet::new(),
            spool: BlobSpool::new()?,
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn claim(&mut self, addr: ChunkAddr) -> Result<()> {
        self.geometry.check(addr)?;
        if !self.written.insert(addr) {
            return Err(CloudletError::Other(format!(
                "chunk {addr} already has a record in this overlay"
            )));
        }
        Ok(())
    }

    fn push(&mut self, addr: ChunkAddr, hash: ChunkHash, payload: Payload) -> usize {
        self.records.push(DeltaRecord {
            addr,
            hash,
            payload,
        });
        self.records.len() - 1
    }

    /// Append a record carrying its own codec-tagged payload.
    pub fn append_compressed(
        &mut self,
        addr: ChunkAddr,
        hash: ChunkHash,
        payload: &[u8],
    ) -> Result<usize> {
        if payload.is_empty() {
            return Err(CloudletError::Other(format!(
                "empty payload for chunk {addr}"
            )));
        }
        self.claim(addr)?;
        let (offset, length) = self.spool.append(payload)?;
        Ok(self.push(addr, hash, Payload::Compressed { offset, length }))
    }

    /// Append a record that reuses the payload of the earlier record `target`.
    pub fn append_self_ref(
        &mut self,
        addr: ChunkAddr,
        hash: ChunkHash,
        target: usize,
    ) -> Result<usize> {
        let target_record = self.records.get(target).ok_or_else(|| {
            CloudletError::Other(format!(
                "self-reference from {addr} to record {target} which does not exist yet"
            ))
        })?;
        if target_record.hash != hash {
            return Err(CloudletError::Other(format!(
                "self-reference from {addr} to record {target} with different content"
            )));
        }
        if matches!(target_record.payload, Payload::SelfRef { .. }) {
            return Err(CloudletError::Other(format!(
                "self-reference from {addr} must target a record with a real payload"
            )));
        }
        self.claim(addr)?;
        Ok(self.push(addr, hash, Payload::SelfRef { target }))
    }

    /// Append a record whose content equals the base chunk at `base`.
    pub fn append_base_ref(
        &mut self,
        addr: ChunkAddr,
        hash: ChunkHash,
        base: ChunkAddr,
    ) -> Result<usize> {
        let ordinal = self.geometry.ordinal(base)?;
        self.claim(addr)?;
        Ok(self.push(addr, hash, Payload::BaseRef { ordinal }))
    }

    /// Write preamble, record headers and blob section to `out`.
    pub fn finish<W: Write>(self, out: &mut W) -> Result<OverlaySummary> {
        let preamble = Preamble {
            geometry: self.geometry,
            record_count: self.records.len() as u64,
            blob_length: self.spool.len(),
        };
        out.write_all(&preamble.encode())?;
        for record in &self.records {
            out.write_all(&record.encode())?;
        }
        let copied = self.spool.copy_to(out)?;
        out.flush()?;

        let summary = OverlaySummary::from_records(&self.records, copied);
        debug!(
            records = summary.records,
            compressed = summary.compressed,
            self_refs = summary.self_refs,
            base_refs = summary.base_refs,
            bytes = summary.container_bytes,
            "wrote overlay container"
        );
        Ok(summary)
    }
}
