//! Accessors for VM disk and memory images.
//!
//! Capture reads live VM state and synthesis reads the base image through
//! [`ChunkSource`]; eager synthesis writes its target through [`ChunkSink`].
//! Hypervisor-specific backends bind to these traits through adapters.

pub(crate) mod file;

use std::sync::RwLock;

use cloudlet_types::{chunk_count, ChunkAddr, ChunkKind, CHUNK_SIZE};
use serde::{Deserialize, Serialize};

use crate::error::{CloudletError, Result};

pub use file::FileImage;

/// Declared disk and memory capacities of a VM image, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Geometry {
    pub disk_capacity: u64,
    pub memory_capacity: u64,
}

impl Geometry {
    /// Validated geometry; both capacities must be chunk-aligned.
    pub fn new(disk_capacity: u64, memory_capacity: u64) -> Result<Self> {
        chunk_count(ChunkKind::Disk, disk_capacity)?;
        chunk_count(ChunkKind::Memory, memory_capacity)?;
        Ok(Self {
            disk_capacity,
            memory_capacity,
        })
    }

    pub fn of(source: &dyn ChunkSource) -> Result<Self> {
        Self::new(
            source.capacity(ChunkKind::Disk),
            source.capacity(ChunkKind::Memory),
        )
    }

    /// Fails with `GeometryMismatch` on the first kind whose capacity in
    /// `actual` differs from `self`.
    pub fn ensure_matches(&self, actual: &Geometry) -> Result<()> {
        for kind in ChunkKind::ALL {
            if self.capacity(kind) != actual.capacity(kind) {
                return Err(CloudletError::GeometryMismatch {
                    kind,
                    expected: self.capacity(kind),
                    actual: actual.capacity(kind),
                });
            }
        }
        Ok(())
    }

    pub fn capacity(&self, kind: ChunkKind) -> u64 {
        match kind {
            ChunkKind::Disk => self.disk_capacity,
            ChunkKind::Memory => self.memory_capacity,
        }
    }

    pub fn chunks(&self, kind: ChunkKind) -> u64 {
        self.capacity(kind) / CHUNK_SIZE as u64
    }

    pub fn total_chunks(&self) -> u64 {
        self.chunks(ChunkKind::Disk) + self.chunks(ChunkKind::Memory)
    }

    pub fn total_bytes(&self) -> u64 {
        self.disk_capacity + self.memory_capacity
    }

    pub fn check(&self, addr: ChunkAddr) -> Result<()> {
        check_addr(addr, self.capacity(addr.kind))
    }

    /// Position of `addr` in a single numbering of all chunks, disk first.
    pub fn ordinal(&self, addr: ChunkAddr) -> Result<u64> {
        self.check(addr)?;
        Ok(match addr.kind {
            ChunkKind::Disk => addr.index,
            ChunkKind::Memory => self.chunks(ChunkKind::Disk) + addr.index,
        })
    }

    /// Inverse of [`Geometry::ordinal`].
    pub fn addr_at(&self, ordinal: u64) -> Option<ChunkAddr> {
        let disk_chunks = self.chunks(ChunkKind::Disk);
        if ordinal < disk_chunks {
            Some(ChunkAddr::disk(ordinal))
        } else if ordinal < self.total_chunks() {
            Some(ChunkAddr::memory(ordinal - disk_chunks))
        } else {
            None
        }
    }

    /// Every chunk address, disk first, in ascending order.
    pub fn addrs(&self) -> impl Iterator<Item = ChunkAddr> + '_ {
        (0..self.total_chunks()).filter_map(|ordinal| self.addr_at(ordinal))
    }
}

/// Read access to chunk-addressed disk and memory contents.
pub trait ChunkSource: Send + Sync {
    /// Capacity of the device in bytes.
    fn capacity(&self, kind: ChunkKind) -> u64;

    /// Fill `buf` (exactly `CHUNK_SIZE` bytes) with the chunk at `addr`.
    fn read_chunk(&self, addr: ChunkAddr, buf: &mut [u8]) -> Result<()>;
}

/// Write access to a target image.
pub trait ChunkSink: Send + Sync {
    /// Overwrite the chunk at `addr` with `data` (exactly `CHUNK_SIZE` bytes).
    fn write_chunk(&self, addr: ChunkAddr, data: &[u8]) -> Result<()>;
}

/// Fail with `AddressOutOfRange` unless `addr` lies inside `capacity` bytes.
pub fn check_addr(addr: ChunkAddr, capacity: u64) -> Result<()> {
    let chunks = capacity / CHUNK_SIZE as u64;
    if addr.index >= chunks {
        return Err(CloudletError::AddressOutOfRange(addr));
    }
    Ok(())
}

/// Read one chunk into a freshly allocated buffer.
pub fn read_chunk_vec(source: &dyn ChunkSource, addr: ChunkAddr) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; CHUNK_SIZE];
    source.read_chunk(addr, &mut buf)?;
    Ok(buf)
}

fn check_chunk_buf(len: usize) -> Result<()> {
    if len != CHUNK_SIZE {
        return Err(CloudletError::Other(format!(
            "chunk buffer must be {CHUNK_SIZE} bytes, got {len}"
        )));
    }
    Ok(())
}

/// Disk and memory images held in RAM.
///
/// Used for small images, tests, and as the live-state accessor when a
/// hypervisor adapter exposes guest memory as a byte buffer.
#[derive(Debug)]
pub struct MemoryImage {
    disk: RwLock<Vec<u8>>,
    memory: RwLock<Vec<u8>>,
}

impl MemoryImage {
    /// Wrap existing buffers. Both lengths must be chunk-aligned.
    pub fn new(disk: Vec<u8>, memory: Vec<u8>) -> Result<Self> {
        chunk_count(ChunkKind::Disk, disk.len() as u64)?;
        chunk_count(ChunkKind::Memory, memory.len() as u64)?;
        Ok(Self {
            disk: RwLock::new(disk),
            memory: RwLock::new(memory),
        })
    }

    /// All-zero image of the given capacities.
    pub fn zeroed(disk_capacity: u64, memory_capacity: u64) -> Result<Self> {
        chunk_count(ChunkKind::Disk, disk_capacity)?;
        chunk_count(ChunkKind::Memory, memory_capacity)?;
        Self::new(
            vec![0u8; disk_capacity as usize],
            vec![0u8; memory_capacity as usize],
        )
    }

    /// Copy the contents of another accessor with matching capacities.
    pub fn snapshot_of(source: &dyn ChunkSource) -> Result<Self> {
        let geometry = Geometry::of(source)?;
        let image = Self::zeroed(geometry.disk_capacity, geometry.memory_capacity)?;
        let mut buf = vec![0u8; CHUNK_SIZE];
        for addr in geometry.addrs() {
            source.read_chunk(addr, &mut buf)?;
            image.write_chunk(addr, &buf)?;
        }
        Ok(image)
    }

    fn device(&self, kind: ChunkKind) -> &RwLock<Vec<u8>> {
        match kind {
            ChunkKind::Disk => &self.disk,
            ChunkKind::Memory => &self.memory,
        }
    }

    /// Overwrite a whole chunk with a repeated byte.
    pub fn fill_chunk(&self, addr: ChunkAddr, byte: u8) -> Result<()> {
        self.write_chunk(addr, &[byte; CHUNK_SIZE])
    }

    /// Copy of one chunk's bytes.
    pub fn chunk(&self, addr: ChunkAddr) -> Result<Vec<u8>> {
        read_chunk_vec(self, addr)
    }

    /// Copy of the whole device contents.
    pub fn bytes(&self, kind: ChunkKind) -> Vec<u8> {
        self.device(kind)
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl ChunkSource for MemoryImage {
    fn capacity(&self, kind: ChunkKind) -> u64 {
        self.device(kind)
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len() as u64
    }

    fn read_chunk(&self, addr: ChunkAddr, buf: &mut [u8]) -> Result<()> {
        check_chunk_buf(buf.len())?;
        let data = self
            .device(addr.kind)
            .read()
            .unwrap_or_else(|e| e.into_inner());
        check_addr(addr, data.len() as u64)?;
        let start = addr.byte_offset() as usize;
        buf.copy_from_slice(&data[start..start + CHUNK_SIZE]);
        Ok(())
    }
}

impl ChunkSink for MemoryImage {
    fn write_chunk(&self, addr: ChunkAddr, data: &[u8]) -> Result<()> {
        check_chunk_buf(data.len())?;
        let mut dev = self
            .device(addr.kind)
            .write()
            .unwrap_or_else(|e| e.into_inner());
        check_addr(addr, dev.len() as u64)?;
        let start = addr.byte_offset() as usize;
        dev[start..start + CHUNK_SIZE].copy_from_slice(data);
        Ok(())
    }
}
