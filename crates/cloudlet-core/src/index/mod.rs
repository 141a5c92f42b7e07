use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use cloudlet_types::{ChunkAddr, ChunkHash, ChunkKind, CHUNK_SIZE};

use crate::error::{CloudletError, Result};
use crate::image::{ChunkSource, Geometry};

/// Content-hash index over a base VM's disk and memory.
///
/// Built once per base image and immutable afterwards, so an
/// `Arc<ChunkIndex>` can be shared by any number of concurrent capture and
/// synthesis sessions without locking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkIndex {
    geometry: Geometry,
    disk: Vec<ChunkHash>,
    memory: Vec<ChunkHash>,
    /// hash -> first base address holding that content. Rebuilt on load.
    #[serde(skip)]
    locations: HashMap<ChunkHash, ChunkAddr>,
}

impl ChunkIndex {
    /// Hash a base image from two sequential streams in a single pass.
    ///
    /// Only one chunk is buffered at a time. Fails with `InvalidSize` if a
    /// capacity is not chunk-aligned or a stream ends before its capacity.
    pub fn build_from_readers<D: Read, M: Read>(
        disk: D,
        disk_capacity: u64,
        memory: M,
        memory_capacity: u64,
    ) -> Result<Self> {
        let geometry = Geometry::new(disk_capacity, memory_capacity)?;
        let disk = hash_stream(disk, ChunkKind::Disk, geometry.chunks(ChunkKind::Disk))?;
        let memory = hash_stream(memory, ChunkKind::Memory, geometry.chunks(ChunkKind::Memory))?;
        Ok(Self::from_parts(geometry, disk, memory))
    }

    /// Hash every chunk exposed by a base image accessor, in address order.
    pub fn build(base: &dyn ChunkSource) -> Result<Self> {
        let geometry = Geometry::of(base)?;
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut disk = Vec::with_capacity(geometry.chunks(ChunkKind::Disk) as usize);
        let mut memory = Vec::with_capacity(geometry.chunks(ChunkKind::Memory) as usize);
        for addr in geometry.addrs() {
            base.read_chunk(addr, &mut buf)?;
            let hash = ChunkHash::compute(&buf);
            match addr.kind {
                ChunkKind::Disk => disk.push(hash),
                ChunkKind::Memory => memory.push(hash),
            }
        }
        Ok(Self::from_parts(geometry, disk, memory))
    }

    fn from_parts(geometry: Geometry, disk: Vec<ChunkHash>, memory: Vec<ChunkHash>) -> Self {
        let mut index = Self {
            geometry,
            disk,
            memory,
            locations: HashMap::new(),
        };
        index.rebuild_locations();
        info!(
            disk_chunks = index.disk.len(),
            memory_chunks = index.memory.len(),
            distinct = index.locations.len(),
            "built base chunk index"
        );
        index
    }

    fn rebuild_locations(&mut self) {
        let mut locations = HashMap::with_capacity(self.disk.len() + self.memory.len());
        let disk = self.disk.iter().enumerate().map(|(i, h)| (ChunkAddr::disk(i as u64), h));
        let memory = self
            .memory
            .iter()
            .enumerate()
            .map(|(i, h)| (ChunkAddr::memory(i as u64), h));
        for (addr, hash) in disk.chain(memory) {
            locations.entry(*hash).or_insert(addr);
        }
        self.locations = locations;
    }

    /// Base content hash of the chunk at `addr`.
    pub fn lookup(&self, addr: ChunkAddr) -> Result<ChunkHash> {
        let hashes = match addr.kind {
            ChunkKind::Disk => &self.disk,
            ChunkKind::Memory => &self.memory,
        };
        hashes
            .get(addr.index as usize)
            .copied()
            .ok_or(CloudletError::AddressOutOfRange(addr))
    }

    /// Returns `true` if any base chunk has this content.
    pub fn contains_hash(&self, hash: &ChunkHash) -> bool {
        self.locations.contains_key(hash)
    }

    /// First base address holding `hash`, if any.
    pub fn locate(&self, hash: &ChunkHash) -> Option<ChunkAddr> {
        self.locations.get(hash).copied()
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn capacity(&self, kind: ChunkKind) -> u64 {
        self.geometry.capacity(kind)
    }

    pub fn chunk_count(&self, kind: ChunkKind) -> u64 {
        self.geometry.chunks(kind)
    }

    /// Total number of indexed chunks across both devices.
    pub fn len(&self) -> usize {
        self.disk.len() + self.memory.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of distinct contents in the base.
    pub fn distinct_hashes(&self) -> usize {
        self.locations.len()
    }

    /// Persist the index as MessagePack.
    pub fn save<W: Write>(&self, mut out: W) -> Result<()> {
        let bytes = rmp_serde::to_vec(self)?;
        out.write_all(&bytes)?;
        debug!(bytes = bytes.len(), "saved chunk index");
        Ok(())
    }

    /// Load an index written by [`ChunkIndex::save`].
    pub fn load<R: Read>(reader: R) -> Result<Self> {
        let mut index: ChunkIndex = rmp_serde::from_read(reader)?;
        let geometry = Geometry::new(
            index.geometry.disk_capacity,
            index.geometry.memory_capacity,
        )?;
        if index.disk.len() as u64 != geometry.chunks(ChunkKind::Disk)
            || index.memory.len() as u64 != geometry.chunks(ChunkKind::Memory)
        {
            return Err(CloudletError::Other(
                "chunk index hash count does not match its declared capacity".into(),
            ));
        }
        index.rebuild_locations();
        Ok(index)
    }
}

fn hash_stream<R: Read>(mut reader: R, kind: ChunkKind, chunks: u64) -> Result<Vec<ChunkHash>> {
    let mut hashes = Vec::with_capacity(chunks as usize);
    let mut buf = vec![0u8; CHUNK_SIZE];
    for i in 0..chunks {
        match reader.read_exact(&mut buf) {
            Ok(()) => hashes.push(ChunkHash::compute(&buf)),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                // The stream ended inside chunk `i`; report what was available.
                return Err(CloudletError::InvalidSize {
                    kind,
                    size: i * CHUNK_SIZE as u64,
                });
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(hashes)
}
