use std::sync::Arc;

use cloudlet_types::{ChunkAddr, CHUNK_SIZE};

use crate::capture::OverlayCapture;
use crate::channel::ChunkPublisher;
use crate::config::CloudletConfig;
use crate::container::OverlayContainer;
use crate::image::{ChunkSink, ChunkSource, MemoryImage};
use crate::index::ChunkIndex;

pub fn pattern(byte: u8) -> Vec<u8> {
    vec![byte; CHUNK_SIZE]
}

/// Image whose chunks all have distinct, non-zero content.
pub fn distinct_image(disk_chunks: u64, memory_chunks: u64) -> MemoryImage {
    let image = MemoryImage::zeroed(
        disk_chunks * CHUNK_SIZE as u64,
        memory_chunks * CHUNK_SIZE as u64,
    )
    .unwrap();
    let addrs = (0..disk_chunks)
        .map(ChunkAddr::disk)
        .chain((0..memory_chunks).map(ChunkAddr::memory));
    for (n, addr) in addrs.enumerate() {
        let mut chunk = vec![0u8; CHUNK_SIZE];
        chunk[..8].copy_from_slice(&(n as u64 + 1).to_le_bytes());
        chunk[8] = addr.kind as u8;
        image.write_chunk(addr, &chunk).unwrap();
    }
    image
}

/// Small thread counts so parallel paths run without hogging the test host.
pub fn test_config() -> CloudletConfig {
    let mut config = CloudletConfig::default();
    config.capture.max_threads = 2;
    config.synthesis.max_threads = 2;
    config.synthesis.apply_batch = 2;
    config
}

pub fn sequential_config() -> CloudletConfig {
    let mut config = CloudletConfig::default();
    config.capture.max_threads = 1;
    config.synthesis.max_threads = 1;
    config
}

/// Base image, a live copy of it, and the base index.
pub struct Fixture {
    pub base: Arc<MemoryImage>,
    pub live: Arc<MemoryImage>,
    pub index: Arc<ChunkIndex>,
}

impl Fixture {
    pub fn new(base: MemoryImage) -> Self {
        let live = MemoryImage::snapshot_of(&base).unwrap();
        let index = ChunkIndex::build(&base).unwrap();
        Self {
            base: Arc::new(base),
            live: Arc::new(live),
            index: Arc::new(index),
        }
    }

    pub fn zeroed(disk_chunks: u64, memory_chunks: u64) -> Self {
        Self::new(
            MemoryImage::zeroed(
                disk_chunks * CHUNK_SIZE as u64,
                memory_chunks * CHUNK_SIZE as u64,
            )
            .unwrap(),
        )
    }

    pub fn capture(&self, config: &CloudletConfig) -> OverlayCapture {
        self.capture_with(config, ChunkPublisher::detached())
    }

    pub fn capture_with(&self, config: &CloudletConfig, publisher: ChunkPublisher) -> OverlayCapture {
        OverlayCapture::new(
            Arc::clone(&self.index),
            Arc::clone(&self.live) as Arc<dyn ChunkSource>,
            config,
            publisher,
        )
        .unwrap()
    }

    /// Write `byte` over `addr` in the live image and report it dirty.
    pub fn dirty(&self, capture: &mut OverlayCapture, addr: ChunkAddr, byte: u8) {
        self.live.fill_chunk(addr, byte).unwrap();
        capture.on_dirty_batch(&[addr]).unwrap();
    }

    pub fn base_source(&self) -> Arc<dyn ChunkSource> {
        Arc::clone(&self.base) as Arc<dyn ChunkSource>
    }

    /// Capture every listed `(addr, byte)` write in one session and seal.
    pub fn overlay(&self, writes: &[(ChunkAddr, u8)]) -> OverlayContainer {
        let mut capture = self.capture(&test_config());
        for &(addr, byte) in writes {
            self.dirty(&mut capture, addr, byte);
        }
        capture.seal().unwrap()
    }
}
