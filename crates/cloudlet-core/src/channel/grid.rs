use cloudlet_types::{ChunkAddr, ChunkKind, ChunkState};

use super::{ChunkBatch, ChunkMonitor};
use crate::image::Geometry;

/// Per-address chunk state, kept up to date from a [`ChunkMonitor`].
///
/// This is the headless form of the chunk heatmap: one cell per disk sector
/// range or memory page, each holding the latest state observed. Updates
/// only move a cell forward, so late or reordered batches never regress it.
#[derive(Debug, Clone)]
pub struct ChunkStateGrid {
    disk: Vec<ChunkState>,
    memory: Vec<ChunkState>,
    ignored: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateCounts {
    pub unmodified: u64,
    pub modified: u64,
    pub decompressed: u64,
    pub delta_applied: u64,
}

impl StateCounts {
    pub fn total(&self) -> u64 {
        self.unmodified + self.modified + self.decompressed + self.delta_applied
    }
}

impl ChunkStateGrid {
    pub fn new(geometry: Geometry) -> Self {
        Self {
            disk: vec![ChunkState::Unmodified; geometry.chunks(ChunkKind::Disk) as usize],
            memory: vec![ChunkState::Unmodified; geometry.chunks(ChunkKind::Memory) as usize],
            ignored: 0,
        }
    }

    fn cells(&self, kind: ChunkKind) -> &[ChunkState] {
        match kind {
            ChunkKind::Disk => &self.disk,
            ChunkKind::Memory => &self.memory,
        }
    }

    /// Apply one batch. Returns the number of cells that changed.
    /// Addresses outside the grid are counted and skipped.
    pub fn apply(&mut self, batch: &ChunkBatch) -> usize {
        let mut changed = 0;
        for addr in &batch.chunks {
            let cells = match addr.kind {
                ChunkKind::Disk => &mut self.disk,
                ChunkKind::Memory => &mut self.memory,
            };
            match cells.get_mut(addr.index as usize) {
                Some(cell) => {
                    if cell.advance(batch.state) {
                        changed += 1;
                    }
                }
                None => self.ignored += 1,
            }
        }
        changed
    }

    /// Drain everything currently queued on `monitor` into the grid.
    /// Returns the number of batches consumed; zero is a normal result.
    pub fn poll(&mut self, monitor: &ChunkMonitor) -> usize {
        let mut batches = 0;
        while let Some(batch) = monitor.try_recv() {
            self.apply(&batch);
            batches += 1;
        }
        batches
    }

    pub fn state(&self, addr: ChunkAddr) -> ChunkState {
        self.cells(addr.kind)
            .get(addr.index as usize)
            .copied()
            .unwrap_or_default()
    }

    pub fn counts(&self, kind: ChunkKind) -> StateCounts {
        let mut counts = StateCounts::default();
        for state in self.cells(kind) {
            match state {
                ChunkState::Unmodified => counts.unmodified += 1,
                ChunkState::Modified => counts.modified += 1,
                ChunkState::Decompressed => counts.decompressed += 1,
                ChunkState::DeltaApplied => counts.delta_applied += 1,
            }
        }
        counts
    }

    /// Addresses received that fall outside the grid.
    pub fn ignored(&self) -> u64 {
        self.ignored
    }
}
