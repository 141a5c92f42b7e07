//! Bounded, non-blocking progress channel for chunk state changes.
//!
//! Capture publishes newly dirtied chunks and synthesis publishes newly
//! decompressed/applied chunks through the same message shape. Producers
//! never block: when the queue is full the oldest unread batch is evicted.
//! Consumers poll with [`ChunkMonitor::try_recv`] / [`ChunkMonitor::drain`]
//! and treat an empty queue as normal.

mod grid;

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use tracing::trace;

use cloudlet_types::{ChunkAddr, ChunkState};

pub use grid::{ChunkStateGrid, StateCounts};

/// Attempts a producer makes to free a slot before giving up on a batch.
/// Only reachable when other producers refill the queue concurrently.
const MAX_SEND_ATTEMPTS: usize = 8;

/// A group of chunks that reached `state` together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkBatch {
    pub state: ChunkState,
    pub chunks: Vec<ChunkAddr>,
}

#[derive(Debug, Default)]
struct Shared {
    open_publishers: AtomicUsize,
    dropped_batches: AtomicU64,
}

/// Create a channel that holds at most `capacity` unread batches.
pub fn dirty_chunk_channel(capacity: usize) -> (ChunkPublisher, ChunkMonitor) {
    let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
    let shared = Arc::new(Shared {
        open_publishers: AtomicUsize::new(1),
        dropped_batches: AtomicU64::new(0),
    });
    let publisher = ChunkPublisher {
        tx,
        evict: rx.clone(),
        shared: Arc::clone(&shared),
        closed: false,
    };
    let monitor = ChunkMonitor { rx, shared };
    (publisher, monitor)
}

/// Producer half. Cloneable; the session counts as ended once every clone
/// has been closed or dropped.
#[derive(Debug)]
pub struct ChunkPublisher {
    tx: Sender<ChunkBatch>,
    /// Producer-side receiver used only to evict the oldest batch on overflow.
    evict: Receiver<ChunkBatch>,
    shared: Arc<Shared>,
    closed: bool,
}

impl ChunkPublisher {
    /// A publisher with no consumer attached. Publishing is still valid and
    /// simply recycles a one-slot queue.
    pub fn detached() -> Self {
        dirty_chunk_channel(1).0
    }

    /// Queue a batch without blocking. Empty batches are skipped.
    pub fn publish(&self, state: ChunkState, chunks: Vec<ChunkAddr>) {
        if chunks.is_empty() || self.closed {
            return;
        }
        let mut batch = ChunkBatch { state, chunks };
        for _ in 0..MAX_SEND_ATTEMPTS {
            match self.tx.try_send(batch) {
                Ok(()) => return,
                Err(TrySendError::Full(returned)) => {
                    if self.evict.try_recv().is_ok() {
                        self.shared.dropped_batches.fetch_add(1, Ordering::Relaxed);
                    }
                    batch = returned;
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
        trace!(state = ?state, "progress queue contended, dropping batch");
        self.shared.dropped_batches.fetch_add(1, Ordering::Relaxed);
    }

    /// Mark this producer as finished. Idempotent; also runs on drop.
    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.shared.open_publishers.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Batches evicted or discarded so far.
    pub fn dropped_batches(&self) -> u64 {
        self.shared.dropped_batches.load(Ordering::Relaxed)
    }
}

impl Clone for ChunkPublisher {
    fn clone(&self) -> Self {
        self.shared.open_publishers.fetch_add(1, Ordering::AcqRel);
        Self {
            tx: self.tx.clone(),
            evict: self.evict.clone(),
            shared: Arc::clone(&self.shared),
            closed: false,
        }
    }
}

impl Drop for ChunkPublisher {
    fn drop(&mut self) {
        self.close();
    }
}

/// Consumer half. Cloneable; clones compete for batches.
#[derive(Debug, Clone)]
pub struct ChunkMonitor {
    rx: Receiver<ChunkBatch>,
    shared: Arc<Shared>,
}

impl ChunkMonitor {
    /// Next queued batch, or `None` if the queue is currently empty.
    pub fn try_recv(&self) -> Option<ChunkBatch> {
        self.rx.try_recv().ok()
    }

    /// Every batch queued right now, oldest first.
    pub fn drain(&self) -> Vec<ChunkBatch> {
        self.rx.try_iter().collect()
    }

    /// `true` once every publisher has closed and the queue is empty:
    /// nothing more will ever arrive.
    pub fn is_closed(&self) -> bool {
        self.shared.open_publishers.load(Ordering::Acquire) == 0 && self.rx.is_empty()
    }

    /// Batches evicted because this consumer fell behind.
    pub fn dropped_batches(&self) -> u64 {
        self.shared.dropped_batches.load(Ordering::Relaxed)
    }
}
