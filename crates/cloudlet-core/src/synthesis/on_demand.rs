use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use cloudlet_types::{ChunkAddr, ChunkState};

use crate::channel::ChunkPublisher;
use crate::container::OverlayContainer;
use crate::error::{CloudletError, Result};
use crate::image::{read_chunk_vec, ChunkSource, Geometry};

/// Per-record resolution state. The mutex doubles as the per-address claim:
/// whoever holds it is the only one allowed to apply that record.
#[derive(Debug)]
struct Slot {
    state: ChunkState,
    applied: Option<Arc<[u8]>>,
}

/// Sparse view of the customized VM layered over its base image.
///
/// Chunks covered by a delta record are decompressed and applied the first
/// time they are resolved, then served from memory. All other chunks are
/// read straight from the base.
pub struct OnDemandImage {
    container: Arc<OverlayContainer>,
    base: Arc<dyn ChunkSource>,
    publisher: ChunkPublisher,
    slots: Vec<Mutex<Slot>>,
    /// Decompressed payloads by owning record, shared by self-references.
    payloads: Vec<Mutex<Option<Arc<[u8]>>>>,
    applied: AtomicU64,
    decompressed: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl OnDemandImage {
    pub(super) fn new(
        container: Arc<OverlayContainer>,
        base: Arc<dyn ChunkSource>,
        publisher: ChunkPublisher,
    ) -> Self {
        let count = container.len();
        let slots = (0..count)
            .map(|_| {
                Mutex::new(Slot {
                    state: ChunkState::Modified,
                    applied: None,
                })
            })
            .collect();
        let payloads = (0..count).map(|_| Mutex::new(None)).collect();
        Self {
            container,
            base,
            publisher,
            slots,
            payloads,
            applied: AtomicU64::new(0),
            decompressed: AtomicU64::new(0),
        }
    }

    pub fn geometry(&self) -> Geometry {
        self.container.geometry()
    }

    /// Whether `addr` has a delta record in the overlay.
    pub fn is_covered(&self, addr: ChunkAddr) -> bool {
        self.container.find(addr).is_some()
    }

    /// Content of `addr` in the customized VM.
    ///
    /// Safe to call concurrently. A record is applied at most once; later
    /// calls return the cached bytes. A failure is reported as
    /// `ResolveFailed` for this address only and leaves it retryable.
    pub fn resolve(&self, addr: ChunkAddr) -> Result<Arc<[u8]>> {
        self.container.geometry().check(addr)?;
        let Some(index) = self.container.find(addr) else {
            let data = read_chunk_vec(self.base.as_ref(), addr).map_err(|e| {
                CloudletError::ResolveFailed {
                    addr,
                    reason: e.to_string(),
                }
            })?;
            return Ok(data.into());
        };

        let mut slot = lock(&self.slots[index]);
        if let Some(data) = &slot.applied {
            return Ok(Arc::clone(data));
        }

        let data = self
            .load_payload(index)
            .map_err(|e| CloudletError::ResolveFailed {
                addr,
                reason: e.to_string(),
            })?;
        if slot.state.advance(ChunkState::Decompressed) {
            self.publisher.publish(ChunkState::Decompressed, vec![addr]);
        }

        slot.applied = Some(Arc::clone(&data));
        slot.state.advance(ChunkState::DeltaApplied);
        self.applied.fetch_add(1, Ordering::Relaxed);
        self.publisher.publish(ChunkState::DeltaApplied, vec![addr]);
        debug!(%addr, record = index, "resolved chunk");
        Ok(data)
    }

    /// Decompressed payload for record `index`, loading its owning record
    /// at most once.
    fn load_payload(&self, index: usize) -> Result<Arc<[u8]>> {
        let source = self.container.resolve_source(index)?;
        let mut cached = lock(&self.payloads[source]);
        if let Some(data) = cached.as_ref() {
            return Ok(Arc::clone(data));
        }
        let data: Arc<[u8]> = self
            .container
            .read_payload_with_base(source, self.base.as_ref())?
            .into();
        self.decompressed.fetch_add(1, Ordering::Relaxed);
        *cached = Some(Arc::clone(&data));
        Ok(data)
    }

    /// Lifecycle state of `addr`. Uncovered addresses stay `Unmodified`.
    pub fn state(&self, addr: ChunkAddr) -> ChunkState {
        match self.container.find(addr) {
            Some(index) => lock(&self.slots[index]).state,
            None => ChunkState::Unmodified,
        }
    }

    /// Records applied so far.
    pub fn applied_count(&self) -> u64 {
        self.applied.load(Ordering::Relaxed)
    }

    /// Payloads decompressed (or fetched from the base) so far.
    pub fn decompress_count(&self) -> u64 {
        self.decompressed.load(Ordering::Relaxed)
    }

    /// Warm up covered chunks within `radius` of `addr`.
    ///
    /// Failures are logged and skipped; a later `resolve` reports them.
    /// Returns how many chunks were resolved.
    pub fn prefetch(&self, addr: ChunkAddr, radius: u64) -> usize {
        let chunks = self.container.geometry().chunks(addr.kind);
        if chunks == 0 {
            return 0;
        }
        let first = addr.index.saturating_sub(radius);
        let last = addr.index.saturating_add(radius).min(chunks - 1);
        let mut resolved = 0;
        for index in first..=last {
            let neighbor = ChunkAddr::new(addr.kind, index);
            if !self.is_covered(neighbor) {
                continue;
            }
            match self.resolve(neighbor) {
                Ok(_) => resolved += 1,
                Err(e) => warn!(addr = %neighbor, error = %e, "prefetch failed"),
            }
        }
        resolved
    }
}
