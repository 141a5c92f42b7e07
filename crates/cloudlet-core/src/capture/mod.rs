//! Overlay capture: turns dirty-chunk hints into a deduplicated delta stream.
//!
//! Each batch is processed in three phases:
//! 1. read and hash every hinted chunk of the live VM (parallel),
//! 2. decide per address, in batch order, whether it reverted to base,
//!    repeats content already captured, or carries new content,
//! 3. compress new unique content (parallel) and append it to a spool.
//!
//! Only the latest observation per address survives to [`OverlayCapture::seal`].

use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::sync::Arc;

use rayon::prelude::*;
use tracing::{debug, info};

use cloudlet_types::{ChunkAddr, ChunkHash, ChunkState};

use crate::cancel::CancelFlag;
use crate::channel::ChunkPublisher;
use crate::compress::{self, Compression};
use crate::config::{build_worker_pool, CloudletConfig};
use crate::container::{BlobSpool, OverlayContainer, OverlaySummary, OverlayWriter};
use crate::error::{CloudletError, Result};
use crate::image::{read_chunk_vec, ChunkSource, Geometry};
use crate::index::ChunkIndex;

/// Latest observation for an address that has been dirty at least once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Observation {
    /// Content is back to the base chunk; nothing to record.
    Reverted,
    Dirty(ChunkHash),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureStats {
    /// Addresses read and hashed.
    pub inspected: u64,
    /// Hints whose content matched the base.
    pub unchanged: u64,
    /// Previously dirty addresses that went back to base content.
    pub reverted: u64,
    /// Delta records emitted before last-write-wins resolution.
    pub emitted: u64,
    /// Emitted records that repeated content already in this overlay.
    pub self_refs: u64,
    /// Emitted records deduplicated against other base chunks.
    pub base_refs: u64,
    /// Distinct contents compressed into the spool.
    pub unique_payloads: u64,
    pub compressed_bytes: u64,
}

impl CaptureStats {
    fn absorb(&mut self, other: &CaptureStats) {
        self.inspected += other.inspected;
        self.unchanged += other.unchanged;
        self.reverted += other.reverted;
        self.emitted += other.emitted;
        self.self_refs += other.self_refs;
        self.base_refs += other.base_refs;
        self.unique_payloads += other.unique_payloads;
        self.compressed_bytes += other.compressed_bytes;
    }
}

/// One capture session against a base image.
pub struct OverlayCapture {
    index: Arc<ChunkIndex>,
    live: Arc<dyn ChunkSource>,
    compression: Compression,
    dedup_against_base: bool,
    batch_limit: usize,
    pool: Option<rayon::ThreadPool>,
    publisher: ChunkPublisher,
    cancel: CancelFlag,
    /// Addresses in first-discovery order.
    order: Vec<ChunkAddr>,
    latest: HashMap<ChunkAddr, Observation>,
    states: HashMap<ChunkAddr, ChunkState>,
    /// Compressed payloads by content, stored in `spool`.
    payloads: HashMap<ChunkHash, (u64, u32)>,
    /// Content found elsewhere in the base (base dedup only).
    base_copies: HashMap<ChunkHash, ChunkAddr>,
    spool: BlobSpool,
    stats: CaptureStats,
}

impl OverlayCapture {
    /// Start a session. `live` must expose the same capacities as the base
    /// that `index` was built from.
    pub fn new(
        index: Arc<ChunkIndex>,
        live: Arc<dyn ChunkSource>,
        config: &CloudletConfig,
        publisher: ChunkPublisher,
    ) -> Result<Self> {
        index
            .geometry()
            .ensure_matches(&Geometry::of(live.as_ref())?)?;
        Ok(Self {
            index,
            live,
            compression: config.compression(),
            dedup_against_base: config.capture.dedup_against_base,
            batch_limit: config.capture.batch_limit.max(1),
            pool: build_worker_pool(config.capture.max_threads)?,
            publisher,
            cancel: CancelFlag::new(),
            order: Vec::new(),
            latest: HashMap::new(),
            states: HashMap::new(),
            payloads: HashMap::new(),
            base_copies: HashMap::new(),
            spool: BlobSpool::new()?,
            stats: CaptureStats::default(),
        })
    }

    #[cfg(test)]
    pub(crate) fn with_spool(mut self, spool: BlobSpool) -> Self {
        self.spool = spool;
        self
    }

    /// Use `cancel` to stop the session between batches.
    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn stats(&self) -> CaptureStats {
        self.stats
    }

    pub fn geometry(&self) -> Geometry {
        self.index.geometry()
    }

    /// Lifecycle state of `addr` in this session.
    pub fn state(&self, addr: ChunkAddr) -> ChunkState {
        self.states.get(&addr).copied().unwrap_or_default()
    }

    /// Number of addresses whose latest content differs from base.
    pub fn pending_records(&self) -> usize {
        self.latest
            .values()
            .filter(|o| matches!(o, Observation::Dirty(_)))
            .count()
    }

    /// Consume one batch of dirty hints from the hypervisor feed.
    ///
    /// Hints are confirmed by content hash; a hint whose content matches the
    /// base is not an error. The whole batch is rejected with
    /// `AddressOutOfRange` before any state changes if any address is
    /// outside the base capacity.
    pub fn on_dirty_batch(&mut self, addrs: &[ChunkAddr]) -> Result<()> {
        let geometry = self.index.geometry();
        for addr in addrs {
            geometry.check(*addr)?;
        }
        for part in addrs.chunks(self.batch_limit) {
            self.cancel.check()?;
            self.process(part)?;
        }
        Ok(())
    }

    /// Hash, decide, then compress. Nothing is committed to the session
    /// until every payload of the batch is in the spool.
    fn process(&mut self, addrs: &[ChunkAddr]) -> Result<()> {
        let live = Arc::clone(&self.live);
        let observed = run_parallel(self.pool.as_ref(), addrs.to_vec(), |addr| {
            let data = read_chunk_vec(live.as_ref(), addr)?;
            let hash = ChunkHash::compute(&data);
            Ok((addr, hash, data))
        })?;

        let mut delta = CaptureStats {
            inspected: observed.len() as u64,
            ..CaptureStats::default()
        };
        let mut decided: HashMap<ChunkAddr, Observation> = HashMap::new();
        let mut new_order = Vec::new();
        let mut dirtied = Vec::new();
        let mut new_base_copies: HashMap<ChunkHash, ChunkAddr> = HashMap::new();
        let mut to_compress = Vec::new();
        let mut queued = HashSet::new();

        for (addr, hash, data) in observed {
            let previous = decided
                .get(&addr)
                .or_else(|| self.latest.get(&addr))
                .copied();
            if hash == self.index.lookup(addr)? {
                delta.unchanged += 1;
                if matches!(previous, Some(Observation::Dirty(_))) {
                    decided.insert(addr, Observation::Reverted);
                    delta.reverted += 1;
                    debug!(%addr, "chunk reverted to base content");
                }
                continue;
            }

            if previous.is_none() {
                new_order.push(addr);
            }
            decided.insert(addr, Observation::Dirty(hash));
            dirtied.push(addr);
            delta.emitted += 1;

            if self.payloads.contains_key(&hash)
                || self.base_copies.contains_key(&hash)
                || new_base_copies.contains_key(&hash)
                || queued.contains(&hash)
            {
                delta.self_refs += 1;
            } else if let Some(base) = self
                .dedup_against_base
                .then(|| self.index.locate(&hash))
                .flatten()
            {
                new_base_copies.insert(hash, base);
                delta.base_refs += 1;
            } else {
                queued.insert(hash);
                to_compress.push((hash, data));
            }
        }

        let compression = self.compression;
        let compressed = run_parallel(self.pool.as_ref(), to_compress, |(hash, data)| {
            Ok((hash, compress::compress(compression, &data)?))
        })?;
        let mut new_payloads = Vec::with_capacity(compressed.len());
        for (hash, payload) in compressed {
            // Spool bytes of a failed batch stay unreferenced.
            let location = self.spool.append(&payload)?;
            delta.unique_payloads += 1;
            delta.compressed_bytes += payload.len() as u64;
            new_payloads.push((hash, location));
        }

        self.payloads.extend(new_payloads);
        self.base_copies.extend(new_base_copies);
        self.order.extend(new_order);
        self.latest.extend(decided);
        self.stats.absorb(&delta);

        let newly_modified: Vec<ChunkAddr> = dirtied
            .into_iter()
            .filter(|addr| self.states.entry(*addr).or_default().advance(ChunkState::Modified))
            .collect();
        self.publisher.publish(ChunkState::Modified, newly_modified);
        Ok(())
    }

    /// Resolve last-write-wins and lay out the final record list.
    fn build_writer(&self) -> Result<OverlayWriter> {
        let mut writer = OverlayWriter::new(self.index.geometry())?;
        let mut first_record: HashMap<ChunkHash, usize> = HashMap::new();

        for addr in &self.order {
            let hash = match self.latest.get(addr) {
                Some(Observation::Dirty(hash)) => *hash,
                _ => continue,
            };
            if let Some(&target) = first_record.get(&hash) {
                writer.append_self_ref(*addr, hash, target)?;
                continue;
            }
            let index = if let Some(&(offset, length)) = self.payloads.get(&hash) {
                let payload = self.spool.read(offset, length)?;
                writer.append_compressed(*addr, hash, &payload)?
            } else if let Some(&base) = self.base_copies.get(&hash) {
                writer.append_base_ref(*addr, hash, base)?
            } else {
                return Err(CloudletError::Other(format!(
                    "no payload captured for chunk {addr}"
                )));
            };
            first_record.insert(hash, index);
        }
        Ok(writer)
    }

    /// Finish the session and stream the container to `out`.
    ///
    /// Fails with `EmptyOverlay`, writing nothing, when no address ends the
    /// session with content different from the base.
    pub fn seal_into<W: Write>(mut self, out: &mut W) -> Result<OverlaySummary> {
        let writer = self.build_writer()?;
        self.publisher.close();
        if writer.is_empty() {
            info!(
                inspected = self.stats.inspected,
                "capture finished without changes"
            );
            return Err(CloudletError::EmptyOverlay);
        }
        let summary = writer.finish(out)?;
        info!(
            records = summary.records,
            compressed = summary.compressed,
            self_refs = summary.self_refs,
            base_refs = summary.base_refs,
            bytes = summary.container_bytes,
            "sealed overlay"
        );
        Ok(summary)
    }

    /// Finish the session into an in-memory container.
    pub fn seal(self) -> Result<OverlayContainer> {
        let mut bytes = Vec::new();
        self.seal_into(&mut bytes)?;
        OverlayContainer::open(bytes)
    }
}

fn run_parallel<T, R, F>(pool: Option<&rayon::ThreadPool>, items: Vec<T>, f: F) -> Result<Vec<R>>
where
    T: Send,
    R: Send,
    F: Fn(T) -> Result<R> + Send + Sync,
{
    match pool {
        Some(pool) => pool.install(|| items.into_par_iter().map(&f).collect()),
        None => items.into_iter().map(f).collect(),
    }
}
