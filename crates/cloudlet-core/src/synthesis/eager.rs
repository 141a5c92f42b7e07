use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use tracing::{debug, info};

use cloudlet_types::{ChunkState, CHUNK_SIZE};

use super::SynthesisEngine;
use crate::cancel::CancelFlag;
use crate::config::build_worker_pool;
use crate::error::{CloudletError, Result};
use crate::image::{read_chunk_vec, ChunkSink};

/// Base chunks copied per worker task.
const BASE_COPY_GROUP: u64 = 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SynthesisStats {
    pub records_applied: u64,
    pub base_chunks_copied: u64,
    pub bytes_written: u64,
}

#[derive(Default)]
struct Counters {
    applied: AtomicU64,
    copied: AtomicU64,
    bytes: AtomicU64,
}

impl SynthesisEngine {
    /// Write the complete customized image into `target`.
    ///
    /// Every delta record is applied exactly once and every chunk without a
    /// record is copied from the base. A payload that cannot be read aborts
    /// the run with `SynthesisFailed`; the partially written target must be
    /// discarded. The progress channel is closed when this returns.
    pub fn materialize(mut self, target: &dyn ChunkSink) -> Result<SynthesisStats> {
        let result = self.run_eager(target);
        self.publisher.close();
        result
    }

    fn run_eager(&self, target: &dyn ChunkSink) -> Result<SynthesisStats> {
        let geometry = self.container.geometry();
        let pool = build_worker_pool(self.max_threads)?;
        let counters = Counters::default();

        let total = geometry.total_chunks();
        let copy_groups: Vec<Range<u64>> = (0..total)
            .step_by(BASE_COPY_GROUP as usize)
            .map(|start| start..(start + BASE_COPY_GROUP).min(total))
            .collect();
        run_groups(pool.as_ref(), &copy_groups, &self.cancel, |range| {
            self.copy_base_range(range.clone(), target, &counters)
        })?;

        let record_count = self.container.len();
        let apply_groups: Vec<Range<usize>> = (0..record_count)
            .step_by(self.apply_batch)
            .map(|start| start..(start + self.apply_batch).min(record_count))
            .collect();
        run_groups(pool.as_ref(), &apply_groups, &self.cancel, |range| {
            self.apply_records(range.clone(), target, &counters)
        })?;

        let stats = SynthesisStats {
            records_applied: counters.applied.load(Ordering::Relaxed),
            base_chunks_copied: counters.copied.load(Ordering::Relaxed),
            bytes_written: counters.bytes.load(Ordering::Relaxed),
        };
        info!(
            records = stats.records_applied,
            base_chunks = stats.base_chunks_copied,
            bytes = stats.bytes_written,
            "synthesis complete"
        );
        Ok(stats)
    }

    fn copy_base_range(
        &self,
        ordinals: Range<u64>,
        target: &dyn ChunkSink,
        counters: &Counters,
    ) -> Result<()> {
        let geometry = self.container.geometry();
        for ordinal in ordinals {
            self.cancel.check()?;
            let Some(addr) = geometry.addr_at(ordinal) else {
                continue;
            };
            if self.container.find(addr).is_some() {
                continue;
            }
            let data = read_chunk_vec(self.base.as_ref(), addr)?;
            target.write_chunk(addr, &data)?;
            counters.copied.fetch_add(1, Ordering::Relaxed);
            counters.bytes.fetch_add(CHUNK_SIZE as u64, Ordering::Relaxed);
        }
        Ok(())
    }

    fn apply_records(
        &self,
        records: Range<usize>,
        target: &dyn ChunkSink,
        counters: &Counters,
    ) -> Result<()> {
        let mut decompressed = Vec::with_capacity(records.len());
        for index in records {
            self.cancel.check()?;
            let addr = self.container.records()[index].addr;
            let data = self
                .container
                .read_payload_with_base(index, self.base.as_ref())
                .map_err(|e| CloudletError::SynthesisFailed(format!("record {index} ({addr}): {e}")))?;
            decompressed.push((addr, data));
        }
        self.publisher.publish(
            ChunkState::Decompressed,
            decompressed.iter().map(|(addr, _)| *addr).collect(),
        );

        let mut applied = Vec::with_capacity(decompressed.len());
        for (addr, data) in decompressed {
            target.write_chunk(addr, &data)?;
            applied.push(addr);
        }
        debug!(count = applied.len(), "applied delta group");
        counters.applied.fetch_add(applied.len() as u64, Ordering::Relaxed);
        counters
            .bytes
            .fetch_add((applied.len() * CHUNK_SIZE) as u64, Ordering::Relaxed);
        self.publisher.publish(ChunkState::DeltaApplied, applied);
        Ok(())
    }
}

/// Run `work` for every group, stopping early on the first error or on
/// cancellation. The first error wins.
fn run_groups<G, F>(
    pool: Option<&rayon::ThreadPool>,
    groups: &[G],
    cancel: &CancelFlag,
    work: F,
) -> Result<()>
where
    G: Sync,
    F: Fn(&G) -> Result<()> + Sync,
{
    let Some(pool) = pool else {
        for group in groups {
            cancel.check()?;
            work(group)?;
        }
        return Ok(());
    };

    let failed = AtomicBool::new(false);
    let first_error = Mutex::new(None::<CloudletError>);

    pool.in_place_scope(|s| {
        for group in groups {
            let failed = &failed;
            let first_error = &first_error;
            let work = &work;
            s.spawn(move |_| {
                if failed.load(Ordering::Acquire) {
                    return;
                }
                if let Err(e) = cancel.check().and_then(|()| work(group)) {
                    failed.store(true, Ordering::Release);
                    if let Ok(mut slot) = first_error.lock() {
                        if slot.is_none() {
                            *slot = Some(e);
                        }
                    }
                }
            });
        }
    });

    if let Ok(mut slot) = first_error.lock() {
        if let Some(err) = slot.take() {
            return Err(err);
        }
    } else if failed.load(Ordering::Acquire) {
        return Err(CloudletError::SynthesisFailed(
            "worker failed while holding the error slot".into(),
        ));
    }
    Ok(())
}
