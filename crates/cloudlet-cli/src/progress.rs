use std::io::{self, IsTerminal, Stderr, Write};
use std::sync::atomic::{AtomicBool, Ordering::Relaxed};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing_subscriber::fmt::MakeWriter;

use cloudlet_core::channel::{ChunkMonitor, ChunkStateGrid, StateCounts};
use cloudlet_core::image::Geometry;
use cloudlet_core::ChunkKind;

use crate::format::format_ratio;

/// True while a chunk progress line is being displayed on stderr.
static PROGRESS_ACTIVE: AtomicBool = AtomicBool::new(false);

/// Serializes all stderr writes between the progress renderer and tracing.
static STDERR_LOCK: Mutex<()> = Mutex::new(());

fn acquire_stderr_lock() -> MutexGuard<'static, ()> {
    STDERR_LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

/// A [`MakeWriter`] that clears the progress line before each tracing event
/// so log lines never interleave with the `\r`-redrawn progress display.
pub(crate) struct ProgressAwareStderr;

/// Holds `STDERR_LOCK` for the whole tracing write.
pub(crate) struct ProgressWriter {
    _guard: MutexGuard<'static, ()>,
    inner: Stderr,
}

impl Write for ProgressWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<'a> MakeWriter<'a> for ProgressAwareStderr {
    type Writer = ProgressWriter;

    fn make_writer(&'a self) -> Self::Writer {
        let guard = acquire_stderr_lock();
        let mut stderr = io::stderr();

        if PROGRESS_ACTIVE.load(Relaxed) && stderr.is_terminal() {
            let _ = stderr.write_all(b"\r\x1b[2K");
        }

        ProgressWriter {
            _guard: guard,
            inner: stderr,
        }
    }
}

/// Terminal consumer of a session's chunk progress channel.
///
/// Runs on its own thread, polling the channel into a [`ChunkStateGrid`]
/// and redrawing one status line. It exits once the session closes the
/// channel or [`ChunkProgress::finish`] is called.
pub(crate) struct ChunkProgress {
    geometry: Geometry,
    stop: Arc<AtomicBool>,
    handle: JoinHandle<ChunkStateGrid>,
}

impl ChunkProgress {
    pub(crate) fn spawn(
        label: &'static str,
        geometry: Geometry,
        monitor: ChunkMonitor,
        interval: Duration,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let handle = thread::spawn(move || {
            let mut grid = ChunkStateGrid::new(geometry);
            let mut renderer = LineRenderer::new(label);
            loop {
                grid.poll(&monitor);
                if monitor.is_closed() || thread_stop.load(Relaxed) {
                    break;
                }
                renderer.render(&grid);
                thread::sleep(interval);
            }
            grid.poll(&monitor);
            renderer.finish(&grid);
            grid
        });
        Self {
            geometry,
            stop,
            handle,
        }
    }

    /// Stop the monitor and return the final grid.
    pub(crate) fn finish(self) -> ChunkStateGrid {
        self.stop.store(true, Relaxed);
        self.handle
            .join()
            .unwrap_or_else(|_| ChunkStateGrid::new(self.geometry))
    }
}

struct LineRenderer {
    label: &'static str,
    enabled: bool,
    last_line_len: usize,
    rendered_any: bool,
}

impl LineRenderer {
    fn new(label: &'static str) -> Self {
        let enabled = io::stderr().is_terminal();
        if enabled {
            PROGRESS_ACTIVE.store(true, Relaxed);
        }
        Self {
            label,
            enabled,
            last_line_len: 0,
            rendered_any: false,
        }
    }

    fn render(&mut self, grid: &ChunkStateGrid) {
        if !self.enabled {
            return;
        }
        let line = status_line(self.label, grid);
        let pad_len = self.last_line_len.saturating_sub(line.len());
        {
            let _guard = acquire_stderr_lock();
            eprint!("\r{line}{}", " ".repeat(pad_len));
            let _ = io::stderr().flush();
        }
        self.last_line_len = line.len();
        self.rendered_any = true;
    }

    fn finish(&mut self, grid: &ChunkStateGrid) {
        if self.rendered_any {
            self.render(grid);
            let _guard = acquire_stderr_lock();
            eprintln!();
        }
        PROGRESS_ACTIVE.store(false, Relaxed);
        if grid.ignored() > 0 {
            tracing::debug!(ignored = grid.ignored(), "progress updates outside the grid");
        }
    }
}

fn describe(kind: ChunkKind, counts: StateCounts) -> String {
    let touched = counts.total() - counts.unmodified;
    let mut out = format!(
        "{kind}: {touched}/{} chunks ({})",
        counts.total(),
        format_ratio(touched, counts.total())
    );
    if counts.decompressed + counts.delta_applied > 0 {
        out.push_str(&format!(", {} applied", counts.delta_applied));
    }
    out
}

pub(crate) fn status_line(label: &str, grid: &ChunkStateGrid) -> String {
    format!(
        "{label}  {}  {}",
        describe(ChunkKind::Disk, grid.counts(ChunkKind::Disk)),
        describe(ChunkKind::Memory, grid.counts(ChunkKind::Memory)),
    )
}

#[cfg(test)]
mod tests {
    use cloudlet_core::channel::ChunkBatch;
    use cloudlet_core::{ChunkAddr, ChunkState};

    use super::*;

    #[test]
    fn status_line_counts_touched_and_applied_chunks() {
        let geometry = Geometry::new(4 * 4096, 2 * 4096).unwrap();
        let mut grid = ChunkStateGrid::new(geometry);
        grid.apply(&ChunkBatch {
            state: ChunkState::DeltaApplied,
            chunks: vec![ChunkAddr::disk(0), ChunkAddr::disk(3)],
        });
        grid.apply(&ChunkBatch {
            state: ChunkState::Modified,
            chunks: vec![ChunkAddr::memory(1)],
        });
        assert_eq!(
            status_line("synthesis", &grid),
            "synthesis  disk: 2/4 chunks (50.0%), 2 applied  memory: 1/2 chunks (50.0%)"
        );
    }
}
