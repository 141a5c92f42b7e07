use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::sync::Arc;

use tempfile::NamedTempFile;
use tracing::info;

use cloudlet_core::capture::OverlayCapture;
use cloudlet_core::channel::dirty_chunk_channel;
use cloudlet_core::config::CloudletConfig;
use cloudlet_core::error::Result;
use cloudlet_core::image::Geometry;
use cloudlet_core::index::ChunkIndex;

use super::{open_image, redraw_interval, CmdResult};
use crate::format::{format_bytes, format_ratio};
use crate::progress::ChunkProgress;

pub(crate) struct OverlayArgs<'a> {
    pub base_disk: &'a Path,
    pub base_memory: Option<&'a Path>,
    pub live_disk: &'a Path,
    pub live_memory: Option<&'a Path>,
    pub index: Option<&'a Path>,
    pub output: &'a Path,
}

fn load_index(args: &OverlayArgs<'_>) -> Result<ChunkIndex> {
    match args.index {
        Some(path) => ChunkIndex::load(BufReader::new(File::open(path)?)),
        None => ChunkIndex::build(&open_image(args.base_disk, args.base_memory)?),
    }
}

/// Offer every chunk of the live VM as a dirty hint, in batches.
///
/// Raw image files carry no dirty tracking, so the whole image is scanned;
/// capture confirms each hint against the base by hash.
fn feed_full_scan(capture: &mut OverlayCapture, geometry: Geometry, batch_size: usize) -> Result<()> {
    let mut batch = Vec::with_capacity(batch_size);
    for addr in geometry.addrs() {
        batch.push(addr);
        if batch.len() == batch_size {
            capture.on_dirty_batch(&batch)?;
            batch.clear();
        }
    }
    if !batch.is_empty() {
        capture.on_dirty_batch(&batch)?;
    }
    Ok(())
}

pub(crate) fn run_overlay(config: &CloudletConfig, args: OverlayArgs<'_>) -> CmdResult {
    let index = load_index(&args)?;
    let geometry = index.geometry();
    let live = open_image(args.live_disk, args.live_memory)?;

    let (publisher, monitor) = dirty_chunk_channel(config.monitor.channel_capacity);
    let progress = ChunkProgress::spawn("overlay", geometry, monitor, redraw_interval(config));

    let mut capture = OverlayCapture::new(Arc::new(index), Arc::new(live), config, publisher)?;
    if let Err(e) = feed_full_scan(&mut capture, geometry, config.capture.batch_limit) {
        drop(capture);
        progress.finish();
        return Err(e.into());
    }
    let stats = capture.stats();

    let dir = args
        .output
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir)?;
    let sealed = {
        let mut out = BufWriter::new(tmp.as_file_mut());
        capture.seal_into(&mut out)
    };
    progress.finish();

    let summary = match sealed {
        Ok(summary) => summary,
        Err(e) if e.is_empty_overlay() => {
            println!("no changes");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };
    tmp.persist(args.output)?;
    info!(
        inspected = stats.inspected,
        emitted = stats.emitted,
        reverted = stats.reverted,
        "capture statistics"
    );

    println!("Overlay:    {}", args.output.display());
    println!(
        "Records:    {} ({} compressed, {} self-ref, {} base-ref)",
        summary.records, summary.compressed, summary.self_refs, summary.base_refs
    );
    println!(
        "Size:       {} ({} of {} image)",
        format_bytes(summary.container_bytes),
        format_ratio(summary.container_bytes, geometry.total_bytes()),
        format_bytes(geometry.total_bytes())
    );
    Ok(())
}
