use std::path::Path;
use std::sync::Arc;

use tracing::warn;

use cloudlet_core::channel::dirty_chunk_channel;
use cloudlet_core::config::CloudletConfig;
use cloudlet_core::container::OverlayContainer;
use cloudlet_core::image::FileImage;
use cloudlet_core::synthesis::SynthesisEngine;

use super::{open_image, redraw_interval, CmdResult};
use crate::format::format_bytes;
use crate::progress::ChunkProgress;

pub(crate) struct SynthesisArgs<'a> {
    pub base_disk: &'a Path,
    pub base_memory: Option<&'a Path>,
    pub overlay: &'a Path,
    pub disk_out: &'a Path,
    pub memory_out: Option<&'a Path>,
}

/// A failed run leaves no half-written image behind.
fn remove_outputs(args: &SynthesisArgs<'_>) {
    for path in std::iter::once(args.disk_out).chain(args.memory_out) {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "could not remove partial output");
        }
    }
}

pub(crate) fn run_synthesis(config: &CloudletConfig, args: SynthesisArgs<'_>) -> CmdResult {
    let overlay = OverlayContainer::open_file(args.overlay)?;
    let geometry = overlay.geometry();
    let base = open_image(args.base_disk, args.base_memory)?;
    let records = overlay.len();

    // Reject a wrong base before any output path is touched.
    let (publisher, monitor) = dirty_chunk_channel(config.monitor.channel_capacity);
    let engine = SynthesisEngine::new(overlay, Arc::new(base), publisher, config)?;

    let target = FileImage::create(
        args.disk_out,
        args.memory_out,
        geometry.disk_capacity,
        geometry.memory_capacity,
    )?;

    let progress = ChunkProgress::spawn("synthesis", geometry, monitor, redraw_interval(config));
    let result = engine
        .materialize(&target)
        .and_then(|stats| target.sync().map(|()| stats));
    progress.finish();

    let stats = match result {
        Ok(stats) => stats,
        Err(e) => {
            drop(target);
            remove_outputs(&args);
            return Err(e.into());
        }
    };

    println!("Disk:       {}", args.disk_out.display());
    if let Some(memory) = args.memory_out {
        println!("Memory:     {}", memory.display());
    }
    println!(
        "Applied:    {} of {records} records, {} base chunks copied",
        stats.records_applied, stats.base_chunks_copied
    );
    println!("Written:    {}", format_bytes(stats.bytes_written));
    Ok(())
}
