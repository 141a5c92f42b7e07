pub(crate) mod base;
pub(crate) mod inspect;
pub(crate) mod overlay;
pub(crate) mod synthesis;

use std::path::Path;
use std::time::Duration;

use cloudlet_core::config::CloudletConfig;
use cloudlet_core::error::Result;
use cloudlet_core::image::FileImage;

use crate::cli::Commands;

pub(crate) type CmdResult = std::result::Result<(), Box<dyn std::error::Error>>;

pub(crate) fn dispatch(command: &Commands, config: &CloudletConfig) -> CmdResult {
    match command {
        Commands::Base {
            disk,
            memory,
            index,
        } => base::run_base(disk, memory.as_deref(), index.as_deref()),
        Commands::Overlay {
            base_disk,
            live_disk,
            base_memory,
            live_memory,
            index,
            disk_only,
            output,
        } => {
            let (base_memory, live_memory) = if *disk_only {
                (None, None)
            } else {
                (base_memory.as_deref(), live_memory.as_deref())
            };
            overlay::run_overlay(
                config,
                overlay::OverlayArgs {
                    base_disk,
                    base_memory,
                    live_disk,
                    live_memory,
                    index: index.as_deref(),
                    output,
                },
            )
        }
        Commands::Synthesis {
            base_disk,
            overlay,
            disk_out,
            base_memory,
            memory_out,
        } => synthesis::run_synthesis(
            config,
            synthesis::SynthesisArgs {
                base_disk,
                base_memory: base_memory.as_deref(),
                overlay,
                disk_out,
                memory_out: memory_out.as_deref(),
            },
        ),
        Commands::Inspect { overlay, records } => inspect::run_inspect(overlay, *records),
    }
}

/// Open a raw disk image plus optional memory snapshot read-only.
pub(crate) fn open_image(disk: &Path, memory: Option<&Path>) -> Result<FileImage> {
    FileImage::open(disk, memory)
}

pub(crate) fn redraw_interval(config: &CloudletConfig) -> Duration {
    Duration::from_millis(config.monitor.redraw_interval_ms.max(10))
}
