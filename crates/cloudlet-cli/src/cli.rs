use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "cloudlet",
    version,
    about = "Capture and synthesize VM overlays against a base image",
    after_help = "\
Configuration file lookup order:
  1. --config <path>             (explicit flag)
  2. $CLOUDLET_CONFIG            (environment variable)
  3. built-in defaults

Image files are raw: a disk image and an optional memory snapshot, each a
whole number of 4 KiB chunks."
)]
pub(crate) struct Cli {
    /// Path to configuration file (overrides CLOUDLET_CONFIG)
    #[arg(short, long)]
    pub config: Option<String>,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Hash a base VM and optionally save its chunk index
    Base {
        /// Base disk image
        disk: PathBuf,

        /// Base memory snapshot
        #[arg(long)]
        memory: Option<PathBuf>,

        /// Write the chunk index to this file
        #[arg(long)]
        index: Option<PathBuf>,
    },

    /// Capture the difference between a base VM and a customized VM
    Overlay {
        /// Base disk image
        base_disk: PathBuf,

        /// Customized (live) disk image
        live_disk: PathBuf,

        /// Base memory snapshot
        #[arg(long)]
        base_memory: Option<PathBuf>,

        /// Customized memory snapshot
        #[arg(long)]
        live_memory: Option<PathBuf>,

        /// Load a saved base chunk index instead of hashing the base again
        #[arg(long)]
        index: Option<PathBuf>,

        /// Ignore memory snapshots and capture the disk only
        #[arg(long)]
        disk_only: bool,

        /// Output overlay file
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Rebuild a customized VM from a base VM and an overlay
    Synthesis {
        /// Base disk image
        base_disk: PathBuf,

        /// Overlay file produced by `cloudlet overlay`
        overlay: PathBuf,

        /// Output disk image
        #[arg(long)]
        disk_out: PathBuf,

        /// Base memory snapshot
        #[arg(long)]
        base_memory: Option<PathBuf>,

        /// Output memory snapshot
        #[arg(long)]
        memory_out: Option<PathBuf>,
    },

    /// Show the header and record summary of an overlay
    Inspect {
        /// Overlay file
        overlay: PathBuf,

        /// List every record
        #[arg(long)]
        records: bool,
    },
}
