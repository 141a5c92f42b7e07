use serde::{Deserialize, Serialize};

use super::defaults::*;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CloudletConfig {
    #[serde(default)]
    pub compression: CompressionConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub synthesis: SynthesisConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    None,
    Lz4,
    Zstd,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompressionConfig {
    #[serde(default = "default_algorithm")]
    pub algorithm: CompressionAlgorithm,
    #[serde(default = "default_zstd_level")]
    pub zstd_level: i32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            algorithm: default_algorithm(),
            zstd_level: default_zstd_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CaptureConfig {
    /// Emit base references for dirty chunks whose content already exists
    /// somewhere in the base image.
    #[serde(default)]
    pub dedup_against_base: bool,
    /// Worker threads for hashing and compression (0 = all cores, 1 = sequential).
    #[serde(default)]
    pub max_threads: usize,
    /// Addresses hashed per parallel pass; larger dirty batches are split.
    #[serde(default = "default_batch_limit")]
    pub batch_limit: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            dedup_against_base: false,
            max_threads: 0,
            batch_limit: default_batch_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SynthesisConfig {
    /// Worker threads for eager synthesis (0 = all cores, 1 = sequential).
    #[serde(default)]
    pub max_threads: usize,
    /// Records decompressed and applied per worker task.
    #[serde(default = "default_apply_batch")]
    pub apply_batch: usize,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            max_threads: 0,
            apply_batch: default_apply_batch(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MonitorConfig {
    /// Queued batches kept per progress channel before the oldest is evicted.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default = "default_redraw_interval_ms")]
    pub redraw_interval_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            redraw_interval_ms: default_redraw_interval_ms(),
        }
    }
}
