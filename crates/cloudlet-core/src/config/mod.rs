mod defaults;
mod types;

use std::path::Path;

use tracing::debug;

use crate::compress::Compression;
use crate::error::{CloudletError, Result};

pub use types::{
    CaptureConfig, CloudletConfig, CompressionAlgorithm, CompressionConfig, MonitorConfig,
    SynthesisConfig,
};

/// Environment variable consulted when no `--config` path is given.
pub const CONFIG_ENV_VAR: &str = "CLOUDLET_CONFIG";

impl CloudletConfig {
    /// Parse and validate a YAML document.
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        // An empty document means "all defaults".
        let config: CloudletConfig = if raw.trim().is_empty() {
            CloudletConfig::default()
        } else {
            serde_yaml::from_str(raw)
                .map_err(|e| CloudletError::Config(format!("invalid YAML: {e}")))?
        };
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a YAML config file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            CloudletError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        let config = Self::from_yaml_str(&raw)?;
        debug!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Resolve the config source: explicit path first, then `$CLOUDLET_CONFIG`,
    /// otherwise defaults.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        match std::env::var_os(CONFIG_ENV_VAR) {
            Some(path) if !path.is_empty() => Self::load(Path::new(&path)),
            _ => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.compression.algorithm == CompressionAlgorithm::Zstd
            && !(1..=22).contains(&self.compression.zstd_level)
        {
            return Err(CloudletError::Config(format!(
                "compression.zstd_level must be in [1, 22], got {}",
                self.compression.zstd_level
            )));
        }
        if self.capture.max_threads > 256 {
            return Err(CloudletError::Config(format!(
                "capture.max_threads must be in [0, 256], got {}",
                self.capture.max_threads
            )));
        }
        if self.capture.batch_limit == 0 {
            return Err(CloudletError::Config(
                "capture.batch_limit must be at least 1".into(),
            ));
        }
        if self.synthesis.max_threads > 256 {
            return Err(CloudletError::Config(format!(
                "synthesis.max_threads must be in [0, 256], got {}",
                self.synthesis.max_threads
            )));
        }
        if !(1..=65536).contains(&self.synthesis.apply_batch) {
            return Err(CloudletError::Config(format!(
                "synthesis.apply_batch must be in [1, 65536], got {}",
                self.synthesis.apply_batch
            )));
        }
        if self.monitor.channel_capacity == 0 {
            return Err(CloudletError::Config(
                "monitor.channel_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Effective payload codec.
    pub fn compression(&self) -> Compression {
        Compression::from_algorithm(self.compression.algorithm, self.compression.zstd_level)
    }
}

/// Build a rayon pool honoring a `max_threads` setting.
///
/// Returns `None` for `max_threads == 1`, meaning "run sequentially".
pub(crate) fn build_worker_pool(max_threads: usize) -> Result<Option<rayon::ThreadPool>> {
    if max_threads == 1 {
        return Ok(None);
    }
    // max_threads == 0 means use all available cores (rayon default).
    let mut builder = rayon::ThreadPoolBuilder::new();
    if max_threads > 1 {
        builder = builder.num_threads(max_threads);
    }
    builder
        .build()
        .map(Some)
        .map_err(|e| CloudletError::Other(format!("failed to create rayon thread pool: {e}")))
}
