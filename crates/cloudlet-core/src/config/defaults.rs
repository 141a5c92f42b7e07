use super::types::CompressionAlgorithm;

pub(super) fn default_algorithm() -> CompressionAlgorithm {
    CompressionAlgorithm::Lz4
}

pub(super) fn default_zstd_level() -> i32 {
    3
}

pub(super) fn default_batch_limit() -> usize {
    4096
}

pub(super) fn default_apply_batch() -> usize {
    64
}

pub(super) fn default_channel_capacity() -> usize {
    256
}

pub(super) fn default_redraw_interval_ms() -> u64 {
    100
}
