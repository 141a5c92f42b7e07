use std::io::Read;

use serde::{Deserialize, Serialize};

use crate::config::CompressionAlgorithm;
use crate::error::{CloudletError, Result};
use cloudlet_types::CHUNK_SIZE;

const TAG_NONE: u8 = 0x00;
const TAG_LZ4: u8 = 0x01;
const TAG_ZSTD: u8 = 0x02;

/// Every payload decodes to exactly one chunk, so anything larger is a
/// decompression bomb or a corrupt blob.
const MAX_DECOMPRESS_SIZE: u64 = CHUNK_SIZE as u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Compression {
    None,
    #[default]
    Lz4,
    Zstd {
        level: i32,
    },
}

impl Compression {
    pub fn from_algorithm(algorithm: CompressionAlgorithm, zstd_level: i32) -> Self {
        match algorithm {
            CompressionAlgorithm::None => Compression::None,
            CompressionAlgorithm::Lz4 => Compression::Lz4,
            CompressionAlgorithm::Zstd => Compression::Zstd { level: zstd_level },
        }
    }
}

/// Compress one chunk and prepend a 1-byte tag identifying the codec.
///
/// The output depends only on `data`, so every payload can later be
/// decompressed on its own.
pub fn compress(compression: Compression, data: &[u8]) -> Result<Vec<u8>> {
    match compression {
        Compression::None => {
            let mut out = Vec::with_capacity(1 + data.len());
            out.push(TAG_NONE);
            out.extend_from_slice(data);
            Ok(out)
        }
        Compression::Lz4 => {
            let compressed = lz4_flex::compress_prepend_size(data);
            let mut out = Vec::with_capacity(1 + compressed.len());
            out.push(TAG_LZ4);
            out.extend_from_slice(&compressed);
            Ok(out)
        }
        Compression::Zstd { level } => {
            use std::cell::RefCell;
            thread_local! {
                static ZSTD_CX: RefCell<Option<(i32, zstd::bulk::Compressor<'static>)>> =
                    const { RefCell::new(None) };
            }

            ZSTD_CX.with(|cell| {
                let mut slot = cell.borrow_mut();

                // Lazily init or reinit if the compression level changed.
                if !matches!(slot.as_ref(), Some((l, _)) if *l == level) {
                    let cx = zstd::bulk::Compressor::new(level)
                        .map_err(|e| CloudletError::Other(format!("zstd init: {e}")))?;
                    *slot = Some((level, cx));
                }
                let Some((_, cx)) = slot.as_mut() else {
                    return Err(CloudletError::Other("zstd compressor unavailable".into()));
                };

                let compressed = cx
                    .compress(data)
                    .map_err(|e| CloudletError::Other(format!("zstd compress: {e}")))?;
                let mut out = Vec::with_capacity(1 + compressed.len());
                out.push(TAG_ZSTD);
                out.extend_from_slice(&compressed);
                Ok(out)
            })
        }
    }
}

/// Decompress data by reading the 1-byte tag prefix and dispatching.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    if data.is_empty() {
        return Err(CloudletError::Decompression("empty data".into()));
    }
    let tag = data[0];
    let payload = &data[1..];
    match tag {
        TAG_NONE => {
            if payload.len() as u64 > MAX_DECOMPRESS_SIZE {
                return Err(CloudletError::Decompression(format!(
                    "raw payload ({} bytes) exceeds limit of {MAX_DECOMPRESS_SIZE} bytes",
                    payload.len()
                )));
            }
            Ok(payload.to_vec())
        }
        TAG_LZ4 => {
            let size_prefix: [u8; 4] = payload
                .get(..4)
                .and_then(|b| b.try_into().ok())
                .ok_or_else(|| CloudletError::Decompression("lz4: payload too short".into()))?;
            let uncompressed_size = u32::from_le_bytes(size_prefix) as u64;
            if uncompressed_size > MAX_DECOMPRESS_SIZE {
                return Err(CloudletError::Decompression(format!(
                    "lz4: decompressed size ({uncompressed_size}) exceeds limit of {MAX_DECOMPRESS_SIZE} bytes"
                )));
            }
            lz4_flex::decompress_size_prepended(payload)
                .map_err(|e| CloudletError::Decompression(format!("lz4: {e}")))
        }
        TAG_ZSTD => {
            let mut decoder = zstd::stream::Decoder::new(std::io::Cursor::new(payload))
                .map_err(|e| CloudletError::Decompression(format!("zstd init: {e}")))?;
            let mut output = Vec::with_capacity(CHUNK_SIZE);
            decoder
                .by_ref()
                .take(MAX_DECOMPRESS_SIZE + 1)
                .read_to_end(&mut output)
                .map_err(|e| CloudletError::Decompression(format!("zstd: {e}")))?;
            if output.len() as u64 > MAX_DECOMPRESS_SIZE {
                return Err(CloudletError::Decompression(format!(
                    "zstd: decompressed size exceeds limit of {MAX_DECOMPRESS_SIZE} bytes"
                )));
            }
            Ok(output)
        }
        _ => Err(CloudletError::UnknownCompressionTag(tag)),
    }
}
