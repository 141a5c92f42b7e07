pub mod chunk;
pub mod chunk_hash;
pub mod error;

pub use chunk::{chunk_count, ChunkAddr, ChunkKind, ChunkState, CHUNK_SIZE};
pub use chunk_hash::{ChunkHash, HASH_LEN};
pub use error::{CloudletError, Result};
