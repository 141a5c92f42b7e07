pub mod cancel;
pub mod capture;
pub mod channel;
pub mod compress;
pub mod config;
pub mod container;
pub mod error;
pub mod image;
pub mod index;
pub mod synthesis;

pub use cloudlet_types::{ChunkAddr, ChunkHash, ChunkKind, ChunkState, CHUNK_SIZE};

#[cfg(test)]
mod tests;
#[cfg(test)]
mod testutil;
