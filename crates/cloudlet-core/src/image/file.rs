use std::fs::{File, OpenOptions};
use std::path::Path;

use cloudlet_types::{chunk_count, ChunkAddr, ChunkKind};
use tracing::debug;

use super::{check_addr, check_chunk_buf, ChunkSink, ChunkSource};
use crate::error::{CloudletError, Result};

/// Disk and (optional) memory image files accessed with positional I/O.
///
/// A missing memory image is treated as a zero-capacity device, which is how
/// disk-only overlays are captured and synthesized.
#[derive(Debug)]
pub struct FileImage {
    disk: File,
    memory: Option<File>,
    disk_capacity: u64,
    memory_capacity: u64,
}

impl FileImage {
    /// Open existing images read-only. Sizes must be chunk-aligned.
    pub fn open(disk_path: &Path, memory_path: Option<&Path>) -> Result<Self> {
        let disk = File::open(disk_path)?;
        let disk_capacity = disk.metadata()?.len();
        chunk_count(ChunkKind::Disk, disk_capacity)?;

        let (memory, memory_capacity) = match memory_path {
            Some(path) => {
                let file = File::open(path)?;
                let len = file.metadata()?.len();
                chunk_count(ChunkKind::Memory, len)?;
                (Some(file), len)
            }
            None => (None, 0),
        };

        debug!(
            disk = %disk_path.display(),
            disk_capacity,
            memory_capacity,
            "opened image files"
        );
        Ok(Self {
            disk,
            memory,
            disk_capacity,
            memory_capacity,
        })
    }

    /// Create (or truncate) target images sized to the given capacities.
    pub fn create(
        disk_path: &Path,
        memory_path: Option<&Path>,
        disk_capacity: u64,
        memory_capacity: u64,
    ) -> Result<Self> {
        chunk_count(ChunkKind::Disk, disk_capacity)?;
        chunk_count(ChunkKind::Memory, memory_capacity)?;

        if memory_path.is_none() && memory_capacity > 0 {
            return Err(CloudletError::Other(format!(
                "image has {memory_capacity} bytes of memory but no memory output path was given"
            )));
        }
        let disk = create_sized(disk_path, disk_capacity)?;
        let memory = memory_path
            .map(|path| create_sized(path, memory_capacity))
            .transpose()?;
        Ok(Self {
            disk,
            memory,
            disk_capacity,
            memory_capacity,
        })
    }

    fn file(&self, addr: ChunkAddr) -> Result<&File> {
        match addr.kind {
            ChunkKind::Disk => Ok(&self.disk),
            ChunkKind::Memory => self
                .memory
                .as_ref()
                .ok_or(CloudletError::AddressOutOfRange(addr)),
        }
    }

    /// Flush written chunks to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.disk.sync_all()?;
        if let Some(memory) = &self.memory {
            memory.sync_all()?;
        }
        Ok(())
    }
}

fn create_sized(path: &Path, len: u64) -> Result<File> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.set_len(len)?;
    Ok(file)
}

impl ChunkSource for FileImage {
    fn capacity(&self, kind: ChunkKind) -> u64 {
        match kind {
            ChunkKind::Disk => self.disk_capacity,
            ChunkKind::Memory => self.memory_capacity,
        }
    }

    fn read_chunk(&self, addr: ChunkAddr, buf: &mut [u8]) -> Result<()> {
        check_chunk_buf(buf.len())?;
        check_addr(addr, self.capacity(addr.kind))?;
        read_exact_at(self.file(addr)?, buf, addr.byte_offset())
    }
}

impl ChunkSink for FileImage {
    fn write_chunk(&self, addr: ChunkAddr, data: &[u8]) -> Result<()> {
        check_chunk_buf(data.len())?;
        check_addr(addr, self.capacity(addr.kind))?;
        write_all_at(self.file(addr)?, data, addr.byte_offset())
    }
}

#[cfg(unix)]
pub(crate) fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)?;
    Ok(())
}

#[cfg(unix)]
pub(crate) fn write_all_at(file: &File, data: &[u8], offset: u64) -> Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(data, offset)?;
    Ok(())
}

#[cfg(windows)]
pub(crate) fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        let n = file.seek_read(buf, offset)?;
        if n == 0 {
            return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
        }
        buf = &mut buf[n..];
        offset += n as u64;
    }
    Ok(())
}

#[cfg(windows)]
pub(crate) fn write_all_at(file: &File, mut data: &[u8], mut offset: u64) -> Result<()> {
    use std::os::windows::fs::FileExt;
    while !data.is_empty() {
        let n = file.seek_write(data, offset)?;
        if n == 0 {
            return Err(std::io::Error::from(std::io::ErrorKind::WriteZero).into());
        }
        data = &data[n..];
        offset += n as u64;
    }
    Ok(())
}
