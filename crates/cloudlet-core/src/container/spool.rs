use std::fs::File;
use std::io::Write;

use crate::error::{CloudletError, Result};
use crate::image::file::{read_exact_at, write_all_at};

/// Copy granularity when streaming the spool into a container.
const COPY_BUF_SIZE: usize = 256 * 1024;

/// Append-only payload storage in an anonymous temporary file.
///
/// Keeps compressed payloads out of RAM while an overlay is being built.
/// All I/O is positional, so reads never disturb the append position.
#[derive(Debug)]
pub struct BlobSpool {
    file: File,
    len: u64,
}

impl BlobSpool {
    pub fn new() -> Result<Self> {
        Ok(Self::from_file(tempfile::tempfile()?))
    }

    /// Spool over an empty, caller-provided file.
    pub(crate) fn from_file(file: File) -> Self {
        Self { file, len: 0 }
    }

    /// Append `data`, returning its `(offset, length)` within the spool.
    pub fn append(&mut self, data: &[u8]) -> Result<(u64, u32)> {
        let length = u32::try_from(data.len()).map_err(|_| {
            CloudletError::Other(format!("payload of {} bytes is too large", data.len()))
        })?;
        let offset = self.len;
        write_all_at(&self.file, data, offset)?;
        self.len += data.len() as u64;
        Ok((offset, length))
    }

    pub fn read(&self, offset: u64, length: u32) -> Result<Vec<u8>> {
        if offset + length as u64 > self.len {
            return Err(CloudletError::Other(format!(
                "spool read {offset}+{length} past end ({})",
                self.len
            )));
        }
        let mut buf = vec![0u8; length as usize];
        read_exact_at(&self.file, &mut buf, offset)?;
        Ok(buf)
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Stream the whole spool into `out`. Returns the number of bytes copied.
    pub fn copy_to<W: Write>(&self, out: &mut W) -> Result<u64> {
        let mut buf = vec![0u8; COPY_BUF_SIZE.min(self.len as usize)];
        let mut pos = 0u64;
        while pos < self.len {
            let n = (self.len - pos).min(buf.len() as u64) as usize;
            read_exact_at(&self.file, &mut buf[..n], pos)?;
            out.write_all(&buf[..n])?;
            pos += n as u64;
        }
        Ok(pos)
    }
}
