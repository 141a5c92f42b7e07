use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use cloudlet_core::index::ChunkIndex;
use cloudlet_core::ChunkKind;

use super::CmdResult;
use crate::format::format_bytes;

fn open_stream(path: Option<&Path>) -> io::Result<(Box<dyn Read>, u64)> {
    match path {
        Some(path) => {
            let file = File::open(path)?;
            let len = file.metadata()?.len();
            Ok((Box::new(BufReader::new(file)), len))
        }
        None => Ok((Box::new(io::empty()), 0)),
    }
}

pub(crate) fn run_base(disk: &Path, memory: Option<&Path>, index_out: Option<&Path>) -> CmdResult {
    let (disk_stream, disk_len) = open_stream(Some(disk))?;
    let (memory_stream, memory_len) = open_stream(memory)?;
    let index = ChunkIndex::build_from_readers(disk_stream, disk_len, memory_stream, memory_len)?;

    for kind in ChunkKind::ALL {
        println!(
            "{:<8} {} ({} chunks)",
            format!("{kind}:"),
            format_bytes(index.capacity(kind)),
            index.chunk_count(kind)
        );
    }
    println!("Distinct: {} chunks", index.distinct_hashes());

    if let Some(path) = index_out {
        let mut out = BufWriter::new(File::create(path)?);
        index.save(&mut out)?;
        out.flush()?;
        println!("Index written to {}", path.display());
    }
    Ok(())
}
