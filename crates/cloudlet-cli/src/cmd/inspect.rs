use std::path::Path;

use cloudlet_core::container::{OverlayContainer, Payload};
use cloudlet_core::ChunkKind;

use super::CmdResult;
use crate::format::format_bytes;

fn describe_payload(payload: Payload) -> String {
    match payload {
        Payload::Compressed { offset, length } => format!("data {length} B @ {offset}"),
        Payload::SelfRef { target } => format!("same as #{target}"),
        Payload::BaseRef { ordinal } => format!("base chunk {ordinal}"),
    }
}

pub(crate) fn run_inspect(path: &Path, list_records: bool) -> CmdResult {
    let overlay = OverlayContainer::open_file(path)?;
    let geometry = overlay.geometry();
    let summary = overlay.summary();

    println!("Overlay:    {}", path.display());
    for kind in ChunkKind::ALL {
        println!(
            "{:<11} {} ({} chunks)",
            format!("{kind}:"),
            format_bytes(geometry.capacity(kind)),
            geometry.chunks(kind)
        );
    }
    println!(
        "Records:    {} ({} compressed, {} self-ref, {} base-ref)",
        summary.records, summary.compressed, summary.self_refs, summary.base_refs
    );
    println!("Blob:       {}", format_bytes(summary.blob_bytes));
    println!("Total:      {}", format_bytes(summary.container_bytes));

    if list_records {
        for (i, record) in overlay.records().iter().enumerate() {
            println!(
                "{i:>6}  {:<16} {}  {}",
                record.addr.to_string(),
                record.hash,
                describe_payload(record.payload)
            );
        }
    }
    Ok(())
}
