use cloudlet_types::{ChunkAddr, ChunkHash, CHUNK_SIZE};

use crate::compress::{self, Compression};
use crate::container::{
    DeltaRecord, OverlayContainer, OverlayWriter, Payload, OVERLAY_MAGIC, PREAMBLE_SIZE,
    RECORD_HEADER_SIZE,
};
use crate::error::CloudletError;
use crate::image::{Geometry, MemoryImage};
use crate::testutil::pattern;

fn geometry() -> Geometry {
    Geometry::new(4 * CHUNK_SIZE as u64, 2 * CHUNK_SIZE as u64).unwrap()
}

fn compressed(byte: u8) -> (ChunkHash, Vec<u8>) {
    let data = pattern(byte);
    (
        ChunkHash::compute(&data),
        compress::compress(Compression::Lz4, &data).unwrap(),
    )
}

/// disk:3 = 0xAB, memory:1 -> self-ref to record 0, disk:0 = 0xCD.
fn sample_bytes() -> Vec<u8> {
    let mut writer = OverlayWriter::new(geometry()).unwrap();
    let (hash_ab, payload_ab) = compressed(0xAB);
    let (hash_cd, payload_cd) = compressed(0xCD);
    writer
        .append_compressed(ChunkAddr::disk(3), hash_ab, &payload_ab)
        .unwrap();
    writer.append_self_ref(ChunkAddr::memory(1), hash_ab, 0).unwrap();
    writer
        .append_compressed(ChunkAddr::disk(0), hash_cd, &payload_cd)
        .unwrap();
    let mut out = Vec::new();
    writer.finish(&mut out).unwrap();
    out
}

fn header_offset(index: usize) -> usize {
    PREAMBLE_SIZE + index * RECORD_HEADER_SIZE
}

fn rewrite_record(bytes: &mut [u8], index: usize, f: impl FnOnce(&mut DeltaRecord)) {
    let at = header_offset(index);
    let mut record = DeltaRecord::decode(&bytes[at..at + RECORD_HEADER_SIZE]).unwrap();
    f(&mut record);
    bytes[at..at + RECORD_HEADER_SIZE].copy_from_slice(&record.encode());
}

fn assert_corrupt(bytes: Vec<u8>) {
    match OverlayContainer::open(bytes) {
        Err(CloudletError::CorruptContainer(_)) => {}
        other => panic!("expected CorruptContainer, got {other:?}"),
    }
}

#[test]
fn written_container_reads_back_in_capture_order() {
    let container = OverlayContainer::open(sample_bytes()).unwrap();
    assert_eq!(container.geometry(), geometry());
    let addrs: Vec<ChunkAddr> = container.records().iter().map(|r| r.addr).collect();
    assert_eq!(
        addrs,
        vec![ChunkAddr::disk(3), ChunkAddr::memory(1), ChunkAddr::disk(0)]
    );
    assert_eq!(container.find(ChunkAddr::disk(0)), Some(2));
    assert_eq!(container.find(ChunkAddr::disk(1)), None);

    assert_eq!(container.read_payload(0).unwrap(), pattern(0xAB));
    assert_eq!(container.read_payload(1).unwrap(), pattern(0xAB));
    assert_eq!(container.read_payload(2).unwrap(), pattern(0xCD));
    assert_eq!(container.resolve_source(1).unwrap(), 0);
}

#[test]
fn summary_counts_payload_kinds() {
    let bytes = sample_bytes();
    let total = bytes.len() as u64;
    let summary = OverlayContainer::open(bytes).unwrap().summary();
    assert_eq!(summary.records, 3);
    assert_eq!(summary.compressed, 2);
    assert_eq!(summary.self_refs, 1);
    assert_eq!(summary.base_refs, 0);
    assert_eq!(summary.container_bytes, total);
}

#[test]
fn file_backed_container_matches_in_memory() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vm.overlay");
    std::fs::write(&path, sample_bytes()).unwrap();

    let container = OverlayContainer::open_file(&path).unwrap();
    assert_eq!(container.len(), 3);
    assert_eq!(container.read_payload(1).unwrap(), pattern(0xAB));
}

#[test]
fn empty_writer_produces_empty_container() {
    let writer = OverlayWriter::new(geometry()).unwrap();
    assert!(writer.is_empty());
    let mut out = Vec::new();
    writer.finish(&mut out).unwrap();
    assert_eq!(out.len(), PREAMBLE_SIZE);
    assert!(OverlayContainer::open(out).unwrap().is_empty());
}

#[test]
fn writer_rejects_duplicate_and_out_of_range_addresses() {
    let mut writer = OverlayWriter::new(geometry()).unwrap();
    let (hash, payload) = compressed(0x01);
    writer
        .append_compressed(ChunkAddr::disk(1), hash, &payload)
        .unwrap();
    assert!(writer
        .append_compressed(ChunkAddr::disk(1), hash, &payload)
        .is_err());
    assert!(matches!(
        writer.append_compressed(ChunkAddr::memory(2), hash, &payload),
        Err(CloudletError::AddressOutOfRange(_))
    ));
    assert_eq!(writer.len(), 1);
}

#[test]
fn writer_rejects_bad_self_references() {
    let mut writer = OverlayWriter::new(geometry()).unwrap();
    let (hash_a, payload_a) = compressed(0x0A);
    let (hash_b, _) = compressed(0x0B);
    writer
        .append_compressed(ChunkAddr::disk(0), hash_a, &payload_a)
        .unwrap();
    // Not yet written.
    assert!(writer.append_self_ref(ChunkAddr::disk(1), hash_a, 1).is_err());
    // Different content.
    assert!(writer.append_self_ref(ChunkAddr::disk(1), hash_b, 0).is_err());
    writer.append_self_ref(ChunkAddr::disk(1), hash_a, 0).unwrap();
    // Chains are not allowed.
    assert!(writer.append_self_ref(ChunkAddr::disk(2), hash_a, 1).is_err());
}

#[test]
fn forward_self_reference_is_corrupt() {
    let mut bytes = sample_bytes();
    rewrite_record(&mut bytes, 1, |r| r.payload = Payload::SelfRef { target: 2 });
    assert_corrupt(bytes);
}

#[test]
fn self_reference_to_itself_is_corrupt() {
    let mut bytes = sample_bytes();
    rewrite_record(&mut bytes, 1, |r| r.payload = Payload::SelfRef { target: 1 });
    assert_corrupt(bytes);
}

#[test]
fn dangling_self_reference_is_corrupt() {
    let mut bytes = sample_bytes();
    rewrite_record(&mut bytes, 2, |r| r.payload = Payload::SelfRef { target: 99 });
    assert_corrupt(bytes);
}

#[test]
fn self_reference_with_different_hash_is_corrupt() {
    let mut bytes = sample_bytes();
    rewrite_record(&mut bytes, 1, |r| r.hash = ChunkHash([7u8; 32]));
    assert_corrupt(bytes);
}

#[test]
fn duplicate_address_is_corrupt() {
    let mut bytes = sample_bytes();
    rewrite_record(&mut bytes, 2, |r| r.addr = ChunkAddr::disk(3));
    assert_corrupt(bytes);
}

#[test]
fn address_beyond_capacity_is_corrupt() {
    let mut bytes = sample_bytes();
    rewrite_record(&mut bytes, 0, |r| r.addr = ChunkAddr::memory(2));
    assert!(OverlayContainer::open(bytes).is_err());
}

#[test]
fn payload_outside_blob_is_corrupt() {
    let mut bytes = sample_bytes();
    rewrite_record(&mut bytes, 0, |r| {
        r.payload = Payload::Compressed {
            offset: 1 << 20,
            length: 16,
        }
    });
    assert_corrupt(bytes);
}

#[test]
fn truncated_blob_is_corrupt() {
    let mut bytes = sample_bytes();
    bytes.pop();
    assert_corrupt(bytes);
}

#[test]
fn trailing_garbage_is_corrupt() {
    let mut bytes = sample_bytes();
    bytes.push(0);
    assert_corrupt(bytes);
}

#[test]
fn bad_magic_and_version_are_corrupt() {
    let mut bytes = sample_bytes();
    bytes[0] ^= 0xFF;
    assert_corrupt(bytes);

    let mut bytes = sample_bytes();
    bytes[OVERLAY_MAGIC.len()] = 99;
    assert_corrupt(bytes);

    assert_corrupt(b"CLDO".to_vec());
}

#[test]
fn unknown_payload_kind_is_corrupt() {
    let mut bytes = sample_bytes();
    bytes[header_offset(0) + 41] = 9;
    assert_corrupt(bytes);
}

#[test]
fn unknown_chunk_kind_is_corrupt() {
    let mut bytes = sample_bytes();
    bytes[header_offset(0)] = 5;
    assert_corrupt(bytes);
}

#[test]
fn tampered_payload_fails_hash_check() {
    let mut bytes = sample_bytes();
    let container = OverlayContainer::open(bytes.clone()).unwrap();
    let Payload::Compressed { length, .. } = container.records()[0].payload else {
        panic!("record 0 should carry a payload");
    };
    // Replace record 0's payload with an uncompressed chunk of other content.
    let (_, other) = compressed(0xEE);
    assert_eq!(other.len(), length as usize);
    let blob_start = header_offset(3);
    bytes[blob_start..blob_start + other.len()].copy_from_slice(&other);

    let container = OverlayContainer::open(bytes).unwrap();
    assert!(matches!(
        container.read_payload(0),
        Err(CloudletError::CorruptContainer(_))
    ));
    // The self-reference shares the bad payload; the other record is fine.
    assert!(container.read_payload(1).is_err());
    assert_eq!(container.read_payload(2).unwrap(), pattern(0xCD));
}

#[test]
fn base_reference_resolves_against_base() {
    let base = MemoryImage::zeroed(4 * CHUNK_SIZE as u64, 2 * CHUNK_SIZE as u64).unwrap();
    base.fill_chunk(ChunkAddr::memory(0), 0x66).unwrap();
    let hash = ChunkHash::compute(&pattern(0x66));

    let mut writer = OverlayWriter::new(geometry()).unwrap();
    writer
        .append_base_ref(ChunkAddr::disk(2), hash, ChunkAddr::memory(0))
        .unwrap();
    writer.append_self_ref(ChunkAddr::disk(3), hash, 0).unwrap();
    let mut out = Vec::new();
    writer.finish(&mut out).unwrap();

    let container = OverlayContainer::open(out).unwrap();
    assert_eq!(container.records()[0].payload, Payload::BaseRef { ordinal: 4 });
    assert!(matches!(
        container.read_payload(1),
        Err(CloudletError::BaseImageRequired(1))
    ));
    assert_eq!(
        container.read_payload_with_base(1, &base).unwrap(),
        pattern(0x66)
    );

    // A different base no longer matches the recorded hash.
    let wrong = MemoryImage::zeroed(4 * CHUNK_SIZE as u64, 2 * CHUNK_SIZE as u64).unwrap();
    assert!(matches!(
        container.read_payload_with_base(0, &wrong),
        Err(CloudletError::CorruptContainer(_))
    ));
}

#[test]
fn base_reference_beyond_capacity_is_corrupt() {
    let base_hash = ChunkHash::compute(&pattern(0));
    let mut writer = OverlayWriter::new(geometry()).unwrap();
    writer
        .append_base_ref(ChunkAddr::disk(0), base_hash, ChunkAddr::disk(1))
        .unwrap();
    let mut bytes = Vec::new();
    writer.finish(&mut bytes).unwrap();
    rewrite_record(&mut bytes, 0, |r| r.payload = Payload::BaseRef { ordinal: 6 });
    assert_corrupt(bytes);
}
