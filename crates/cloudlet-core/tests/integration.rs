use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use cloudlet_core::capture::OverlayCapture;
use cloudlet_core::channel::{dirty_chunk_channel, ChunkPublisher, ChunkStateGrid};
use cloudlet_core::config::CloudletConfig;
use cloudlet_core::container::{OverlayContainer, Payload};
use cloudlet_core::image::{ChunkSource, FileImage, Geometry};
use cloudlet_core::index::ChunkIndex;
use cloudlet_core::synthesis::SynthesisEngine;
use cloudlet_core::{ChunkAddr, ChunkKind, ChunkState, CHUNK_SIZE};

struct Vm {
    disk: PathBuf,
    memory: PathBuf,
}

impl Vm {
    fn write(dir: &Path, name: &str, disk: &[u8], memory: &[u8]) -> Self {
        let vm = Self {
            disk: dir.join(format!("{name}.disk")),
            memory: dir.join(format!("{name}.mem")),
        };
        std::fs::write(&vm.disk, disk).unwrap();
        std::fs::write(&vm.memory, memory).unwrap();
        vm
    }

    fn open(&self) -> Arc<dyn ChunkSource> {
        Arc::new(FileImage::open(&self.disk, Some(&self.memory)).unwrap())
    }

    fn index(&self) -> ChunkIndex {
        let disk = File::open(&self.disk).unwrap();
        let memory = File::open(&self.memory).unwrap();
        let disk_len = disk.metadata().unwrap().len();
        let memory_len = memory.metadata().unwrap().len();
        ChunkIndex::build_from_readers(disk, disk_len, memory, memory_len).unwrap()
    }
}

fn config() -> CloudletConfig {
    let mut config = CloudletConfig::default();
    config.capture.max_threads = 2;
    config.synthesis.max_threads = 2;
    config
}

fn set_chunk(image: &mut [u8], index: usize, byte: u8) {
    image[index * CHUNK_SIZE..(index + 1) * CHUNK_SIZE].fill(byte);
}

/// Offer every chunk of the live VM as a dirty hint and seal to `out`.
fn capture_full_scan(index: ChunkIndex, live: Arc<dyn ChunkSource>, out: &Path) -> OverlayContainer {
    let geometry = index.geometry();
    let mut capture = OverlayCapture::new(
        Arc::new(index),
        live,
        &config(),
        ChunkPublisher::detached(),
    )
    .unwrap();
    let addrs: Vec<ChunkAddr> = geometry.addrs().collect();
    for batch in addrs.chunks(3) {
        capture.on_dirty_batch(batch).unwrap();
    }
    let mut file = File::create(out).unwrap();
    capture.seal_into(&mut file).unwrap();
    OverlayContainer::open_file(out).unwrap()
}

fn synthesize_to(dir: &Path, base: &Vm, overlay: OverlayContainer) -> Vm {
    let geometry = overlay.geometry();
    let target = Vm {
        disk: dir.join("synth.disk"),
        memory: dir.join("synth.mem"),
    };
    let image = FileImage::create(
        &target.disk,
        Some(&target.memory),
        geometry.disk_capacity,
        geometry.memory_capacity,
    )
    .unwrap();
    SynthesisEngine::new(overlay, base.open(), ChunkPublisher::detached(), &config())
        .unwrap()
        .materialize(&image)
        .unwrap();
    image.sync().unwrap();
    target
}

#[test]
fn single_dirty_chunk_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let base = Vm::write(dir.path(), "base", &[0u8; 2 * CHUNK_SIZE], &[]);
    let mut live_disk = vec![0u8; 2 * CHUNK_SIZE];
    set_chunk(&mut live_disk, 0, 0xAA);
    let live = Vm::write(dir.path(), "live", &live_disk, &[]);

    let overlay = capture_full_scan(base.index(), live.open(), &dir.path().join("vm.overlay"));
    assert_eq!(overlay.len(), 1);
    assert_eq!(overlay.records()[0].addr, ChunkAddr::disk(0));

    let synth = synthesize_to(dir.path(), &base, overlay);
    let disk = std::fs::read(&synth.disk).unwrap();
    assert!(disk[..CHUNK_SIZE].iter().all(|&b| b == 0xAA));
    assert!(disk[CHUNK_SIZE..].iter().all(|&b| b == 0));
    assert!(std::fs::read(&synth.memory).unwrap().is_empty());
}

#[test]
fn duplicate_content_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let base = Vm::write(dir.path(), "base", &[0u8; 3 * CHUNK_SIZE], &[0u8; CHUNK_SIZE]);
    let mut live_disk = vec![0u8; 3 * CHUNK_SIZE];
    set_chunk(&mut live_disk, 0, 0x5C);
    let mut live_memory = vec![0u8; CHUNK_SIZE];
    set_chunk(&mut live_memory, 0, 0x5C);
    let live = Vm::write(dir.path(), "live", &live_disk, &live_memory);

    let overlay = capture_full_scan(base.index(), live.open(), &dir.path().join("vm.overlay"));
    let summary = overlay.summary();
    assert_eq!(summary.compressed, 1);
    assert_eq!(summary.self_refs, 1);
    assert_eq!(overlay.records()[1].payload, Payload::SelfRef { target: 0 });

    let synth = synthesize_to(dir.path(), &base, overlay);
    assert_eq!(std::fs::read(&synth.disk).unwrap(), live_disk);
    assert_eq!(std::fs::read(&synth.memory).unwrap(), live_memory);
}

#[test]
fn persisted_index_drives_capture() {
    let dir = tempfile::tempdir().unwrap();
    let base_disk: Vec<u8> = (0..4 * CHUNK_SIZE).map(|i| (i / 7) as u8).collect();
    let base_memory: Vec<u8> = (0..2 * CHUNK_SIZE).map(|i| (i / 13) as u8).collect();
    let base = Vm::write(dir.path(), "base", &base_disk, &base_memory);

    let index_path = dir.path().join("base.index");
    base.index().save(File::create(&index_path).unwrap()).unwrap();
    let index = ChunkIndex::load(File::open(&index_path).unwrap()).unwrap();
    assert_eq!(
        index.geometry(),
        Geometry::new(base_disk.len() as u64, base_memory.len() as u64).unwrap()
    );

    let mut live_disk = base_disk.clone();
    set_chunk(&mut live_disk, 3, 0x01);
    let mut live_memory = base_memory.clone();
    set_chunk(&mut live_memory, 1, 0x02);
    let live = Vm::write(dir.path(), "live", &live_disk, &live_memory);

    let overlay = capture_full_scan(index, live.open(), &dir.path().join("vm.overlay"));
    assert_eq!(overlay.len(), 2);
    let synth = synthesize_to(dir.path(), &base, overlay);
    assert_eq!(std::fs::read(&synth.disk).unwrap(), live_disk);
    assert_eq!(std::fs::read(&synth.memory).unwrap(), live_memory);
}

#[test]
fn unchanged_vm_is_empty_overlay() {
    let dir = tempfile::tempdir().unwrap();
    let base = Vm::write(dir.path(), "base", &[7u8; CHUNK_SIZE], &[9u8; CHUNK_SIZE]);
    let live = Vm::write(dir.path(), "live", &[7u8; CHUNK_SIZE], &[9u8; CHUNK_SIZE]);
    let index = Arc::new(base.index());
    let mut capture =
        OverlayCapture::new(index, live.open(), &config(), ChunkPublisher::detached()).unwrap();
    capture
        .on_dirty_batch(&[ChunkAddr::disk(0), ChunkAddr::memory(0)])
        .unwrap();
    assert!(capture.seal().unwrap_err().is_empty_overlay());
}

#[test]
fn unaligned_base_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let base = Vm::write(dir.path(), "base", &[0u8; CHUNK_SIZE + 512], &[]);
    assert!(FileImage::open(&base.disk, Some(&base.memory)).is_err());
}

#[test]
fn on_demand_over_file_overlay_with_monitor() {
    let dir = tempfile::tempdir().unwrap();
    let base = Vm::write(dir.path(), "base", &[0u8; 8 * CHUNK_SIZE], &[0u8; 4 * CHUNK_SIZE]);
    let mut live_disk = vec![0u8; 8 * CHUNK_SIZE];
    for i in (0..8).step_by(2) {
        set_chunk(&mut live_disk, i, 0x30 + i as u8);
    }
    let mut live_memory = vec![0u8; 4 * CHUNK_SIZE];
    set_chunk(&mut live_memory, 3, 0x30);
    let live = Vm::write(dir.path(), "live", &live_disk, &live_memory);
    let overlay = capture_full_scan(base.index(), live.open(), &dir.path().join("vm.overlay"));
    let geometry = overlay.geometry();

    let (publisher, monitor) = dirty_chunk_channel(256);
    let image = SynthesisEngine::new(overlay, base.open(), publisher, &config())
        .unwrap()
        .on_demand();
    let live_image = live.open();

    std::thread::scope(|s| {
        for worker in 0..3 {
            let image = &image;
            let live_image = &live_image;
            s.spawn(move || {
                let mut buf = vec![0u8; CHUNK_SIZE];
                for addr in geometry.addrs().skip(worker) {
                    live_image.read_chunk(addr, &mut buf).unwrap();
                    assert_eq!(&image.resolve(addr).unwrap()[..], &buf[..], "{addr}");
                }
            });
        }
    });

    assert_eq!(image.applied_count(), 5);
    assert_eq!(image.decompress_count(), 4);
    drop(image);

    let mut grid = ChunkStateGrid::new(geometry);
    grid.poll(&monitor);
    assert!(monitor.is_closed());
    assert_eq!(grid.counts(ChunkKind::Disk).delta_applied, 4);
    assert_eq!(grid.counts(ChunkKind::Memory).delta_applied, 1);
    assert_eq!(grid.state(ChunkAddr::disk(1)), ChunkState::Unmodified);
}
