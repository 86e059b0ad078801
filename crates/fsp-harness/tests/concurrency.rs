#![forbid(unsafe_code)]
//! Many submitters driving one observed instance at once.

use fsp_block::{BlockRequest, RequestId};
use fsp_core::{FaultSpec, ObserverConfig, TraceKind};
use fsp_harness::ObservedImage;
use fsp_harness::blocks::{filled, jbd_descriptor};
use fsp_harness::image::{BLOCK_SIZE, ext3};
use fsp_types::{BlockNumber, FsVariant, JournalingMode, SectorNumber, SemanticBlockType};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::thread;

const THREADS: u64 = 16;
const PER_THREAD: u64 = 8;

fn observed(mode: JournalingMode, inject: bool) -> ObservedImage {
    let mut config = ObserverConfig::new(FsVariant::Ext3, mode);
    config.inject_faults = inject;
    let image = ObservedImage::for_config(config).expect("image");
    image.start().expect("start");
    image
}

fn write(id: u64, block: u64, data: Vec<u8>) -> BlockRequest {
    BlockRequest::write(RequestId(id), SectorNumber(block * 8), data)
}

#[test]
fn transient_fault_is_administered_once_across_threads() {
    let image = observed(JournalingMode::Ordered, true);
    let observer = image.observer();
    observer
        .queue_fault(FaultSpec::new(FsVariant::Ext3, SemanticBlockType::Any))
        .expect("queue");

    let failures = AtomicUsize::new(0);
    let next_id = AtomicU64::new(1);
    thread::scope(|s| {
        for worker in 0..THREADS {
            let (image, failures, next_id) = (&image, &failures, &next_id);
            s.spawn(move || {
                let block = ext3::SCRATCH[usize::try_from(worker).unwrap_or(0) % ext3::SCRATCH.len()];
                for _ in 0..PER_THREAD {
                    let id = next_id.fetch_add(1, Ordering::Relaxed);
                    let done = image.run_one(write(id, block, filled(BLOCK_SIZE, 0x5A)));
                    if !done.is_success() {
                        failures.fetch_add(1, Ordering::Relaxed);
                    }
                }
            });
        }
    });

    assert_eq!(failures.load(Ordering::Relaxed), 1);
    assert!(observer.fault_injected().expect("injected"));
    assert!(observer.pending_fault().expect("pending").is_none());
    let trace = observer.instance().expect("instance").trace().snapshot();
    assert_eq!(trace.iter().filter(|r| r.kind == TraceKind::Fault).count(), 1);
    let writes = trace.iter().filter(|r| r.kind == TraceKind::Write).count();
    assert_eq!(u64::try_from(writes).unwrap_or(0), THREADS * PER_THREAD);
}

#[test]
fn descriptors_learned_on_one_thread_meet_their_checkpoints() {
    let image = observed(JournalingMode::Writeback, false);
    let observer = image.observer();
    let instance = observer.instance().expect("instance");
    let start = image.workload().expect("workload").cursor();
    let reals = [
        ext3::INODE_BITMAP[0],
        ext3::DATA_BITMAP[0],
        ext3::INODE_TABLE[0] + 1,
        ext3::INODE_BITMAP[1],
    ];

    thread::scope(|s| {
        for (i, real) in reals.iter().copied().enumerate() {
            let (image, observer) = (&image, &observer);
            let position = instance
                .registry()
                .journal()
                .nth_after(start, 2 * i)
                .expect("log position");
            s.spawn(move || {
                let id = 10 * u64::try_from(i).unwrap_or(0);
                let tag = u32::try_from(real).unwrap_or(0);
                let sequence = u32::try_from(i + 1).unwrap_or(1);
                image.run_one(write(id, position.0, jbd_descriptor(BLOCK_SIZE, sequence, &[tag])));
                let pending = observer.pending_checkpoints().expect("pending");
                assert!(pending.iter().any(|(r, _)| *r == BlockNumber(real)));

                image.run_one(write(id + 1, real, filled(BLOCK_SIZE, 0x33)));
            });
        }
    });

    assert!(observer.pending_checkpoints().expect("pending").is_empty());
    let trace = instance.trace().snapshot();
    for real in reals {
        let labels: Vec<&str> = trace
            .iter()
            .filter(|r| r.kind == TraceKind::Write && r.block == real)
            .map(|r| r.label)
            .collect();
        assert_eq!(labels, vec!["checkpoint"], "block {real}");
    }
}
