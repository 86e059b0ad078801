#![forbid(unsafe_code)]
//! End-to-end observation through an interposed in-memory device.

use fsp_block::{BlockRequest, RequestId};
use fsp_core::{COPY_COMPLETED, ObserverConfig, TraceKind};
use fsp_error::FspError;
use fsp_harness::ObservedImage;
use fsp_harness::blocks::{filled, jbd_commit, jbd_descriptor};
use fsp_harness::image::{BLOCK_SIZE, ext3, jfs, reiserfs};
use fsp_journal::StateId;
use fsp_types::{BlockNumber, FsVariant, JournalingMode, SectorNumber};
use proptest::prelude::*;

fn observed(variant: FsVariant, mode: JournalingMode) -> ObservedImage {
    let image = ObservedImage::for_config(ObserverConfig::new(variant, mode)).expect("image");
    image.start().expect("start");
    image
}

fn write(id: u64, block: u64, data: Vec<u8>) -> BlockRequest {
    BlockRequest::write(RequestId(id), SectorNumber(block * 8), data)
}

/// Blocks a workload may log and write unjournaled without touching the
/// structures discovery and refinement read.
fn blocks_for(variant: FsVariant) -> (Vec<u64>, Vec<u64>) {
    match variant {
        FsVariant::Ext3 => (
            vec![ext3::INODE_BITMAP[0], ext3::DATA_BITMAP[0], 5, ext3::INODE_BITMAP[1]],
            ext3::SCRATCH.to_vec(),
        ),
        FsVariant::Reiserfs => (reiserfs::SCRATCH.to_vec(), vec![110, 111, 112, 113]),
        FsVariant::Jfs => (jfs::SCRATCH.to_vec(), vec![70, 71, 72, 73]),
    }
}

#[test]
fn traffic_before_start_passes_through_unobserved() {
    let image =
        ObservedImage::for_config(ObserverConfig::new(FsVariant::Ext3, JournalingMode::Ordered))
            .expect("image");
    let done = image.run_one(write(1, 100, filled(BLOCK_SIZE, 0x11)));
    assert!(done.is_success());
    assert_eq!(image.observer().counters().writes, 1);
    assert!(matches!(image.observer().extract_trace(), Err(FspError::NotObserving)));

    image.start().expect("start");
    assert!(matches!(image.start(), Err(FspError::AlreadyObserving)));
    image.observer().stop().expect("stop");
    assert!(!image.observer().is_observing());
}

#[test]
fn ordered_transaction_walks_the_automaton() {
    let image = observed(FsVariant::Ext3, JournalingMode::Ordered);
    let observer = image.observer();
    let mut workload = image.workload().expect("workload");
    let txn = workload.transaction(
        &[BlockNumber(ext3::INODE_BITMAP[0]), BlockNumber(5)],
        &[BlockNumber(ext3::SCRATCH[0])],
    );

    for request in txn.unjournaled.iter().chain(&txn.log) {
        assert!(image.run_one(request.clone()).is_success());
    }
    assert_eq!(observer.model_state().expect("state").0, StateId::COMMITTED);
    assert_eq!(observer.pending_checkpoints().expect("pending").len(), 2);

    for request in &txn.checkpoint {
        assert!(image.run_one(request.clone()).is_success());
    }
    assert!(observer.pending_checkpoints().expect("pending").is_empty());
    assert_eq!(observer.violations().expect("violations"), 0);

    // Next unjournaled write closes the transaction.
    image.run_one(write(99, ext3::SCRATCH[1], filled(BLOCK_SIZE, 0x33)));
    assert_eq!(observer.model_state().expect("state").0, StateId::CLEAN);

    let trace = observer.instance().expect("instance").trace().snapshot();
    let labels: Vec<&str> = trace
        .iter()
        .filter(|r| r.kind == TraceKind::Write)
        .map(|r| r.label)
        .collect();
    assert_eq!(
        labels,
        vec!["data", "jdesc", "jdata", "jdata", "jcommit", "checkpoint", "checkpoint", "data"]
    );
    assert_eq!(trace.iter().filter(|r| r.kind == TraceKind::Descriptor).count(), 2);
}

#[test]
fn descriptor_tags_become_checkpoints_once() {
    let image = observed(FsVariant::Ext3, JournalingMode::Writeback);
    let observer = image.observer();
    let start = image.workload().expect("workload").cursor();
    let tags = [3_u32, 2, 5];
    image.run_one(write(1, start.0, jbd_descriptor(BLOCK_SIZE, 1, &tags)));

    let pending = observer.pending_checkpoints().expect("pending");
    assert_eq!(pending.len(), tags.len());
    for (real, position) in &pending {
        let tag_index = tags
            .iter()
            .position(|t| u64::from(*t) == real.0)
            .expect("tag learned");
        assert_eq!(position.0, start.0 + 1 + tag_index as u64);
    }

    image.run_one(write(2, 5, filled(BLOCK_SIZE, 0x44)));
    image.run_one(write(3, 5, filled(BLOCK_SIZE, 0x44)));
    let labels: Vec<&str> = observer
        .instance()
        .expect("instance")
        .trace()
        .snapshot()
        .iter()
        .filter(|r| r.kind == TraceKind::Write && r.block == 5)
        .map(|r| r.label)
        .collect();
    assert_eq!(labels, vec!["checkpoint", "inode"]);
}

#[test]
fn commit_without_transaction_is_a_violation_not_an_error() {
    let image = observed(FsVariant::Ext3, JournalingMode::Ordered);
    let observer = image.observer();
    let start = image.workload().expect("workload").cursor();
    let done = image.run_one(write(1, start.0, jbd_commit(BLOCK_SIZE, 7)));
    assert!(done.is_success());
    assert_eq!(observer.violations().expect("violations"), 1);
    assert_eq!(observer.model_state().expect("state").0, StateId::CLEAN);

    observer.reset_model().expect("reset");
    assert_eq!(observer.model_state().expect("state").1, "S0");
    let automaton = observer.print_model().expect("model");
    assert!(automaton.starts_with("mode ordered"));
    assert!(automaton.lines().any(|l| l.starts_with("S0:")));
}

#[test]
fn crash_after_commit_fails_everything_until_cleared() {
    let image = observed(FsVariant::Reiserfs, JournalingMode::Ordered);
    let observer = image.observer();
    observer.arm_crash_after_commit().expect("arm");
    let mut workload = image.workload().expect("workload");
    let txn = workload.transaction(&[BlockNumber(reiserfs::SCRATCH[0])], &[]);

    for request in &txn.log {
        assert!(image.run_one(request.clone()).is_success());
    }
    assert!(observer.is_crashed().expect("crashed"));
    assert!(!image.run_one(txn.checkpoint[0].clone()).is_success());
    let read = BlockRequest::read(RequestId(50), SectorNumber(0), BLOCK_SIZE);
    assert!(!image.run_one(read).is_success());

    observer.clear_crash().expect("clear");
    assert!(image.run_one(txn.checkpoint[0].clone()).is_success());

    let crashes = observer
        .instance()
        .expect("instance")
        .trace()
        .snapshot()
        .iter()
        .filter(|r| r.kind == TraceKind::Crash)
        .count();
    assert_eq!(crashes, 1);
}

#[test]
fn trace_is_extracted_in_bounded_chunks() {
    let mut config = ObserverConfig::new(FsVariant::Jfs, JournalingMode::Writeback);
    config.trace_chunk_records = 4;
    let image = ObservedImage::for_config(config).expect("image");
    image.start().expect("start");
    let observer = image.observer();
    observer.mark_workload(true).expect("start marker");
    let mut workload = image.workload().expect("workload");
    for _ in 0..3 {
        let (metadata, data) = blocks_for(FsVariant::Jfs);
        let txn = workload.transaction(
            &metadata[..2].iter().copied().map(BlockNumber).collect::<Vec<_>>(),
            &[BlockNumber(data[0])],
        );
        image.run(txn.requests());
    }
    observer.mark_workload(false).expect("end marker");

    let mut lines = Vec::new();
    loop {
        let chunk = observer.extract_trace().expect("chunk");
        assert!(chunk.records <= 4);
        lines.extend(chunk.text.lines().map(str::to_owned));
        if chunk.complete {
            break;
        }
    }
    assert_eq!(lines.last().map(String::as_str), Some(COPY_COMPLETED));
    assert!(lines.first().is_some_and(|l| l.starts_with("S 0 t= workload")));
    assert!(lines.iter().any(|l| l.starts_with("E 0 t= workload")));
    assert!(lines.iter().any(|l| l.starts_with("W 124 t= jcommit")));
}

#[test]
fn clear_all_forgets_learned_state() {
    let image = observed(FsVariant::Ext3, JournalingMode::Ordered);
    let observer = image.observer();
    observer
        .init_dir_blocks(fsp_types::InodeNumber::ROOT)
        .expect("dirs");
    let start = image.workload().expect("workload").cursor();
    image.run_one(write(1, start.0, jbd_descriptor(BLOCK_SIZE, 1, &[3])));
    assert_eq!(observer.registry_summary().expect("summary").learned_directories, 2);

    observer.clear_all().expect("clear");
    let summary = observer.registry_summary().expect("summary");
    assert_eq!(summary.learned_directories, 0);
    assert_eq!(summary.pending_checkpoints, 0);
    assert!(observer.instance().expect("instance").trace().is_empty());
}

#[test]
fn learned_directory_blocks_classify_as_directory() {
    let image = observed(FsVariant::Ext3, JournalingMode::Ordered);
    let observer = image.observer();
    image.run_one(write(1, ext3::ROOT_DIR_BLOCKS[0], filled(BLOCK_SIZE, 0)));
    observer
        .init_dir_blocks(fsp_types::InodeNumber::ROOT)
        .expect("dirs");
    image.run_one(write(2, ext3::ROOT_DIR_BLOCKS[0], filled(BLOCK_SIZE, 0)));
    let labels: Vec<&str> = observer
        .instance()
        .expect("instance")
        .trace()
        .snapshot()
        .iter()
        .map(|r| r.label)
        .collect();
    assert_eq!(labels, vec!["data", "dir"]);
}

fn variant() -> impl Strategy<Value = FsVariant> {
    prop_oneof![
        Just(FsVariant::Ext3),
        Just(FsVariant::Reiserfs),
        Just(FsVariant::Jfs)
    ]
}

fn mode() -> impl Strategy<Value = JournalingMode> {
    prop_oneof![
        Just(JournalingMode::Data),
        Just(JournalingMode::Ordered),
        Just(JournalingMode::Writeback)
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn conforming_workloads_never_violate(
        variant in variant(),
        mode in mode(),
        shape in proptest::collection::vec((1_usize..=4, 0_usize..=4), 1..12),
    ) {
        let image = observed(variant, mode);
        let mut workload = image.workload().expect("workload");
        let (metadata, data) = blocks_for(variant);
        for (logged, unjournaled) in shape {
            let metadata: Vec<BlockNumber> =
                metadata[..logged].iter().copied().map(BlockNumber).collect();
            // Full data journaling has no unjournaled role.
            let unjournaled = if mode == JournalingMode::Data { 0 } else { unjournaled };
            let data: Vec<BlockNumber> =
                data[..unjournaled].iter().copied().map(BlockNumber).collect();
            let txn = workload.transaction(&metadata, &data);
            for done in image.run(txn.requests()) {
                prop_assert!(done.is_success());
            }
        }
        let observer = image.observer();
        prop_assert_eq!(observer.violations().expect("violations"), 0);
        prop_assert!(observer.pending_checkpoints().expect("pending").is_empty());
        prop_assert_ne!(observer.model_state().expect("state").0, StateId::ABORTED);
    }
}
