#![forbid(unsafe_code)]

use fsp_core::{FixedLayout, discover};
use fsp_error::FspError;
use fsp_harness::image::{ext3, jfs, reiserfs};
use fsp_harness::{SyntheticImage, ext3_image, jfs_image, reiserfs_image};
use fsp_ondisk::ext3::EXT3_SUPERBLOCK_OFFSET;
use fsp_types::{BlockNumber, FsVariant, IndirectTier, InodeNumber};

fn device(image: SyntheticImage) -> fsp_block::MemByteDevice {
    image.into_device()
}

#[test]
fn ext3_journal_walks_direct_and_indirect_blocks() {
    let registry = discover(FsVariant::Ext3, &device(ext3_image())).expect("discover");
    let journal = registry.journal();

    let mut expected: Vec<BlockNumber> = (ext3::JOURNAL_FIRST..ext3::JOURNAL_FIRST + 12)
        .map(BlockNumber)
        .collect();
    expected.extend(ext3::JOURNAL_INDIRECT_DATA.iter().copied().map(BlockNumber));
    expected.push(BlockNumber(ext3::JOURNAL_INDIRECT));
    assert_eq!(journal.blocks(), expected.as_slice());
    assert_eq!(journal.log_start(), 1);

    // The last log block wraps to the first block after the superblock,
    // skipping the pointer block.
    assert_eq!(
        journal.nth_after(BlockNumber(40), 1),
        Some(BlockNumber(ext3::JOURNAL_FIRST + 1))
    );
    assert_eq!(journal.nth_after(BlockNumber(ext3::JOURNAL_INDIRECT), 1), None);

    let layout = registry.ext3().expect("ext3 layout");
    assert!(layout.is_journal_indirect(BlockNumber(ext3::JOURNAL_INDIRECT)));
    assert_eq!(layout.journal_indirect_blocks().len(), 1);
    assert!(layout.is_inode_bitmap(BlockNumber(ext3::INODE_BITMAP[1])));
    assert!(layout.is_data_bitmap(BlockNumber(ext3::DATA_BITMAP[0])));
    assert!(layout.is_group_descriptor(BlockNumber(ext3::GROUP_DESCRIPTORS)));
    assert!(layout.is_superblock(BlockNumber(ext3::SUPERBLOCK)));
    assert_eq!(
        layout.inode_block(InodeNumber(ext3::FILE_INODE)),
        Some(BlockNumber(ext3::INODE_TABLE[0]))
    );
}

#[test]
fn ext3_geometry_scenario() {
    let registry = discover(FsVariant::Ext3, &device(ext3_image())).expect("discover");
    let layout = registry.ext3().expect("ext3 layout");
    assert!(layout.is_inode_block(BlockNumber(5)));
    assert!(layout.is_inode_block(BlockNumber(67)));
    assert!(!layout.is_inode_block(BlockNumber(6)));
    assert!(!layout.is_inode_block(BlockNumber(68)));
}

#[test]
fn ext3_without_journal_is_rejected() {
    let mut image = ext3_image();
    image.put_le32(EXT3_SUPERBLOCK_OFFSET + 0x5C, 0);
    let err = discover(FsVariant::Ext3, &device(image)).expect_err("no journal");
    assert!(matches!(err, FspError::JournalNotFound(_)));
}

#[test]
fn ext3_external_journal_is_unsupported() {
    let mut image = ext3_image();
    image.put_le32(EXT3_SUPERBLOCK_OFFSET + 0xE4, 0x0803);
    let err = discover(FsVariant::Ext3, &device(image)).expect_err("external");
    assert!(matches!(err, FspError::UnsupportedFeature(_)));
}

#[test]
fn wrong_variant_is_a_format_error() {
    let err = discover(FsVariant::Ext3, &device(reiserfs_image())).expect_err("not ext3");
    assert!(matches!(err, FspError::Format(_)));
    let err = discover(FsVariant::Reiserfs, &device(jfs_image())).expect_err("not reiserfs");
    assert!(matches!(err, FspError::Format(_)));
}

#[test]
fn bad_geometry_is_reported_as_such() {
    let mut image = ext3_image();
    image.put_le32(EXT3_SUPERBLOCK_OFFSET + 0x28, 0);
    let err = discover(FsVariant::Ext3, &device(image)).expect_err("zero inodes per group");
    assert!(matches!(err, FspError::InvalidGeometry(_)));
}

#[test]
fn reiserfs_journal_is_contiguous_with_header_after() {
    let registry = discover(FsVariant::Reiserfs, &device(reiserfs_image())).expect("discover");
    let journal = registry.journal();
    assert_eq!(journal.len(), usize::try_from(reiserfs::JOURNAL_LEN).expect("len"));
    assert_eq!(journal.blocks()[0], BlockNumber(reiserfs::JOURNAL_FIRST));
    assert!(!journal.contains(BlockNumber(reiserfs::JOURNAL_HEADER)));
    assert!(matches!(
        registry.fixed(),
        FixedLayout::Reiserfs { superblock, journal_header }
            if *superblock == BlockNumber(reiserfs::SUPERBLOCK)
                && *journal_header == BlockNumber(reiserfs::JOURNAL_HEADER)
    ));
}

#[test]
fn jfs_inline_log_is_found() {
    let registry = discover(FsVariant::Jfs, &device(jfs_image())).expect("discover");
    assert_eq!(registry.journal().blocks()[0], BlockNumber(jfs::LOG_FIRST));
    assert_eq!(registry.journal().log_start(), 2);
    assert!(matches!(
        registry.fixed(),
        FixedLayout::Jfs { log_super, .. } if *log_super == BlockNumber(jfs::LOG_SUPER)
    ));
}

#[test]
fn jfs_without_inline_log_is_rejected() {
    let mut image = jfs_image();
    image.put_le32(fsp_ondisk::jfs::JFS_SUPERBLOCK_OFFSET + 72, 0);
    let err = discover(FsVariant::Jfs, &device(image)).expect_err("no log");
    assert!(matches!(err, FspError::JournalNotFound(_)));
}

#[test]
fn indirect_tiers_of_a_file_are_learned() {
    let dev = device(ext3_image());
    let registry = discover(FsVariant::Ext3, &dev).expect("discover");
    let learned = fsp_core::classify::ext3::init_indirect_blocks(
        &registry,
        &dev,
        InodeNumber(ext3::FILE_INODE),
    )
    .expect("indirect");
    assert_eq!(learned, vec![(BlockNumber(ext3::FILE_INDIRECT), IndirectTier::Single)]);
    let dirs =
        fsp_core::classify::ext3::init_dir_blocks(&registry, &dev, InodeNumber::ROOT).expect("dir");
    assert_eq!(
        dirs,
        ext3::ROOT_DIR_BLOCKS.iter().copied().map(BlockNumber).collect::<Vec<_>>()
    );
    assert_eq!(registry.ext3().map(|l| l.learned_counts()), Some((2, 1)));
}
