//! Small synthetic filesystem images.
//!
//! Only the structures discovery and refinement read are populated:
//! superblocks, group descriptors, a handful of inodes and their pointer
//! blocks, and the journal superblock. Everything else is zero.

use crate::blocks::jbd_superblock;
use fsp_block::MemByteDevice;
use fsp_ondisk::ext3::{EXT3_FEATURE_COMPAT_HAS_JOURNAL, EXT3_SUPERBLOCK_OFFSET};
use fsp_ondisk::jfs::{JFS_MAGIC, JFS_SUPERBLOCK_OFFSET};
use fsp_ondisk::reiserfs::{REISERFS_MAGIC_3_6, REISERFS_SUPERBLOCK_OFFSET};
use fsp_types::{BlockNumber, FsVariant};

pub const BLOCK_SIZE: usize = 4096;

/// Block numbers of the synthetic ext3 image.
pub mod ext3 {
    pub const BLOCKS: u64 = 128;
    pub const BLOCKS_PER_GROUP: u32 = 64;
    pub const INODES_PER_GROUP: u32 = 64;
    pub const SUPERBLOCK: u64 = 0;
    pub const GROUP_DESCRIPTORS: u64 = 1;
    pub const DATA_BITMAP: [u64; 2] = [2, 64];
    pub const INODE_BITMAP: [u64; 2] = [3, 65];
    pub const INODE_TABLE: [u64; 2] = [4, 66];
    pub const JOURNAL_INODE: u64 = 8;
    /// Journal superblock and first direct block of the journal.
    pub const JOURNAL_FIRST: u64 = 20;
    pub const JOURNAL_DIRECT: u64 = 12;
    /// Single-indirect pointer block of the journal inode.
    pub const JOURNAL_INDIRECT: u64 = 32;
    pub const JOURNAL_INDIRECT_DATA: [u64; 8] = [33, 34, 35, 36, 37, 38, 39, 40];
    pub const JOURNAL_LEN: u64 = JOURNAL_DIRECT + 8;
    pub const ROOT_DIR_BLOCKS: [u64; 2] = [44, 45];
    /// A regular file with twelve direct blocks and one indirect tree.
    pub const FILE_INODE: u64 = 12;
    pub const FILE_DIRECT_FIRST: u64 = 80;
    pub const FILE_INDIRECT: u64 = 92;
    pub const FILE_INDIRECT_DATA: [u64; 2] = [93, 94];
    /// Unallocated blocks free for workload data.
    pub const SCRATCH: [u64; 4] = [100, 101, 102, 103];
}

/// Block numbers of the synthetic reiserfs image.
pub mod reiserfs {
    pub const BLOCKS: u64 = 128;
    pub const SUPERBLOCK: u64 = 16;
    pub const JOURNAL_FIRST: u64 = 18;
    pub const JOURNAL_LEN: u64 = 32;
    pub const JOURNAL_HEADER: u64 = JOURNAL_FIRST + JOURNAL_LEN;
    pub const SCRATCH: [u64; 4] = [100, 101, 102, 103];
}

/// Block numbers of the synthetic jfs image.
pub mod jfs {
    pub const BLOCKS: u64 = 160;
    pub const SUPERBLOCK: u64 = 8;
    pub const LOG_FIRST: u64 = 120;
    pub const LOG_LEN: u32 = 16;
    pub const LOG_SUPER: u64 = LOG_FIRST + 1;
    pub const SCRATCH: [u64; 4] = [60, 61, 62, 63];
}

/// An in-memory image and the variant it was built as.
#[derive(Debug, Clone)]
pub struct SyntheticImage {
    pub variant: FsVariant,
    pub bytes: Vec<u8>,
}

impl SyntheticImage {
    #[must_use]
    pub fn for_variant(variant: FsVariant) -> Self {
        match variant {
            FsVariant::Ext3 => ext3_image(),
            FsVariant::Reiserfs => reiserfs_image(),
            FsVariant::Jfs => jfs_image(),
        }
    }

    #[must_use]
    pub fn block(&self, block: u64) -> &[u8] {
        let start = usize::try_from(block).unwrap_or(usize::MAX) * BLOCK_SIZE;
        &self.bytes[start..start + BLOCK_SIZE]
    }

    pub fn block_mut(&mut self, block: u64) -> &mut [u8] {
        let start = usize::try_from(block).unwrap_or(usize::MAX) * BLOCK_SIZE;
        &mut self.bytes[start..start + BLOCK_SIZE]
    }

    pub fn put_le32(&mut self, offset: usize, value: u32) {
        self.bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    pub fn put_le16(&mut self, offset: usize, value: u16) {
        self.bytes[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }

    #[must_use]
    pub fn into_device(self) -> MemByteDevice {
        MemByteDevice::from_vec(self.bytes)
    }
}

fn blank(blocks: u64) -> Vec<u8> {
    vec![0_u8; usize::try_from(blocks).unwrap_or(0) * BLOCK_SIZE]
}

fn u32_of(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

// ── ext3 ────────────────────────────────────────────────────────────────────

const S_IFDIR: u16 = 0o040_755;
const S_IFREG: u16 = 0o100_644;

fn write_inode(image: &mut SyntheticImage, ino: u64, mode: u16, size: u32, pointers: &[(usize, u64)]) {
    let index = usize::try_from(ino - 1).unwrap_or(0);
    let base = usize::try_from(ext3::INODE_TABLE[0]).unwrap_or(0) * BLOCK_SIZE + index * 128;
    image.put_le16(base, mode);
    image.put_le32(base + 4, size);
    image.put_le16(base + 0x1A, 1);
    for &(slot, block) in pointers {
        image.put_le32(base + 0x28 + slot * 4, u32_of(block));
    }
}

fn write_pointer_block(image: &mut SyntheticImage, block: u64, children: &[u64]) {
    let start = usize::try_from(block).unwrap_or(0) * BLOCK_SIZE;
    for (i, child) in children.iter().enumerate() {
        image.put_le32(start + i * 4, u32_of(*child));
    }
}

/// A two-group ext3 image with a 20-block internal journal.
///
/// The journal inode maps twelve direct blocks from
/// [`ext3::JOURNAL_FIRST`] and eight more through one indirect block.
#[must_use]
pub fn ext3_image() -> SyntheticImage {
    let mut image = SyntheticImage {
        variant: FsVariant::Ext3,
        bytes: blank(ext3::BLOCKS),
    };

    let sb = EXT3_SUPERBLOCK_OFFSET;
    image.put_le32(sb, ext3::INODES_PER_GROUP * 2);
    image.put_le32(sb + 0x04, u32_of(ext3::BLOCKS));
    image.put_le32(sb + 0x14, 0);
    // log2(4096) - 10
    image.put_le32(sb + 0x18, 2);
    image.put_le32(sb + 0x20, ext3::BLOCKS_PER_GROUP);
    image.put_le32(sb + 0x28, ext3::INODES_PER_GROUP);
    image.put_le16(sb + 0x38, 0xEF53);
    image.put_le32(sb + 0x5C, EXT3_FEATURE_COMPAT_HAS_JOURNAL);
    image.put_le32(sb + 0xE0, u32_of(ext3::JOURNAL_INODE));

    let gdt = usize::try_from(ext3::GROUP_DESCRIPTORS).unwrap_or(0) * BLOCK_SIZE;
    for group in 0..2 {
        let desc = gdt + group * 32;
        image.put_le32(desc, u32_of(ext3::DATA_BITMAP[group]));
        image.put_le32(desc + 4, u32_of(ext3::INODE_BITMAP[group]));
        image.put_le32(desc + 8, u32_of(ext3::INODE_TABLE[group]));
    }

    // Journal inode.
    let mut pointers: Vec<(usize, u64)> = (0..12)
        .map(|slot| (slot, ext3::JOURNAL_FIRST + slot as u64))
        .collect();
    pointers.push((12, ext3::JOURNAL_INDIRECT));
    let journal_bytes = u32_of(ext3::JOURNAL_LEN) * u32_of(BLOCK_SIZE as u64);
    write_inode(&mut image, ext3::JOURNAL_INODE, S_IFREG, journal_bytes, &pointers);
    write_pointer_block(&mut image, ext3::JOURNAL_INDIRECT, &ext3::JOURNAL_INDIRECT_DATA);
    let jsb = jbd_superblock(BLOCK_SIZE, u32_of(ext3::JOURNAL_LEN), 1);
    image.block_mut(ext3::JOURNAL_FIRST).copy_from_slice(&jsb);

    // Root directory.
    let dir_pointers: Vec<(usize, u64)> = ext3::ROOT_DIR_BLOCKS.iter().copied().enumerate().collect();
    write_inode(&mut image, 2, S_IFDIR, 2 * u32_of(BLOCK_SIZE as u64), &dir_pointers);

    // Regular file.
    let mut pointers: Vec<(usize, u64)> = (0..12)
        .map(|slot| (slot, ext3::FILE_DIRECT_FIRST + slot as u64))
        .collect();
    pointers.push((12, ext3::FILE_INDIRECT));
    write_inode(&mut image, ext3::FILE_INODE, S_IFREG, 14 * u32_of(BLOCK_SIZE as u64), &pointers);
    write_pointer_block(&mut image, ext3::FILE_INDIRECT, &ext3::FILE_INDIRECT_DATA);

    image
}

// ── reiserfs ────────────────────────────────────────────────────────────────

/// A reiserfs 3.6 image with a 32-block journal on the same device.
#[must_use]
pub fn reiserfs_image() -> SyntheticImage {
    let mut image = SyntheticImage {
        variant: FsVariant::Reiserfs,
        bytes: blank(reiserfs::BLOCKS),
    };
    let sb = REISERFS_SUPERBLOCK_OFFSET;
    image.put_le32(sb, u32_of(reiserfs::BLOCKS));
    image.put_le32(sb + 12, u32_of(reiserfs::JOURNAL_FIRST));
    image.put_le32(sb + 20, u32_of(reiserfs::JOURNAL_LEN));
    image.put_le32(sb + 24, 16);
    image.put_le16(sb + 44, u16::try_from(BLOCK_SIZE).unwrap_or(u16::MAX));
    let magic = REISERFS_MAGIC_3_6.as_bytes();
    image.bytes[sb + 52..sb + 52 + magic.len()].copy_from_slice(magic);
    image
}

// ── jfs ─────────────────────────────────────────────────────────────────────

/// A jfs image with a 16-block inline log.
#[must_use]
pub fn jfs_image() -> SyntheticImage {
    let mut image = SyntheticImage {
        variant: FsVariant::Jfs,
        bytes: blank(jfs::BLOCKS),
    };
    let sb = JFS_SUPERBLOCK_OFFSET;
    image.bytes[sb..sb + 4].copy_from_slice(JFS_MAGIC);
    image.put_le32(sb + 4, 1);
    image.put_le32(sb + 8, u32_of(jfs::BLOCKS));
    image.put_le32(sb + 16, u32_of(BLOCK_SIZE as u64));
    image.put_le16(sb + 20, 12);
    image.put_le32(sb + 24, 512);
    image.put_le32(sb + 72, jfs::LOG_LEN);
    image.put_le32(sb + 76, u32_of(jfs::LOG_FIRST));
    image
}

/// Home block of an inode in the synthetic ext3 image.
#[must_use]
pub fn ext3_inode_block(ino: u64) -> BlockNumber {
    let per_block = (BLOCK_SIZE / 128) as u64;
    let group = (ino - 1) / u64::from(ext3::INODES_PER_GROUP);
    let index = (ino - 1) % u64::from(ext3::INODES_PER_GROUP);
    let table = ext3::INODE_TABLE[usize::try_from(group).unwrap_or(0)];
    BlockNumber(table + index / per_block)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fsp_ondisk::{Ext3Superblock, JfsSuperblock, ReiserfsSuperblock};

    #[test]
    fn superblocks_parse() {
        let sb = Ext3Superblock::parse_from_image(&ext3_image().bytes).expect("ext3");
        assert!(sb.has_journal());
        assert_eq!(sb.groups_count(), 2);
        assert_eq!(sb.inode_blocks_per_group(), 2);
        sb.validate_geometry().expect("geometry");

        let sb = ReiserfsSuperblock::parse_from_image(&reiserfs_image().bytes).expect("reiserfs");
        assert_eq!(sb.journal_header_block(), reiserfs::JOURNAL_HEADER);

        let sb = JfsSuperblock::parse_from_image(&jfs_image().bytes).expect("jfs");
        assert_eq!(sb.logpxd.address, jfs::LOG_FIRST);
        assert_eq!(sb.logpxd.length, jfs::LOG_LEN);
    }

    #[test]
    fn inode_blocks_follow_the_table() {
        assert_eq!(ext3_inode_block(2), BlockNumber(4));
        assert_eq!(ext3_inode_block(33), BlockNumber(5));
        assert_eq!(ext3_inode_block(65), BlockNumber(66));
    }
}
