//! ext3 superblock, group descriptor and inode block-map parsing.

use fsp_types::{
    BlockSize, IndirectTier, InodeNumber, ParseError, ensure_slice, inode_index_in_group,
    inode_to_group, read_fixed, read_le_u16, read_le_u32, trim_nul_padded,
};
use serde::{Deserialize, Serialize};

pub const EXT3_SUPERBLOCK_OFFSET: usize = 1024;
pub const EXT3_SUPERBLOCK_SIZE: usize = 1024;
pub const EXT3_SUPER_MAGIC: u16 = 0xEF53;
pub const EXT3_GROUP_DESC_SIZE: usize = 32;
pub const EXT3_GOOD_OLD_INODE_SIZE: u16 = 128;
pub const EXT3_GOOD_OLD_REV: u32 = 0;

/// Direct block pointers in `i_block`.
pub const EXT3_NDIR_BLOCKS: usize = 12;
/// Total `i_block` slots (12 direct + single, double, triple indirect).
pub const EXT3_N_BLOCKS: usize = 15;

pub const EXT3_FEATURE_COMPAT_HAS_JOURNAL: u32 = 0x0004;

const S_IFMT: u16 = 0o170_000;
const S_IFDIR: u16 = 0o040_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext3Superblock {
    pub inodes_count: u32,
    pub blocks_count: u32,
    pub free_blocks_count: u32,
    pub free_inodes_count: u32,
    pub first_data_block: u32,
    pub log_block_size: u32,
    pub block_size: u32,
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    pub magic: u16,
    pub state: u16,
    pub rev_level: u32,
    pub first_ino: u32,
    pub inode_size: u16,
    pub feature_compat: u32,
    pub feature_incompat: u32,
    pub uuid: [u8; 16],
    pub volume_name: String,
    pub journal_inum: u32,
    pub journal_dev: u32,
}

impl Ext3Superblock {
    /// Parse from the 1024-byte region that starts at byte 1024 of the device.
    pub fn parse_superblock_region(region: &[u8]) -> Result<Self, ParseError> {
        if region.len() < EXT3_SUPERBLOCK_SIZE {
            return Err(ParseError::InsufficientData {
                needed: EXT3_SUPERBLOCK_SIZE,
                offset: 0,
                actual: region.len(),
            });
        }

        let magic = read_le_u16(region, 0x38)?;
        if magic != EXT3_SUPER_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(EXT3_SUPER_MAGIC),
                actual: u64::from(magic),
            });
        }

        let log_block_size = read_le_u32(region, 0x18)?;
        let Some(block_size) = 10_u32
            .checked_add(log_block_size)
            .and_then(|shift| 1_u32.checked_shl(shift))
        else {
            return Err(ParseError::InvalidField {
                field: "s_log_block_size",
                reason: "invalid shift",
            });
        };
        if !matches!(block_size, 1024 | 2048 | 4096) {
            return Err(ParseError::InvalidField {
                field: "s_log_block_size",
                reason: "unsupported block size",
            });
        }

        let rev_level = read_le_u32(region, 0x4C)?;
        let inode_size = if rev_level == EXT3_GOOD_OLD_REV {
            EXT3_GOOD_OLD_INODE_SIZE
        } else {
            read_le_u16(region, 0x58)?
        };

        Ok(Self {
            inodes_count: read_le_u32(region, 0x00)?,
            blocks_count: read_le_u32(region, 0x04)?,
            free_blocks_count: read_le_u32(region, 0x0C)?,
            free_inodes_count: read_le_u32(region, 0x10)?,
            first_data_block: read_le_u32(region, 0x14)?,
            log_block_size,
            block_size,
            blocks_per_group: read_le_u32(region, 0x20)?,
            inodes_per_group: read_le_u32(region, 0x28)?,
            magic,
            state: read_le_u16(region, 0x3A)?,
            rev_level,
            first_ino: read_le_u32(region, 0x54)?,
            inode_size,
            feature_compat: read_le_u32(region, 0x5C)?,
            feature_incompat: read_le_u32(region, 0x60)?,
            uuid: read_fixed::<16>(region, 0x68)?,
            volume_name: trim_nul_padded(&read_fixed::<16>(region, 0x78)?),
            journal_inum: read_le_u32(region, 0xE0)?,
            journal_dev: read_le_u32(region, 0xE4)?,
        })
    }

    /// Parse from a full image buffer.
    pub fn parse_from_image(image: &[u8]) -> Result<Self, ParseError> {
        let region = ensure_slice(image, EXT3_SUPERBLOCK_OFFSET, EXT3_SUPERBLOCK_SIZE)?;
        Self::parse_superblock_region(region)
    }

    pub fn block_size(&self) -> Result<BlockSize, ParseError> {
        BlockSize::new(self.block_size)
    }

    #[must_use]
    pub fn has_journal(&self) -> bool {
        self.feature_compat & EXT3_FEATURE_COMPAT_HAS_JOURNAL != 0
    }

    #[must_use]
    pub fn groups_count(&self) -> u32 {
        if self.blocks_per_group == 0 {
            return 0;
        }
        let data_blocks = self.blocks_count.saturating_sub(self.first_data_block);
        data_blocks.div_ceil(self.blocks_per_group)
    }

    /// Blocks occupied by one group's inode table.
    #[must_use]
    pub fn inode_blocks_per_group(&self) -> u32 {
        let bytes = u64::from(self.inodes_per_group) * u64::from(self.inode_size);
        u32::try_from(bytes.div_ceil(u64::from(self.block_size.max(1)))).unwrap_or(u32::MAX)
    }

    /// Block holding the primary superblock.
    #[must_use]
    pub fn superblock_block(&self) -> u64 {
        (EXT3_SUPERBLOCK_OFFSET as u64) / u64::from(self.block_size.max(1))
    }

    /// First block of the group descriptor table.
    #[must_use]
    pub fn group_desc_table_block(&self) -> u64 {
        u64::from(self.first_data_block) + 1
    }

    /// Blocks occupied by the group descriptor table.
    #[must_use]
    pub fn group_desc_table_blocks(&self) -> u64 {
        let bytes = u64::from(self.groups_count()) * EXT3_GROUP_DESC_SIZE as u64;
        bytes.div_ceil(u64::from(self.block_size.max(1))).max(1)
    }

    /// Locate an inode: its group, and the block/byte offset inside that
    /// group's inode table.
    #[must_use]
    pub fn locate_inode(&self, ino: InodeNumber) -> InodeLocation {
        let index = u64::from(inode_index_in_group(ino, self.inodes_per_group));
        let byte = index * u64::from(self.inode_size);
        let block_size = u64::from(self.block_size.max(1));
        InodeLocation {
            group: inode_to_group(ino, self.inodes_per_group).0,
            block_in_table: byte / block_size,
            offset_in_block: usize::try_from(byte % block_size).unwrap_or(0),
        }
    }

    pub fn validate_geometry(&self) -> Result<(), ParseError> {
        if self.blocks_per_group == 0 {
            return Err(ParseError::InvalidField {
                field: "s_blocks_per_group",
                reason: "cannot be zero",
            });
        }
        if self.blocks_per_group > self.block_size.saturating_mul(8) {
            return Err(ParseError::InvalidField {
                field: "s_blocks_per_group",
                reason: "exceeds block_size * 8 (block bitmap capacity)",
            });
        }
        if self.inodes_per_group == 0 {
            return Err(ParseError::InvalidField {
                field: "s_inodes_per_group",
                reason: "cannot be zero",
            });
        }
        if self.inode_size < EXT3_GOOD_OLD_INODE_SIZE
            || !self.inode_size.is_power_of_two()
            || u32::from(self.inode_size) > self.block_size
        {
            return Err(ParseError::InvalidField {
                field: "s_inode_size",
                reason: "must be a power of two between 128 and block_size",
            });
        }
        if self.first_data_block >= self.blocks_count {
            return Err(ParseError::InvalidField {
                field: "s_first_data_block",
                reason: "first_data_block >= blocks_count",
            });
        }
        Ok(())
    }
}

/// Position of an inode inside its group's inode table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeLocation {
    pub group: u32,
    pub block_in_table: u64,
    pub offset_in_block: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext3GroupDesc {
    pub block_bitmap: u32,
    pub inode_bitmap: u32,
    pub inode_table: u32,
    pub free_blocks_count: u16,
    pub free_inodes_count: u16,
    pub used_dirs_count: u16,
}

impl Ext3GroupDesc {
    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        if bytes.len() < EXT3_GROUP_DESC_SIZE {
            return Err(ParseError::InsufficientData {
                needed: EXT3_GROUP_DESC_SIZE,
                offset: 0,
                actual: bytes.len(),
            });
        }
        Ok(Self {
            block_bitmap: read_le_u32(bytes, 0x00)?,
            inode_bitmap: read_le_u32(bytes, 0x04)?,
            inode_table: read_le_u32(bytes, 0x08)?,
            free_blocks_count: read_le_u16(bytes, 0x0C)?,
            free_inodes_count: read_le_u16(bytes, 0x0E)?,
            used_dirs_count: read_le_u16(bytes, 0x10)?,
        })
    }
}

/// The parts of an ext3 inode needed to follow its block map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext3Inode {
    pub mode: u16,
    pub size: u32,
    pub links_count: u16,
    pub blocks: u32,
    pub flags: u32,
    pub block: [u32; EXT3_N_BLOCKS],
}

impl Ext3Inode {
    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        if bytes.len() < usize::from(EXT3_GOOD_OLD_INODE_SIZE) {
            return Err(ParseError::InsufficientData {
                needed: usize::from(EXT3_GOOD_OLD_INODE_SIZE),
                offset: 0,
                actual: bytes.len(),
            });
        }
        let mut block = [0_u32; EXT3_N_BLOCKS];
        for (i, slot) in block.iter_mut().enumerate() {
            *slot = read_le_u32(bytes, 0x28 + i * 4)?;
        }
        Ok(Self {
            mode: read_le_u16(bytes, 0x00)?,
            size: read_le_u32(bytes, 0x04)?,
            links_count: read_le_u16(bytes, 0x1A)?,
            blocks: read_le_u32(bytes, 0x1C)?,
            flags: read_le_u32(bytes, 0x20)?,
            block,
        })
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    /// Non-zero direct pointers, in logical order.
    pub fn direct_blocks(&self) -> impl Iterator<Item = u32> + '_ {
        self.block[..EXT3_NDIR_BLOCKS]
            .iter()
            .copied()
            .filter(|b| *b != 0)
    }

    /// Root pointer of one indirect tree, if allocated.
    #[must_use]
    pub fn indirect_root(&self, tier: IndirectTier) -> Option<u32> {
        let ptr = self.block[tier.pointer_index()];
        (ptr != 0).then_some(ptr)
    }

    /// Number of filesystem blocks spanned by `i_size`.
    #[must_use]
    pub fn size_in_blocks(&self, block_size: u32) -> u64 {
        u64::from(self.size).div_ceil(u64::from(block_size.max(1)))
    }
}

/// Decode an indirect block into its little-endian block pointers.
#[must_use]
pub fn parse_block_pointers(block: &[u8]) -> Vec<u32> {
    block
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_valid_sb() -> [u8; EXT3_SUPERBLOCK_SIZE] {
        let mut sb = [0_u8; EXT3_SUPERBLOCK_SIZE];
        sb[0x38..0x3A].copy_from_slice(&EXT3_SUPER_MAGIC.to_le_bytes());
        sb[0x18..0x1C].copy_from_slice(&2_u32.to_le_bytes()); // 4K
        sb[0x00..0x04].copy_from_slice(&128_u32.to_le_bytes()); // inodes_count
        sb[0x04..0x08].copy_from_slice(&128_u32.to_le_bytes()); // blocks_count
        sb[0x20..0x24].copy_from_slice(&64_u32.to_le_bytes()); // blocks_per_group
        sb[0x28..0x2C].copy_from_slice(&64_u32.to_le_bytes()); // inodes_per_group
        sb[0x4C..0x50].copy_from_slice(&1_u32.to_le_bytes()); // rev_level
        sb[0x58..0x5A].copy_from_slice(&128_u16.to_le_bytes()); // inode_size
        sb[0x5C..0x60].copy_from_slice(&EXT3_FEATURE_COMPAT_HAS_JOURNAL.to_le_bytes());
        sb[0xE0..0xE4].copy_from_slice(&8_u32.to_le_bytes()); // journal_inum
        sb
    }

    #[test]
    fn superblock_geometry() {
        let sb = Ext3Superblock::parse_superblock_region(&make_valid_sb()).expect("parse");
        assert_eq!(sb.block_size, 4096);
        assert_eq!(sb.groups_count(), 2);
        assert_eq!(sb.inode_blocks_per_group(), 2);
        assert_eq!(sb.superblock_block(), 0);
        assert_eq!(sb.group_desc_table_block(), 1);
        assert_eq!(sb.group_desc_table_blocks(), 1);
        assert!(sb.has_journal());
        assert_eq!(sb.journal_inum, 8);
        sb.validate_geometry().expect("valid geometry");
    }

    #[test]
    fn revision_zero_forces_128_byte_inodes() {
        let mut raw = make_valid_sb();
        raw[0x4C..0x50].copy_from_slice(&0_u32.to_le_bytes());
        raw[0x58..0x5A].copy_from_slice(&256_u16.to_le_bytes());
        let sb = Ext3Superblock::parse_superblock_region(&raw).expect("parse");
        assert_eq!(sb.inode_size, 128);
    }

    #[test]
    fn bad_magic_rejected() {
        let mut raw = make_valid_sb();
        raw[0x38] = 0;
        assert!(matches!(
            Ext3Superblock::parse_superblock_region(&raw),
            Err(ParseError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn zero_blocks_per_group_fails_geometry() {
        let mut raw = make_valid_sb();
        raw[0x20..0x24].copy_from_slice(&0_u32.to_le_bytes());
        let sb = Ext3Superblock::parse_superblock_region(&raw).expect("parse");
        assert!(matches!(
            sb.validate_geometry(),
            Err(ParseError::InvalidField {
                field: "s_blocks_per_group",
                ..
            })
        ));
    }

    #[test]
    fn inode_location_math() {
        let sb = Ext3Superblock::parse_superblock_region(&make_valid_sb()).expect("parse");
        // 32 inodes of 128 bytes per 4K block.
        let loc = sb.locate_inode(InodeNumber(8));
        assert_eq!(loc.group, 0);
        assert_eq!(loc.block_in_table, 0);
        assert_eq!(loc.offset_in_block, 7 * 128);

        let loc = sb.locate_inode(InodeNumber(40));
        assert_eq!(loc.block_in_table, 1);
        assert_eq!(loc.offset_in_block, 7 * 128);

        let loc = sb.locate_inode(InodeNumber(65));
        assert_eq!(loc.group, 1);
        assert_eq!(loc.block_in_table, 0);
    }

    #[test]
    fn group_desc_parse() {
        let mut raw = [0_u8; 32];
        raw[0..4].copy_from_slice(&5_u32.to_le_bytes());
        raw[4..8].copy_from_slice(&6_u32.to_le_bytes());
        raw[8..12].copy_from_slice(&7_u32.to_le_bytes());
        let gd = Ext3GroupDesc::parse_from_bytes(&raw).expect("gd");
        assert_eq!((gd.block_bitmap, gd.inode_bitmap, gd.inode_table), (5, 6, 7));
        assert!(Ext3GroupDesc::parse_from_bytes(&raw[..16]).is_err());
    }

    #[test]
    fn inode_block_map() {
        let mut raw = [0_u8; 128];
        raw[0..2].copy_from_slice(&0o040_755_u16.to_le_bytes());
        raw[4..8].copy_from_slice(&8192_u32.to_le_bytes());
        raw[0x28..0x2C].copy_from_slice(&50_u32.to_le_bytes());
        raw[0x2C..0x30].copy_from_slice(&51_u32.to_le_bytes());
        raw[0x28 + 12 * 4..0x28 + 13 * 4].copy_from_slice(&60_u32.to_le_bytes());
        let inode = Ext3Inode::parse_from_bytes(&raw).expect("inode");
        assert!(inode.is_dir());
        assert_eq!(inode.direct_blocks().collect::<Vec<_>>(), vec![50, 51]);
        assert_eq!(inode.indirect_root(IndirectTier::Single), Some(60));
        assert_eq!(inode.indirect_root(IndirectTier::Double), None);
        assert_eq!(inode.size_in_blocks(4096), 2);
    }

    #[test]
    fn block_pointer_decode() {
        let mut raw = vec![0_u8; 16];
        raw[0..4].copy_from_slice(&33_u32.to_le_bytes());
        raw[8..12].copy_from_slice(&35_u32.to_le_bytes());
        assert_eq!(parse_block_pointers(&raw), vec![33, 0, 35, 0]);
    }
}
