//! reiserfs superblock and journal descriptor/commit parsing.

use fsp_types::{BlockSize, ParseError, ensure_slice, read_le_u16, read_le_u32, trim_nul_padded};
use serde::{Deserialize, Serialize};

pub const REISERFS_SUPERBLOCK_OFFSET: usize = 64 * 1024;
/// Bytes of the v1 superblock this crate decodes.
pub const REISERFS_SUPERBLOCK_SIZE: usize = 76;

pub const REISERFS_MAGIC_3_5: &str = "ReIsErFs";
pub const REISERFS_MAGIC_3_6: &str = "ReIsEr2Fs";
pub const REISERFS_MAGIC_JR: &str = "ReIsEr3Fs";

pub const REISERFS_JOURNAL_DESC_MAGIC: &[u8; 8] = b"ReIsErLB";
/// Descriptor magic sits this many bytes before the end of the block.
const DESC_MAGIC_FROM_END: usize = 12;
const DESC_HEADER_SIZE: usize = 12;
const COMMIT_HEADER_SIZE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReiserfsFormat {
    V3_5,
    V3_6,
    Relocated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReiserfsJournalParams {
    pub first_block: u32,
    pub device: u32,
    pub size: u32,
    pub trans_max: u32,
    pub magic: u32,
    pub max_batch: u32,
    pub max_commit_age: u32,
    pub max_trans_age: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReiserfsSuperblock {
    pub block_count: u32,
    pub free_blocks: u32,
    pub root_block: u32,
    pub journal: ReiserfsJournalParams,
    pub block_size: u16,
    pub umount_state: u16,
    pub magic: String,
    pub format: ReiserfsFormat,
    pub tree_height: u16,
    pub bmap_nr: u16,
    pub version: u16,
}

impl ReiserfsSuperblock {
    /// Parse from the region starting at byte 65536 of the device.
    pub fn parse_superblock_region(region: &[u8]) -> Result<Self, ParseError> {
        let magic = trim_nul_padded(ensure_slice(region, 52, 10)?);
        let format = match magic.as_str() {
            REISERFS_MAGIC_3_5 => ReiserfsFormat::V3_5,
            REISERFS_MAGIC_3_6 => ReiserfsFormat::V3_6,
            REISERFS_MAGIC_JR => ReiserfsFormat::Relocated,
            _ => {
                return Err(ParseError::InvalidField {
                    field: "s_magic",
                    reason: "not a reiserfs magic string",
                });
            }
        };

        let journal = ReiserfsJournalParams {
            first_block: read_le_u32(region, 12)?,
            device: read_le_u32(region, 16)?,
            size: read_le_u32(region, 20)?,
            trans_max: read_le_u32(region, 24)?,
            magic: read_le_u32(region, 28)?,
            max_batch: read_le_u32(region, 32)?,
            max_commit_age: read_le_u32(region, 36)?,
            max_trans_age: read_le_u32(region, 40)?,
        };

        Ok(Self {
            block_count: read_le_u32(region, 0)?,
            free_blocks: read_le_u32(region, 4)?,
            root_block: read_le_u32(region, 8)?,
            journal,
            block_size: read_le_u16(region, 44)?,
            umount_state: read_le_u16(region, 50)?,
            magic,
            format,
            tree_height: read_le_u16(region, 68)?,
            bmap_nr: read_le_u16(region, 70)?,
            version: read_le_u16(region, 72)?,
        })
    }

    pub fn parse_from_image(image: &[u8]) -> Result<Self, ParseError> {
        let region = ensure_slice(image, REISERFS_SUPERBLOCK_OFFSET, REISERFS_SUPERBLOCK_SIZE)?;
        Self::parse_superblock_region(region)
    }

    pub fn block_size(&self) -> Result<BlockSize, ParseError> {
        BlockSize::new(u32::from(self.block_size))
    }

    /// Block holding the superblock.
    #[must_use]
    pub fn superblock_block(&self) -> u64 {
        REISERFS_SUPERBLOCK_OFFSET as u64 / u64::from(self.block_size.max(1))
    }

    /// Journal header block, immediately after the circular log area.
    #[must_use]
    pub fn journal_header_block(&self) -> u64 {
        u64::from(self.journal.first_block) + u64::from(self.journal.size)
    }
}

/// Real block numbers that fit in a descriptor block.
#[must_use]
pub fn journal_trans_half(block_size: usize) -> usize {
    block_size.saturating_sub(24) / 4
}

/// Whether `block` carries the descriptor magic at its tail.
#[must_use]
pub fn is_journal_desc(block: &[u8]) -> bool {
    block.len() >= DESC_HEADER_SIZE + DESC_MAGIC_FROM_END
        && ensure_slice(block, block.len() - DESC_MAGIC_FROM_END, 8)
            .is_ok_and(|magic| magic == REISERFS_JOURNAL_DESC_MAGIC)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReiserfsJournalDesc {
    pub trans_id: u32,
    pub len: u32,
    pub mount_id: u32,
    /// Home locations of the first `min(len, trans_half)` logged blocks.
    pub real_blocks: Vec<u32>,
}

impl ReiserfsJournalDesc {
    pub fn parse(block: &[u8]) -> Result<Self, ParseError> {
        if !is_journal_desc(block) {
            return Err(ParseError::InvalidField {
                field: "j_magic",
                reason: "descriptor magic missing",
            });
        }
        let trans_id = read_le_u32(block, 0)?;
        let len = read_le_u32(block, 4)?;
        let mount_id = read_le_u32(block, 8)?;
        let listed = usize::try_from(len)
            .map_err(|_| ParseError::IntegerConversion { field: "j_len" })?
            .min(journal_trans_half(block.len()));
        let real_blocks = (0..listed)
            .map(|i| read_le_u32(block, DESC_HEADER_SIZE + i * 4))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            trans_id,
            len,
            mount_id,
            real_blocks,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReiserfsJournalCommit {
    pub trans_id: u32,
    pub len: u32,
    /// Home locations beyond the descriptor's capacity.
    pub real_blocks: Vec<u32>,
}

impl ReiserfsJournalCommit {
    /// Parse a commit block. Only the overflow half of long transactions is
    /// listed here, so `real_blocks` is empty for short ones.
    pub fn parse(block: &[u8]) -> Result<Self, ParseError> {
        let trans_id = read_le_u32(block, 0)?;
        let len = read_le_u32(block, 4)?;
        let half = journal_trans_half(block.len());
        let overflow = usize::try_from(len)
            .map_err(|_| ParseError::IntegerConversion { field: "j_len" })?
            .saturating_sub(half)
            .min(half);
        let real_blocks = (0..overflow)
            .map(|i| read_le_u32(block, COMMIT_HEADER_SIZE + i * 4))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            trans_id,
            len,
            real_blocks,
        })
    }
}
