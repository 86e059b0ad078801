#![forbid(unsafe_code)]
//! Shared vocabulary for fsprobe.
//!
//! Unit-carrying newtypes for sectors, blocks, groups and inodes, the
//! filesystem variant and journaling mode enums, the semantic block roles
//! the classifier produces, and the bounds-checked byte readers every
//! on-disk parser builds on.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Size of one addressable sector on the observed device.
pub const SECTOR_SIZE: u32 = 512;
pub const SECTOR_SHIFT: u32 = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SectorNumber(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeNumber(pub u64);

/// Block group index (ext3: u32 group number).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupNumber(pub u32);

/// Validated filesystem block size (power of two in 1024..=65536).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockSize(u32);

impl BlockSize {
    pub const DEFAULT: Self = Self(4096);

    pub fn new(value: u32) -> Result<Self, ParseError> {
        if !value.is_power_of_two() || !(1024..=65536).contains(&value) {
            return Err(ParseError::InvalidField {
                field: "block_size",
                reason: "must be power of two in 1024..=65536",
            });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    /// Block size as a `usize` for buffer math.
    #[must_use]
    pub fn as_usize(self) -> usize {
        usize::try_from(self.0).unwrap_or(usize::MAX)
    }

    #[must_use]
    pub fn shift(self) -> u32 {
        self.0.trailing_zeros()
    }

    /// Number of device sectors covered by one block.
    #[must_use]
    pub fn sectors_per_block(self) -> u64 {
        u64::from(self.0 >> SECTOR_SHIFT)
    }

    #[must_use]
    pub fn block_to_byte(self, block: BlockNumber) -> Option<u64> {
        block.0.checked_mul(u64::from(self.0))
    }
}

impl Default for BlockSize {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl SectorNumber {
    /// Block containing this sector.
    #[must_use]
    pub fn to_block(self, block_size: BlockSize) -> BlockNumber {
        BlockNumber(self.0 >> (block_size.shift() - SECTOR_SHIFT))
    }

    /// Sector of the `index`-th block after this one in a multi-block request.
    #[must_use]
    pub fn nth_block(self, index: u64, block_size: BlockSize) -> Option<Self> {
        index
            .checked_mul(block_size.sectors_per_block())
            .and_then(|delta| self.0.checked_add(delta))
            .map(Self)
    }
}

impl BlockNumber {
    /// First sector of this block.
    #[must_use]
    pub fn first_sector(self, block_size: BlockSize) -> Option<SectorNumber> {
        self.0
            .checked_mul(block_size.sectors_per_block())
            .map(SectorNumber)
    }

    #[must_use]
    pub fn checked_add(self, blocks: u64) -> Option<Self> {
        self.0.checked_add(blocks).map(Self)
    }

    #[must_use]
    pub fn checked_sub(self, blocks: u64) -> Option<Self> {
        self.0.checked_sub(blocks).map(Self)
    }
}

impl InodeNumber {
    pub const ROOT: Self = Self(2);
    pub const JOURNAL: Self = Self(8);
}

/// Group that owns an inode (inodes are 1-indexed).
#[must_use]
pub fn inode_to_group(ino: InodeNumber, inodes_per_group: u32) -> GroupNumber {
    let index = ino.0.saturating_sub(1) / u64::from(inodes_per_group.max(1));
    GroupNumber(u32::try_from(index).unwrap_or(u32::MAX))
}

/// Zero-based slot of an inode within its group's inode table.
#[must_use]
pub fn inode_index_in_group(ino: InodeNumber, inodes_per_group: u32) -> u32 {
    let index = ino.0.saturating_sub(1) % u64::from(inodes_per_group.max(1));
    u32::try_from(index).unwrap_or(u32::MAX)
}

// ── Variants and modes ──────────────────────────────────────────────────────

/// On-disk layout family of the observed filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FsVariant {
    Ext3,
    Reiserfs,
    Jfs,
}

impl FsVariant {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Ext3 => "ext3",
            Self::Reiserfs => "reiserfs",
            Self::Jfs => "jfs",
        }
    }
}

impl fmt::Display for FsVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for FsVariant {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ext3" => Ok(Self::Ext3),
            "reiserfs" => Ok(Self::Reiserfs),
            "jfs" => Ok(Self::Jfs),
            _ => Err(ParseError::InvalidField {
                field: "filesystem",
                reason: "expected ext3, reiserfs or jfs",
            }),
        }
    }
}

/// Which writes pass through the log first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JournalingMode {
    /// Full data journaling: every block goes through the log.
    Data,
    /// Metadata journaling, data written before the commit.
    #[default]
    Ordered,
    /// Metadata journaling without data ordering.
    Writeback,
}

impl JournalingMode {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Data => "data",
            Self::Ordered => "ordered",
            Self::Writeback => "writeback",
        }
    }
}

impl fmt::Display for JournalingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for JournalingMode {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "data" | "journal" | "full" => Ok(Self::Data),
            "ordered" => Ok(Self::Ordered),
            "writeback" => Ok(Self::Writeback),
            _ => Err(ParseError::InvalidField {
                field: "journaling_mode",
                reason: "expected data, ordered or writeback",
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Read,
    Write,
}

impl Direction {
    /// Single-letter trace tag.
    #[must_use]
    pub fn tag(self) -> char {
        match self {
            Self::Read => 'R',
            Self::Write => 'W',
        }
    }
}

/// Result of a block write as the protocol automaton sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failure,
}

impl Outcome {
    #[must_use]
    pub fn tag(self) -> char {
        match self {
            Self::Success => 'S',
            Self::Failure => 'F',
        }
    }
}

// ── Semantic block roles ────────────────────────────────────────────────────

/// Indirection level of an ext3 block-map pointer block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndirectTier {
    Single,
    Double,
    Triple,
}

impl IndirectTier {
    pub const ALL: [Self; 3] = [Self::Single, Self::Double, Self::Triple];

    /// Index of this tier's root pointer in `i_block`.
    #[must_use]
    pub fn pointer_index(self) -> usize {
        match self {
            Self::Single => 12,
            Self::Double => 13,
            Self::Triple => 14,
        }
    }

    /// Number of pointer-block levels below the inode.
    #[must_use]
    pub fn depth(self) -> u32 {
        match self {
            Self::Single => 1,
            Self::Double => 2,
            Self::Triple => 3,
        }
    }
}

/// Fixed-location block roles of the ext3-style layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ext3BlockType {
    Inode,
    Superblock,
    InodeBitmap,
    DataBitmap,
    GroupDescriptor,
    Directory,
    Indirect,
    /// Indirect block belonging to the journal inode itself.
    JournalIndirect,
    Data,
}

/// What a block is to the journaling protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SemanticBlockType {
    JournalDescriptor,
    JournalRevoke,
    JournalData,
    JournalCommit,
    JournalSuperblock,
    Checkpoint,
    Ordered,
    Unordered,
    Unknown,
    /// Wildcard; only meaningful as a fault target or automaton edge.
    Any,
    Ext3(Ext3BlockType),
}

impl SemanticBlockType {
    /// Short tag used in trace records.
    #[must_use]
    pub fn tag(self) -> &'static str {
        match self {
            Self::JournalDescriptor => "jdesc",
            Self::JournalRevoke => "jrevoke",
            Self::JournalData => "jdata",
            Self::JournalCommit => "jcommit",
            Self::JournalSuperblock => "jsuper",
            Self::Checkpoint => "checkpoint",
            Self::Ordered => "ordered",
            Self::Unordered => "unordered",
            Self::Unknown => "unknown",
            Self::Any => "any",
            Self::Ext3(kind) => match kind {
                Ext3BlockType::Inode => "inode",
                Ext3BlockType::Superblock => "super",
                Ext3BlockType::InodeBitmap => "ibitmap",
                Ext3BlockType::DataBitmap => "dbitmap",
                Ext3BlockType::GroupDescriptor => "gdesc",
                Ext3BlockType::Directory => "dir",
                Ext3BlockType::Indirect => "indirect",
                Ext3BlockType::JournalIndirect => "jindirect",
                Ext3BlockType::Data => "data",
            },
        }
    }

    /// Role this block plays as automaton input under `mode`.
    ///
    /// Fixed-location ext3 types collapse to `Ordered` or `Unordered`; every
    /// journal-relative role passes through unchanged.
    #[must_use]
    pub fn protocol_role(self, mode: JournalingMode) -> Self {
        match self {
            Self::Ext3(Ext3BlockType::JournalIndirect) => Self::JournalData,
            Self::Ext3(_) => match mode {
                JournalingMode::Ordered => Self::Ordered,
                JournalingMode::Writeback | JournalingMode::Data => Self::Unordered,
            },
            other => other,
        }
    }
}

impl fmt::Display for SemanticBlockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

// ── Parsing primitives ──────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// JBD journal structures are big-endian.
#[inline]
pub fn read_be_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

#[must_use]
pub fn trim_nul_padded(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim().to_owned()
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for SectorNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for GroupNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BlockSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn read_helpers_little_and_big_endian() {
        let bytes = [0x34_u8, 0x12, 0x78, 0x56, 0xC0, 0x3B, 0x39, 0x98];
        assert_eq!(read_le_u16(&bytes, 0).expect("u16"), 0x1234);
        assert_eq!(read_le_u32(&bytes, 0).expect("u32"), 0x5678_1234);
        assert_eq!(read_be_u32(&bytes, 4).expect("be u32"), 0xC03B_3998);
        assert!(matches!(
            read_le_u32(&bytes, 6),
            Err(ParseError::InsufficientData { needed: 4, .. })
        ));
    }

    #[test]
    fn trim_nul_padded_stops_at_first_nul() {
        assert_eq!(trim_nul_padded(b"ReIsEr2Fs\0"), "ReIsEr2Fs");
    }

    #[test]
    fn block_size_validation() {
        assert!(BlockSize::new(4096).is_ok());
        assert!(BlockSize::new(1024).is_ok());
        assert!(BlockSize::new(3000).is_err());
        assert!(BlockSize::new(512).is_err());
        assert!(BlockSize::new(0).is_err());
        assert_eq!(BlockSize::DEFAULT.sectors_per_block(), 8);
        assert_eq!(BlockSize::new(1024).expect("1k").sectors_per_block(), 2);
    }

    #[test]
    fn sector_block_conversions() {
        let bs = BlockSize::DEFAULT;
        assert_eq!(SectorNumber(0).to_block(bs), BlockNumber(0));
        assert_eq!(SectorNumber(7).to_block(bs), BlockNumber(0));
        assert_eq!(SectorNumber(8).to_block(bs), BlockNumber(1));
        assert_eq!(SectorNumber(800).to_block(bs), BlockNumber(100));
        assert_eq!(SectorNumber(u64::MAX).to_block(bs), BlockNumber(u64::MAX >> 3));
        assert_eq!(SectorNumber(1 << 60).to_block(bs), BlockNumber(1 << 57));
        assert_eq!(BlockNumber(100).first_sector(bs), Some(SectorNumber(800)));
        assert_eq!(SectorNumber(800).nth_block(3, bs), Some(SectorNumber(824)));
    }

    #[test]
    fn inode_group_math() {
        assert_eq!(inode_to_group(InodeNumber(1), 64), GroupNumber(0));
        assert_eq!(inode_to_group(InodeNumber(64), 64), GroupNumber(0));
        assert_eq!(inode_to_group(InodeNumber(65), 64), GroupNumber(1));
        assert_eq!(inode_index_in_group(InodeNumber(8), 64), 7);
        assert_eq!(inode_index_in_group(InodeNumber(65), 64), 0);
    }

    #[test]
    fn variant_and_mode_parse() {
        assert_eq!("EXT3".parse::<FsVariant>().expect("ext3"), FsVariant::Ext3);
        assert_eq!("jfs".parse::<FsVariant>().expect("jfs"), FsVariant::Jfs);
        assert!("xfs".parse::<FsVariant>().is_err());
        assert_eq!(
            "writeback".parse::<JournalingMode>().expect("mode"),
            JournalingMode::Writeback
        );
        assert_eq!(
            "full".parse::<JournalingMode>().expect("mode"),
            JournalingMode::Data
        );
        assert_eq!(JournalingMode::default(), JournalingMode::Ordered);
    }

    #[test]
    fn fixed_types_collapse_by_mode() {
        let inode = SemanticBlockType::Ext3(Ext3BlockType::Inode);
        assert_eq!(
            inode.protocol_role(JournalingMode::Ordered),
            SemanticBlockType::Ordered
        );
        assert_eq!(
            inode.protocol_role(JournalingMode::Writeback),
            SemanticBlockType::Unordered
        );
        assert_eq!(
            SemanticBlockType::Ext3(Ext3BlockType::JournalIndirect)
                .protocol_role(JournalingMode::Ordered),
            SemanticBlockType::JournalData
        );
        assert_eq!(
            SemanticBlockType::JournalCommit.protocol_role(JournalingMode::Data),
            SemanticBlockType::JournalCommit
        );
    }

    #[test]
    fn semantic_type_serde_shape() {
        let json = serde_json::to_string(&SemanticBlockType::Ext3(Ext3BlockType::InodeBitmap))
            .expect("serialize");
        assert_eq!(json, r#"{"ext3":"inode_bitmap"}"#);
        let back: SemanticBlockType =
            serde_json::from_str(r#""journal_commit""#).expect("deserialize");
        assert_eq!(back, SemanticBlockType::JournalCommit);
    }

    proptest! {
        #[test]
        fn first_sector_round_trips_to_block(block in 0_u64..(1 << 40), shift in 10_u32..=16) {
            let bs = BlockSize::new(1 << shift).expect("valid size");
            let sector = BlockNumber(block).first_sector(bs).expect("no overflow");
            prop_assert_eq!(sector.to_block(bs), BlockNumber(block));
        }
    }
}
