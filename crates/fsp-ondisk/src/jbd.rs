//! JBD (ext3 journal) block headers, descriptor tags and revoke records.
//!
//! Every JBD metadata block starts with a 12-byte big-endian header
//! (magic, block type, transaction sequence). Blocks without the magic are
//! journaled copies of filesystem blocks.

use fsp_types::{ParseError, read_be_u32};
use serde::{Deserialize, Serialize};

pub const JBD_MAGIC: u32 = 0xC03B_3998;
pub const JBD_HEADER_SIZE: usize = 12;

pub const JBD_DESCRIPTOR_BLOCK: u32 = 1;
pub const JBD_COMMIT_BLOCK: u32 = 2;
pub const JBD_SUPERBLOCK_V1: u32 = 3;
pub const JBD_SUPERBLOCK_V2: u32 = 4;
pub const JBD_REVOKE_BLOCK: u32 = 5;

pub const JBD_FLAG_SAME_UUID: u32 = 2;
pub const JBD_FLAG_LAST_TAG: u32 = 8;

pub const JBD_TAG_SIZE: usize = 8;
pub const JBD_UUID_SIZE: usize = 16;
pub const JBD_REVOKE_HEADER_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JbdBlockKind {
    Descriptor,
    Commit,
    SuperblockV1,
    SuperblockV2,
    Revoke,
    Other(u32),
}

impl JbdBlockKind {
    #[must_use]
    pub fn from_raw(blocktype: u32) -> Self {
        match blocktype {
            JBD_DESCRIPTOR_BLOCK => Self::Descriptor,
            JBD_COMMIT_BLOCK => Self::Commit,
            JBD_SUPERBLOCK_V1 => Self::SuperblockV1,
            JBD_SUPERBLOCK_V2 => Self::SuperblockV2,
            JBD_REVOKE_BLOCK => Self::Revoke,
            other => Self::Other(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JbdHeader {
    pub blocktype: u32,
    pub sequence: u32,
}

impl JbdHeader {
    /// Parse the header; `InvalidMagic` means the block is journaled data.
    pub fn parse(block: &[u8]) -> Result<Self, ParseError> {
        let magic = read_be_u32(block, 0)?;
        if magic != JBD_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(JBD_MAGIC),
                actual: u64::from(magic),
            });
        }
        Ok(Self {
            blocktype: read_be_u32(block, 4)?,
            sequence: read_be_u32(block, 8)?,
        })
    }

    #[must_use]
    pub fn kind(&self) -> JbdBlockKind {
        JbdBlockKind::from_raw(self.blocktype)
    }
}

/// One descriptor tag: the home location of the next journaled block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JbdTag {
    pub blocknr: u32,
    pub flags: u32,
}

impl JbdTag {
    #[must_use]
    pub fn is_last(&self) -> bool {
        self.flags & JBD_FLAG_LAST_TAG != 0
    }
}

/// Walk the tag list of a descriptor block.
///
/// A tag without `SAME_UUID` is followed by a 16-byte UUID. The walk ends at
/// `LAST_TAG` or when the next tag would run off the block.
#[must_use]
pub fn parse_descriptor_tags(block: &[u8]) -> Vec<JbdTag> {
    let mut tags = Vec::new();
    let mut offset = JBD_HEADER_SIZE;
    while offset + JBD_TAG_SIZE <= block.len() {
        let (Ok(blocknr), Ok(flags)) = (read_be_u32(block, offset), read_be_u32(block, offset + 4))
        else {
            break;
        };
        let tag = JbdTag { blocknr, flags };
        tags.push(tag);
        offset += JBD_TAG_SIZE;
        if flags & JBD_FLAG_SAME_UUID == 0 {
            offset += JBD_UUID_SIZE;
        }
        if tag.is_last() {
            break;
        }
    }
    tags
}

/// Revoked block numbers listed in a revoke block.
///
/// `r_count` is the number of bytes in use, including the header.
pub fn parse_revoke_records(block: &[u8]) -> Result<Vec<u32>, ParseError> {
    let count = usize::try_from(read_be_u32(block, JBD_HEADER_SIZE)?)
        .map_err(|_| ParseError::IntegerConversion { field: "r_count" })?;
    if count > block.len() {
        return Err(ParseError::InvalidField {
            field: "r_count",
            reason: "exceeds block size",
        });
    }
    let mut revoked = Vec::new();
    let mut offset = JBD_REVOKE_HEADER_SIZE;
    while offset + 4 <= count {
        revoked.push(read_be_u32(block, offset)?);
        offset += 4;
    }
    Ok(revoked)
}

/// Journal superblock (first block of the journal).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JbdSuperblock {
    pub header: JbdHeader,
    pub block_size: u32,
    pub max_len: u32,
    pub first: u32,
    pub sequence: u32,
    pub start: u32,
}

impl JbdSuperblock {
    pub fn parse(block: &[u8]) -> Result<Self, ParseError> {
        let header = JbdHeader::parse(block)?;
        if !matches!(
            header.kind(),
            JbdBlockKind::SuperblockV1 | JbdBlockKind::SuperblockV2
        ) {
            return Err(ParseError::InvalidField {
                field: "h_blocktype",
                reason: "not a journal superblock",
            });
        }
        Ok(Self {
            header,
            block_size: read_be_u32(block, 12)?,
            max_len: read_be_u32(block, 16)?,
            first: read_be_u32(block, 20)?,
            sequence: read_be_u32(block, 24)?,
            start: read_be_u32(block, 28)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(blocktype: u32, seq: u32) -> Vec<u8> {
        let mut block = vec![0_u8; 4096];
        block[0..4].copy_from_slice(&JBD_MAGIC.to_be_bytes());
        block[4..8].copy_from_slice(&blocktype.to_be_bytes());
        block[8..12].copy_from_slice(&seq.to_be_bytes());
        block
    }

    #[test]
    fn header_kinds() {
        let h = JbdHeader::parse(&header(JBD_COMMIT_BLOCK, 9)).expect("header");
        assert_eq!(h.kind(), JbdBlockKind::Commit);
        assert_eq!(h.sequence, 9);
        assert_eq!(JbdBlockKind::from_raw(77), JbdBlockKind::Other(77));
        assert!(matches!(
            JbdHeader::parse(&[0_u8; 4096]),
            Err(ParseError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn descriptor_tags_honor_uuid_and_last_flag() {
        let mut block = header(JBD_DESCRIPTOR_BLOCK, 1);
        // First tag carries a UUID, the following share it.
        let mut off = JBD_HEADER_SIZE;
        block[off..off + 4].copy_from_slice(&100_u32.to_be_bytes());
        off += JBD_TAG_SIZE + JBD_UUID_SIZE;
        block[off..off + 4].copy_from_slice(&101_u32.to_be_bytes());
        block[off + 4..off + 8].copy_from_slice(&JBD_FLAG_SAME_UUID.to_be_bytes());
        off += JBD_TAG_SIZE;
        block[off..off + 4].copy_from_slice(&102_u32.to_be_bytes());
        block[off + 4..off + 8]
            .copy_from_slice(&(JBD_FLAG_SAME_UUID | JBD_FLAG_LAST_TAG).to_be_bytes());
        off += JBD_TAG_SIZE;
        // Garbage after LAST_TAG must be ignored.
        block[off..off + 4].copy_from_slice(&999_u32.to_be_bytes());

        let tags = parse_descriptor_tags(&block);
        let blocks: Vec<u32> = tags.iter().map(|t| t.blocknr).collect();
        assert_eq!(blocks, vec![100, 101, 102]);
        assert!(tags[2].is_last());
    }

    #[test]
    fn revoke_records_bounded_by_count() {
        let mut block = header(JBD_REVOKE_BLOCK, 3);
        block[12..16].copy_from_slice(&24_u32.to_be_bytes());
        block[16..20].copy_from_slice(&40_u32.to_be_bytes());
        block[20..24].copy_from_slice(&41_u32.to_be_bytes());
        block[24..28].copy_from_slice(&42_u32.to_be_bytes());
        assert_eq!(parse_revoke_records(&block).expect("revoke"), vec![40, 41]);

        block[12..16].copy_from_slice(&9000_u32.to_be_bytes());
        assert!(parse_revoke_records(&block).is_err());
    }

    #[test]
    fn journal_superblock_fields() {
        let mut block = header(JBD_SUPERBLOCK_V2, 0);
        block[12..16].copy_from_slice(&4096_u32.to_be_bytes());
        block[16..20].copy_from_slice(&20_u32.to_be_bytes());
        block[20..24].copy_from_slice(&1_u32.to_be_bytes());
        let jsb = JbdSuperblock::parse(&block).expect("jsb");
        assert_eq!((jsb.block_size, jsb.max_len, jsb.first), (4096, 20, 1));
        assert!(JbdSuperblock::parse(&header(JBD_COMMIT_BLOCK, 0)).is_err());
    }
}
