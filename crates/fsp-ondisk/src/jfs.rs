//! jfs aggregate superblock and inline-log page parsing.
//!
//! Log pages hold variable-length records written front to back; each
//! record's fixed descriptor (`lrd`) follows its data. Readers start at the
//! page's end-of-records offset and walk backward.

use fsp_types::{BlockSize, ParseError, ensure_slice, read_le_u16, read_le_u32};
use serde::{Deserialize, Serialize};

pub const JFS_SUPERBLOCK_OFFSET: usize = 32 * 1024;
pub const JFS_SUPERBLOCK_SIZE: usize = 128;
pub const JFS_MAGIC: &[u8; 4] = b"JFS1";

pub const LOG_PAGE_SIZE: usize = 4096;
pub const LOG_PAGE_HEADER_SIZE: usize = 8;
pub const LOG_PAGE_TRAILER_SIZE: usize = 8;
/// Size of the fixed log record descriptor.
pub const LOG_RECORD_DESC_SIZE: usize = 36;
/// Log superblock offset from the start of the log, in blocks.
pub const LOG_SUPER_BLOCK: u64 = 1;

pub const LOG_COMMIT: u16 = 0x8000;
pub const LOG_SYNCPT: u16 = 0x4000;
pub const LOG_MOUNT: u16 = 0x0400;
pub const LOG_REDOPAGE: u16 = 0x0800;
pub const LOG_NOREDOPAGE: u16 = 0x0080;
pub const LOG_NOREDOINOEXT: u16 = 0x0040;
pub const LOG_UPDATEMAP: u16 = 0x0008;
pub const LOG_NOREDOFILE: u16 = 0x0001;

/// Offset of the extent descriptor inside an `lrd`.
const LRD_PXD_OFFSET: usize = 28;

/// Physical extent descriptor: 24-bit length, 40-bit address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pxd {
    pub length: u32,
    pub address: u64,
}

impl Pxd {
    pub fn parse(bytes: &[u8], offset: usize) -> Result<Self, ParseError> {
        let len_addr = read_le_u32(bytes, offset)?;
        let addr2 = read_le_u32(bytes, offset + 4)?;
        Ok(Self {
            length: len_addr & 0x00FF_FFFF,
            address: (u64::from(len_addr >> 24) << 32) | u64::from(addr2),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JfsSuperblock {
    pub version: u32,
    pub size: u64,
    pub block_size: u32,
    pub l2bsize: u16,
    pub pbsize: u32,
    pub agsize: u32,
    pub flag: u32,
    pub state: u32,
    pub logdev: u32,
    pub logserial: u32,
    pub logpxd: Pxd,
}

impl JfsSuperblock {
    pub fn parse_superblock_region(region: &[u8]) -> Result<Self, ParseError> {
        let magic = ensure_slice(region, 0, 4)?;
        if magic != JFS_MAGIC {
            return Err(ParseError::InvalidField {
                field: "s_magic",
                reason: "not JFS1",
            });
        }
        let size_lo = u64::from(read_le_u32(region, 8)?);
        let size_hi = u64::from(read_le_u32(region, 12)?);
        Ok(Self {
            version: read_le_u32(region, 4)?,
            size: size_lo | (size_hi << 32),
            block_size: read_le_u32(region, 16)?,
            l2bsize: read_le_u16(region, 20)?,
            pbsize: read_le_u32(region, 24)?,
            agsize: read_le_u32(region, 32)?,
            flag: read_le_u32(region, 36)?,
            state: read_le_u32(region, 40)?,
            logdev: read_le_u32(region, 64)?,
            logserial: read_le_u32(region, 68)?,
            logpxd: Pxd::parse(region, 72)?,
        })
    }

    pub fn parse_from_image(image: &[u8]) -> Result<Self, ParseError> {
        let region = ensure_slice(image, JFS_SUPERBLOCK_OFFSET, JFS_SUPERBLOCK_SIZE)?;
        Self::parse_superblock_region(region)
    }

    pub fn block_size(&self) -> Result<BlockSize, ParseError> {
        BlockSize::new(self.block_size)
    }

    #[must_use]
    pub fn superblock_block(&self) -> u64 {
        JFS_SUPERBLOCK_OFFSET as u64 / u64::from(self.block_size.max(1))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogRecordKind {
    Commit,
    SyncPoint,
    Mount,
    RedoPage,
    NoRedoPage,
    NoRedoInodeExtent,
    UpdateMap,
    NoRedoFile,
    Other(u16),
}

impl LogRecordKind {
    #[must_use]
    pub fn from_raw(raw: u16) -> Self {
        match raw {
            LOG_COMMIT => Self::Commit,
            LOG_SYNCPT => Self::SyncPoint,
            LOG_MOUNT => Self::Mount,
            LOG_REDOPAGE => Self::RedoPage,
            LOG_NOREDOPAGE => Self::NoRedoPage,
            LOG_NOREDOINOEXT => Self::NoRedoInodeExtent,
            LOG_UPDATEMAP => Self::UpdateMap,
            LOG_NOREDOFILE => Self::NoRedoFile,
            other => Self::Other(other),
        }
    }

    /// Whether the record names an on-disk extent that will be checkpointed.
    #[must_use]
    pub fn carries_extent(self) -> bool {
        matches!(
            self,
            Self::RedoPage | Self::NoRedoPage | Self::NoRedoInodeExtent | Self::UpdateMap
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub tid: u32,
    pub backchain: u32,
    pub kind: LogRecordKind,
    pub length: u16,
    pub aggregate: u32,
    pub extent: Option<Pxd>,
}

impl LogRecord {
    fn parse(lrd: &[u8]) -> Result<Self, ParseError> {
        let kind = LogRecordKind::from_raw(read_le_u16(lrd, 8)?);
        let extent = if kind.carries_extent() {
            Some(Pxd::parse(lrd, LRD_PXD_OFFSET)?)
        } else {
            None
        };
        Ok(Self {
            tid: read_le_u32(lrd, 0)?,
            backchain: read_le_u32(lrd, 4)?,
            kind,
            length: read_le_u16(lrd, 10)?,
            aggregate: read_le_u32(lrd, 12)?,
            extent,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogPage {
    pub page: u32,
    pub eor: u16,
    /// Records in the order they were read (newest first).
    pub records: Vec<LogRecord>,
}

impl LogPage {
    #[must_use]
    pub fn has_commit(&self) -> bool {
        self.records.iter().any(|r| r.kind == LogRecordKind::Commit)
    }
}

/// Parse a log page backward from its end-of-records offset.
///
/// The walk stops when fewer bytes than the next item remain in the data
/// area. An end-of-records offset outside the data area is an error.
pub fn parse_log_page(block: &[u8]) -> Result<LogPage, ParseError> {
    let page_bytes = ensure_slice(block, 0, LOG_PAGE_SIZE)?;
    let page = read_le_u32(page_bytes, 0)?;
    let eor = read_le_u16(page_bytes, 6)?;
    let end = usize::from(eor) & (LOG_PAGE_SIZE - 1);
    if end < LOG_PAGE_HEADER_SIZE || end > LOG_PAGE_SIZE - LOG_PAGE_TRAILER_SIZE {
        return Err(ParseError::InvalidField {
            field: "h.eor",
            reason: "outside log page data area",
        });
    }

    let mut records = Vec::new();
    let mut off = end;
    loop {
        if off - LOG_PAGE_HEADER_SIZE < LOG_RECORD_DESC_SIZE {
            break;
        }
        off -= LOG_RECORD_DESC_SIZE;
        let record = LogRecord::parse(&page_bytes[off..off + LOG_RECORD_DESC_SIZE])?;
        records.push(record);

        let data_len = usize::from(record.length).div_ceil(4) * 4;
        if off - LOG_PAGE_HEADER_SIZE < data_len {
            break;
        }
        off -= data_len;
    }

    Ok(LogPage {
        page,
        eor,
        records,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lrd(kind: u16, length: u16, address: u64) -> [u8; LOG_RECORD_DESC_SIZE] {
        let mut raw = [0_u8; LOG_RECORD_DESC_SIZE];
        raw[0..4].copy_from_slice(&5_u32.to_le_bytes());
        raw[8..10].copy_from_slice(&kind.to_le_bytes());
        raw[10..12].copy_from_slice(&length.to_le_bytes());
        let len_addr = 1_u32 | (u32::try_from(address >> 32).expect("hi") << 24);
        raw[28..32].copy_from_slice(&len_addr.to_le_bytes());
        raw[32..36].copy_from_slice(&u32::try_from(address & 0xFFFF_FFFF).expect("lo").to_le_bytes());
        raw
    }

    fn page_with(records: &[(u16, u16, u64)]) -> Vec<u8> {
        let mut page = vec![0_u8; LOG_PAGE_SIZE];
        let mut cursor = LOG_PAGE_HEADER_SIZE;
        for &(kind, length, address) in records {
            cursor += usize::from(length).div_ceil(4) * 4;
            page[cursor..cursor + LOG_RECORD_DESC_SIZE].copy_from_slice(&lrd(kind, length, address));
            cursor += LOG_RECORD_DESC_SIZE;
        }
        page[6..8].copy_from_slice(&u16::try_from(cursor).expect("eor").to_le_bytes());
        page
    }

    #[test]
    fn pxd_splits_length_and_address() {
        let mut raw = [0_u8; 8];
        raw[0..4].copy_from_slice(&(0x0200_0010_u32).to_le_bytes());
        raw[4..8].copy_from_slice(&0x1234_u32.to_le_bytes());
        let pxd = Pxd::parse(&raw, 0).expect("pxd");
        assert_eq!(pxd.length, 0x10);
        assert_eq!(pxd.address, (2_u64 << 32) | 0x1234);
    }

    #[test]
    fn superblock_log_extent() {
        let mut sb = vec![0_u8; JFS_SUPERBLOCK_SIZE];
        sb[0..4].copy_from_slice(JFS_MAGIC);
        sb[16..20].copy_from_slice(&4096_u32.to_le_bytes());
        sb[72..76].copy_from_slice(&16_u32.to_le_bytes());
        sb[76..80].copy_from_slice(&120_u32.to_le_bytes());
        let parsed = JfsSuperblock::parse_superblock_region(&sb).expect("sb");
        assert_eq!(parsed.logpxd, Pxd { length: 16, address: 120 });
        assert_eq!(parsed.superblock_block(), 8);

        sb[0] = b'X';
        assert!(JfsSuperblock::parse_superblock_region(&sb).is_err());
    }

    #[test]
    fn backward_walk_reads_every_record() {
        let page = page_with(&[
            (LOG_REDOPAGE, 12, 300),
            (LOG_UPDATEMAP, 0, 301),
            (LOG_COMMIT, 0, 0),
        ]);
        let parsed = parse_log_page(&page).expect("page");
        let kinds: Vec<_> = parsed.records.iter().map(|r| r.kind).collect();
        assert_eq!(
            kinds,
            vec![
                LogRecordKind::Commit,
                LogRecordKind::UpdateMap,
                LogRecordKind::RedoPage
            ]
        );
        assert!(parsed.has_commit());
        assert_eq!(parsed.records[2].extent.map(|p| p.address), Some(300));
        assert_eq!(parsed.records[0].extent, None);
    }

    #[test]
    fn empty_page_has_no_records() {
        let page = page_with(&[]);
        let parsed = parse_log_page(&page).expect("page");
        assert!(parsed.records.is_empty());
        assert!(!parsed.has_commit());
    }

    #[test]
    fn eor_outside_data_area_rejected() {
        let mut page = page_with(&[]);
        page[6..8].copy_from_slice(&4090_u16.to_le_bytes());
        assert!(parse_log_page(&page).is_err());
        page[6..8].copy_from_slice(&2_u16.to_le_bytes());
        assert!(parse_log_page(&page).is_err());
    }
}
