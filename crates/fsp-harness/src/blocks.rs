//! Builders for individual journal blocks.
//!
//! Each function returns one block of `block_size` bytes laid out the way
//! the matching parser in `fsp-ondisk` expects.

use fsp_ondisk::jbd::{
    JBD_COMMIT_BLOCK, JBD_DESCRIPTOR_BLOCK, JBD_FLAG_LAST_TAG, JBD_FLAG_SAME_UUID, JBD_HEADER_SIZE,
    JBD_MAGIC, JBD_REVOKE_BLOCK, JBD_REVOKE_HEADER_SIZE, JBD_SUPERBLOCK_V2, JBD_TAG_SIZE,
    JBD_UUID_SIZE,
};
use fsp_ondisk::jfs::{LOG_PAGE_HEADER_SIZE, LOG_PAGE_SIZE, LOG_RECORD_DESC_SIZE};
use fsp_ondisk::reiserfs::REISERFS_JOURNAL_DESC_MAGIC;
use fsp_ondisk::journal_trans_half;
use serde::{Deserialize, Serialize};

fn put_be32(block: &mut [u8], offset: usize, value: u32) {
    block[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}

fn put_le32(block: &mut [u8], offset: usize, value: u32) {
    block[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn jbd_header(block_size: usize, blocktype: u32, sequence: u32) -> Vec<u8> {
    let mut block = vec![0_u8; block_size];
    put_be32(&mut block, 0, JBD_MAGIC);
    put_be32(&mut block, 4, blocktype);
    put_be32(&mut block, 8, sequence);
    block
}

// ── JBD ─────────────────────────────────────────────────────────────────────

/// A v2 journal superblock whose log area starts at index `first`.
#[must_use]
pub fn jbd_superblock(block_size: usize, max_len: u32, first: u32) -> Vec<u8> {
    let mut block = jbd_header(block_size, JBD_SUPERBLOCK_V2, 0);
    put_be32(&mut block, 12, u32::try_from(block_size).unwrap_or(u32::MAX));
    put_be32(&mut block, 16, max_len);
    put_be32(&mut block, 20, first);
    put_be32(&mut block, 24, 1);
    block
}

/// A descriptor listing `tags` in order. The first tag carries a UUID.
#[must_use]
pub fn jbd_descriptor(block_size: usize, sequence: u32, tags: &[u32]) -> Vec<u8> {
    let mut block = jbd_header(block_size, JBD_DESCRIPTOR_BLOCK, sequence);
    let mut offset = JBD_HEADER_SIZE;
    for (i, real) in tags.iter().enumerate() {
        let mut flags = if i == 0 { 0 } else { JBD_FLAG_SAME_UUID };
        if i + 1 == tags.len() {
            flags |= JBD_FLAG_LAST_TAG;
        }
        put_be32(&mut block, offset, *real);
        put_be32(&mut block, offset + 4, flags);
        offset += JBD_TAG_SIZE;
        if i == 0 {
            block[offset..offset + JBD_UUID_SIZE].fill(0x5A);
            offset += JBD_UUID_SIZE;
        }
    }
    block
}

#[must_use]
pub fn jbd_commit(block_size: usize, sequence: u32) -> Vec<u8> {
    jbd_header(block_size, JBD_COMMIT_BLOCK, sequence)
}

#[must_use]
pub fn jbd_revoke(block_size: usize, sequence: u32, revoked: &[u32]) -> Vec<u8> {
    let mut block = jbd_header(block_size, JBD_REVOKE_BLOCK, sequence);
    let used = JBD_REVOKE_HEADER_SIZE + revoked.len() * 4;
    put_be32(&mut block, JBD_HEADER_SIZE, u32::try_from(used).unwrap_or(u32::MAX));
    for (i, real) in revoked.iter().enumerate() {
        put_be32(&mut block, JBD_REVOKE_HEADER_SIZE + i * 4, *real);
    }
    block
}

// ── reiserfs ────────────────────────────────────────────────────────────────

/// A descriptor for a transaction of `reals.len()` blocks. Blocks past the
/// descriptor's capacity belong in the commit.
#[must_use]
pub fn reiserfs_desc(block_size: usize, trans_id: u32, reals: &[u32]) -> Vec<u8> {
    let mut block = vec![0_u8; block_size];
    put_le32(&mut block, 0, trans_id);
    put_le32(&mut block, 4, u32::try_from(reals.len()).unwrap_or(u32::MAX));
    put_le32(&mut block, 8, 1);
    let half = journal_trans_half(block_size);
    for (i, real) in reals.iter().take(half).enumerate() {
        put_le32(&mut block, 12 + i * 4, *real);
    }
    block[block_size - 12..block_size - 4].copy_from_slice(REISERFS_JOURNAL_DESC_MAGIC);
    block
}

/// The commit closing the transaction described by `reals`.
#[must_use]
pub fn reiserfs_commit(block_size: usize, trans_id: u32, reals: &[u32]) -> Vec<u8> {
    let mut block = vec![0_u8; block_size];
    put_le32(&mut block, 0, trans_id);
    put_le32(&mut block, 4, u32::try_from(reals.len()).unwrap_or(u32::MAX));
    let half = journal_trans_half(block_size);
    for (i, real) in reals.iter().skip(half).take(half).enumerate() {
        put_le32(&mut block, 8 + i * 4, *real);
    }
    block
}

// ── jfs ─────────────────────────────────────────────────────────────────────

/// One record of a synthetic log page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecordSpec {
    pub kind: u16,
    /// First block of the extent; zero for records without one.
    #[serde(default)]
    pub address: u64,
}

/// A log page holding `records` with no payloads, first record written
/// lowest so the backward walk meets them last-to-first.
#[must_use]
pub fn jfs_log_page(page: u32, records: &[LogRecordSpec]) -> Vec<u8> {
    let mut block = vec![0_u8; LOG_PAGE_SIZE];
    put_le32(&mut block, 0, page);
    let mut offset = LOG_PAGE_HEADER_SIZE;
    for record in records {
        let lrd = &mut block[offset..offset + LOG_RECORD_DESC_SIZE];
        lrd[0..4].copy_from_slice(&page.to_le_bytes());
        lrd[8..10].copy_from_slice(&record.kind.to_le_bytes());
        let hi = u32::try_from(record.address >> 32).unwrap_or(0) & 0xFF;
        let len_addr = 1_u32 | (hi << 24);
        lrd[28..32].copy_from_slice(&len_addr.to_le_bytes());
        let lo = u32::try_from(record.address & 0xFFFF_FFFF).unwrap_or(0);
        lrd[32..36].copy_from_slice(&lo.to_le_bytes());
        offset += LOG_RECORD_DESC_SIZE;
    }
    let eor = u16::try_from(offset).unwrap_or(u16::MAX);
    block[6..8].copy_from_slice(&eor.to_le_bytes());
    block
}

/// A block of `fill` bytes: logged copies, data, anything without a header.
#[must_use]
pub fn filled(block_size: usize, fill: u8) -> Vec<u8> {
    vec![fill; block_size]
}
