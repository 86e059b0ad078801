//! Request streams shaped like a conforming journaling client.
//!
//! Each transaction writes its unjournaled data first, then the log (opener,
//! logged copies, commit), then checkpoints every logged block home. Log
//! positions advance around the circular area exactly as the classifier
//! computes them, so a replay through an observer never sees a protocol
//! violation.

use crate::blocks::{
    LogRecordSpec, filled, jbd_commit, jbd_descriptor, jfs_log_page, reiserfs_commit,
    reiserfs_desc,
};
use fsp_block::{BlockRequest, RequestId};
use fsp_core::JournalLayout;
use fsp_ondisk::jfs::{LOG_COMMIT, LOG_REDOPAGE};
use fsp_types::{BlockNumber, BlockSize, FsVariant, SectorNumber};

/// One transaction's requests, in submission order.
#[derive(Debug, Clone, Default)]
pub struct Transaction {
    pub unjournaled: Vec<BlockRequest>,
    pub log: Vec<BlockRequest>,
    pub checkpoint: Vec<BlockRequest>,
}

impl Transaction {
    /// Every request in submission order.
    #[must_use]
    pub fn requests(&self) -> Vec<BlockRequest> {
        self.unjournaled
            .iter()
            .chain(&self.log)
            .chain(&self.checkpoint)
            .cloned()
            .collect()
    }

    /// The block each request of `log` lands on.
    #[must_use]
    pub fn log_blocks(&self, block_size: BlockSize) -> Vec<BlockNumber> {
        self.log
            .iter()
            .map(|r| r.sector.to_block(block_size))
            .collect()
    }
}

/// Generates back-to-back transactions for one observed layout.
#[derive(Debug, Clone)]
pub struct TransactionWorkload {
    variant: FsVariant,
    block_size: BlockSize,
    journal: JournalLayout,
    cursor: BlockNumber,
    sequence: u32,
    next_id: u64,
}

impl TransactionWorkload {
    /// Start logging at the first block of the circular area.
    #[must_use]
    pub fn new(variant: FsVariant, block_size: BlockSize, journal: JournalLayout) -> Self {
        let cursor = journal
            .blocks()
            .get(journal.log_start())
            .copied()
            .unwrap_or(BlockNumber(0));
        Self {
            variant,
            block_size,
            journal,
            cursor,
            sequence: 1,
            next_id: 1,
        }
    }

    #[must_use]
    pub fn for_registry(registry: &fsp_core::LayoutRegistry) -> Self {
        Self::new(
            registry.variant(),
            registry.block_size(),
            registry.journal().clone(),
        )
    }

    /// Next log block; the cursor wraps inside the log area.
    #[must_use]
    pub fn cursor(&self) -> BlockNumber {
        self.cursor
    }

    fn request(&mut self, block: BlockNumber, data: Vec<u8>) -> BlockRequest {
        let id = RequestId(self.next_id);
        self.next_id += 1;
        let sector = block
            .first_sector(self.block_size)
            .unwrap_or(SectorNumber(0));
        BlockRequest::write(id, sector, data)
    }

    fn advance(&self, from: BlockNumber, n: usize) -> BlockNumber {
        self.journal.nth_after(from, n).unwrap_or(from)
    }

    /// One transaction logging `metadata` and writing `data` unjournaled.
    pub fn transaction(&mut self, metadata: &[BlockNumber], data: &[BlockNumber]) -> Transaction {
        let bs = self.block_size.as_usize();
        let mut txn = Transaction::default();
        for block in data {
            let req = self.request(*block, filled(bs, payload_byte(*block)));
            txn.unjournaled.push(req);
        }

        let reals: Vec<u32> = metadata
            .iter()
            .map(|b| u32::try_from(b.0).unwrap_or(u32::MAX))
            .collect();
        let start = self.cursor;
        match self.variant {
            FsVariant::Ext3 => {
                let opener = jbd_descriptor(bs, self.sequence, &reals);
                txn.log.push(self.request(start, opener));
                for (i, real) in metadata.iter().enumerate() {
                    let at = self.advance(start, i + 1);
                    let req = self.request(at, filled(bs, payload_byte(*real)));
                    txn.log.push(req);
                }
                let commit_at = self.advance(start, metadata.len() + 1);
                let commit = jbd_commit(bs, self.sequence);
                txn.log.push(self.request(commit_at, commit));
                self.cursor = self.advance(commit_at, 1);
            }
            FsVariant::Reiserfs => {
                let opener = reiserfs_desc(bs, self.sequence, &reals);
                txn.log.push(self.request(start, opener));
                for (i, real) in metadata.iter().enumerate() {
                    let at = self.advance(start, i + 1);
                    let req = self.request(at, filled(bs, payload_byte(*real)));
                    txn.log.push(req);
                }
                let commit_at = self.advance(start, metadata.len() + 1);
                let commit = reiserfs_commit(bs, self.sequence, &reals);
                txn.log.push(self.request(commit_at, commit));
                self.cursor = self.advance(commit_at, 1);
            }
            FsVariant::Jfs => {
                // One redo record per page, then a page holding the commit.
                let mut at = start;
                for real in metadata {
                    let page = jfs_log_page(
                        self.sequence,
                        &[LogRecordSpec {
                            kind: LOG_REDOPAGE,
                            address: real.0,
                        }],
                    );
                    txn.log.push(self.request(at, page));
                    at = self.advance(at, 1);
                }
                let commit = jfs_log_page(
                    self.sequence,
                    &[LogRecordSpec {
                        kind: LOG_COMMIT,
                        address: 0,
                    }],
                );
                txn.log.push(self.request(at, commit));
                self.cursor = self.advance(at, 1);
            }
        }

        for block in metadata {
            let req = self.request(*block, filled(bs, payload_byte(*block)));
            txn.checkpoint.push(req);
        }
        self.sequence = self.sequence.wrapping_add(1);
        txn
    }
}

/// Printable fill byte derived from the home block; never a JBD magic.
fn payload_byte(block: BlockNumber) -> u8 {
    u8::try_from(block.0 % 0x5F).unwrap_or(0) + 0x20
}
