//! reiserfs: a contiguous journal of descriptor, logged blocks and commit.

use super::{ClassifyCx, FsSemantics, unjournaled_role};
use crate::registry::FixedLayout;
use fsp_ondisk::{ReiserfsJournalCommit, ReiserfsJournalDesc, is_journal_desc, journal_trans_half};
use fsp_types::{BlockNumber, Direction, FsVariant, SectorNumber, SemanticBlockType};
use parking_lot::Mutex;

/// The transaction whose descriptor was seen and whose commit was not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct OpenTransaction {
    trans_id: u32,
    len: u32,
    desc: BlockNumber,
}

#[derive(Debug, Default)]
pub struct ReiserfsSemantics {
    open: Mutex<Option<OpenTransaction>>,
}

impl FsSemantics for ReiserfsSemantics {
    fn variant(&self) -> FsVariant {
        FsVariant::Reiserfs
    }

    fn classify(
        &self,
        cx: &ClassifyCx<'_>,
        sector: SectorNumber,
        bytes: &[u8],
        direction: Direction,
    ) -> SemanticBlockType {
        let block = sector.to_block(cx.registry.block_size());
        if cx.registry.is_journal_block(block) {
            return self.classify_journal(cx, block, bytes);
        }
        if cx.take_checkpoint(block, direction) {
            return SemanticBlockType::Checkpoint;
        }
        match cx.registry.fixed() {
            FixedLayout::Reiserfs { journal_header, .. } if *journal_header == block => {
                SemanticBlockType::JournalSuperblock
            }
            _ => unjournaled_role(cx.mode),
        }
    }
}

impl ReiserfsSemantics {
    fn classify_journal(
        &self,
        cx: &ClassifyCx<'_>,
        block: BlockNumber,
        bytes: &[u8],
    ) -> SemanticBlockType {
        let journal = cx.registry.journal();
        if is_journal_desc(bytes) {
            let desc = match ReiserfsJournalDesc::parse(bytes) {
                Ok(desc) => desc,
                Err(err) => {
                    tracing::warn!(
                        target: "fsp::classify",
                        block = block.0,
                        error = %err,
                        "descriptor magic present but body unreadable"
                    );
                    return SemanticBlockType::Unknown;
                }
            };
            for (i, real) in desc.real_blocks.iter().enumerate() {
                if let Some(position) = journal.nth_after(block, i + 1) {
                    cx.learn_logged(position, BlockNumber(u64::from(*real)));
                }
            }
            tracing::debug!(
                target: "fsp::classify",
                descriptor = block.0,
                trans_id = desc.trans_id,
                len = desc.len,
                "transaction opened"
            );
            *self.open.lock() = Some(OpenTransaction {
                trans_id: desc.trans_id,
                len: desc.len,
                desc: block,
            });
            return SemanticBlockType::JournalDescriptor;
        }

        let mut open = self.open.lock();
        let Some(txn) = *open else {
            return SemanticBlockType::JournalData;
        };
        let Ok(commit) = ReiserfsJournalCommit::parse(bytes) else {
            return SemanticBlockType::JournalData;
        };
        if commit.trans_id != txn.trans_id || commit.len != txn.len {
            return SemanticBlockType::JournalData;
        }
        // Blocks past the descriptor's capacity are listed in the commit.
        let half = journal_trans_half(bytes.len());
        for (i, real) in commit.real_blocks.iter().enumerate() {
            if let Some(position) = journal.nth_after(txn.desc, 1 + half + i) {
                cx.learn_logged(position, BlockNumber(u64::from(*real)));
            }
        }
        *open = None;
        tracing::debug!(
            target: "fsp::classify",
            commit = block.0,
            trans_id = txn.trans_id,
            "transaction committed"
        );
        SemanticBlockType::JournalCommit
    }
}
