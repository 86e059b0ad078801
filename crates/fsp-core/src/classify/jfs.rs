//! jfs: an inline log of self-describing pages.

use super::{ClassifyCx, FsSemantics, unjournaled_role};
use crate::registry::FixedLayout;
use fsp_ondisk::parse_log_page;
use fsp_types::{BlockNumber, Direction, FsVariant, SectorNumber, SemanticBlockType};

#[derive(Debug, Clone, Copy, Default)]
pub struct JfsSemantics;

impl FsSemantics for JfsSemantics {
    fn variant(&self) -> FsVariant {
        FsVariant::Jfs
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
            if let FixedLayout::Jfs { log_super, .. } = cx.registry.fixed() {
                if *log_super == block {
                    return SemanticBlockType::JournalSuperblock;
                }
            }
            return classify_log_page(cx, block, bytes);
        }
        if cx.take_checkpoint(block, direction) {
            return SemanticBlockType::Checkpoint;
        }
        unjournaled_role(cx.mode)
    }
}

/// Every extent-carrying record logs the extent's first block in this page.
fn classify_log_page(cx: &ClassifyCx<'_>, block: BlockNumber, bytes: &[u8]) -> SemanticBlockType {
    let page = match parse_log_page(bytes) {
        Ok(page) => page,
        Err(err) => {
            tracing::warn!(
                target: "fsp::classify",
                block = block.0,
                error = %err,
                "log page unreadable"
            );
            return SemanticBlockType::Unknown;
        }
    };
    for record in &page.records {
        if let Some(extent) = record.extent.filter(|e| e.address != 0) {
            cx.learn_logged(block, BlockNumber(extent.address));
        }
    }
    if page.has_commit() {
        SemanticBlockType::JournalCommit
    } else {
        SemanticBlockType::JournalData
    }
}
