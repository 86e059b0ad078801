//! Per-request classification cache.

use crate::classify::{ClassifyCx, FsSemantics};
use fsp_block::BlockRequest;
use fsp_types::{BlockNumber, SectorNumber, SemanticBlockType};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassifiedBlock {
    pub block: BlockNumber,
    pub ty: SemanticBlockType,
}

/// Every block of one request, classified exactly once.
///
/// Private to the request that built it; dropped when the request ends.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    blocks: BTreeMap<SectorNumber, ClassifiedBlock>,
}

impl RequestContext {
    pub fn build(semantics: &dyn FsSemantics, cx: &ClassifyCx<'_>, request: &BlockRequest) -> Self {
        let block_size = cx.registry.block_size();
        let blocks = request
            .blocks(block_size)
            .into_iter()
            .map(|part| {
                let block = part.sector.to_block(block_size);
                let ty = semantics.classify(cx, part.sector, part.bytes, request.direction);
                tracing::trace!(
                    target: "fsp::classify",
                    request = request.id.0,
                    block = block.0,
                    block_type = %ty,
                    "classified"
                );
                (part.sector, ClassifiedBlock { block, ty })
            })
            .collect();
        Self { blocks }
    }

    #[must_use]
    pub fn get(&self, sector: SectorNumber) -> Option<SemanticBlockType> {
        self.blocks.get(&sector).map(|c| c.ty)
    }

    /// Blocks in sector order.
    pub fn iter(&self) -> impl Iterator<Item = &ClassifiedBlock> {
        self.blocks.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    #[must_use]
    pub fn contains_type(&self, ty: SemanticBlockType) -> bool {
        self.blocks.values().any(|c| c.ty == ty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::Ext3Semantics;
    use crate::registry::{Ext3Layout, FixedLayout, JournalLayout, LayoutRegistry};
    use fsp_block::RequestId;
    use fsp_types::{BlockSize, Ext3BlockType, JournalingMode};

    #[test]
    fn multi_block_request_is_classified_per_block() {
        let registry = LayoutRegistry::new(
            BlockSize::DEFAULT,
            JournalLayout::contiguous(BlockNumber(100), 8, 1),
            FixedLayout::Ext3(Ext3Layout::from_groups(&[(0, 10)], 5, BlockSize::DEFAULT)),
        );
        let cx = ClassifyCx::new(&registry, JournalingMode::Ordered);
        // Blocks 9..=12: inode bitmap, then three inode-table blocks.
        let request = BlockRequest::write(RequestId(1), SectorNumber(72), vec![0; 4096 * 4]);
        let context = RequestContext::build(&Ext3Semantics, &cx, &request);

        assert_eq!(context.len(), 4);
        assert_eq!(
            context.get(SectorNumber(72)),
            Some(SemanticBlockType::Ext3(Ext3BlockType::InodeBitmap))
        );
        assert_eq!(
            context.get(SectorNumber(80)),
            Some(SemanticBlockType::Ext3(Ext3BlockType::Inode))
        );
        assert_eq!(context.get(SectorNumber(81)), None);
        let blocks: Vec<u64> = context.iter().map(|c| c.block.0).collect();
        assert_eq!(blocks, vec![9, 10, 11, 12]);
        assert!(!context.contains_type(SemanticBlockType::JournalCommit));
    }
}
