//! ext3: fixed-location metadata plus a JBD journal inside inode 8.

use super::{ClassifyCx, FsSemantics};
use crate::discover::{map_logical_block, read_inode, walk_block_map};
use crate::fault::FaultSpec;
use crate::registry::{Ext3Layout, LayoutRegistry};
use fsp_block::ByteDevice;
use fsp_error::{FspError, Result};
use fsp_ondisk::{JbdBlockKind, JbdHeader, parse_descriptor_tags, parse_revoke_records};
use fsp_types::{
    BlockNumber, Direction, Ext3BlockType, FsVariant, IndirectTier, InodeNumber, ParseError,
    SectorNumber, SemanticBlockType,
};

#[derive(Debug, Clone, Copy, Default)]
pub struct Ext3Semantics;

impl FsSemantics for Ext3Semantics {
    fn variant(&self) -> FsVariant {
        FsVariant::Ext3
    }

    fn classify(
        &self,
        cx: &ClassifyCx<'_>,
        sector: SectorNumber,
        bytes: &[u8],
        direction: Direction,
    ) -> SemanticBlockType {
        let block = sector.to_block(cx.registry.block_size());
        let Some(layout) = cx.registry.ext3() else {
            tracing::warn!(target: "fsp::classify", block = block.0, "ext3 classifier over a non-ext3 registry");
            return SemanticBlockType::Unknown;
        };
        if cx.registry.is_journal_block(block) {
            return classify_journal(cx, layout, block, bytes);
        }
        if cx.take_checkpoint(block, direction) {
            return SemanticBlockType::Checkpoint;
        }
        SemanticBlockType::Ext3(fixed_location_type(layout, block))
    }

    fn fault_matches(
        &self,
        registry: &LayoutRegistry,
        spec: &FaultSpec,
        block: BlockNumber,
        _ty: SemanticBlockType,
    ) -> bool {
        if let Some(target) = spec.block {
            return target == block;
        }
        match (spec.target, spec.refinement) {
            (SemanticBlockType::Ext3(Ext3BlockType::Inode), Some(refinement)) => registry
                .ext3()
                .and_then(|layout| layout.inode_block(refinement.inode))
                .is_some_and(|home| home == block),
            _ => true,
        }
    }

    fn process_fault(
        &self,
        registry: &LayoutRegistry,
        dev: &dyn ByteDevice,
        spec: &mut FaultSpec,
    ) -> Result<()> {
        let Some(refinement) = spec.refinement else {
            return Ok(());
        };
        let layout = ext3_layout(registry)?;
        let ino = refinement.inode;
        match spec.target {
            SemanticBlockType::Ext3(Ext3BlockType::Inode) => {
                let block = layout
                    .inode_block(ino)
                    .ok_or_else(|| FspError::Format(format!("inode {ino} outside every group")))?;
                spec.block = Some(block);
            }
            SemanticBlockType::Ext3(Ext3BlockType::Data) => {
                if let Some(logical) = refinement.logical_block {
                    let inode = read_inode(dev, layout, ino)?;
                    let block = map_logical_block(dev, registry.block_size(), &inode, logical)?
                        .ok_or_else(|| {
                            FspError::Format(format!(
                                "logical block {logical} of inode {ino} is a hole"
                            ))
                        })?;
                    spec.block = Some(block);
                }
            }
            SemanticBlockType::Ext3(Ext3BlockType::Directory) => {
                let blocks = init_dir_blocks(registry, dev, ino)?;
                if spec.block.is_none() {
                    spec.block = blocks.first().copied();
                }
            }
            SemanticBlockType::Ext3(Ext3BlockType::Indirect) => {
                let pointers = init_indirect_blocks(registry, dev, ino)?;
                if let Some(tier) = refinement.indirect_tier {
                    let root = pointers
                        .iter()
                        .find(|(_, t)| *t == tier)
                        .map(|(block, _)| *block)
                        .ok_or_else(|| {
                            FspError::Format(format!("inode {ino} has no {tier:?} indirect tree"))
                        })?;
                    spec.block = Some(root);
                }
            }
            _ => {}
        }
        Ok(())
    }
}

fn ext3_layout(registry: &LayoutRegistry) -> Result<&Ext3Layout> {
    registry.ext3().ok_or_else(|| {
        FspError::UnsupportedFeature(format!(
            "inode refinements need an ext3 layout, observing {}",
            registry.variant()
        ))
    })
}

/// Fixed-location precedence outside the journal.
fn fixed_location_type(layout: &Ext3Layout, block: BlockNumber) -> Ext3BlockType {
    if layout.is_inode_block(block) {
        Ext3BlockType::Inode
    } else if layout.is_superblock(block) {
        Ext3BlockType::Superblock
    } else if layout.is_inode_bitmap(block) {
        Ext3BlockType::InodeBitmap
    } else if layout.is_data_bitmap(block) {
        Ext3BlockType::DataBitmap
    } else if layout.is_group_descriptor(block) {
        Ext3BlockType::GroupDescriptor
    } else if layout.is_directory(block) {
        Ext3BlockType::Directory
    } else if layout.indirect_owner(block).is_some() {
        Ext3BlockType::Indirect
    } else {
        Ext3BlockType::Data
    }
}

fn classify_journal(
    cx: &ClassifyCx<'_>,
    layout: &Ext3Layout,
    block: BlockNumber,
    bytes: &[u8],
) -> SemanticBlockType {
    if layout.is_journal_indirect(block) {
        return SemanticBlockType::Ext3(Ext3BlockType::JournalIndirect);
    }
    let header = match JbdHeader::parse(bytes) {
        Ok(header) => header,
        Err(ParseError::InvalidMagic { .. }) => return SemanticBlockType::JournalData,
        Err(err) => {
            tracing::warn!(
                target: "fsp::classify",
                block = block.0,
                error = %err,
                "journal block too short for a header"
            );
            return SemanticBlockType::Unknown;
        }
    };
    match header.kind() {
        JbdBlockKind::Descriptor => {
            learn_descriptor(cx, block, bytes);
            SemanticBlockType::JournalDescriptor
        }
        JbdBlockKind::Commit => SemanticBlockType::JournalCommit,
        JbdBlockKind::SuperblockV1 | JbdBlockKind::SuperblockV2 => {
            SemanticBlockType::JournalSuperblock
        }
        JbdBlockKind::Revoke => {
            trace_revoked(block, bytes);
            SemanticBlockType::JournalRevoke
        }
        JbdBlockKind::Other(_) => SemanticBlockType::JournalData,
    }
}

/// Tag `i` describes the `i + 1`-th journal block after the descriptor.
fn learn_descriptor(cx: &ClassifyCx<'_>, desc: BlockNumber, bytes: &[u8]) {
    let journal = cx.registry.journal();
    let tags = parse_descriptor_tags(bytes);
    for (i, tag) in tags.iter().enumerate() {
        let Some(position) = journal.nth_after(desc, i + 1) else {
            tracing::warn!(
                target: "fsp::classify",
                descriptor = desc.0,
                tag = i,
                "descriptor tag has no journal position"
            );
            continue;
        };
        cx.learn_logged(position, BlockNumber(u64::from(tag.blocknr)));
    }
    tracing::debug!(
        target: "fsp::classify",
        descriptor = desc.0,
        tags = tags.len(),
        "descriptor parsed"
    );
}

fn trace_revoked(block: BlockNumber, bytes: &[u8]) {
    match parse_revoke_records(bytes) {
        Ok(revoked) => {
            for blocknr in revoked {
                tracing::debug!(target: "fsp::classify", revoke = block.0, blocknr, "revoked");
            }
        }
        Err(err) => tracing::warn!(
            target: "fsp::classify",
            block = block.0,
            error = %err,
            "revoke record list unreadable"
        ),
    }
}

/// Learn every data block of directory `ino` so it classifies as
/// `Directory`. Returns the blocks in logical order.
pub fn init_dir_blocks(
    registry: &LayoutRegistry,
    dev: &dyn ByteDevice,
    ino: InodeNumber,
) -> Result<Vec<BlockNumber>> {
    let layout = ext3_layout(registry)?;
    let inode = read_inode(dev, layout, ino)?;
    if !inode.is_dir() {
        tracing::warn!(target: "fsp::classify", inode = ino.0, "learning data blocks of a non-directory");
    }
    let limit = inode.size_in_blocks(registry.block_size().get());
    let map = walk_block_map(dev, registry.block_size(), &inode, limit)?;
    for block in &map.data {
        layout.learn_directory(*block, ino);
    }
    tracing::info!(
        target: "fsp::classify",
        inode = ino.0,
        blocks = map.data.len(),
        "directory blocks learned"
    );
    Ok(map.data)
}

/// Learn the pointer blocks of `ino` so they classify as `Indirect`.
pub fn init_indirect_blocks(
    registry: &LayoutRegistry,
    dev: &dyn ByteDevice,
    ino: InodeNumber,
) -> Result<Vec<(BlockNumber, IndirectTier)>> {
    let layout = ext3_layout(registry)?;
    let inode = read_inode(dev, layout, ino)?;
    let limit = inode.size_in_blocks(registry.block_size().get());
    let map = walk_block_map(dev, registry.block_size(), &inode, limit)?;
    for (block, tier) in &map.indirect {
        layout.learn_indirect(*block, ino, *tier);
    }
    tracing::info!(
        target: "fsp::classify",
        inode = ino.0,
        blocks = map.indirect.len(),
        "indirect blocks learned"
    );
    Ok(map.indirect)
}
