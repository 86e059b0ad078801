//! Layout discovery.
//!
//! Reads superblocks, group descriptors and the journal's block map through
//! a [`ByteDevice`] and assembles a [`LayoutRegistry`]. Nothing is published
//! until every read and parse has succeeded.

use crate::registry::{
    Ext3Geometry, Ext3Layout, FixedLayout, GroupLayout, JournalLayout, LayoutRegistry,
};
use crate::{metadata_error, parse_error_to_fsp};
use fsp_block::{ByteDevice, read_region};
use fsp_error::{FspError, Result};
use fsp_ondisk::ext3::{
    EXT3_GROUP_DESC_SIZE, EXT3_NDIR_BLOCKS, EXT3_SUPERBLOCK_OFFSET, EXT3_SUPERBLOCK_SIZE,
};
use fsp_ondisk::jfs::{JFS_SUPERBLOCK_OFFSET, JFS_SUPERBLOCK_SIZE, LOG_SUPER_BLOCK};
use fsp_ondisk::reiserfs::{REISERFS_SUPERBLOCK_OFFSET, REISERFS_SUPERBLOCK_SIZE};
use fsp_ondisk::{
    Ext3GroupDesc, Ext3Inode, Ext3Superblock, JbdSuperblock, JfsSuperblock, ReiserfsSuperblock,
    parse_block_pointers,
};
use fsp_types::{BlockNumber, BlockSize, FsVariant, GroupNumber, IndirectTier, InodeNumber};
use std::collections::{BTreeMap, HashSet};

/// Discover the layout of the filesystem on `dev`.
pub fn discover(variant: FsVariant, dev: &dyn ByteDevice) -> Result<LayoutRegistry> {
    let registry = match variant {
        FsVariant::Ext3 => discover_ext3(dev),
        FsVariant::Reiserfs => discover_reiserfs(dev),
        FsVariant::Jfs => discover_jfs(dev),
    };
    match &registry {
        Ok(registry) => tracing::info!(
            target: "fsp::registry",
            filesystem = %variant,
            block_size = registry.block_size().get(),
            journal_blocks = registry.journal().len(),
            "layout discovered"
        ),
        Err(err) => tracing::error!(
            target: "fsp::registry",
            filesystem = %variant,
            error = %err,
            "layout discovery failed"
        ),
    }
    registry
}

// ── Shared block reads ──────────────────────────────────────────────────────

pub(crate) fn read_block(
    dev: &dyn ByteDevice,
    block_size: BlockSize,
    block: BlockNumber,
) -> Result<Vec<u8>> {
    let offset = block_size
        .block_to_byte(block)
        .ok_or_else(|| FspError::Format(format!("block {block} offset overflows")))?;
    read_region(dev, offset, block_size.as_usize())
}

/// Read and decode one ext3 inode.
pub(crate) fn read_inode(
    dev: &dyn ByteDevice,
    layout: &Ext3Layout,
    ino: InodeNumber,
) -> Result<Ext3Inode> {
    let (block, offset) = layout
        .inode_location(ino)
        .ok_or_else(|| FspError::Format(format!("inode {ino} outside every group")))?;
    let bytes = read_block(dev, layout.geometry().block_size, block)?;
    let inode_size = usize::from(layout.geometry().inode_size);
    let raw = bytes
        .get(offset..offset + inode_size)
        .ok_or_else(|| FspError::Corruption {
            block: block.0,
            detail: format!("inode {ino} runs past its table block"),
        })?;
    Ext3Inode::parse_from_bytes(raw).map_err(|e| metadata_error(block, &e))
}

/// Blocks reachable from an inode's block map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockMap {
    /// Data blocks in logical order.
    pub data: Vec<BlockNumber>,
    /// Pointer blocks with the tree they belong to.
    pub indirect: Vec<(BlockNumber, IndirectTier)>,
}

/// Walk direct pointers and the three indirect trees, stopping after
/// `limit` data blocks.
///
/// The trees are walked with an explicit stack; children are pushed in
/// reverse so data blocks come out in logical order.
pub(crate) fn walk_block_map(
    dev: &dyn ByteDevice,
    block_size: BlockSize,
    inode: &Ext3Inode,
    limit: u64,
) -> Result<BlockMap> {
    let limit = usize::try_from(limit).unwrap_or(usize::MAX);
    let mut map = BlockMap::default();
    map.data.extend(
        inode
            .direct_blocks()
            .map(|b| BlockNumber(u64::from(b)))
            .take(limit),
    );

    for tier in IndirectTier::ALL {
        let Some(root) = inode.indirect_root(tier) else {
            continue;
        };
        let mut stack = vec![(BlockNumber(u64::from(root)), tier.depth())];
        while let Some((block, depth)) = stack.pop() {
            if map.data.len() >= limit {
                return Ok(map);
            }
            map.indirect.push((block, tier));
            let pointers = parse_block_pointers(&read_block(dev, block_size, block)?);
            let children = pointers
                .into_iter()
                .filter(|p| *p != 0)
                .map(|p| BlockNumber(u64::from(p)));
            if depth == 1 {
                let room = limit - map.data.len();
                map.data.extend(children.take(room));
            } else {
                let mut next: Vec<_> = children.map(|c| (c, depth - 1)).collect();
                next.reverse();
                stack.extend(next);
            }
        }
    }
    Ok(map)
}

/// Translate a logical block of an inode to its physical block.
pub(crate) fn map_logical_block(
    dev: &dyn ByteDevice,
    block_size: BlockSize,
    inode: &Ext3Inode,
    logical: u64,
) -> Result<Option<BlockNumber>> {
    let nonzero = |p: u32| (p != 0).then(|| BlockNumber(u64::from(p)));
    if let Ok(index) = usize::try_from(logical) {
        if index < EXT3_NDIR_BLOCKS {
            return Ok(nonzero(inode.block[index]));
        }
    }
    let per_block = u64::from(block_size.get() / 4);
    let mut remaining = logical - EXT3_NDIR_BLOCKS as u64;
    for tier in IndirectTier::ALL {
        let span = per_block.saturating_pow(tier.depth());
        if remaining >= span {
            remaining -= span;
            continue;
        }
        let Some(mut pointer) = inode.indirect_root(tier) else {
            return Ok(None);
        };
        for level in (0..tier.depth()).rev() {
            let slot = usize::try_from(remaining / per_block.pow(level) % per_block)
                .map_err(|_| FspError::Format("pointer slot overflows usize".to_owned()))?;
            let block = BlockNumber(u64::from(pointer));
            let pointers = parse_block_pointers(&read_block(dev, block_size, block)?);
            pointer = pointers.get(slot).copied().unwrap_or(0);
            if pointer == 0 {
                return Ok(None);
            }
        }
        return Ok(nonzero(pointer));
    }
    Ok(None)
}

// ── ext3 ────────────────────────────────────────────────────────────────────

fn discover_ext3(dev: &dyn ByteDevice) -> Result<LayoutRegistry> {
    let region = read_region(dev, EXT3_SUPERBLOCK_OFFSET as u64, EXT3_SUPERBLOCK_SIZE)?;
    let sb = Ext3Superblock::parse_superblock_region(&region).map_err(|e| parse_error_to_fsp(&e))?;
    sb.validate_geometry().map_err(|e| parse_error_to_fsp(&e))?;
    if !sb.has_journal() || sb.journal_inum == 0 {
        return Err(FspError::JournalNotFound(
            "superblock advertises no journal inode".to_owned(),
        ));
    }
    if sb.journal_dev != 0 {
        return Err(FspError::UnsupportedFeature(format!(
            "external journal device {:#x}",
            sb.journal_dev
        )));
    }
    let geometry = Ext3Geometry::from_superblock(&sb).map_err(|e| parse_error_to_fsp(&e))?;
    let block_size = geometry.block_size;

    let groups = read_group_table(dev, &sb, &geometry)?;
    tracing::debug!(
        target: "fsp::registry",
        groups = groups.len(),
        inode_blocks_per_group = geometry.inode_blocks_per_group,
        "group descriptors read"
    );

    // The journal's own pointer blocks are only known after the walk.
    let probe = Ext3Layout::new(geometry, groups.clone(), HashSet::new());
    let journal_inode = read_inode(dev, &probe, geometry.journal_inode)?;
    let limit = journal_inode.size_in_blocks(block_size.get());
    let limit = if limit == 0 { u64::MAX } else { limit };
    let map = walk_block_map(dev, block_size, &journal_inode, limit)?;
    if map.data.is_empty() {
        return Err(FspError::JournalNotFound(format!(
            "journal inode {} maps no blocks",
            geometry.journal_inode
        )));
    }

    let log_start = match read_block(dev, block_size, map.data[0])
        .and_then(|bytes| JbdSuperblock::parse(&bytes).map_err(|e| metadata_error(map.data[0], &e)))
    {
        Ok(jsb) => usize::try_from(jsb.first).unwrap_or(1).max(1),
        Err(err) => {
            tracing::warn!(
                target: "fsp::registry",
                block = map.data[0].0,
                error = %err,
                "journal superblock unreadable; assuming log starts at index 1"
            );
            1
        }
    };

    let journal_indirect: HashSet<BlockNumber> = map.indirect.iter().map(|(b, _)| *b).collect();
    let log_len = map.data.len();
    let mut journal_blocks = map.data;
    let mut pointer_blocks: Vec<BlockNumber> = journal_indirect.iter().copied().collect();
    pointer_blocks.sort_unstable();
    journal_blocks.extend(pointer_blocks);
    // Pointer blocks join the block set but never hold log positions.
    let journal = JournalLayout::with_log_len(journal_blocks, log_start, log_len);

    Ok(LayoutRegistry::new(
        block_size,
        journal,
        FixedLayout::Ext3(Ext3Layout::new(geometry, groups, journal_indirect)),
    ))
}

fn read_group_table(
    dev: &dyn ByteDevice,
    sb: &Ext3Superblock,
    geometry: &Ext3Geometry,
) -> Result<BTreeMap<GroupNumber, GroupLayout>> {
    let block_size = geometry.block_size;
    let table_offset = block_size
        .block_to_byte(geometry.gdt_start)
        .ok_or_else(|| FspError::Format("group descriptor table offset overflows".to_owned()))?;
    let table_len = usize::try_from(geometry.gdt_blocks)
        .ok()
        .and_then(|blocks| blocks.checked_mul(block_size.as_usize()))
        .ok_or_else(|| FspError::Format("group descriptor table too large".to_owned()))?;
    let table = read_region(dev, table_offset, table_len)?;

    let mut groups = BTreeMap::new();
    for (index, raw) in table
        .chunks_exact(EXT3_GROUP_DESC_SIZE)
        .take(usize::try_from(sb.groups_count()).unwrap_or(usize::MAX))
        .enumerate()
    {
        let desc = Ext3GroupDesc::parse_from_bytes(raw).map_err(|e| parse_error_to_fsp(&e))?;
        if desc.block_bitmap == 0 {
            break;
        }
        let group = GroupNumber(u32::try_from(index).unwrap_or(u32::MAX));
        groups.insert(
            group,
            GroupLayout {
                inode_table: BlockNumber(u64::from(desc.inode_table)),
                inode_bitmap: BlockNumber(u64::from(desc.inode_bitmap)),
                data_bitmap: BlockNumber(u64::from(desc.block_bitmap)),
            },
        );
    }
    if groups.is_empty() {
        return Err(FspError::InvalidGeometry(
            "group descriptor table lists no groups".to_owned(),
        ));
    }
    Ok(groups)
}

// ── reiserfs ────────────────────────────────────────────────────────────────

fn discover_reiserfs(dev: &dyn ByteDevice) -> Result<LayoutRegistry> {
    let region = read_region(
        dev,
        REISERFS_SUPERBLOCK_OFFSET as u64,
        REISERFS_SUPERBLOCK_SIZE,
    )?;
    let sb = ReiserfsSuperblock::parse_superblock_region(&region)
        .map_err(|e| parse_error_to_fsp(&e))?;
    let block_size = sb.block_size().map_err(|e| parse_error_to_fsp(&e))?;
    if sb.journal.device != 0 {
        return Err(FspError::UnsupportedFeature(format!(
            "external journal device {:#x}",
            sb.journal.device
        )));
    }
    if sb.journal.size == 0 {
        return Err(FspError::JournalNotFound(
            "superblock reports a zero-length journal".to_owned(),
        ));
    }
    let journal = JournalLayout::contiguous(
        BlockNumber(u64::from(sb.journal.first_block)),
        u64::from(sb.journal.size),
        0,
    );
    Ok(LayoutRegistry::new(
        block_size,
        journal,
        FixedLayout::Reiserfs {
            superblock: BlockNumber(sb.superblock_block()),
            journal_header: BlockNumber(sb.journal_header_block()),
        },
    ))
}

// ── jfs ─────────────────────────────────────────────────────────────────────

fn discover_jfs(dev: &dyn ByteDevice) -> Result<LayoutRegistry> {
    let region = read_region(dev, JFS_SUPERBLOCK_OFFSET as u64, JFS_SUPERBLOCK_SIZE)?;
    let sb = JfsSuperblock::parse_superblock_region(&region).map_err(|e| parse_error_to_fsp(&e))?;
    let block_size = sb.block_size().map_err(|e| parse_error_to_fsp(&e))?;
    if sb.logpxd.length == 0 {
        return Err(FspError::JournalNotFound(
            "no inline log extent; external log devices are not observed".to_owned(),
        ));
    }
    let first = BlockNumber(sb.logpxd.address);
    let log_super = first
        .checked_add(LOG_SUPER_BLOCK)
        .ok_or_else(|| FspError::Format("log extent address overflows".to_owned()))?;
    // Pages after the log superblock form the circular area.
    let journal = JournalLayout::contiguous(first, u64::from(sb.logpxd.length), 2);
    Ok(LayoutRegistry::new(
        block_size,
        journal,
        FixedLayout::Jfs {
            superblock: BlockNumber(sb.superblock_block()),
            log_super,
        },
    ))
}
