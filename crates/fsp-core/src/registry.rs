//! Per-instance layout registry.
//!
//! Everything the classifier needs to know about where metadata lives:
//! fixed-location tables discovered at start, the journal's block list, and
//! the pending journal-position to real-block mappings learned from
//! descriptor blocks. Discovery lives in [`crate::discover`]; this module
//! only holds and queries the result.

use fsp_ondisk::Ext3Superblock;
use fsp_types::{
    BlockNumber, BlockSize, FsVariant, GroupNumber, IndirectTier, InodeNumber, ParseError,
    inode_index_in_group, inode_to_group,
};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};

// ── Journal ─────────────────────────────────────────────────────────────────

/// The journal's blocks in logical order.
///
/// Indices `log_start..log_end` form the circular log area; positions
/// computed past `log_end` wrap back to `log_start`. Blocks after `log_end`
/// belong to the journal but never hold log positions.
#[derive(Debug, Clone, Default, Serialize)]
pub struct JournalLayout {
    blocks: Vec<BlockNumber>,
    #[serde(skip)]
    index: HashMap<BlockNumber, usize>,
    log_start: usize,
    log_end: usize,
}

impl JournalLayout {
    #[must_use]
    pub fn new(blocks: Vec<BlockNumber>, log_start: usize) -> Self {
        let len = blocks.len();
        Self::with_log_len(blocks, log_start, len)
    }

    #[must_use]
    pub fn with_log_len(blocks: Vec<BlockNumber>, log_start: usize, log_len: usize) -> Self {
        let mut index = HashMap::with_capacity(blocks.len());
        for (i, block) in blocks.iter().enumerate() {
            index.entry(*block).or_insert(i);
        }
        let log_end = log_len.min(blocks.len());
        let log_start = log_start.min(log_end.saturating_sub(1));
        Self {
            blocks,
            index,
            log_start,
            log_end,
        }
    }

    /// Journal occupying `len` contiguous blocks from `first`.
    #[must_use]
    pub fn contiguous(first: BlockNumber, len: u64, log_start: usize) -> Self {
        Self::new((first.0..first.0 + len).map(BlockNumber).collect(), log_start)
    }

    #[must_use]
    pub fn blocks(&self) -> &[BlockNumber] {
        &self.blocks
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
    pub fn log_start(&self) -> usize {
        self.log_start
    }

    #[must_use]
    pub fn contains(&self, block: BlockNumber) -> bool {
        self.index.contains_key(&block)
    }

    #[must_use]
    pub fn position_of(&self, block: BlockNumber) -> Option<usize> {
        self.index.get(&block).copied()
    }

    /// The journal block `n` places after `block`, wrapping inside the log area.
    #[must_use]
    pub fn nth_after(&self, block: BlockNumber, n: usize) -> Option<BlockNumber> {
        let from = self.position_of(block).filter(|i| *i < self.log_end)?;
        let target = from.checked_add(n)?;
        if target < self.log_end {
            return self.blocks.get(target).copied();
        }
        let ring = self.log_end.checked_sub(self.log_start).filter(|r| *r > 0)?;
        let wrapped = self.log_start + (target - self.log_end) % ring;
        self.blocks.get(wrapped).copied()
    }
}

// ── Pending checkpoint mappings ─────────────────────────────────────────────

/// Real blocks that were logged and not yet written back home, keyed by
/// real block, valued by the journal position holding the logged copy.
#[derive(Debug, Default)]
pub struct PendingMap {
    by_real: HashMap<BlockNumber, BlockNumber>,
}

impl PendingMap {
    /// Insert-if-absent. Returns `false` when `real` is already pending.
    pub fn learn(&mut self, position: BlockNumber, real: BlockNumber) -> bool {
        if self.by_real.contains_key(&real) {
            return false;
        }
        self.by_real.insert(real, position);
        true
    }

    /// Remove the mapping for `real`, returning its journal position.
    pub fn consume(&mut self, real: BlockNumber) -> Option<BlockNumber> {
        self.by_real.remove(&real)
    }

    #[must_use]
    pub fn lookup_position(&self, real: BlockNumber) -> Option<BlockNumber> {
        self.by_real.get(&real).copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_real.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_real.is_empty()
    }

    pub fn clear(&mut self) {
        self.by_real.clear();
    }

    /// `(real, position)` pairs sorted by real block.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(BlockNumber, BlockNumber)> {
        let mut out: Vec<_> = self.by_real.iter().map(|(r, p)| (*r, *p)).collect();
        out.sort_unstable();
        out
    }
}

// ── ext3 fixed layout ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GroupLayout {
    pub inode_table: BlockNumber,
    pub inode_bitmap: BlockNumber,
    pub data_bitmap: BlockNumber,
}

/// Superblock-derived geometry kept after discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Ext3Geometry {
    pub block_size: BlockSize,
    pub inodes_per_group: u32,
    pub inode_size: u16,
    pub inode_blocks_per_group: u32,
    pub superblock_block: BlockNumber,
    pub gdt_start: BlockNumber,
    pub gdt_blocks: u64,
    pub journal_inode: InodeNumber,
}

impl Ext3Geometry {
    pub fn from_superblock(sb: &Ext3Superblock) -> Result<Self, ParseError> {
        Ok(Self {
            block_size: sb.block_size()?,
            inodes_per_group: sb.inodes_per_group,
            inode_size: sb.inode_size,
            inode_blocks_per_group: sb.inode_blocks_per_group(),
            superblock_block: BlockNumber(sb.superblock_block()),
            gdt_start: BlockNumber(sb.group_desc_table_block()),
            gdt_blocks: sb.group_desc_table_blocks(),
            journal_inode: InodeNumber(u64::from(sb.journal_inum)),
        })
    }
}

/// Blocks learned at runtime from inode block maps.
#[derive(Debug, Default)]
struct LearnedBlocks {
    directories: HashMap<BlockNumber, InodeNumber>,
    indirect: HashMap<BlockNumber, (InodeNumber, IndirectTier)>,
}

#[derive(Debug)]
pub struct Ext3Layout {
    geometry: Ext3Geometry,
    groups: BTreeMap<GroupNumber, GroupLayout>,
    inode_tables: BTreeMap<BlockNumber, GroupNumber>,
    inode_bitmaps: HashMap<BlockNumber, GroupNumber>,
    data_bitmaps: HashMap<BlockNumber, GroupNumber>,
    journal_indirect: HashSet<BlockNumber>,
    learned: RwLock<LearnedBlocks>,
}

impl Ext3Layout {
    #[must_use]
    pub fn new(
        geometry: Ext3Geometry,
        groups: BTreeMap<GroupNumber, GroupLayout>,
        journal_indirect: HashSet<BlockNumber>,
    ) -> Self {
        let mut inode_tables = BTreeMap::new();
        let mut inode_bitmaps = HashMap::new();
        let mut data_bitmaps = HashMap::new();
        for (group, layout) in &groups {
            inode_tables.insert(layout.inode_table, *group);
            inode_bitmaps.insert(layout.inode_bitmap, *group);
            data_bitmaps.insert(layout.data_bitmap, *group);
        }
        Self {
            geometry,
            groups,
            inode_tables,
            inode_bitmaps,
            data_bitmaps,
            journal_indirect,
            learned: RwLock::new(LearnedBlocks::default()),
        }
    }

    /// Layout from explicit inode-table starts, for building registries by hand.
    ///
    /// Bitmaps are placed just before each table so they do not collide
    /// with the tables themselves.
    #[must_use]
    pub fn from_groups(
        inode_table_starts: &[(u32, u64)],
        inode_blocks_per_group: u32,
        block_size: BlockSize,
    ) -> Self {
        let groups = inode_table_starts
            .iter()
            .map(|&(group, start)| {
                (
                    GroupNumber(group),
                    GroupLayout {
                        inode_table: BlockNumber(start),
                        inode_bitmap: BlockNumber(start.saturating_sub(1)),
                        data_bitmap: BlockNumber(start.saturating_sub(2)),
                    },
                )
            })
            .collect();
        let geometry = Ext3Geometry {
            block_size,
            inodes_per_group: inode_blocks_per_group * (block_size.get() / 128),
            inode_size: 128,
            inode_blocks_per_group,
            superblock_block: BlockNumber(0),
            gdt_start: BlockNumber(1),
            gdt_blocks: 1,
            journal_inode: InodeNumber::JOURNAL,
        };
        Self::new(geometry, groups, HashSet::new())
    }

    #[must_use]
    pub fn geometry(&self) -> &Ext3Geometry {
        &self.geometry
    }

    #[must_use]
    pub fn groups(&self) -> &BTreeMap<GroupNumber, GroupLayout> {
        &self.groups
    }

    /// Group whose inode table contains `block`.
    ///
    /// Nearest table start at or below the block, then a bounds check.
    #[must_use]
    pub fn inode_table_group(&self, block: BlockNumber) -> Option<GroupNumber> {
        let (start, group) = self.inode_tables.range(..=block).next_back()?;
        let end = start.0 + u64::from(self.geometry.inode_blocks_per_group);
        (block.0 < end).then_some(*group)
    }

    #[must_use]
    pub fn is_inode_block(&self, block: BlockNumber) -> bool {
        self.inode_table_group(block).is_some()
    }

    #[must_use]
    pub fn is_superblock(&self, block: BlockNumber) -> bool {
        block == self.geometry.superblock_block
    }

    #[must_use]
    pub fn is_inode_bitmap(&self, block: BlockNumber) -> bool {
        self.inode_bitmaps.contains_key(&block)
    }

    #[must_use]
    pub fn is_data_bitmap(&self, block: BlockNumber) -> bool {
        self.data_bitmaps.contains_key(&block)
    }

    #[must_use]
    pub fn is_group_descriptor(&self, block: BlockNumber) -> bool {
        let start = self.geometry.gdt_start.0;
        (start..start + self.geometry.gdt_blocks).contains(&block.0)
    }

    #[must_use]
    pub fn is_journal_indirect(&self, block: BlockNumber) -> bool {
        self.journal_indirect.contains(&block)
    }

    #[must_use]
    pub fn journal_indirect_blocks(&self) -> &HashSet<BlockNumber> {
        &self.journal_indirect
    }

    /// Where an inode's on-disk copy lives: the table block and the byte
    /// offset inside it.
    #[must_use]
    pub fn inode_location(&self, ino: InodeNumber) -> Option<(BlockNumber, usize)> {
        let geometry = &self.geometry;
        let group = inode_to_group(ino, geometry.inodes_per_group);
        let table = self.groups.get(&group)?.inode_table;
        let byte = u64::from(inode_index_in_group(ino, geometry.inodes_per_group))
            * u64::from(geometry.inode_size);
        let block_size = u64::from(geometry.block_size.get());
        let block = table.checked_add(byte / block_size)?;
        let offset = usize::try_from(byte % block_size).ok()?;
        Some((block, offset))
    }

    #[must_use]
    pub fn inode_block(&self, ino: InodeNumber) -> Option<BlockNumber> {
        self.inode_location(ino).map(|(block, _)| block)
    }

    pub fn learn_directory(&self, block: BlockNumber, owner: InodeNumber) {
        self.learned.write().directories.insert(block, owner);
    }

    pub fn learn_indirect(&self, block: BlockNumber, owner: InodeNumber, tier: IndirectTier) {
        self.learned.write().indirect.insert(block, (owner, tier));
    }

    #[must_use]
    pub fn is_directory(&self, block: BlockNumber) -> bool {
        self.learned.read().directories.contains_key(&block)
    }

    #[must_use]
    pub fn indirect_owner(&self, block: BlockNumber) -> Option<(InodeNumber, IndirectTier)> {
        self.learned.read().indirect.get(&block).copied()
    }

    #[must_use]
    pub fn learned_counts(&self) -> (usize, usize) {
        let learned = self.learned.read();
        (learned.directories.len(), learned.indirect.len())
    }

    pub fn forget_learned(&self) {
        let mut learned = self.learned.write();
        learned.directories.clear();
        learned.indirect.clear();
    }
}

// ── Registry ────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum FixedLayout {
    Ext3(Ext3Layout),
    Reiserfs {
        superblock: BlockNumber,
        journal_header: BlockNumber,
    },
    Jfs {
        superblock: BlockNumber,
        log_super: BlockNumber,
    },
}

impl FixedLayout {
    #[must_use]
    pub fn variant(&self) -> FsVariant {
        match self {
            Self::Ext3(_) => FsVariant::Ext3,
            Self::Reiserfs { .. } => FsVariant::Reiserfs,
            Self::Jfs { .. } => FsVariant::Jfs,
        }
    }
}

/// Everything discovered about one observed filesystem instance.
///
/// Assembled by discovery and only handed out once complete. The pending
/// map is the only part that mutates on the request path.
#[derive(Debug)]
pub struct LayoutRegistry {
    block_size: BlockSize,
    journal: JournalLayout,
    fixed: FixedLayout,
    pending: Mutex<PendingMap>,
}

impl LayoutRegistry {
    #[must_use]
    pub fn new(block_size: BlockSize, journal: JournalLayout, fixed: FixedLayout) -> Self {
        Self {
            block_size,
            journal,
            fixed,
            pending: Mutex::new(PendingMap::default()),
        }
    }

    #[must_use]
    pub fn variant(&self) -> FsVariant {
        self.fixed.variant()
    }

    #[must_use]
    pub fn block_size(&self) -> BlockSize {
        self.block_size
    }

    #[must_use]
    pub fn journal(&self) -> &JournalLayout {
        &self.journal
    }

    #[must_use]
    pub fn fixed(&self) -> &FixedLayout {
        &self.fixed
    }

    #[must_use]
    pub fn ext3(&self) -> Option<&Ext3Layout> {
        match &self.fixed {
            FixedLayout::Ext3(layout) => Some(layout),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_journal_block(&self, block: BlockNumber) -> bool {
        self.journal.contains(block)
    }

    pub fn learn_pending(&self, position: BlockNumber, real: BlockNumber) -> bool {
        let learned = self.pending.lock().learn(position, real);
        if learned {
            tracing::debug!(
                target: "fsp::registry",
                position = position.0,
                real = real.0,
                "journaled block pending checkpoint"
            );
        } else {
            tracing::debug!(
                target: "fsp::registry",
                position = position.0,
                real = real.0,
                "block journaled again before checkpoint"
            );
        }
        learned
    }

    /// Consume the pending entry for `real`, if any.
    pub fn consume_pending(&self, real: BlockNumber) -> Option<BlockNumber> {
        self.pending.lock().consume(real)
    }

    #[must_use]
    pub fn pending_position(&self, real: BlockNumber) -> Option<BlockNumber> {
        self.pending.lock().lookup_position(real)
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    #[must_use]
    pub fn pending_snapshot(&self) -> Vec<(BlockNumber, BlockNumber)> {
        self.pending.lock().snapshot()
    }

    pub fn clear_pending(&self) {
        self.pending.lock().clear();
    }

    /// Serializable view for inspection output.
    #[must_use]
    pub fn summary(&self) -> RegistrySummary {
        let (groups, directories, indirect) = match &self.fixed {
            FixedLayout::Ext3(layout) => {
                let (dirs, indirect) = layout.learned_counts();
                (
                    layout
                        .groups()
                        .iter()
                        .map(|(group, g)| (group.0, *g))
                        .collect(),
                    dirs,
                    indirect,
                )
            }
            _ => (Vec::new(), 0, 0),
        };
        let (superblock, journal_super) = match &self.fixed {
            FixedLayout::Ext3(layout) => (
                layout.geometry().superblock_block,
                self.journal.blocks().first().copied(),
            ),
            FixedLayout::Reiserfs {
                superblock,
                journal_header,
            } => (*superblock, Some(*journal_header)),
            FixedLayout::Jfs {
                superblock,
                log_super,
            } => (*superblock, Some(*log_super)),
        };
        RegistrySummary {
            variant: self.variant(),
            block_size: self.block_size.get(),
            superblock,
            journal_super,
            journal_blocks: self.journal.len(),
            journal_first: self.journal.blocks().first().copied(),
            journal_last: self.journal.blocks().last().copied(),
            log_start: self.journal.log_start(),
            groups,
            learned_directories: directories,
            learned_indirect: indirect,
            pending_checkpoints: self.pending_len(),
        }
    }

    /// Cross-check the ordered indexes: inode tables must not overlap each
    /// other, and no fixed metadata block may sit inside the journal.
    #[cfg(feature = "invariant-checks")]
    pub fn verify_consistency(&self) -> fsp_error::Result<()> {
        let FixedLayout::Ext3(layout) = &self.fixed else {
            return Ok(());
        };
        let span = u64::from(layout.geometry.inode_blocks_per_group);
        let mut stack: Vec<(BlockNumber, GroupNumber)> = layout
            .inode_tables
            .iter()
            .rev()
            .map(|(start, group)| (*start, *group))
            .collect();
        let mut previous_end: Option<(u64, GroupNumber)> = None;
        while let Some((start, group)) = stack.pop() {
            if let Some((end, prev_group)) = previous_end {
                if start.0 < end {
                    return Err(fsp_error::FspError::Corruption {
                        block: start.0,
                        detail: format!(
                            "inode table of group {group} overlaps group {prev_group}"
                        ),
                    });
                }
            }
            for offset in 0..span {
                let block = BlockNumber(start.0 + offset);
                if self.journal.contains(block) {
                    return Err(fsp_error::FspError::Corruption {
                        block: block.0,
                        detail: format!("inode table of group {group} inside the journal"),
                    });
                }
            }
            previous_end = Some((start.0 + span, group));
        }
        for block in layout.inode_bitmaps.keys().chain(layout.data_bitmaps.keys()) {
            if layout.is_inode_block(*block) || self.journal.contains(*block) {
                return Err(fsp_error::FspError::Corruption {
                    block: block.0,
                    detail: "bitmap block collides with inode table or journal".to_owned(),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistrySummary {
    pub variant: FsVariant,
    pub block_size: u32,
    pub superblock: BlockNumber,
    pub journal_super: Option<BlockNumber>,
    pub journal_blocks: usize,
    pub journal_first: Option<BlockNumber>,
    pub journal_last: Option<BlockNumber>,
    pub log_start: usize,
    pub groups: Vec<(u32, GroupLayout)>,
    pub learned_directories: usize,
    pub learned_indirect: usize,
    pub pending_checkpoints: usize,
}

impl std::fmt::Display for RegistrySummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "filesystem: {}", self.variant)?;
        writeln!(f, "block size: {}", self.block_size)?;
        writeln!(f, "superblock: {}", self.superblock)?;
        if let Some(block) = self.journal_super {
            writeln!(f, "journal superblock: {block}")?;
        }
        match (self.journal_first, self.journal_last) {
            (Some(first), Some(last)) => writeln!(
                f,
                "journal: {} blocks ({first}..={last}), log area from index {}",
                self.journal_blocks, self.log_start
            )?,
            _ => writeln!(f, "journal: empty")?,
        }
        for (group, layout) in &self.groups {
            writeln!(
                f,
                "group {group}: inode table {} inode bitmap {} data bitmap {}",
                layout.inode_table, layout.inode_bitmap, layout.data_bitmap
            )?;
        }
        writeln!(
            f,
            "learned: {} directory, {} indirect; pending checkpoints: {}",
            self.learned_directories, self.learned_indirect, self.pending_checkpoints
        )
    }
}
