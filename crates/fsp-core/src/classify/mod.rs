//! Block classification.
//!
//! Each filesystem variant implements [`FsSemantics`]: given a block's
//! sector, bytes and direction it decides what the block is to the
//! journaling protocol. Classification never fails; undecodable journal
//! blocks degrade to [`SemanticBlockType::Unknown`].

pub mod ext3;
pub mod jfs;
pub mod reiserfs;

pub use ext3::Ext3Semantics;
pub use jfs::JfsSemantics;
pub use reiserfs::ReiserfsSemantics;

use crate::fault::FaultSpec;
use crate::registry::LayoutRegistry;
use crate::trace::{TraceKind, TraceLog};
use fsp_block::ByteDevice;
use fsp_error::Result;
use fsp_types::{
    BlockNumber, Direction, FsVariant, JournalingMode, SectorNumber, SemanticBlockType,
};

/// Everything a classifier may consult or update for one block.
#[derive(Debug, Clone, Copy)]
pub struct ClassifyCx<'a> {
    pub registry: &'a LayoutRegistry,
    pub mode: JournalingMode,
    /// Destination for learned-tag records; `None` classifies silently.
    pub trace: Option<&'a TraceLog>,
}

impl<'a> ClassifyCx<'a> {
    #[must_use]
    pub fn new(registry: &'a LayoutRegistry, mode: JournalingMode) -> Self {
        Self {
            registry,
            mode,
            trace: None,
        }
    }

    #[must_use]
    pub fn with_trace(mut self, trace: &'a TraceLog) -> Self {
        self.trace = Some(trace);
        self
    }

    /// Record that the logged copy at `position` belongs home at `real`.
    pub(crate) fn learn_logged(&self, position: BlockNumber, real: BlockNumber) {
        self.registry.learn_pending(position, real);
        if let Some(trace) = self.trace {
            trace.mark(TraceKind::Descriptor, real.0, "jdesc");
        }
    }

    /// Checkpoint check shared by every variant: a write to a block that
    /// is still pending in the log consumes its entry.
    pub(crate) fn take_checkpoint(&self, block: BlockNumber, direction: Direction) -> bool {
        direction == Direction::Write && self.registry.consume_pending(block).is_some()
    }
}

/// Variant-specific classification and fault narrowing.
pub trait FsSemantics: Send + Sync + std::fmt::Debug {
    fn variant(&self) -> FsVariant;

    /// Semantic role of the block starting at `sector`.
    fn classify(
        &self,
        cx: &ClassifyCx<'_>,
        sector: SectorNumber,
        bytes: &[u8],
        direction: Direction,
    ) -> SemanticBlockType;

    fn is_journal_block(&self, registry: &LayoutRegistry, block: BlockNumber) -> bool {
        registry.is_journal_block(block)
    }

    /// Location check after direction and type already matched.
    fn fault_matches(
        &self,
        _registry: &LayoutRegistry,
        spec: &FaultSpec,
        block: BlockNumber,
        _ty: SemanticBlockType,
    ) -> bool {
        spec.block.is_none_or(|target| target == block)
    }

    /// Resolve a fault's refinement into a concrete block, reading metadata
    /// through `dev` as needed.
    fn process_fault(
        &self,
        _registry: &LayoutRegistry,
        _dev: &dyn ByteDevice,
        _spec: &mut FaultSpec,
    ) -> Result<()> {
        Ok(())
    }
}

#[must_use]
pub fn semantics_for(variant: FsVariant) -> Box<dyn FsSemantics> {
    match variant {
        FsVariant::Ext3 => Box::new(Ext3Semantics),
        FsVariant::Reiserfs => Box::new(ReiserfsSemantics::default()),
        FsVariant::Jfs => Box::new(JfsSemantics),
    }
}

/// Role of a block written outside the log, by journaling mode.
///
/// Full-data mode has no such role; it reports `Unordered` and the model
/// flags the write.
#[must_use]
pub fn unjournaled_role(mode: JournalingMode) -> SemanticBlockType {
    match mode {
        JournalingMode::Ordered => SemanticBlockType::Ordered,
        JournalingMode::Writeback | JournalingMode::Data => SemanticBlockType::Unordered,
    }
}
