//! Fault descriptions and the single-slot injection engine.

use crate::classify::FsSemantics;
use crate::registry::LayoutRegistry;
use fsp_block::ByteDevice;
use fsp_error::{FspError, Result};
use fsp_types::{BlockNumber, Direction, FsVariant, IndirectTier, InodeNumber, SemanticBlockType};
use parking_lot::Mutex;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FaultDirection {
    Read,
    Write,
    #[default]
    Either,
}

impl FaultDirection {
    #[must_use]
    pub fn matches(self, direction: Direction) -> bool {
        match self {
            Self::Either => true,
            Self::Read => direction == Direction::Read,
            Self::Write => direction == Direction::Write,
        }
    }
}

/// What happens to a matched block.
///
/// `Corrupt` is accepted but payload mutation is not modeled: it fails the
/// block exactly like `Fail`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FaultKind {
    #[default]
    Fail,
    Corrupt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Persistence {
    /// Retired after the first match.
    #[default]
    Transient,
    /// Stays queued until removed with force.
    Sticky,
}

/// ext3-only narrowing of a fault to one inode's blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext3Refinement {
    pub inode: InodeNumber,
    /// Logical block within the file, for data faults.
    #[serde(default)]
    pub logical_block: Option<u64>,
    /// Which pointer tree, for indirect-block faults.
    #[serde(default)]
    pub indirect_tier: Option<IndirectTier>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultSpec {
    #[serde(default)]
    pub direction: FaultDirection,
    #[serde(default)]
    pub kind: FaultKind,
    #[serde(default)]
    pub persistence: Persistence,
    pub filesystem: FsVariant,
    pub target: SemanticBlockType,
    /// Exact block; `None` (or `-1` on the wire) leaves it unconstrained.
    #[serde(default, deserialize_with = "block_or_unset")]
    pub block: Option<BlockNumber>,
    #[serde(default)]
    pub refinement: Option<Ext3Refinement>,
}

fn block_or_unset<'de, D>(deserializer: D) -> std::result::Result<Option<BlockNumber>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<i64>::deserialize(deserializer)?;
    Ok(raw
        .and_then(|value| u64::try_from(value).ok())
        .map(BlockNumber))
}

impl FaultSpec {
    /// A transient, either-direction `Fail` fault on every block of `target`.
    #[must_use]
    pub fn new(filesystem: FsVariant, target: SemanticBlockType) -> Self {
        Self {
            direction: FaultDirection::Either,
            kind: FaultKind::Fail,
            persistence: Persistence::Transient,
            filesystem,
            target,
            block: None,
            refinement: None,
        }
    }

    #[must_use]
    pub fn with_direction(mut self, direction: FaultDirection) -> Self {
        self.direction = direction;
        self
    }

    #[must_use]
    pub fn with_kind(mut self, kind: FaultKind) -> Self {
        self.kind = kind;
        self
    }

    #[must_use]
    pub fn with_persistence(mut self, persistence: Persistence) -> Self {
        self.persistence = persistence;
        self
    }

    #[must_use]
    pub fn at_block(mut self, block: BlockNumber) -> Self {
        self.block = Some(block);
        self
    }

    #[must_use]
    pub fn with_refinement(mut self, refinement: Ext3Refinement) -> Self {
        self.refinement = Some(refinement);
        self
    }

    #[must_use]
    pub fn is_sticky(&self) -> bool {
        self.persistence == Persistence::Sticky
    }

    /// Direction and type check, before any variant-specific narrowing.
    #[must_use]
    pub fn matches_io(&self, direction: Direction, ty: SemanticBlockType) -> bool {
        self.direction.matches(direction)
            && (self.target == SemanticBlockType::Any || self.target == ty)
    }
}

impl fmt::Display for FaultSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:?} {:?} {:?} target={}",
            self.filesystem, self.direction, self.kind, self.persistence, self.target
        )?;
        match self.block {
            Some(block) => write!(f, " block={block}")?,
            None => f.write_str(" block=any")?,
        }
        if let Some(refinement) = &self.refinement {
            write!(f, " inode={}", refinement.inode)?;
            if let Some(logical) = refinement.logical_block {
                write!(f, " logical={logical}")?;
            }
            if let Some(tier) = refinement.indirect_tier {
                write!(f, " tier={tier:?}")?;
            }
        }
        Ok(())
    }
}

// ── Slot ────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct SlotState {
    spec: Option<FaultSpec>,
    injected: bool,
    administered: u64,
}

/// Holds at most one pending fault for an observed instance.
#[derive(Debug)]
pub struct FaultSlot {
    variant: FsVariant,
    state: Mutex<SlotState>,
}

impl FaultSlot {
    #[must_use]
    pub fn new(variant: FsVariant) -> Self {
        Self {
            variant,
            state: Mutex::new(SlotState::default()),
        }
    }

    fn check_variant(&self, spec: &FaultSpec) -> Result<()> {
        if spec.filesystem == self.variant {
            return Ok(());
        }
        Err(FspError::FilesystemMismatch {
            observed: self.variant.to_string(),
            requested: spec.filesystem.to_string(),
        })
    }

    /// Queue a fault. Rejected with no state change when one is pending or
    /// it targets another filesystem variant.
    pub fn queue(&self, spec: FaultSpec) -> Result<()> {
        self.check_variant(&spec)?;
        let mut state = self.state.lock();
        if state.spec.is_some() {
            tracing::warn!(target: "fsp::fault", "fault already queued; request rejected");
            return Err(FspError::FaultAlreadyQueued);
        }
        tracing::info!(target: "fsp::fault", fault = %spec, "fault queued");
        state.spec = Some(spec);
        state.injected = false;
        Ok(())
    }

    /// Replace the pending fault, or queue it when the slot is empty.
    ///
    /// Re-arming a retired transient fault makes it eligible again.
    pub fn rearm(&self, spec: FaultSpec) -> Result<()> {
        self.check_variant(&spec)?;
        let mut state = self.state.lock();
        tracing::info!(
            target: "fsp::fault",
            fault = %spec,
            replaced = state.spec.is_some(),
            "fault re-armed"
        );
        state.spec = Some(spec);
        state.injected = false;
        Ok(())
    }

    /// Remove the pending fault. A sticky fault survives unless `force`.
    ///
    /// Returns whether the slot is now empty.
    pub fn remove(&self, force: bool) -> Result<bool> {
        let mut state = self.state.lock();
        let Some(spec) = &state.spec else {
            return Err(FspError::NoFaultQueued);
        };
        if spec.is_sticky() && !force {
            tracing::info!(target: "fsp::fault", "sticky fault kept; remove with force");
            return Ok(false);
        }
        tracing::info!(target: "fsp::fault", "fault removed");
        state.spec = None;
        Ok(true)
    }

    #[must_use]
    pub fn pending(&self) -> Option<FaultSpec> {
        self.state.lock().spec.clone()
    }

    /// Whether the most recently queued fault has been administered.
    #[must_use]
    pub fn fault_injected(&self) -> bool {
        self.state.lock().injected
    }

    #[must_use]
    pub fn administered(&self) -> u64 {
        self.state.lock().administered
    }

    /// Swap in a resolved spec, unless the pending one changed meanwhile.
    pub fn update_pending(&self, old: &FaultSpec, new: FaultSpec) -> bool {
        let mut state = self.state.lock();
        if state.spec.as_ref() != Some(old) {
            return false;
        }
        state.spec = Some(new);
        true
    }

    /// Resolve the pending fault's refinement to a concrete block.
    ///
    /// Metadata is read without holding the slot.
    pub fn process(
        &self,
        semantics: &dyn FsSemantics,
        registry: &LayoutRegistry,
        dev: &dyn ByteDevice,
    ) -> Result<FaultSpec> {
        let old = self.pending().ok_or(FspError::NoFaultQueued)?;
        let mut resolved = old.clone();
        semantics.process_fault(registry, dev, &mut resolved)?;
        if self.update_pending(&old, resolved.clone()) {
            tracing::info!(target: "fsp::fault", fault = %resolved, "fault refinement resolved");
        }
        Ok(resolved)
    }

    /// Match one classified block against the pending fault.
    ///
    /// On a match the fault is returned and, unless sticky, retired, so it
    /// is never examined again for later blocks of the same request.
    pub fn evaluate(
        &self,
        semantics: &dyn FsSemantics,
        registry: &LayoutRegistry,
        direction: Direction,
        block: BlockNumber,
        ty: SemanticBlockType,
    ) -> Option<FaultSpec> {
        let mut state = self.state.lock();
        let sticky = {
            let spec = state.spec.as_ref()?;
            if spec.filesystem != semantics.variant()
                || !spec.matches_io(direction, ty)
                || !semantics.fault_matches(registry, spec, block, ty)
            {
                return None;
            }
            spec.is_sticky()
        };
        let spec = if sticky {
            state.spec.clone()?
        } else {
            state.spec.take()?
        };
        state.injected = true;
        state.administered += 1;
        tracing::info!(
            target: "fsp::fault",
            block = block.0,
            block_type = %ty,
            direction = ?direction,
            fault = %spec,
            "fault administered"
        );
        Some(spec)
    }
}
