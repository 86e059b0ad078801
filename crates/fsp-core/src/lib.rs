#![forbid(unsafe_code)]
//! Journaling-filesystem block observation.
//!
//! Discovers the static layout of an ext3, reiserfs or jfs image, classifies
//! every block of every request by its role in the journaling protocol,
//! replays writes through the protocol automaton of the mounted journaling
//! mode and injects single-shot or sticky faults into matching blocks.
//!
//! The entry point is [`Observer`], installed as the hook of an
//! [`fsp_block::InterposedDevice`].

pub mod classify;
pub mod config;
pub mod context;
pub mod discover;
pub mod fault;
pub mod instance;
pub mod observer;
pub mod registry;
pub mod trace;

pub use classify::{
    ClassifyCx, Ext3Semantics, FsSemantics, JfsSemantics, ReiserfsSemantics, semantics_for,
    unjournaled_role,
};
pub use config::ObserverConfig;
pub use context::{ClassifiedBlock, RequestContext};
pub use discover::discover;
pub use fault::{Ext3Refinement, FaultDirection, FaultKind, FaultSlot, FaultSpec, Persistence};
pub use instance::{FilesystemInstance, InstanceTicket};
pub use observer::{IoCounters, IoCountersSnapshot, Observer};
pub use registry::{
    Ext3Layout, FixedLayout, JournalLayout, LayoutRegistry, PendingMap, RegistrySummary,
};
pub use trace::{COPY_COMPLETED, TraceChunk, TraceKind, TraceLog, TraceRecord};

use fsp_error::FspError;
use fsp_types::{BlockNumber, ParseError};

/// Map a parse failure found during discovery onto the runtime error.
pub(crate) fn parse_error_to_fsp(e: &ParseError) -> FspError {
    match e {
        ParseError::InvalidField { field, reason } => {
            if field.contains("feature") || reason.contains("unsupported") {
                FspError::UnsupportedFeature(format!("{field}: {reason}"))
            } else if field.contains("block_size")
                || field.contains("blocks_per_group")
                || field.contains("inodes_per_group")
                || field.contains("inode_size")
                || field.contains("first_data_block")
                || field.contains("blocks_count")
                || field.contains("inodes_count")
            {
                FspError::InvalidGeometry(format!("{field}: {reason}"))
            } else {
                FspError::Format(e.to_string())
            }
        }
        ParseError::InvalidMagic { .. } => FspError::Format(e.to_string()),
        ParseError::InsufficientData { .. } | ParseError::IntegerConversion { .. } => {
            FspError::Corruption {
                block: 0,
                detail: e.to_string(),
            }
        }
    }
}

/// Metadata read from a known block that did not decode.
pub(crate) fn metadata_error(block: BlockNumber, e: &ParseError) -> FspError {
    FspError::Corruption {
        block: block.0,
        detail: e.to_string(),
    }
}
