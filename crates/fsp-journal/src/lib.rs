#![forbid(unsafe_code)]
//! Journaling protocol model.
//!
//! One finite automaton per journaling mode (full data, ordered,
//! writeback). Edges are labeled with a semantic block role and the write
//! outcome; the model tracks the current state as blocks are observed and
//! reports writes that no edge accepts.

pub mod protocol;

pub use protocol::{
    InvalidMove, ProtocolAutomaton, ProtocolEdge, ProtocolModel, ProtocolState, SequenceError,
    StateId,
};
