//! Automaton tables and the per-instance model that walks them.
//!
//! Every mode shares the same three live states:
//!
//! - `S0`: clean, nothing logged since the last commit was checkpointed
//!   (or since start).
//! - `S1`: inside a transaction; log blocks are being written.
//! - `S2`: a commit record landed; checkpoint writes may follow.
//!
//! `S_abort` is terminal and has no outgoing edges. Any failed write from a
//! live state leads there.

use fsp_types::{JournalingMode, Outcome, SemanticBlockType};
use parking_lot::Mutex;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StateId(pub usize);

impl StateId {
    pub const CLEAN: Self = Self(0);
    pub const IN_TRANSACTION: Self = Self(1);
    pub const COMMITTED: Self = Self(2);
    pub const ABORTED: Self = Self(3);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolEdge {
    pub input: SemanticBlockType,
    pub outcome: Outcome,
    pub to: StateId,
}

impl ProtocolEdge {
    /// `Any` accepts every role; the outcome must still be equal.
    #[must_use]
    pub fn accepts(&self, input: SemanticBlockType, outcome: Outcome) -> bool {
        self.outcome == outcome && (self.input == SemanticBlockType::Any || self.input == input)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolState {
    pub name: &'static str,
    pub edges: Vec<ProtocolEdge>,
}

impl ProtocolState {
    /// Destination of the first edge accepting the input.
    #[must_use]
    pub fn next(&self, input: SemanticBlockType, outcome: Outcome) -> Option<StateId> {
        self.edges
            .iter()
            .find(|edge| edge.accepts(input, outcome))
            .map(|edge| edge.to)
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.edges.is_empty()
    }
}

/// No edge out of `state` accepts `(input, outcome)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("no edge from {state_name} accepts ({input}, {outcome:?}) in {mode} mode")]
pub struct InvalidMove {
    pub mode: JournalingMode,
    pub state: StateId,
    pub state_name: &'static str,
    pub input: SemanticBlockType,
    pub outcome: Outcome,
}

/// A dry-run replay stopped at `index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("sequence rejected at position {index}: {invalid}")]
pub struct SequenceError {
    pub index: usize,
    #[source]
    pub invalid: InvalidMove,
}

// ── Tables ──────────────────────────────────────────────────────────────────

const LOG_ROLES: [SemanticBlockType; 3] = [
    SemanticBlockType::JournalDescriptor,
    SemanticBlockType::JournalRevoke,
    SemanticBlockType::JournalData,
];

fn ok(input: SemanticBlockType, to: StateId) -> ProtocolEdge {
    ProtocolEdge {
        input,
        outcome: Outcome::Success,
        to,
    }
}

fn abort_edge() -> ProtocolEdge {
    ProtocolEdge {
        input: SemanticBlockType::Any,
        outcome: Outcome::Failure,
        to: StateId::ABORTED,
    }
}

/// Immutable state table for one journaling mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolAutomaton {
    mode: JournalingMode,
    states: Vec<ProtocolState>,
}

impl ProtocolAutomaton {
    #[must_use]
    pub fn for_mode(mode: JournalingMode) -> Self {
        // Role of writes that bypass the log; full data mode has none.
        let unjournaled = match mode {
            JournalingMode::Ordered => Some(SemanticBlockType::Ordered),
            JournalingMode::Writeback => Some(SemanticBlockType::Unordered),
            JournalingMode::Data => None,
        };
        let log_edges = || LOG_ROLES.iter().map(|role| ok(*role, StateId::IN_TRANSACTION));

        let mut clean: Vec<ProtocolEdge> = log_edges().collect();
        clean.extend(unjournaled.map(|role| ok(role, StateId::CLEAN)));
        clean.push(abort_edge());

        let mut in_transaction: Vec<ProtocolEdge> = log_edges().collect();
        in_transaction.extend(unjournaled.map(|role| ok(role, StateId::IN_TRANSACTION)));
        in_transaction.push(ok(SemanticBlockType::JournalCommit, StateId::COMMITTED));
        in_transaction.push(abort_edge());

        let mut committed = vec![
            ok(SemanticBlockType::Checkpoint, StateId::COMMITTED),
            ok(SemanticBlockType::JournalSuperblock, StateId::COMMITTED),
        ];
        committed.extend(log_edges());
        committed.extend(unjournaled.map(|role| ok(role, StateId::CLEAN)));
        committed.push(abort_edge());

        Self {
            mode,
            states: vec![
                ProtocolState {
                    name: "S0",
                    edges: clean,
                },
                ProtocolState {
                    name: "S1",
                    edges: in_transaction,
                },
                ProtocolState {
                    name: "S2",
                    edges: committed,
                },
                ProtocolState {
                    name: "S_abort",
                    edges: Vec::new(),
                },
            ],
        }
    }

    #[must_use]
    pub fn mode(&self) -> JournalingMode {
        self.mode
    }

    #[must_use]
    pub fn states(&self) -> &[ProtocolState] {
        &self.states
    }

    #[must_use]
    pub fn state(&self, id: StateId) -> Option<&ProtocolState> {
        self.states.get(id.0)
    }

    #[must_use]
    pub fn state_name(&self, id: StateId) -> &'static str {
        self.state(id).map_or("S_invalid", |s| s.name)
    }

    pub fn step(
        &self,
        from: StateId,
        input: SemanticBlockType,
        outcome: Outcome,
    ) -> Result<StateId, InvalidMove> {
        self.state(from)
            .and_then(|state| state.next(input, outcome))
            .ok_or(InvalidMove {
                mode: self.mode,
                state: from,
                state_name: self.state_name(from),
                input,
                outcome,
            })
    }
}

fn edge_label(role: SemanticBlockType) -> &'static str {
    match role {
        SemanticBlockType::JournalDescriptor => "D",
        SemanticBlockType::JournalRevoke => "R",
        SemanticBlockType::JournalData => "J",
        SemanticBlockType::JournalCommit => "C",
        SemanticBlockType::Checkpoint => "K",
        SemanticBlockType::JournalSuperblock => "S",
        SemanticBlockType::Ordered => "O",
        SemanticBlockType::Unordered => "U",
        SemanticBlockType::Any => "*",
        other => other.tag(),
    }
}

impl fmt::Display for ProtocolAutomaton {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "mode {}", self.mode)?;
        for state in &self.states {
            write!(f, "{}:", state.name)?;
            if state.is_terminal() {
                write!(f, " (terminal)")?;
            }
            for edge in &state.edges {
                write!(
                    f,
                    " {}/{}->{}",
                    edge_label(edge.input),
                    edge.outcome.tag(),
                    self.state_name(edge.to)
                )?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

// ── Model ───────────────────────────────────────────────────────────────────

/// An automaton plus the current-state pointer of one observed instance.
#[derive(Debug)]
pub struct ProtocolModel {
    automaton: ProtocolAutomaton,
    current: Mutex<StateId>,
}

impl ProtocolModel {
    #[must_use]
    pub fn new(mode: JournalingMode) -> Self {
        Self {
            automaton: ProtocolAutomaton::for_mode(mode),
            current: Mutex::new(StateId::CLEAN),
        }
    }

    #[must_use]
    pub fn mode(&self) -> JournalingMode {
        self.automaton.mode()
    }

    #[must_use]
    pub fn automaton(&self) -> &ProtocolAutomaton {
        &self.automaton
    }

    #[must_use]
    pub fn current(&self) -> StateId {
        *self.current.lock()
    }

    #[must_use]
    pub fn current_name(&self) -> &'static str {
        self.automaton.state_name(self.current())
    }

    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.current() == StateId::ABORTED
    }

    /// Advance on one observed block. On rejection the state is unchanged.
    pub fn observe(
        &self,
        input: SemanticBlockType,
        outcome: Outcome,
    ) -> Result<StateId, InvalidMove> {
        let mut current = self.current.lock();
        let from = *current;
        let to = self.automaton.step(from, input, outcome)?;
        *current = to;
        drop(current);
        tracing::trace!(
            target: "fsp::model",
            from = self.automaton.state_name(from),
            to = self.automaton.state_name(to),
            input = input.tag(),
            outcome = ?outcome,
            "transition"
        );
        Ok(to)
    }

    /// Whether a successful write of `input` is legal from `state`.
    #[must_use]
    pub fn would_accept(&self, state: StateId, input: SemanticBlockType) -> bool {
        self.automaton.step(state, input, Outcome::Success).is_ok()
    }

    /// Replay successful writes from the current state without moving it.
    pub fn check_sequence(&self, inputs: &[SemanticBlockType]) -> Result<StateId, SequenceError> {
        let start = self.current();
        inputs
            .iter()
            .enumerate()
            .try_fold(start, |state, (index, input)| {
                self.automaton
                    .step(state, *input, Outcome::Success)
                    .map_err(|invalid| SequenceError { index, invalid })
            })
    }

    pub fn reset(&self) {
        *self.current.lock() = StateId::CLEAN;
        tracing::debug!(target: "fsp::model", mode = %self.mode(), "model reset to S0");
    }
}

impl fmt::Display for ProtocolModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.automaton)?;
        writeln!(f, "current {}", self.current_name())
    }
}
