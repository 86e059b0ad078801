//! One observed filesystem: registry, classifier, model, fault slot, trace.
//!
//! Every piece of per-instance mutable state lives here, behind its own
//! lock, so several instances can be observed side by side and tests need
//! no global reset.

use crate::classify::{ClassifyCx, FsSemantics, semantics_for};
use crate::config::ObserverConfig;
use crate::context::RequestContext;
use crate::discover::discover;
use crate::fault::FaultSlot;
use crate::registry::LayoutRegistry;
use crate::trace::{TraceKind, TraceLog};
use fsp_block::{BlockRequest, ByteDevice, RequestStatus, Verdict};
use fsp_error::Result;
use fsp_journal::ProtocolModel;
use fsp_types::{Direction, FsVariant, JournalingMode, Outcome, SemanticBlockType};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct CrashState {
    /// Crash as soon as a commit block is seen.
    after_commit: bool,
    crashed: bool,
}

/// State carried from a request's submission to its completion.
#[derive(Debug)]
pub struct InstanceTicket {
    submitted: Duration,
    /// Write classification done at submit; `None` for reads.
    context: Option<RequestContext>,
    /// Failed at submission because the instance had crashed.
    rejected: bool,
}

#[derive(Debug)]
pub struct FilesystemInstance {
    config: ObserverConfig,
    registry: LayoutRegistry,
    semantics: Box<dyn FsSemantics>,
    model: ProtocolModel,
    faults: FaultSlot,
    trace: TraceLog,
    inject_faults: AtomicBool,
    crash: Mutex<CrashState>,
    violations: AtomicU64,
}

impl FilesystemInstance {
    #[must_use]
    pub fn new(config: ObserverConfig, registry: LayoutRegistry) -> Self {
        let variant = registry.variant();
        Self {
            semantics: semantics_for(variant),
            model: ProtocolModel::new(config.journaling_mode),
            faults: FaultSlot::new(variant),
            trace: TraceLog::new(config.trace_capacity),
            inject_faults: AtomicBool::new(config.inject_faults),
            crash: Mutex::new(CrashState::default()),
            violations: AtomicU64::new(0),
            registry,
            config,
        }
    }

    /// Discover the layout on `dev` and build an instance around it.
    pub fn discover(config: ObserverConfig, dev: &dyn ByteDevice) -> Result<Self> {
        config.validate()?;
        let registry = discover(config.filesystem, dev)?;
        Ok(Self::new(config, registry))
    }

    #[must_use]
    pub fn config(&self) -> &ObserverConfig {
        &self.config
    }

    #[must_use]
    pub fn variant(&self) -> FsVariant {
        self.registry.variant()
    }

    #[must_use]
    pub fn mode(&self) -> JournalingMode {
        self.config.journaling_mode
    }

    #[must_use]
    pub fn registry(&self) -> &LayoutRegistry {
        &self.registry
    }

    #[must_use]
    pub fn semantics(&self) -> &dyn FsSemantics {
        self.semantics.as_ref()
    }

    #[must_use]
    pub fn model(&self) -> &ProtocolModel {
        &self.model
    }

    #[must_use]
    pub fn faults(&self) -> &FaultSlot {
        &self.faults
    }

    #[must_use]
    pub fn trace(&self) -> &TraceLog {
        &self.trace
    }

    #[must_use]
    pub fn classify_cx(&self) -> ClassifyCx<'_> {
        ClassifyCx::new(&self.registry, self.config.journaling_mode).with_trace(&self.trace)
    }

    #[must_use]
    pub fn violations(&self) -> u64 {
        self.violations.load(Ordering::Relaxed)
    }

    // ── Switches ────────────────────────────────────────────────────────────

    pub fn set_inject_faults(&self, enabled: bool) {
        self.inject_faults.store(enabled, Ordering::Relaxed);
        tracing::info!(target: "fsp::fault", enabled, "fault injection toggled");
    }

    #[must_use]
    pub fn inject_faults(&self) -> bool {
        self.inject_faults.load(Ordering::Relaxed)
    }

    pub fn arm_crash_after_commit(&self) {
        self.crash.lock().after_commit = true;
        tracing::info!(target: "fsp::fault", "crash after next commit armed");
    }

    /// Disarm and forget any crash already emulated.
    pub fn disarm_crash_after_commit(&self) {
        *self.crash.lock() = CrashState::default();
        tracing::info!(target: "fsp::fault", "crash after commit disarmed");
    }

    pub fn crash_now(&self) {
        self.crash.lock().crashed = true;
        self.trace.mark(TraceKind::Crash, 0, "forced");
        tracing::info!(target: "fsp::fault", "crash forced");
    }

    pub fn clear_crash(&self) {
        self.crash.lock().crashed = false;
        tracing::info!(target: "fsp::fault", "crash cleared");
    }

    #[must_use]
    pub fn is_crashed(&self) -> bool {
        self.crash.lock().crashed
    }

    #[must_use]
    pub fn crash_after_commit_armed(&self) -> bool {
        self.crash.lock().after_commit
    }

    pub fn mark_workload(&self, start: bool) {
        let kind = if start {
            TraceKind::WorkloadStart
        } else {
            TraceKind::WorkloadEnd
        };
        self.trace.mark(kind, 0, "workload");
    }

    /// Empty the trace and forget pending checkpoints and learned blocks.
    pub fn clear_all(&self) {
        self.trace.clear();
        self.registry.clear_pending();
        if let Some(layout) = self.registry.ext3() {
            layout.forget_learned();
        }
        tracing::info!(target: "fsp::observer", "trace, pending checkpoints and learned blocks cleared");
    }

    // ── Request path ────────────────────────────────────────────────────────

    /// Classify a write, match it against the pending fault and watch for
    /// the commit that triggers an armed crash. A commit block trips the
    /// crash even when the fault fails it.
    pub fn on_submit(&self, request: &BlockRequest) -> (InstanceTicket, Verdict) {
        let submitted = self.trace.now();
        if self.is_crashed() {
            tracing::debug!(
                target: "fsp::fault",
                request = request.id.0,
                "request rejected: system crashed"
            );
            let ticket = InstanceTicket {
                submitted,
                context: None,
                rejected: true,
            };
            return (ticket, Verdict::Fail("system crashed".to_owned()));
        }
        if request.direction == Direction::Read {
            let ticket = InstanceTicket {
                submitted,
                context: None,
                rejected: false,
            };
            return (ticket, Verdict::Proceed);
        }

        let context = RequestContext::build(self.semantics(), &self.classify_cx(), request);
        let verdict = self
            .administer(&context, Direction::Write)
            .map_or(Verdict::Proceed, Verdict::Fail);
        self.watch_for_commit(&context);
        let ticket = InstanceTicket {
            submitted,
            context: Some(context),
            rejected: false,
        };
        (ticket, verdict)
    }

    /// Record the request and, for writes, replay it through the model.
    /// Reads are classified and fault-matched here, once their data is in.
    pub fn on_complete(
        &self,
        ticket: InstanceTicket,
        request: &BlockRequest,
        status: RequestStatus,
    ) -> RequestStatus {
        if ticket.rejected {
            return status;
        }
        match request.direction {
            Direction::Write => {
                let Some(context) = ticket.context else {
                    return status;
                };
                self.record(&context, TraceKind::Write, ticket.submitted);
                if self.config.validate_protocol {
                    let outcome = if status.is_success() {
                        Outcome::Success
                    } else {
                        Outcome::Failure
                    };
                    self.validate(&context, outcome);
                }
                status
            }
            Direction::Read => {
                let context = RequestContext::build(self.semantics(), &self.classify_cx(), request);
                let status = match self.administer(&context, Direction::Read) {
                    Some(detail) => RequestStatus::Failed(detail),
                    None => status,
                };
                self.watch_for_commit(&context);
                self.record(&context, TraceKind::Read, ticket.submitted);
                status
            }
        }
    }

    /// Match every block against the pending fault; returns the failure
    /// detail when at least one block was failed.
    fn administer(&self, context: &RequestContext, direction: Direction) -> Option<String> {
        if !self.inject_faults() {
            return None;
        }
        let mut failed = None;
        for classified in context.iter() {
            let Some(spec) = self.faults.evaluate(
                self.semantics(),
                &self.registry,
                direction,
                classified.block,
                classified.ty,
            ) else {
                continue;
            };
            self.trace
                .mark(TraceKind::Fault, classified.block.0, classified.ty.tag());
            failed = Some(format!(
                "injected {:?} fault on {} block {}",
                spec.kind, classified.ty, classified.block
            ));
        }
        failed
    }

    fn watch_for_commit(&self, context: &RequestContext) {
        let mut crash = self.crash.lock();
        if !crash.after_commit || crash.crashed {
            return;
        }
        let Some(commit) = context
            .iter()
            .find(|c| c.ty == SemanticBlockType::JournalCommit)
        else {
            return;
        };
        crash.crashed = true;
        drop(crash);
        self.trace.mark(TraceKind::Crash, commit.block.0, commit.ty.tag());
        tracing::info!(
            target: "fsp::fault",
            block = commit.block.0,
            "commit seen; emulating crash"
        );
    }

    fn record(&self, context: &RequestContext, kind: TraceKind, submitted: Duration) {
        let end = self.trace.now();
        for classified in context.iter() {
            self.trace
                .record(kind, classified.block.0, classified.ty.tag(), submitted, end);
        }
    }

    fn validate(&self, context: &RequestContext, outcome: Outcome) {
        let mode = self.config.journaling_mode;
        for classified in context.iter() {
            if self.model.is_aborted() {
                break;
            }
            let role = classified.ty.protocol_role(mode);
            if mode == JournalingMode::Data && role == SemanticBlockType::Unordered {
                tracing::warn!(
                    target: "fsp::model",
                    block = classified.block.0,
                    "unjournaled block written in full data journaling"
                );
            }
            if let Err(invalid) = self.model.observe(role, outcome) {
                self.violations.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    target: "fsp::model",
                    block = classified.block.0,
                    block_type = %classified.ty,
                    error = %invalid,
                    "protocol violation"
                );
                self.trace
                    .mark(TraceKind::Violation, classified.block.0, classified.ty.tag());
            }
        }
    }
}
