//! The control surface.
//!
//! An [`Observer`] is installed as the [`RequestHook`] of an
//! [`fsp_block::InterposedDevice`] before the filesystem exists. Until
//! [`Observer::start`] it only counts traffic; once started it routes every
//! request through a [`FilesystemInstance`].

use crate::classify::ext3::{init_dir_blocks, init_indirect_blocks};
use crate::config::ObserverConfig;
use crate::fault::FaultSpec;
use crate::instance::{FilesystemInstance, InstanceTicket};
use crate::registry::RegistrySummary;
use crate::trace::TraceChunk;
use fsp_block::{BlockRequest, ByteDevice, RequestHook, RequestStatus, Submission, Verdict};
use fsp_error::{FspError, Result};
use fsp_journal::StateId;
use fsp_types::{BlockNumber, Direction, IndirectTier, InodeNumber};
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Requests and bytes seen by the hook, observed or not.
#[derive(Debug, Default)]
pub struct IoCounters {
    reads: AtomicU64,
    writes: AtomicU64,
    read_bytes: AtomicU64,
    write_bytes: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IoCountersSnapshot {
    pub reads: u64,
    pub writes: u64,
    pub read_bytes: u64,
    pub write_bytes: u64,
}

impl std::fmt::Display for IoCountersSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "reads: {} ({} bytes) writes: {} ({} bytes)",
            self.reads, self.read_bytes, self.writes, self.write_bytes
        )
    }
}

impl IoCounters {
    fn count(&self, request: &BlockRequest) {
        let bytes = u64::try_from(request.data.len()).unwrap_or(u64::MAX);
        let (count, total) = match request.direction {
            Direction::Read => (&self.reads, &self.read_bytes),
            Direction::Write => (&self.writes, &self.write_bytes),
        };
        count.fetch_add(1, Ordering::Relaxed);
        total.fetch_add(bytes, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> IoCountersSnapshot {
        IoCountersSnapshot {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            read_bytes: self.read_bytes.load(Ordering::Relaxed),
            write_bytes: self.write_bytes.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        for counter in [&self.reads, &self.writes, &self.read_bytes, &self.write_bytes] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

struct Observed {
    instance: Arc<FilesystemInstance>,
    /// Unhooked view of the device, for metadata reads during refinement.
    device: Arc<dyn ByteDevice>,
}

pub struct Observer {
    config: ObserverConfig,
    observed: RwLock<Option<Observed>>,
    counters: IoCounters,
}

impl std::fmt::Debug for Observer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observer")
            .field("config", &self.config)
            .field("observing", &self.is_observing())
            .field("counters", &self.counters.snapshot())
            .finish()
    }
}

impl Observer {
    #[must_use]
    pub fn new(config: ObserverConfig) -> Self {
        Self {
            config,
            observed: RwLock::new(None),
            counters: IoCounters::default(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &ObserverConfig {
        &self.config
    }

    #[must_use]
    pub fn is_observing(&self) -> bool {
        self.observed.read().is_some()
    }

    // ── Lifecycle ───────────────────────────────────────────────────────────

    /// Discover the layout on `device` and begin observing.
    ///
    /// Nothing changes when discovery fails.
    pub fn start(&self, device: Arc<dyn ByteDevice>) -> Result<RegistrySummary> {
        if self.is_observing() {
            return Err(FspError::AlreadyObserving);
        }
        let instance = FilesystemInstance::discover(self.config.clone(), device.as_ref())?;
        let summary = instance.registry().summary();
        let mut observed = self.observed.write();
        if observed.is_some() {
            return Err(FspError::AlreadyObserving);
        }
        *observed = Some(Observed {
            instance: Arc::new(instance),
            device,
        });
        tracing::info!(
            target: "fsp::observer",
            filesystem = %self.config.filesystem,
            mode = %self.config.journaling_mode,
            "observation started"
        );
        Ok(summary)
    }

    /// Stop observing and hand back the instance for inspection.
    pub fn stop(&self) -> Result<Arc<FilesystemInstance>> {
        let observed = self.observed.write().take().ok_or(FspError::NotObserving)?;
        tracing::info!(
            target: "fsp::observer",
            violations = observed.instance.violations(),
            "observation stopped"
        );
        Ok(observed.instance)
    }

    /// The observed instance.
    pub fn instance(&self) -> Result<Arc<FilesystemInstance>> {
        self.observed
            .read()
            .as_ref()
            .map(|o| Arc::clone(&o.instance))
            .ok_or(FspError::NotObserving)
    }

    fn with_device<T>(
        &self,
        f: impl FnOnce(&FilesystemInstance, &dyn ByteDevice) -> Result<T>,
    ) -> Result<T> {
        let (instance, device) = {
            let observed = self.observed.read();
            let observed = observed.as_ref().ok_or(FspError::NotObserving)?;
            (Arc::clone(&observed.instance), Arc::clone(&observed.device))
        };
        f(&instance, device.as_ref())
    }

    // ── Faults ──────────────────────────────────────────────────────────────

    pub fn queue_fault(&self, spec: FaultSpec) -> Result<()> {
        self.instance()?.faults().queue(spec)
    }

    pub fn rearm_fault(&self, spec: FaultSpec) -> Result<()> {
        self.instance()?.faults().rearm(spec)
    }

    /// Returns whether the slot is now empty; a sticky fault needs `force`.
    pub fn remove_fault(&self, force: bool) -> Result<bool> {
        self.instance()?.faults().remove(force)
    }

    /// Resolve the pending fault's refinement to a concrete block.
    pub fn process_fault(&self) -> Result<FaultSpec> {
        self.with_device(|instance, device| {
            instance
                .faults()
                .process(instance.semantics(), instance.registry(), device)
        })
    }

    pub fn pending_fault(&self) -> Result<Option<FaultSpec>> {
        Ok(self.instance()?.faults().pending())
    }

    pub fn fault_injected(&self) -> Result<bool> {
        Ok(self.instance()?.faults().fault_injected())
    }

    /// Text form of the pending fault.
    pub fn describe_fault(&self) -> Result<String> {
        Ok(self
            .pending_fault()?
            .map_or_else(|| "no fault queued".to_owned(), |spec| spec.to_string()))
    }

    pub fn set_inject_faults(&self, enabled: bool) -> Result<()> {
        self.instance()?.set_inject_faults(enabled);
        Ok(())
    }

    // ── Crash emulation ─────────────────────────────────────────────────────

    pub fn arm_crash_after_commit(&self) -> Result<()> {
        self.instance()?.arm_crash_after_commit();
        Ok(())
    }

    pub fn disarm_crash_after_commit(&self) -> Result<()> {
        self.instance()?.disarm_crash_after_commit();
        Ok(())
    }

    pub fn crash_now(&self) -> Result<()> {
        self.instance()?.crash_now();
        Ok(())
    }

    pub fn clear_crash(&self) -> Result<()> {
        self.instance()?.clear_crash();
        Ok(())
    }

    pub fn is_crashed(&self) -> Result<bool> {
        Ok(self.instance()?.is_crashed())
    }

    // ── Protocol model ──────────────────────────────────────────────────────

    pub fn reset_model(&self) -> Result<()> {
        let instance = self.instance()?;
        instance.model().reset();
        tracing::info!(target: "fsp::model", "protocol model reset");
        Ok(())
    }

    pub fn model_state(&self) -> Result<(StateId, String)> {
        let instance = self.instance()?;
        let model = instance.model();
        Ok((model.current(), model.current_name().to_owned()))
    }

    pub fn print_model(&self) -> Result<String> {
        Ok(self.instance()?.model().automaton().to_string())
    }

    pub fn violations(&self) -> Result<u64> {
        Ok(self.instance()?.violations())
    }

    // ── Learning and listings ───────────────────────────────────────────────

    pub fn mark_workload(&self, start: bool) -> Result<()> {
        self.instance()?.mark_workload(start);
        Ok(())
    }

    pub fn init_dir_blocks(&self, ino: InodeNumber) -> Result<Vec<BlockNumber>> {
        self.with_device(|instance, device| init_dir_blocks(instance.registry(), device, ino))
    }

    pub fn init_indirect_blocks(
        &self,
        ino: InodeNumber,
    ) -> Result<Vec<(BlockNumber, IndirectTier)>> {
        self.with_device(|instance, device| init_indirect_blocks(instance.registry(), device, ino))
    }

    pub fn journal_blocks(&self) -> Result<Vec<BlockNumber>> {
        Ok(self.instance()?.registry().journal().blocks().to_vec())
    }

    /// `(real block, journal position)` pairs awaiting checkpoint.
    pub fn pending_checkpoints(&self) -> Result<Vec<(BlockNumber, BlockNumber)>> {
        Ok(self.instance()?.registry().pending_snapshot())
    }

    pub fn registry_summary(&self) -> Result<RegistrySummary> {
        Ok(self.instance()?.registry().summary())
    }

    // ── Trace ───────────────────────────────────────────────────────────────

    /// Next chunk of the trace within the configured budgets.
    pub fn extract_trace(&self) -> Result<TraceChunk> {
        let chunk = self
            .instance()?
            .trace()
            .extract(self.config.trace_chunk_bytes, self.config.trace_chunk_records);
        tracing::debug!(
            target: "fsp::trace",
            records = chunk.records,
            remaining = chunk.remaining,
            truncated = chunk.truncated,
            "trace chunk extracted"
        );
        Ok(chunk)
    }

    pub fn clear_trace(&self) -> Result<()> {
        self.instance()?.trace().clear();
        Ok(())
    }

    pub fn clear_all(&self) -> Result<()> {
        self.instance()?.clear_all();
        Ok(())
    }

    // ── Counters ────────────────────────────────────────────────────────────

    #[must_use]
    pub fn counters(&self) -> IoCountersSnapshot {
        self.counters.snapshot()
    }

    pub fn reset_counters(&self) {
        self.counters.reset();
    }
}

impl RequestHook for Observer {
    type Ticket = Option<(Arc<FilesystemInstance>, InstanceTicket)>;

    fn on_submit(&self, request: &BlockRequest) -> Submission<Self::Ticket> {
        self.counters.count(request);
        let Ok(instance) = self.instance() else {
            return Submission {
                ticket: None,
                verdict: Verdict::Proceed,
            };
        };
        let (ticket, verdict) = instance.on_submit(request);
        Submission {
            ticket: Some((instance, ticket)),
            verdict,
        }
    }

    fn on_complete(
        &self,
        ticket: Self::Ticket,
        request: &BlockRequest,
        status: RequestStatus,
    ) -> RequestStatus {
        match ticket {
            Some((instance, ticket)) => instance.on_complete(ticket, request, status),
            None => status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fsp_block::MemByteDevice;
    use fsp_types::{FsVariant, JournalingMode};

    #[test]
    fn controls_require_observation() {
        let observer = Observer::new(ObserverConfig::new(FsVariant::Jfs, JournalingMode::Ordered));
        assert!(matches!(observer.crash_now(), Err(FspError::NotObserving)));
        assert!(matches!(observer.stop(), Err(FspError::NotObserving)));
        assert!(matches!(observer.extract_trace(), Err(FspError::NotObserving)));
    }

    #[test]
    fn unobserved_traffic_is_counted_and_passed() {
        let observer = Observer::new(ObserverConfig::default());
        let request =
            BlockRequest::write(fsp_block::RequestId(1), fsp_types::SectorNumber(0), vec![0; 4096]);
        let Submission { ticket, verdict } = observer.on_submit(&request);
        assert_eq!(verdict, Verdict::Proceed);
        assert!(ticket.is_none());
        assert!(observer.on_complete(ticket, &request, RequestStatus::Success).is_success());
        assert_eq!(observer.counters().writes, 1);
        assert_eq!(observer.counters().write_bytes, 4096);
        observer.reset_counters();
        assert_eq!(observer.counters(), IoCountersSnapshot::default());
    }

    #[test]
    fn failed_discovery_leaves_observer_idle() {
        let observer = Observer::new(ObserverConfig::default());
        let blank: Arc<dyn ByteDevice> = Arc::new(MemByteDevice::new(64 * 1024));
        assert!(observer.start(blank).is_err());
        assert!(!observer.is_observing());
    }
}
