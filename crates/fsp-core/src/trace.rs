//! Bounded trace log.
//!
//! One record per observed block plus markers for faults, crashes, learned
//! descriptor tags, protocol violations and workload boundaries. The text
//! form is line oriented:
//!
//! ```text
//! W 123 t= inode b= 0.001234 e= 0.001300
//! ```
//!
//! Extraction drains the log in bounded chunks; the final chunk ends with
//! [`COPY_COMPLETED`].

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt::{self, Write as _};
use std::time::{Duration, Instant};

/// Terminator line of the last extracted chunk.
pub const COPY_COMPLETED: &str = "COPY COMPLETED";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceKind {
    Read,
    Write,
    Fault,
    Crash,
    /// A descriptor tag was learned; the record's block is the real block.
    Descriptor,
    Violation,
    WorkloadStart,
    WorkloadEnd,
}

impl TraceKind {
    #[must_use]
    pub fn tag(self) -> char {
        match self {
            Self::Read => 'R',
            Self::Write => 'W',
            Self::Fault => 'F',
            Self::Crash => 'C',
            Self::Descriptor => 'D',
            Self::Violation => 'V',
            Self::WorkloadStart => 'S',
            Self::WorkloadEnd => 'E',
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TraceRecord {
    pub kind: TraceKind,
    pub block: u64,
    pub label: &'static str,
    /// Offset from observation start.
    pub start: Duration,
    pub end: Duration,
}

impl fmt::Display for TraceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} t= {} b= {}.{:06} e= {}.{:06}",
            self.kind.tag(),
            self.block,
            self.label,
            self.start.as_secs(),
            self.start.subsec_micros(),
            self.end.as_secs(),
            self.end.subsec_micros(),
        )
    }
}

/// One extracted slice of the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TraceChunk {
    pub text: String,
    pub records: usize,
    /// Records still waiting after this chunk.
    pub remaining: usize,
    /// Records evicted since the previous extraction.
    pub truncated: u64,
    pub complete: bool,
}

#[derive(Debug, Default)]
struct TraceBuffer {
    records: VecDeque<TraceRecord>,
    evicted: u64,
}

#[derive(Debug)]
pub struct TraceLog {
    origin: Instant,
    capacity: usize,
    buffer: Mutex<TraceBuffer>,
}

impl TraceLog {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            origin: Instant::now(),
            capacity: capacity.max(1),
            buffer: Mutex::new(TraceBuffer::default()),
        }
    }

    /// Time since observation started.
    #[must_use]
    pub fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn record(
        &self,
        kind: TraceKind,
        block: u64,
        label: &'static str,
        start: Duration,
        end: Duration,
    ) {
        let record = TraceRecord {
            kind,
            block,
            label,
            start,
            end,
        };
        tracing::trace!(target: "fsp::trace", record = %record);
        let mut buffer = self.buffer.lock();
        if buffer.records.len() >= self.capacity {
            buffer.records.pop_front();
            buffer.evicted += 1;
        }
        buffer.records.push_back(record);
    }

    /// Record a point-in-time event stamped now.
    pub fn mark(&self, kind: TraceKind, block: u64, label: &'static str) {
        let now = self.now();
        self.record(kind, block, label, now, now);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.lock().records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.lock().records.is_empty()
    }

    #[must_use]
    pub fn evicted(&self) -> u64 {
        self.buffer.lock().evicted
    }

    /// Copy of the retained records, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<TraceRecord> {
        self.buffer.lock().records.iter().cloned().collect()
    }

    /// Drop every retained record. The eviction count is kept and reported
    /// by the next [`extract`](Self::extract).
    pub fn clear(&self) {
        self.buffer.lock().records.clear();
    }

    /// Drain up to `max_records` records or `max_bytes` bytes of text.
    ///
    /// At least one record is drained per call so extraction always makes
    /// progress. The [`COPY_COMPLETED`] line counts against `max_bytes`; when
    /// it does not fit, the next call returns it alone. Call again until
    /// `complete`.
    pub fn extract(&self, max_bytes: usize, max_records: usize) -> TraceChunk {
        let mut buffer = self.buffer.lock();
        let truncated = std::mem::take(&mut buffer.evicted);
        let mut text = String::new();
        let mut records = 0;
        let mut line = String::new();
        while records < max_records.max(1) {
            let Some(front) = buffer.records.front() else {
                break;
            };
            line.clear();
            // Writing into a String cannot fail.
            let _ = writeln!(line, "{front}");
            if records > 0 && text.len() + line.len() > max_bytes {
                break;
            }
            text.push_str(&line);
            buffer.records.pop_front();
            records += 1;
        }
        let remaining = buffer.records.len();
        let terminator = COPY_COMPLETED.len() + 1;
        let complete = remaining == 0 && (records == 0 || text.len() + terminator <= max_bytes);
        if complete {
            text.push_str(COPY_COMPLETED);
            text.push('\n');
        }
        if truncated > 0 {
            tracing::warn!(
                target: "fsp::trace",
                truncated,
                "trace records evicted before extraction"
            );
        }
        TraceChunk {
            text,
            records,
            remaining,
            truncated,
            complete,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_text_form() {
        let record = TraceRecord {
            kind: TraceKind::Write,
            block: 123,
            label: "inode",
            start: Duration::from_micros(1_234),
            end: Duration::from_micros(1_300),
        };
        assert_eq!(record.to_string(), "W 123 t= inode b= 0.001234 e= 0.001300");
        let late = TraceRecord {
            start: Duration::new(12, 5_000),
            end: Duration::new(12, 5_000),
            ..record
        };
        assert_eq!(late.to_string(), "W 123 t= inode b= 12.000005 e= 12.000005");
    }

    #[test]
    fn full_log_evicts_oldest_and_reports_truncation() {
        let log = TraceLog::new(2);
        for block in 0..5 {
            log.mark(TraceKind::Read, block, "data");
        }
        assert_eq!(log.len(), 2);
        assert_eq!(log.evicted(), 3);
        let chunk = log.extract(1 << 20, 100);
        assert_eq!(chunk.truncated, 3);
        assert!(chunk.complete);
        assert!(chunk.text.starts_with("R 3 "));
        assert!(chunk.text.ends_with("COPY COMPLETED\n"));
        assert_eq!(log.evicted(), 0);
    }

    #[test]
    fn extraction_is_chunked_and_resumable() {
        let log = TraceLog::new(100);
        for block in 0..10 {
            log.mark(TraceKind::Write, block, "jdata");
        }
        let first = log.extract(1 << 20, 4);
        assert_eq!((first.records, first.remaining), (4, 6));
        assert!(!first.complete);
        assert!(!first.text.contains(COPY_COMPLETED));

        let line_len = first.text.lines().next().map_or(0, |l| l.len() + 1);
        let second = log.extract(line_len * 2, 100);
        assert_eq!(second.records, 2);

        let rest = log.extract(1 << 20, 100);
        assert_eq!((rest.records, rest.remaining), (4, 0));
        assert!(rest.complete);
        assert!(log.is_empty());
    }

    #[test]
    fn terminator_counts_against_the_byte_budget() {
        let log = TraceLog::new(8);
        log.mark(TraceKind::Write, 5, "jdata");
        log.mark(TraceKind::Write, 6, "jdata");
        let line_len = log.snapshot()[0].to_string().len() + 1;

        let first = log.extract(line_len * 2, 100);
        assert_eq!((first.records, first.remaining), (2, 0));
        assert!(!first.complete);
        assert!(first.text.len() <= line_len * 2);
        assert!(!first.text.contains(COPY_COMPLETED));

        let last = log.extract(line_len * 2, 100);
        assert_eq!(last.records, 0);
        assert!(last.complete);
        assert_eq!(last.text, "COPY COMPLETED\n");
    }

    #[test]
    fn clear_keeps_unreported_evictions() {
        let log = TraceLog::new(1);
        log.mark(TraceKind::Read, 1, "data");
        log.mark(TraceKind::Read, 2, "data");
        log.clear();
        assert!(log.is_empty());
        let chunk = log.extract(1 << 20, 100);
        assert_eq!(chunk.truncated, 1);
        assert!(chunk.complete);
        assert_eq!(log.evicted(), 0);
    }

    #[test]
    fn tiny_byte_budget_still_makes_progress() {
        let log = TraceLog::new(4);
        log.mark(TraceKind::Fault, 9, "jcommit");
        let chunk = log.extract(1, 1);
        assert_eq!(chunk.records, 1);
        assert!(chunk.text.starts_with("F 9 t= jcommit"));
    }
}
