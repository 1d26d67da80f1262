//! Transfer diagnostics.
//!
//! Every completed read or write on a session produces one
//! [`DiagnosticsRecord`]. Records go to a [`DiagnosticsSink`], the only object
//! shared across worker threads. Appends are serialized by a lock held for
//! exactly one record and never across an await point.
//!
//! Ordering: records of one session are appended from that session's task,
//! in the order they were produced. Records of different sessions interleave
//! in arrival order.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, LineWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use tracing::{debug, warn};

use crate::error::RelayError;

/// Default number of payload bytes captured per record.
pub const DEFAULT_EXCERPT_LEN: usize = 64;

/// Target of the events emitted by [`TracingSink`].
pub const DIAGNOSTICS_TARGET: &str = "tcprelay::diagnostics";

/// Stable handle of a session: the owning worker and a per-worker sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct SessionId {
    /// Index of the worker that owns the session.
    pub worker: usize,
    /// Sequence number within that worker.
    pub seq: u64,
}

impl SessionId {
    /// Create a new session id.
    pub const fn new(worker: usize, seq: u64) -> Self {
        Self { worker, seq }
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "w{}-{}", self.worker, self.seq)
    }
}

/// Direction of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Client to upstream server.
    Upstream,
    /// Upstream server to client.
    Downstream,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Upstream => f.write_str("upstream"),
            Direction::Downstream => f.write_str("downstream"),
        }
    }
}

/// The relay step a record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferOp {
    /// Bytes were read from the source socket.
    Read,
    /// Bytes were fully written to the destination socket.
    Write,
}

/// One transfer event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiagnosticsRecord {
    /// Session that produced the record.
    pub session: SessionId,
    /// Direction of the transfer.
    pub direction: Direction,
    /// Read or write step.
    pub op: TransferOp,
    /// Number of bytes moved by this step.
    pub bytes: usize,
    /// When the step completed.
    pub timestamp: DateTime<Utc>,
    /// Leading payload bytes, raw.
    #[serde(serialize_with = "serialize_lossy")]
    pub excerpt: Vec<u8>,
}

fn serialize_lossy<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&String::from_utf8_lossy(bytes))
}

/// Append-only recorder of transfer events.
///
/// `append` is called concurrently from every worker thread and must never
/// fail the caller.
pub trait DiagnosticsSink: Send + Sync {
    /// Record one event.
    fn append(&self, record: DiagnosticsRecord);
}

// =============================================================================
// Sinks
// =============================================================================

/// In-memory sink.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<DiagnosticsRecord>>,
}

impl MemorySink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all records in append order.
    pub fn records(&self) -> Vec<DiagnosticsRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Snapshot of the records produced by one session.
    pub fn records_for(&self, session: SessionId) -> Vec<DiagnosticsRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|r| r.session == session)
            .cloned()
            .collect()
    }

    /// Number of records appended so far.
    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Check if nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DiagnosticsSink for MemorySink {
    fn append(&self, record: DiagnosticsRecord) {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
    }
}

/// Sink writing JSON lines to any writer.
///
/// The first write fault is reported once; after that the sink keeps trying
/// on a best-effort basis and stays silent.
pub struct WriterSink<W> {
    writer: Mutex<W>,
    degraded: AtomicBool,
}

/// JSON-lines sink backed by a file opened in append mode.
pub type FileSink = WriterSink<LineWriter<File>>;

impl<W: Write + Send> WriterSink<W> {
    /// Wrap a writer.
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
            degraded: AtomicBool::new(false),
        }
    }

    /// Whether a write fault has been observed.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    fn report_fault(&self, err: io::Error) {
        if !self.degraded.swap(true, Ordering::AcqRel) {
            let err = RelayError::DiagnosticsWrite(err);
            warn!(
                error = %err,
                reason = err.reason_code(),
                "Diagnostics sink degraded to best-effort"
            );
        }
    }
}

impl WriterSink<LineWriter<File>> {
    /// Open (or create) a diagnostics file for appending.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::new(LineWriter::new(file)))
    }
}

impl<W: Write + Send> DiagnosticsSink for WriterSink<W> {
    fn append(&self, record: DiagnosticsRecord) {
        // Encode outside the lock.
        let mut line = match serde_json::to_vec(&record) {
            Ok(line) => line,
            Err(e) => {
                self.report_fault(io::Error::other(e));
                return;
            }
        };
        line.push(b'\n');

        let result = self
            .writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .write_all(&line);

        if let Err(e) = result {
            self.report_fault(e);
        }
    }
}

/// Sink emitting each record as a `debug` event under [`DIAGNOSTICS_TARGET`].
///
/// [`RelayConfig::log_filter`](crate::config::RelayConfig::log_filter)
/// enables that target whatever the log level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DiagnosticsSink for TracingSink {
    fn append(&self, record: DiagnosticsRecord) {
        debug!(
            target: DIAGNOSTICS_TARGET,
            session = %record.session,
            direction = %record.direction,
            op = ?record.op,
            bytes = record.bytes,
            timestamp = %record.timestamp.to_rfc3339(),
            excerpt = %String::from_utf8_lossy(&record.excerpt),
            "transfer"
        );
    }
}

/// Build the configured sink: a JSON-lines file when a path is given,
/// tracing events otherwise.
pub fn open_sink(path: Option<&Path>) -> Result<Arc<dyn DiagnosticsSink>, RelayError> {
    match path {
        Some(path) => {
            let sink = FileSink::open(path).map_err(RelayError::DiagnosticsWrite)?;
            Ok(Arc::new(sink))
        }
        None => Ok(Arc::new(TracingSink)),
    }
}

// =============================================================================
// Session tap
// =============================================================================

/// Per-session adapter stamping records before they reach the shared sink.
#[derive(Clone)]
pub struct SessionTap {
    session: SessionId,
    sink: Arc<dyn DiagnosticsSink>,
    excerpt_len: usize,
}

impl SessionTap {
    /// Create a tap for one session.
    pub fn new(session: SessionId, sink: Arc<dyn DiagnosticsSink>, excerpt_len: usize) -> Self {
        Self {
            session,
            sink,
            excerpt_len,
        }
    }

    /// Record one completed step.
    pub fn record(&self, direction: Direction, op: TransferOp, data: &[u8]) {
        let excerpt = data[..data.len().min(self.excerpt_len)].to_vec();
        self.sink.append(DiagnosticsRecord {
            session: self.session,
            direction,
            op,
            bytes: data.len(),
            timestamp: Utc::now(),
            excerpt,
        });
    }
}
