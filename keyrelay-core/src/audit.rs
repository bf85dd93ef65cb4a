use crate::errors::ErrorKind;
use crate::path::SecretPath;
use crate::types::{CallerIdentity, Capability};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

/// How an audited operation concluded.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AuditOutcome {
    /// The policy gate allowed the operation and it succeeded.
    Granted { cache_hit: bool },
    /// The policy gate rejected the operation; the backend was not contacted.
    Denied { reason: String },
    /// The operation was authorized but failed afterwards.
    Failed { kind: ErrorKind },
}

/// Immutable record of one access decision or backend call.
///
/// Events are append-only; the broker never mutates or deletes them.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AuditEvent {
    pub id: Uuid,
    pub timestamp_ms: u64,
    pub caller: String,
    pub path: String,
    pub capability: Capability,
    #[serde(flatten)]
    pub outcome: AuditOutcome,
    pub backend: String,
}

impl AuditEvent {
    pub fn new(
        caller: &CallerIdentity,
        path: &SecretPath,
        capability: Capability,
        outcome: AuditOutcome,
        backend: &str,
    ) -> Self {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Self {
            id: Uuid::new_v4(),
            timestamp_ms,
            caller: caller.subject().to_string(),
            path: path.to_string(),
            capability,
            outcome,
            backend: backend.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialize error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Destination for audit events.
///
/// `record` is best-effort from the broker's point of view: a failing sink
/// must never block or fail the secret operation it describes.
pub trait AuditSink: Send + Sync {
    fn record(&self, event: &AuditEvent) -> Result<(), AuditError>;

    fn flush(&self) -> Result<(), AuditError> {
        Ok(())
    }
}

/// Appends one JSON object per line to a file, flushed per event.
pub struct JsonlSink {
    writer: Mutex<BufWriter<File>>,
}

impl JsonlSink {
    pub fn open(path: &Path) -> Result<Self, AuditError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
        })
    }
}

impl AuditSink for JsonlSink {
    fn record(&self, event: &AuditEvent) -> Result<(), AuditError> {
        let line = serde_json::to_string(event)?;
        let mut writer = self.writer.lock().expect("audit writer lock poisoned");
        writeln!(writer, "{line}")?;
        writer.flush()?;
        Ok(())
    }

    fn flush(&self) -> Result<(), AuditError> {
        self.writer
            .lock()
            .expect("audit writer lock poisoned")
            .flush()?;
        Ok(())
    }
}

/// Emits audit events as structured log lines under the `audit` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl AuditSink for TracingSink {
    fn record(&self, event: &AuditEvent) -> Result<(), AuditError> {
        info!(
            target: "audit",
            id = %event.id,
            caller = %event.caller,
            path = %event.path,
            capability = %event.capability,
            outcome = ?event.outcome,
            backend = %event.backend,
            "audit event"
        );
        Ok(())
    }
}

/// Collects events in memory; used by tests asserting audit invariants.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything recorded so far.
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().expect("audit lock poisoned").clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().expect("audit lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AuditSink for MemorySink {
    fn record(&self, event: &AuditEvent) -> Result<(), AuditError> {
        self.events
            .lock()
            .expect("audit lock poisoned")
            .push(event.clone());
        Ok(())
    }
}

impl<T> AuditSink for std::sync::Arc<T>
where
    T: AuditSink + ?Sized,
{
    fn record(&self, event: &AuditEvent) -> Result<(), AuditError> {
        (**self).record(event)
    }

    fn flush(&self) -> Result<(), AuditError> {
        (**self).flush()
    }
}

/// Wraps a sink so that recording never fails the caller.
///
/// A sink failure is logged locally as a fallback and counted; the counter
/// is the monitorable signal that audit records are going missing.
pub struct AuditRecorder {
    sink: Box<dyn AuditSink>,
    dropped: AtomicU64,
}

impl AuditRecorder {
    pub fn new(sink: Box<dyn AuditSink>) -> Self {
        Self {
            sink,
            dropped: AtomicU64::new(0),
        }
    }

    /// Record an event, swallowing sink failures.
    pub fn record(&self, event: AuditEvent) {
        if let Err(err) = self.sink.record(&event) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::error!(
                target: "audit",
                error = %err,
                caller = %event.caller,
                path = %event.path,
                capability = %event.capability,
                "audit record dropped"
            );
        }
    }

    /// Number of events the sink failed to persist.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn flush(&self) -> Result<(), AuditError> {
        self.sink.flush()
    }
}
