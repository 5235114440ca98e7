/// Append-only audit trail for the threat engine.
///
/// Events go to a capped in-memory ring buffer (for the admin API) and,
/// best effort, to a JSONL file (one JSON object per line). File write
/// failures are surfaced on the operational log only; they never reach
/// the request path.
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::warn;

use crate::clock::Clock;

// =============================================================================
// EVENT TYPES
// =============================================================================

/// Kind of security event recorded in the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEventType {
    IpBlocked,
    SqlInjectionAttempt,
    NosqlInjectionAttempt,
    PathTraversalAttempt,
    MaliciousBotBlocked,
    DangerousFileUpload,
    RequestDepthExceeded,
    DdosDetected,
    ClientTrusted,
    AdminUnblock,
    AdminClearAll,
}

/// Event severity, lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditSeverity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

/// A single audit trail entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Unique event ID
    pub id: String,
    /// Milliseconds since the Unix epoch
    pub timestamp_ms: u64,
    #[serde(rename = "type")]
    pub event_type: AuditEventType,
    pub severity: AuditSeverity,
    /// Free-form operator-facing message
    pub message: String,
    /// Client identity, when the event concerns one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client: Option<String>,
    /// Request path, when the event concerns one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Additional structured context
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    pub context: serde_json::Value,
}

impl AuditEvent {
    pub fn new(event_type: AuditEventType, severity: AuditSeverity, message: &str) -> Self {
        Self {
            id: generate_event_id(),
            timestamp_ms: 0,
            event_type,
            severity,
            message: message.to_string(),
            client: None,
            path: None,
            context: serde_json::Value::Null,
        }
    }

    pub fn with_client(mut self, client: &str) -> Self {
        self.client = Some(client.to_string());
        self
    }

    pub fn with_path(mut self, path: &str) -> Self {
        self.path = Some(path.to_string());
        self
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }
}

/// Generate a unique event ID.
fn generate_event_id() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let seq = COUNTER.fetch_add(1, Ordering::Relaxed);
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("evt_{:x}_{:x}", nanos, seq)
}

// =============================================================================
// SINK
// =============================================================================

/// Audit event sink: bounded ring buffer plus best-effort file appends.
pub struct AuditSink {
    clock: Arc<dyn Clock>,
    capacity: usize,
    buffer: RwLock<VecDeque<AuditEvent>>,
    file: Mutex<Option<File>>,
    events_recorded: AtomicU64,
    write_failures: AtomicU64,
}

impl AuditSink {
    /// Create a sink with no file backing (in-memory only).
    pub fn in_memory(clock: Arc<dyn Clock>, capacity: usize) -> Self {
        Self {
            clock,
            capacity,
            buffer: RwLock::new(VecDeque::with_capacity(capacity)),
            file: Mutex::new(None),
            events_recorded: AtomicU64::new(0),
            write_failures: AtomicU64::new(0),
        }
    }

    /// Create a sink that also appends JSONL lines to `path`.
    ///
    /// Failure to open the file degrades to in-memory operation rather
    /// than failing engine startup.
    pub fn with_log_file<P: AsRef<Path>>(clock: Arc<dyn Clock>, capacity: usize, path: P) -> Self {
        let file = match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(f) => Some(f),
            Err(e) => {
                warn!(
                    "audit log file {:?} unavailable, continuing in-memory only: {}",
                    path.as_ref(),
                    e
                );
                None
            }
        };

        let sink = Self::in_memory(clock, capacity);
        *lock_or_recover(&sink.file) = file;
        sink
    }

    /// Record an event. Never fails; file errors are swallowed after a warn.
    pub fn record(&self, mut event: AuditEvent) {
        event.timestamp_ms = self.clock.now_ms();
        self.events_recorded.fetch_add(1, Ordering::Relaxed);

        if let Ok(line) = serde_json::to_string(&event) {
            let mut guard = lock_or_recover(&self.file);
            if let Some(file) = guard.as_mut() {
                if let Err(e) = writeln!(file, "{}", line) {
                    self.write_failures.fetch_add(1, Ordering::Relaxed);
                    warn!("audit log append failed: {}", e);
                }
            }
        }

        let mut buffer = match self.buffer.write() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        if buffer.len() >= self.capacity {
            buffer.pop_front();
        }
        buffer.push_back(event);
    }

    /// Most recent events, newest first.
    pub fn recent(&self, limit: usize) -> Vec<AuditEvent> {
        let buffer = match self.buffer.read() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        buffer.iter().rev().take(limit).cloned().collect()
    }

    /// Total events recorded since startup.
    pub fn events_recorded(&self) -> u64 {
        self.events_recorded.load(Ordering::Relaxed)
    }

    /// Count of failed file appends since startup.
    pub fn write_failures(&self) -> u64 {
        self.write_failures.load(Ordering::Relaxed)
    }
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
