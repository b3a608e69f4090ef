//! In-memory log ring buffer
//!
//! The process logs to two sinks: stderr via `tracing_subscriber::fmt`, and
//! this capped ring buffer that backs the control panel's log view. The
//! buffer keeps the newest 500 entries; `entries()` returns them
//! newest-first.

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// Buffer capacity in entries
const LOG_BUFFER_CAP: usize = 500;

/// One captured log record
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    /// Unix timestamp in seconds
    pub timestamp: u64,
    /// Level name ("INFO", "WARN", ...)
    pub level: String,
    /// Event target (module path)
    pub target: String,
    /// Message followed by formatted key=value fields
    pub message: String,
}

/// Thread-safe capped ring of log entries
#[derive(Debug, Default)]
pub struct LogBuffer {
    entries: Mutex<VecDeque<LogEntry>>,
}

impl LogBuffer {
    /// Create an empty shared buffer
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// All buffered entries, newest first
    #[must_use]
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().iter().rev().cloned().collect()
    }

    /// Number of buffered entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the buffer is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    fn push(&self, entry: LogEntry) {
        let mut entries = self.entries.lock();
        if entries.len() >= LOG_BUFFER_CAP {
            entries.pop_front();
        }
        entries.push_back(entry);
    }
}

/// Layer feeding a [`LogBuffer`]
pub struct BufferLayer {
    buffer: Arc<LogBuffer>,
    min_level: Level,
}

impl BufferLayer {
    /// A `tracing_subscriber` layer writing events at or above `min_level`
    /// into the given buffer.
    #[must_use]
    pub fn new(buffer: Arc<LogBuffer>, min_level: Level) -> Self {
        Self { buffer, min_level }
    }
}

impl<S: Subscriber> Layer<S> for BufferLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();
        if *metadata.level() > self.min_level {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        self.buffer.push(LogEntry {
            timestamp,
            level: metadata.level().to_string(),
            target: metadata.target().to_string(),
            message: visitor.finish(),
        });
    }
}

/// Collects the `message` field and formats the rest as `key=value`
#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl MessageVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else if self.message.is_empty() {
            self.fields
        } else {
            format!("{} {}", self.message, self.fields)
        }
    }

    fn push_field(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if !self.fields.is_empty() {
            self.fields.push(' ');
        }
        let _ = write!(self.fields, "{}={:?}", field.name(), value);
    }
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.push_field(field, &value);
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            if !self.fields.is_empty() {
                self.fields.push(' ');
            }
            let _ = write!(self.fields, "{}={}", field.name(), value);
        }
    }
}
