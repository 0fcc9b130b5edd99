//! Progress notifications.
//!
//! Long-running operations (sub-query execution, cross-server cohort copies)
//! report progress and warnings through a [`ProgressSink`] supplied by the
//! caller.

use log::{error, info, warn};
use parking_lot::Mutex;

/// Severity of a progress event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProgressLevel {
    /// Informational.
    Information,
    /// Something the operator should look at; the operation continues.
    Warning,
    /// The operation failed.
    Error,
}

/// A progress event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    /// Severity.
    pub level: ProgressLevel,
    /// Component that raised the event.
    pub sender: String,
    /// Message text.
    pub message: String,
}

impl ProgressEvent {
    /// Creates an event.
    pub fn new(level: ProgressLevel, sender: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level,
            sender: sender.into(),
            message: message.into(),
        }
    }
}

/// Receives progress events.
pub trait ProgressSink: Send + Sync {
    /// Delivers an event.
    fn notify(&self, event: ProgressEvent);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpProgressSink;

impl ProgressSink for NoOpProgressSink {
    fn notify(&self, _event: ProgressEvent) {}
}

/// Forwards events to the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogProgressSink;

impl ProgressSink for LogProgressSink {
    fn notify(&self, event: ProgressEvent) {
        match event.level {
            ProgressLevel::Information => info!("[{}] {}", event.sender, event.message),
            ProgressLevel::Warning => warn!("[{}] {}", event.sender, event.message),
            ProgressLevel::Error => error!("[{}] {}", event.sender, event.message),
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct CollectingProgressSink {
    events: Mutex<Vec<ProgressEvent>>,
}

impl CollectingProgressSink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every event received so far.
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().clone()
    }

    /// Events at `level` or above.
    pub fn at_least(&self, level: ProgressLevel) -> Vec<ProgressEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.level >= level)
            .cloned()
            .collect()
    }
}

impl ProgressSink for CollectingProgressSink {
    fn notify(&self, event: ProgressEvent) {
        self.events.lock().push(event);
    }
}
