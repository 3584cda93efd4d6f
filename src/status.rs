//! Status feed for an external UI. Every entry is also logged through tracing
//! by whoever reports it; the feed only carries the user-facing summary.

use chrono::{DateTime, Local};
use serde::Serialize;
use std::fmt;
use tokio::sync::broadcast;

const STATUS_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StatusLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusEntry {
    pub timestamp: DateTime<Local>,
    pub level: StatusLevel,
    pub source: &'static str,
    pub message: String,
}

impl fmt::Display for StatusEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {:?} {}: {}",
            self.timestamp.format("%H:%M:%S"),
            self.level,
            self.source,
            self.message
        )
    }
}

#[derive(Debug, Clone)]
pub struct StatusSink {
    tx: broadcast::Sender<StatusEntry>,
}

impl Default for StatusSink {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusSink {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(STATUS_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEntry> {
        self.tx.subscribe()
    }

    /// Without subscribers the entry is dropped.
    pub fn report(&self, level: StatusLevel, source: &'static str, message: impl Into<String>) {
        let _ = self.tx.send(StatusEntry {
            timestamp: Local::now(),
            level,
            source,
            message: message.into(),
        });
    }

    pub fn info(&self, source: &'static str, message: impl Into<String>) {
        self.report(StatusLevel::Info, source, message);
    }

    pub fn warn(&self, source: &'static str, message: impl Into<String>) {
        self.report(StatusLevel::Warn, source, message);
    }

    pub fn error(&self, source: &'static str, message: impl Into<String>) {
        self.report(StatusLevel::Error, source, message);
    }
}
