//! Append-only, timestamped log shown to the user.
//!
//! Every line is also emitted as a `tracing` event so the file log and the
//! user-facing stream never disagree.

use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Local};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub timestamp: DateTime<Local>,
    pub level: LogLevel,
    pub message: String,
}

impl fmt::Display for LogLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.timestamp.format("%H:%M:%S"), self.message)
    }
}

/// Shared handle; clones append to the same stream.
#[derive(Clone)]
pub struct LogStream {
    lines: Arc<Mutex<Vec<LogLine>>>,
    tx: broadcast::Sender<LogLine>,
}

impl Default for LogStream {
    fn default() -> Self {
        Self::new()
    }
}

impl LogStream {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            lines: Arc::new(Mutex::new(Vec::new())),
            tx,
        }
    }

    pub fn info(&self, message: impl Into<String>) {
        self.push(LogLevel::Info, message.into());
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.push(LogLevel::Warn, message.into());
    }

    pub fn error(&self, message: impl Into<String>) {
        self.push(LogLevel::Error, message.into());
    }

    /// Everything logged so far, oldest first.
    pub fn snapshot(&self) -> Vec<LogLine> {
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }

    /// Lines appended from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<LogLine> {
        self.tx.subscribe()
    }

    fn push(&self, level: LogLevel, message: String) {
        match level {
            LogLevel::Info => info!(target: "macvm::log", "{message}"),
            LogLevel::Warn => warn!(target: "macvm::log", "{message}"),
            LogLevel::Error => error!(target: "macvm::log", "{message}"),
        }

        let line = LogLine {
            timestamp: Local::now(),
            level,
            message,
        };
        // Appending and broadcasting under one lock keeps subscribers in
        // snapshot order.
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(line.clone());
            let _ = self.tx.send(line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_uses_clock_time() {
        let line = LogLine {
            timestamp: Local::now(),
            level: LogLevel::Info,
            message: "VM started".into(),
        };
        let rendered = line.to_string();
        assert!(rendered.starts_with('['));
        assert_eq!(&rendered[9..], "] VM started");
    }

    #[test]
    fn snapshot_preserves_order() {
        let log = LogStream::new();
        log.info("one");
        log.warn("two");
        log.error("three");

        let messages: Vec<_> = log.snapshot().into_iter().map(|l| l.message).collect();
        assert_eq!(messages, ["one", "two", "three"]);
    }

    #[tokio::test]
    async fn subscribers_see_new_lines() {
        let log = LogStream::new();
        log.info("before");
        let mut rx = log.subscribe();
        log.error("after");

        let line = rx.recv().await.unwrap();
        assert_eq!(line.message, "after");
        assert_eq!(line.level, LogLevel::Error);
    }
}
