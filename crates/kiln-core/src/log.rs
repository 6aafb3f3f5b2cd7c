//! Replayable log records emitted by commands.
//!
//! Messages a command logs while executing are persisted with its cache
//! record so that a cache hit can replay them, making a skipped build look
//! identical to the original one in diagnostics.

use serde::{Deserialize, Serialize};

/// Severity of a [`LogMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    /// Diagnostic detail.
    Debug,
    /// Normal progress information.
    Info,
    /// A recoverable problem.
    Warning,
    /// A failure.
    Error,
}

/// One log record produced by a command execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogMessage {
    /// Severity.
    pub level: LogLevel,
    /// Message text.
    pub text: String,
}

impl LogMessage {
    /// Creates a log record.
    pub fn new(level: LogLevel, text: impl Into<String>) -> Self {
        Self {
            level,
            text: text.into(),
        }
    }
}
