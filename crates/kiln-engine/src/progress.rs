//! Build progress reporting and per-step logging.

use std::sync::{Arc, Mutex};

use tracing::{debug, error, info, warn};

use kiln_core::{IgnoreLock as _, LogLevel, LogMessage, ResultStatus};

use crate::step::{BuildStep, StepId};

/// Observer of build progress.
///
/// Monitors are registered on the builder and notified from the scheduler;
/// callbacks must be cheap and must not block.
pub trait BuildMonitor: Send + Sync {
    /// A step was accepted for execution.
    fn step_scheduled(&self, _step: &dyn BuildStep) {}

    /// A step began executing, after its prerequisites settled.
    fn step_started(&self, _step: &dyn BuildStep) {}

    /// A step reached a terminal status.
    fn step_finished(&self, _step: &dyn BuildStep, _status: ResultStatus) {}

    /// A step emitted a log message, live or replayed from the cache.
    fn log_message(&self, _step: StepId, _message: &LogMessage) {}
}

/// Collects the log messages of one step execution and forwards them to
/// tracing and the registered monitors.
///
/// Messages emitted during a real command execution are persisted in the
/// cache record; on a cache hit the recorded messages are replayed through
/// the same logger so skipped steps log identically to executed ones.
pub struct StepLogger {
    step: StepId,
    title: String,
    monitors: Vec<Arc<dyn BuildMonitor>>,
    messages: Mutex<Vec<LogMessage>>,
}

impl StepLogger {
    pub(crate) fn new(step: StepId, title: String, monitors: Vec<Arc<dyn BuildMonitor>>) -> Self {
        Self {
            step,
            title,
            monitors,
            messages: Mutex::new(Vec::new()),
        }
    }

    /// Emits one message.
    pub fn log(&self, level: LogLevel, text: impl Into<String>) {
        let message = LogMessage::new(level, text);
        match level {
            LogLevel::Debug => debug!(step = %self.title, "{}", message.text),
            LogLevel::Info => info!(step = %self.title, "{}", message.text),
            LogLevel::Warning => warn!(step = %self.title, "{}", message.text),
            LogLevel::Error => error!(step = %self.title, "{}", message.text),
        }
        for monitor in &self.monitors {
            monitor.log_message(self.step, &message);
        }
        self.messages.lock_ignore_poison().push(message);
    }

    /// Replays messages recorded by an earlier execution.
    pub fn replay(&self, messages: &[LogMessage]) {
        for message in messages {
            self.log(message.level, message.text.clone());
        }
    }

    /// Snapshot of the messages emitted so far.
    pub fn messages(&self) -> Vec<LogMessage> {
        self.messages.lock_ignore_poison().clone()
    }
}
