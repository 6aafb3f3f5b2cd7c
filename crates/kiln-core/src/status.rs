//! Result statuses, build result codes and the step counter.

use core::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

/// Execution status of a build step.
///
/// A step starts in [`ResultStatus::NotProcessed`] and must reach exactly
/// one of the terminal statuses. A step whose execution task completes
/// while still `NotProcessed` indicates a bug in the engine or in a
/// command, not a data problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResultStatus {
    /// Initial state, not yet executed.
    NotProcessed,
    /// The step executed its command and succeeded.
    Successful,
    /// The step executed and failed.
    Failed,
    /// The step was cancelled before or during execution.
    Cancelled,
    /// The step was skipped because a previous successful result is still
    /// valid (cache hit).
    NotTriggeredWasSuccessful,
    /// The step was never executed because a prerequisite failed.
    NotTriggeredPrerequisiteFailed,
}

impl ResultStatus {
    /// Number of status variants, for counter storage.
    pub const COUNT: usize = 6;

    /// Whether the status is terminal.
    pub fn is_terminal(self) -> bool {
        self != Self::NotProcessed
    }

    /// Whether the status counts as a successful outcome.
    pub fn is_successful(self) -> bool {
        matches!(self, Self::Successful | Self::NotTriggeredWasSuccessful)
    }

    /// Dense index of the variant, used by [`StepCounter`].
    fn index(self) -> usize {
        match self {
            Self::NotProcessed => 0,
            Self::Successful => 1,
            Self::Failed => 2,
            Self::Cancelled => 3,
            Self::NotTriggeredWasSuccessful => 4,
            Self::NotTriggeredPrerequisiteFailed => 5,
        }
    }
}

/// Overall outcome of a build run, surfaced to the driving process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildResultCode {
    /// Every step succeeded or was up to date.
    Successful,
    /// At least one step failed or was not triggered due to a failure.
    BuildError,
    /// The driving process was invoked with invalid arguments. Reserved
    /// for drivers; the engine itself never returns it.
    CommandLineError,
    /// The run was cancelled.
    Cancelled,
}

/// Mode a build run executes in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildMode {
    /// Execute the build graph.
    Build,
    /// Drop the cache records used to skip up-to-date commands.
    Clean,
    /// Drop the cache records and delete every recorded output object.
    CleanAndDelete,
}

/// Aggregate per-status step counters for reporting.
#[derive(Debug, Default)]
pub struct StepCounter {
    counts: [AtomicUsize; ResultStatus::COUNT],
}

impl StepCounter {
    /// Creates a zeroed counter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one step result.
    pub fn add_step_result(&self, status: ResultStatus) {
        self.counts[status.index()].fetch_add(1, Ordering::Relaxed);
    }

    /// Number of steps that finished with `status`.
    pub fn get(&self, status: ResultStatus) -> usize {
        self.counts[status.index()].load(Ordering::Relaxed)
    }

    /// Total number of recorded step results.
    pub fn total(&self) -> usize {
        self.counts
            .iter()
            .map(|count| count.load(Ordering::Relaxed))
            .sum()
    }

    /// Resets every counter to zero.
    pub fn clear(&self) {
        for count in &self.counts {
            count.store(0, Ordering::Relaxed);
        }
    }
}
