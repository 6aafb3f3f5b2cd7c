//! Error types and result definitions.

use core::fmt;
use core::result::Result as CoreResult;
use std::io::Error as IoError;

use serde_json::Error as SerdeJsonError;
use thiserror::Error;
use uuid::Uuid;

use crate::url::ObjectUrl;

/// Result type for build engine operations.
pub type Result<T> = CoreResult<T, Error>;

/// Errors that can occur while building.
#[derive(Debug, Error)]
pub enum Error {
    /// An I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON serialization or deserialization failed.
    #[error("JSON serialization error: {0}")]
    Json(#[from] SerdeJsonError),

    /// The object store or one of its companions failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// A command input could not be resolved or hashed.
    #[error("input hashing failed: {0}")]
    Hashing(String),

    /// A command reported a failure while executing.
    #[error("command failed: {0}")]
    Command(String),

    /// Merging a finished child surfaced a read/write or write/write
    /// hazard. This is a defect in the build graph, not in a command, and
    /// is never retried.
    #[error("merge conflict: {0}")]
    MergeConflict(MergeConflictReport),

    /// Inferred prerequisite edges form a cycle between producer steps.
    #[error("dependency cycle between producer steps involving {0}")]
    CyclicDependency(String),

    /// The engine or a command violated an internal contract. Fatal to
    /// the run.
    #[error("engine invariant violated: {0}")]
    InvariantViolation(String),

    /// The build was cancelled.
    #[error("build cancelled")]
    Cancelled,

    /// A general error not covered by other variants.
    #[error("{0}")]
    Other(String),
}

/// Kind of hazard detected while merging output maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    /// A step read a location another step wrote concurrently.
    ReadWrite,
    /// Two steps wrote different objects to the same location.
    WriteWrite,
}

/// One conflicting location in a [`MergeConflictReport`].
#[derive(Debug, Clone)]
pub struct UrlConflict {
    /// Location both steps touched.
    pub url: ObjectUrl,
    /// Hazard classification.
    pub kind: ConflictKind,
    /// Step that already owned an output for the location.
    pub existing_producer: Uuid,
    /// Step whose merge was rejected.
    pub incoming_producer: Uuid,
}

/// Structured report for a rejected merge.
#[derive(Debug, Clone)]
pub struct MergeConflictReport {
    /// Conflicting locations, one entry per url.
    pub conflicts: Vec<UrlConflict>,
}

impl fmt::Display for MergeConflictReport {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, conflict) in self.conflicts.iter().enumerate() {
            if index > 0 {
                formatter.write_str("; ")?;
            }
            let kind = match conflict.kind {
                ConflictKind::ReadWrite => "read/write",
                ConflictKind::WriteWrite => "write/write",
            };
            write!(
                formatter,
                "{} hazard on {} between steps {} and {}",
                kind, conflict.url, conflict.existing_producer, conflict.incoming_producer
            )?;
        }
        Ok(())
    }
}
