//! Core types and contracts for the kiln build engine.
//!
//! This crate defines the data model shared by the storage layer and the
//! engine: content-addressed object identities, logical object urls, the
//! result status state machine, the pluggable [`Command`] contract, cache
//! records, and the shared error type.

/// Cooperative cancellation token.
pub mod cancel;
/// The pluggable command contract and its execution-side collaborators.
pub mod command;
/// Error types and result definitions.
pub mod error;
/// Replayable log records emitted by commands.
pub mod log;
/// Content-addressed object identities.
pub mod object;
/// Persisted command result records.
pub mod result_entry;
/// Result statuses, build result codes and the step counter.
pub mod status;
/// Synchronization utilities.
pub mod sync;
/// Logical object urls.
pub mod url;

pub use cancel::CancelToken;
pub use command::{Command, CommandContext, HookContext};
pub use error::{ConflictKind, Error, MergeConflictReport, Result, UrlConflict};
pub use log::{LogLevel, LogMessage};
pub use object::{ObjectId, ObjectIdHasher};
pub use result_entry::CommandResultEntry;
pub use status::{BuildMode, BuildResultCode, ResultStatus, StepCounter};
pub use sync::IgnoreLock;
pub use url::{ObjectUrl, UrlKind};
