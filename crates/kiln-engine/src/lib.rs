//! Incremental, cache-aware build orchestration.
//!
//! The engine executes a graph of build steps: leaves wrap pluggable
//! commands, composites fan out over children, and a dynamic step pulls
//! work from a provider while the build runs. Command results are cached
//! by a hash of the command's parameters, version tag and input versions;
//! an unchanged command is skipped and its recorded outputs and log
//! messages are replayed. Identical commands running concurrently are
//! deduplicated to a single execution.
//!
//! A [`builder::Builder`] owns the root of the graph and the storage
//! collaborators from `kiln-store`, and drives a run to a
//! [`kiln_core::BuildResultCode`].

/// The build driver: scheduling, prerequisite sequencing and run control.
pub mod builder;
/// Shared run state and the per-step execution context.
pub mod context;
/// Runtime detection of overlapping reads and writes across commands.
pub mod monitor;
/// Build progress reporting and per-step logging.
pub mod progress;
/// Inference of prerequisite edges from declared locations.
mod resolver;
/// Build step model.
pub mod step;
/// Output transactions and composite output map merging.
pub mod transaction;

pub use builder::Builder;
pub use context::ExecuteContext;
pub use monitor::IoMonitor;
pub use progress::{BuildMonitor, StepLogger};
pub use step::{
    BuildStep, CommandStep, DynamicStep, ListStep, OutputObject, StepCore, StepId, StepProvider,
    StepRef, WeakStepRef, link_steps,
};
pub use step::dynamic::URGENT_PRIORITY;
pub use transaction::{BuildTransaction, InputRecord, MergedMaps};

/// Version folded into every command hash. Bumping it invalidates every
/// cached result at once, for changes to the hashing or record layout
/// itself.
pub const CACHE_FORMAT_VERSION: u32 = 1;
