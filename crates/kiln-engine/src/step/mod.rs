//! Build step model: identities, shared step state and the step contract.

use core::fmt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use async_trait::async_trait;
use tokio::sync::watch;
use uuid::Uuid;

use kiln_core::{IgnoreLock as _, ObjectId, ObjectUrl, Result, ResultStatus};

use crate::context::ExecuteContext;
use crate::transaction::MergedMaps;

pub mod command;
pub mod dynamic;
pub mod list;

pub use command::CommandStep;
pub use dynamic::{DynamicStep, StepProvider};
pub use list::ListStep;

/// Shared reference to a build step.
pub type StepRef = Arc<dyn BuildStep>;

/// Weak reference to a build step, used for parent links.
pub type WeakStepRef = Weak<dyn BuildStep>;

/// Unique identity of a build step within a builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StepId(Uuid);

impl StepId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Raw uuid of the step, used in conflict reports.
    pub fn as_uuid(self) -> Uuid {
        self.0
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

/// One output object in a composite's merged output map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputObject {
    /// Object backing the location.
    pub id: ObjectId,
    /// Step whose merge last wrote the location.
    pub producer: StepId,
    /// Merge generation the location was last written in.
    pub generation: u64,
    /// Symbolic tags attached by the producing command.
    pub tags: Vec<String>,
}

/// State every build step carries: identity, status channel, scheduling
/// bookkeeping and graph links.
pub struct StepCore {
    id: StepId,
    title: String,
    status: watch::Sender<ResultStatus>,
    execution_id: AtomicU64,
    priority: Mutex<Option<i32>>,
    parent: OnceLock<WeakStepRef>,
    prerequisites: Mutex<Vec<StepRef>>,
    processed_dependencies: AtomicBool,
    start_generation: AtomicU64,
}

impl StepCore {
    /// Creates the core state for a step titled `title`.
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            id: StepId::new(),
            title: title.into(),
            status: watch::Sender::new(ResultStatus::NotProcessed),
            execution_id: AtomicU64::new(0),
            priority: Mutex::new(None),
            parent: OnceLock::new(),
            prerequisites: Mutex::new(Vec::new()),
            processed_dependencies: AtomicBool::new(false),
            start_generation: AtomicU64::new(0),
        }
    }

    /// Identity of the step.
    pub fn id(&self) -> StepId {
        self.id
    }

    /// Step title for logs and progress reporting.
    pub fn title(&self) -> &str {
        &self.title
    }

    /// Current status of the step.
    pub fn status(&self) -> ResultStatus {
        *self.status.borrow()
    }

    pub(crate) fn set_status(&self, status: ResultStatus) {
        self.status.send_replace(status);
    }

    /// Waits until the step reaches a terminal status and returns it.
    /// Returns immediately if the step is already terminal.
    pub async fn executed(&self) -> ResultStatus {
        let mut receiver = self.status.subscribe();
        match receiver.wait_for(|status| status.is_terminal()).await {
            Ok(status) => *status,
            // The sender lives in self, so the channel cannot close while
            // we are borrowing it.
            Err(_) => self.status(),
        }
    }

    /// Scheduling priority, lower runs first. `None` means unset and
    /// inherits from the instigator at scheduling time.
    pub fn priority(&self) -> Option<i32> {
        *self.priority.lock_ignore_poison()
    }

    /// Sets the scheduling priority.
    pub fn set_priority(&self, priority: i32) {
        *self.priority.lock_ignore_poison() = Some(priority);
    }

    /// Parent composite the step was scheduled under, if still alive.
    pub fn parent(&self) -> Option<StepRef> {
        self.parent.get().and_then(Weak::upgrade)
    }

    pub(crate) fn set_parent(&self, parent: WeakStepRef) -> bool {
        self.parent.set(parent).is_ok()
    }

    /// Steps that must reach a successful terminal status before this one
    /// executes.
    pub fn prerequisites(&self) -> Vec<StepRef> {
        self.prerequisites.lock_ignore_poison().clone()
    }

    /// Adds a prerequisite edge. Duplicate edges to the same step are
    /// dropped.
    pub fn add_prerequisite(&self, step: StepRef) {
        let mut prerequisites = self.prerequisites.lock_ignore_poison();
        if prerequisites
            .iter()
            .any(|existing| existing.core().id() == step.core().id())
        {
            return;
        }
        prerequisites.push(step);
    }

    /// Claims the step for scheduling. Only the first caller wins; later
    /// schedule attempts are no-ops.
    pub(crate) fn try_assign_execution_id(&self, execution_id: u64) -> bool {
        self.execution_id
            .compare_exchange(0, execution_id, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Execution id assigned at scheduling time, 0 if never scheduled.
    pub fn execution_id(&self) -> u64 {
        self.execution_id.load(Ordering::SeqCst)
    }

    /// Marks dependency generation as done, returning whether this call
    /// was the first.
    pub(crate) fn mark_dependencies_processed(&self) -> bool {
        !self.processed_dependencies.swap(true, Ordering::SeqCst)
    }

    /// Parent merge generation observed when this step started executing.
    pub fn start_generation(&self) -> u64 {
        self.start_generation.load(Ordering::SeqCst)
    }

    pub(crate) fn set_start_generation(&self, generation: u64) {
        self.start_generation.store(generation, Ordering::SeqCst);
    }
}

impl fmt::Debug for StepCore {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("StepCore")
            .field("id", &self.id)
            .field("title", &self.title)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

/// A node of the build graph.
///
/// Leaves wrap a [`kiln_core::Command`]; composites schedule children and
/// merge their results. Implementations outside this crate are possible
/// but the engine's semantics are carried by [`CommandStep`], [`ListStep`]
/// and [`DynamicStep`].
#[async_trait]
pub trait BuildStep: Send + Sync + 'static {
    /// Shared step state.
    fn core(&self) -> &StepCore;

    /// Logical location this step is the canonical producer of, used to
    /// infer prerequisite edges.
    fn output_location(&self) -> Option<ObjectUrl> {
        None
    }

    /// Runs the step and returns its terminal status. Infrastructure
    /// errors bubble up as `Err` and are turned into `Failed` by the
    /// scheduler.
    async fn execute(&self, ctx: &ExecuteContext) -> Result<ResultStatus>;

    /// Drops the cached results of this step, and the recorded output
    /// objects as well when `delete_output` is set.
    async fn clean(&self, ctx: &ExecuteContext, delete_output: bool) -> Result<()>;

    /// Inputs the step read, keyed by url.
    fn input_objects(&self) -> HashMap<ObjectUrl, ObjectId>;

    /// Outputs the step produced, keyed by url.
    fn output_objects(&self) -> HashMap<ObjectUrl, OutputObject>;

    /// Child steps of a composite; empty for leaves.
    fn children(&self) -> Vec<StepRef> {
        Vec::new()
    }

    /// Merged output maps handle for composites; `None` for leaves.
    fn merged_handle(&self) -> Option<Arc<Mutex<MergedMaps>>> {
        None
    }

    /// Downcast to a leaf command step.
    fn as_command(&self) -> Option<&CommandStep> {
        None
    }
}

/// Links `prerequisite` before `dependent`: the dependent will not execute
/// until the prerequisite reaches a successful terminal status.
pub fn link_steps(prerequisite: &StepRef, dependent: &StepRef) {
    dependent.core().add_prerequisite(Arc::clone(prerequisite));
}

#[cfg(test)]
mod tests {
    use super::*;

    struct InertStep {
        core: StepCore,
    }

    #[async_trait]
    impl BuildStep for InertStep {
        fn core(&self) -> &StepCore {
            &self.core
        }

        async fn execute(&self, _ctx: &ExecuteContext) -> Result<ResultStatus> {
            Ok(ResultStatus::Successful)
        }

        async fn clean(&self, _ctx: &ExecuteContext, _delete_output: bool) -> Result<()> {
            Ok(())
        }

        fn input_objects(&self) -> HashMap<ObjectUrl, ObjectId> {
            HashMap::new()
        }

        fn output_objects(&self) -> HashMap<ObjectUrl, OutputObject> {
            HashMap::new()
        }
    }

    fn inert(title: &str) -> StepRef {
        Arc::new(InertStep {
            core: StepCore::new(title),
        })
    }

    #[test]
    fn test_execution_id_is_claimed_once() {
        let step = inert("claim");
        assert_eq!(step.core().execution_id(), 0);
        assert!(step.core().try_assign_execution_id(7));
        assert!(!step.core().try_assign_execution_id(8));
        assert_eq!(step.core().execution_id(), 7);
    }

    #[test]
    fn test_duplicate_prerequisites_are_dropped() {
        let producer = inert("producer");
        let consumer = inert("consumer");
        link_steps(&producer, &consumer);
        link_steps(&producer, &consumer);
        assert_eq!(consumer.core().prerequisites().len(), 1);
    }

    #[tokio::test]
    async fn test_executed_returns_terminal_status() {
        let step = inert("watched");
        let waited = {
            let step = Arc::clone(&step);
            tokio::spawn(async move { step.core().executed().await })
        };
        step.core().set_status(ResultStatus::Successful);
        assert_eq!(waited.await.unwrap(), ResultStatus::Successful);

        // Already terminal, must return immediately.
        assert_eq!(step.core().executed().await, ResultStatus::Successful);
    }
}
