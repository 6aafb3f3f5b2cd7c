//! Shared run state and the per-step execution context.

use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;

use kiln_core::{BuildMode, CancelToken, Error, IgnoreLock as _, ObjectId, Result, StepCounter};
use kiln_store::{ContentIndex, FileVersionTracker, ObjectStore, ResultRecordStore};

use crate::monitor::IoMonitor;
use crate::progress::{BuildMonitor, StepLogger};
use crate::step::{CommandStep, StepRef};
use crate::transaction::BuildTransaction;

/// State shared by every step of one build run.
pub struct BuildContext {
    pub(crate) objects: Arc<dyn ObjectStore>,
    pub(crate) records: Arc<dyn ResultRecordStore>,
    pub(crate) index: Arc<ContentIndex>,
    pub(crate) tracker: Arc<FileVersionTracker>,
    /// Command hash to the step currently executing that command. Entries
    /// are removed when the owning execution finishes.
    pub(crate) in_progress: DashMap<ObjectId, Arc<CommandStep>>,
    pub(crate) cancel: CancelToken,
    pub(crate) counter: Arc<StepCounter>,
    pub(crate) io_monitor: IoMonitor,
    pub(crate) monitors: Vec<Arc<dyn BuildMonitor>>,
    pub(crate) next_execution_id: AtomicU64,
    pub(crate) mode: BuildMode,
    fatal: Mutex<Option<Error>>,
}

impl BuildContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        objects: Arc<dyn ObjectStore>,
        records: Arc<dyn ResultRecordStore>,
        index: Arc<ContentIndex>,
        tracker: Arc<FileVersionTracker>,
        cancel: CancelToken,
        counter: Arc<StepCounter>,
        monitors: Vec<Arc<dyn BuildMonitor>>,
        mode: BuildMode,
    ) -> Self {
        Self {
            objects,
            records,
            index,
            tracker,
            in_progress: DashMap::new(),
            cancel,
            counter,
            io_monitor: IoMonitor::new(),
            monitors,
            next_execution_id: AtomicU64::new(1),
            mode,
            fatal: Mutex::new(None),
        }
    }

    /// Records an engine invariant violation and cancels the run. Only the
    /// first fatal error is kept.
    pub(crate) fn record_fatal(&self, error: Error) {
        let mut fatal = self.fatal.lock_ignore_poison();
        if fatal.is_none() {
            *fatal = Some(error);
        }
        drop(fatal);
        self.cancel.cancel();
    }

    pub(crate) fn take_fatal(&self) -> Option<Error> {
        self.fatal.lock_ignore_poison().take()
    }

    /// Runtime I/O hazard monitor for this run.
    pub fn io_monitor(&self) -> &IoMonitor {
        &self.io_monitor
    }

    /// Mode the run executes in.
    pub fn mode(&self) -> BuildMode {
        self.mode
    }
}

/// Everything one step needs while executing: the shared run state, the
/// step's resolution transaction and its logger.
pub struct ExecuteContext {
    build: Arc<BuildContext>,
    step: StepRef,
    transaction: BuildTransaction,
    logger: StepLogger,
}

impl ExecuteContext {
    pub(crate) fn new(build: Arc<BuildContext>, step: StepRef) -> Self {
        let transaction = BuildTransaction::for_step(&step, Arc::clone(&build.index));
        let logger = StepLogger::new(
            step.core().id(),
            step.core().title().to_owned(),
            build.monitors.clone(),
        );
        Self {
            build,
            step,
            transaction,
            logger,
        }
    }

    pub(crate) fn build(&self) -> &Arc<BuildContext> {
        &self.build
    }

    /// Step this context belongs to.
    pub fn step(&self) -> &StepRef {
        &self.step
    }

    /// Url resolution scope of the step.
    pub fn transaction(&self) -> &BuildTransaction {
        &self.transaction
    }

    /// Logger of the step.
    pub fn logger(&self) -> &StepLogger {
        &self.logger
    }

    /// Cancellation signal of the run.
    pub fn cancel_token(&self) -> &CancelToken {
        &self.build.cancel
    }

    /// Schedules a child step with this step as instigator.
    ///
    /// # Errors
    /// Returns an error if the child is already owned by a different
    /// parent or if dependency generation finds a cycle.
    pub fn schedule(&self, child: &StepRef) -> Result<()> {
        crate::builder::schedule_step(&self.build, Some(&self.step), child)
    }
}
