//! The build driver: scheduling, prerequisite sequencing and run control.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, error, info, warn};

use kiln_core::{
    BuildMode, BuildResultCode, CancelToken, Error, IgnoreLock as _, LogLevel, Result,
    ResultStatus, StepCounter,
};
use kiln_store::{
    ContentIndex, FileVersionTracker, MemoryObjectStore, MemoryRecordStore, ObjectStore,
    ResultRecordStore,
};

use crate::context::{BuildContext, ExecuteContext};
use crate::progress::BuildMonitor;
use crate::resolver;
use crate::step::{BuildStep, ListStep, StepRef};

/// Drives one build graph to completion.
///
/// A builder owns a root [`ListStep`], the storage collaborators and the
/// run configuration. Steps execute as cooperative tasks on a multi-thread
/// runtime sized by `thread_count`; a step that awaits a prerequisite or
/// polls a provider yields its thread instead of blocking it.
pub struct Builder {
    name: String,
    thread_count: usize,
    replace_index: bool,
    root: Arc<ListStep>,
    objects: Arc<dyn ObjectStore>,
    records: Arc<dyn ResultRecordStore>,
    index: Arc<ContentIndex>,
    tracker: Arc<FileVersionTracker>,
    counter: Arc<StepCounter>,
    monitors: Vec<Arc<dyn BuildMonitor>>,
    cancel: Mutex<CancelToken>,
    current: Mutex<Option<Arc<BuildContext>>>,
    running: AtomicBool,
}

impl Builder {
    /// Creates a builder over the given storage collaborators.
    pub fn new(
        name: impl Into<String>,
        objects: Arc<dyn ObjectStore>,
        records: Arc<dyn ResultRecordStore>,
        index: Arc<ContentIndex>,
    ) -> Self {
        Self {
            name: name.into(),
            thread_count: std::thread::available_parallelism().map_or(4, std::num::NonZero::get),
            replace_index: false,
            root: ListStep::new("root"),
            objects,
            records,
            index,
            tracker: Arc::new(FileVersionTracker::new()),
            counter: Arc::new(StepCounter::new()),
            monitors: Vec::new(),
            cancel: Mutex::new(CancelToken::default()),
            current: Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    /// Creates a builder over in-memory stores, for tests and one-shot
    /// builds.
    pub fn in_memory(name: impl Into<String>) -> Self {
        Self::new(
            name,
            Arc::new(MemoryObjectStore::new()),
            Arc::new(MemoryRecordStore::new()),
            Arc::new(ContentIndex::new()),
        )
    }

    /// Sets the number of worker threads [`Builder::run`] uses.
    pub fn with_thread_count(mut self, thread_count: usize) -> Self {
        self.thread_count = thread_count.max(1);
        self
    }

    /// Makes a successful build replace the content index with the root's
    /// outputs instead of merging into it. Entries for locations the graph
    /// no longer produces are dropped.
    pub fn with_replace_index(mut self, replace: bool) -> Self {
        self.replace_index = replace;
        self
    }

    /// Registers a progress monitor.
    pub fn add_monitor(&mut self, monitor: Arc<dyn BuildMonitor>) {
        self.monitors.push(monitor);
    }

    /// Builder name, used in run logs.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Root step the build graph hangs off.
    pub fn root(&self) -> &Arc<ListStep> {
        &self.root
    }

    /// Per-status counters of the last (or current) run.
    pub fn step_counter(&self) -> &Arc<StepCounter> {
        &self.counter
    }

    /// Content index updated after successful builds.
    pub fn content_index(&self) -> &Arc<ContentIndex> {
        &self.index
    }

    /// Replaces the root with a fresh empty list so the builder can run
    /// another graph. Counters are reset as well.
    pub fn reset(&mut self) {
        self.root = ListStep::new("root");
        self.counter.clear();
    }

    /// Cancels the current run: signals every task and forwards the
    /// request to commands executing right now. Already-finished steps are
    /// unaffected.
    pub fn cancel_build(&self) {
        self.cancel.lock_ignore_poison().cancel();
        let current = self.current.lock_ignore_poison().clone();
        if let Some(build) = current {
            for entry in &build.in_progress {
                entry.value().command().cancel();
            }
        }
    }

    /// Runs the graph on a freshly built multi-thread runtime.
    ///
    /// Must not be called from inside an async runtime; use
    /// [`Builder::run_async`] there.
    ///
    /// # Errors
    /// Returns an error on runtime construction failure or any fatal
    /// engine error; ordinary step failures are reported through the
    /// result code instead.
    pub fn run(&self, mode: BuildMode) -> Result<BuildResultCode> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(self.thread_count)
            .enable_all()
            .build()?;
        runtime.block_on(self.run_async(mode))
    }

    /// Runs the graph on the current runtime.
    ///
    /// # Errors
    /// Returns an error if the builder is already running, if dependency
    /// generation finds a producer cycle, or on a fatal engine invariant
    /// violation.
    pub async fn run_async(&self, mode: BuildMode) -> Result<BuildResultCode> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::InvariantViolation(
                "this builder is already running".to_owned(),
            ));
        }
        let outcome = self.run_inner(mode).await;
        *self.current.lock_ignore_poison() = None;
        self.running.store(false, Ordering::SeqCst);
        outcome
    }

    async fn run_inner(&self, mode: BuildMode) -> Result<BuildResultCode> {
        info!(builder = self.name, ?mode, "build started");
        self.counter.clear();
        let cancel = CancelToken::default();
        *self.cancel.lock_ignore_poison() = cancel.clone();

        let build = Arc::new(BuildContext::new(
            Arc::clone(&self.objects),
            Arc::clone(&self.records),
            Arc::clone(&self.index),
            Arc::clone(&self.tracker),
            cancel.clone(),
            Arc::clone(&self.counter),
            self.monitors.clone(),
            mode,
        ));
        *self.current.lock_ignore_poison() = Some(Arc::clone(&build));
        let root: StepRef = Arc::clone(&self.root) as StepRef;

        match mode {
            BuildMode::Build => {
                schedule_step(&build, None, &root)?;
                let status = root.core().executed().await;

                if let Some(fatal) = build.take_fatal() {
                    error!(builder = self.name, "build aborted: {fatal}");
                    return Err(fatal);
                }

                if status.is_successful() {
                    if self.replace_index {
                        self.index.clear();
                    }
                    self.index.merge(
                        self.root
                            .output_objects()
                            .into_iter()
                            .filter(|(url, _)| url.is_content())
                            .map(|(url, output)| (url.path, output.id)),
                    );
                }

                let counter = &self.counter;
                info!(
                    builder = self.name,
                    "steps: {} succeeded, {} up-to-date, {} failed, {} not triggered due to \
                     previous failures",
                    counter.get(ResultStatus::Successful),
                    counter.get(ResultStatus::NotTriggeredWasSuccessful),
                    counter.get(ResultStatus::Failed),
                    counter.get(ResultStatus::NotTriggeredPrerequisiteFailed),
                );

                if cancel.is_cancelled() || status == ResultStatus::Cancelled {
                    error!(builder = self.name, "build cancelled");
                    Ok(BuildResultCode::Cancelled)
                } else if counter.get(ResultStatus::Failed) > 0
                    || counter.get(ResultStatus::NotTriggeredPrerequisiteFailed) > 0
                    || !status.is_successful()
                {
                    error!(builder = self.name, "build failed");
                    Ok(BuildResultCode::BuildError)
                } else {
                    info!(builder = self.name, "build is successful");
                    Ok(BuildResultCode::Successful)
                }
            }
            BuildMode::Clean | BuildMode::CleanAndDelete => {
                let ctx = ExecuteContext::new(Arc::clone(&build), Arc::clone(&root));
                root.clean(&ctx, mode == BuildMode::CleanAndDelete).await?;
                info!(builder = self.name, "clean finished");
                Ok(BuildResultCode::Successful)
            }
        }
    }
}

/// Accepts a step for execution and spawns its task.
///
/// The first schedule call wins the step's execution id; any later call is
/// a no-op so shared prerequisites are executed once. A step scheduled
/// with an instigator different from its recorded parent is a graph
/// defect.
pub(crate) fn schedule_step(
    build: &Arc<BuildContext>,
    instigator: Option<&StepRef>,
    step: &StepRef,
) -> Result<()> {
    let execution_id = build
        .next_execution_id
        .fetch_add(1, Ordering::SeqCst);
    if !step.core().try_assign_execution_id(execution_id) {
        return Ok(());
    }

    if let Some(instigator) = instigator {
        match step.core().parent() {
            Some(parent) => {
                if parent.core().id() != instigator.core().id() {
                    return Err(Error::InvariantViolation(format!(
                        "step {} was scheduled by {} but belongs to {}",
                        step.core().title(),
                        instigator.core().title(),
                        parent.core().title()
                    )));
                }
            }
            None => {
                step.core().set_parent(Arc::downgrade(instigator));
            }
        }
        if step.core().priority().is_none() {
            if let Some(priority) = instigator.core().priority() {
                step.core().set_priority(priority);
            }
        }
    }

    resolver::generate_dependencies(step)?;

    for monitor in &build.monitors {
        monitor.step_scheduled(step.as_ref());
    }

    let build = Arc::clone(build);
    let step = Arc::clone(step);
    tokio::spawn(run_step(build, step));
    Ok(())
}

/// Task body of one scheduled step: waits for prerequisites, executes,
/// merges into the parent and publishes the terminal status.
async fn run_step(build: Arc<BuildContext>, step: StepRef) {
    let ctx = ExecuteContext::new(Arc::clone(&build), Arc::clone(&step));

    let mut prerequisites_ok = true;
    for prerequisite in step.core().prerequisites() {
        if !prerequisite.core().executed().await.is_successful() {
            prerequisites_ok = false;
        }
    }

    let status = if !prerequisites_ok {
        ResultStatus::NotTriggeredPrerequisiteFailed
    } else if build.cancel.is_cancelled() {
        ResultStatus::Cancelled
    } else {
        if let Some(parent) = step.core().parent() {
            if let Some(handle) = parent.merged_handle() {
                step.core()
                    .set_start_generation(handle.lock_ignore_poison().generation());
            }
        }
        for monitor in &build.monitors {
            monitor.step_started(step.as_ref());
        }
        match step.execute(&ctx).await {
            Ok(status) => status,
            Err(Error::Cancelled) => ResultStatus::Cancelled,
            Err(error) => {
                ctx.logger().log(
                    LogLevel::Error,
                    format!("step failed: {error}"),
                );
                ResultStatus::Failed
            }
        }
    };

    let status = if status == ResultStatus::NotProcessed {
        build.record_fatal(Error::InvariantViolation(format!(
            "step {} completed while still NotProcessed",
            step.core().title()
        )));
        ResultStatus::Failed
    } else {
        status
    };

    match status {
        ResultStatus::Successful => debug!(step = step.core().title(), "step succeeded"),
        ResultStatus::NotTriggeredWasSuccessful => {
            debug!(step = step.core().title(), "step is up to date");
        }
        ResultStatus::Failed => error!(step = step.core().title(), "step failed"),
        ResultStatus::NotTriggeredPrerequisiteFailed => {
            warn!(step = step.core().title(), "step skipped, a prerequisite failed");
        }
        ResultStatus::Cancelled => warn!(step = step.core().title(), "step cancelled"),
        ResultStatus::NotProcessed => {}
    }

    // Merge the finished step into its parent before the terminal status
    // becomes observable, so a dependent scheduled next sees its outputs.
    if status.is_successful() {
        if let Some(parent) = step.core().parent() {
            if let Some(handle) = parent.merged_handle() {
                let prerequisite_ids = step
                    .core()
                    .prerequisites()
                    .iter()
                    .map(|prerequisite| prerequisite.core().id())
                    .collect();
                let merge = handle.lock_ignore_poison().merge_child(
                    step.core().id(),
                    step.core().start_generation(),
                    &prerequisite_ids,
                    &step.input_objects(),
                    &step.output_objects(),
                );
                if let Err(error) = merge {
                    error!(
                        step = step.core().title(),
                        parent = parent.core().title(),
                        "merge rejected: {error}"
                    );
                }
            }
        }
    }

    step.core().set_status(status);
    build.counter.add_step_result(status);
    for monitor in &build.monitors {
        monitor.step_finished(step.as_ref(), status);
    }
}
