//! Static composite step over a fixed list of children.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::task::JoinSet;

use kiln_core::{Command, Error, IgnoreLock as _, ObjectId, ObjectUrl, Result, ResultStatus};

use crate::context::ExecuteContext;
use crate::step::{BuildStep, CommandStep, OutputObject, StepCore, StepRef};
use crate::transaction::MergedMaps;

/// Composite step executing a fixed set of children concurrently.
///
/// Children are scheduled in priority order (lower first) and run under
/// the scheduler's parallelism budget. As each child reaches a terminal
/// status its input and output maps are merged into this step's maps, and
/// a merge hazard fails the composite rather than any one child.
pub struct ListStep {
    core: StepCore,
    children: Mutex<Vec<StepRef>>,
    merged: Arc<Mutex<MergedMaps>>,
}

impl ListStep {
    /// Creates an empty list step.
    pub fn new(title: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            core: StepCore::new(title),
            children: Mutex::new(Vec::new()),
            merged: Arc::new(Mutex::new(MergedMaps::default())),
        })
    }

    /// Adds a child step. Children added after the list started executing
    /// are not picked up; use a dynamic step for open-ended work.
    pub fn add(&self, step: StepRef) {
        self.children.lock_ignore_poison().push(step);
    }

    /// Wraps a command in a leaf step and adds it, returning the leaf.
    pub fn add_command(&self, command: Arc<dyn Command>) -> Arc<CommandStep> {
        let step = CommandStep::new(command);
        self.add(Arc::clone(&step) as StepRef);
        step
    }

    /// Snapshot of the children.
    pub fn steps(&self) -> Vec<StepRef> {
        self.children.lock_ignore_poison().clone()
    }
}

#[async_trait]
impl BuildStep for ListStep {
    fn core(&self) -> &StepCore {
        &self.core
    }

    async fn execute(&self, ctx: &ExecuteContext) -> Result<ResultStatus> {
        let mut children = self.steps();
        children.sort_by_key(|child| child.core().priority().unwrap_or(0));

        for child in &children {
            ctx.schedule(child)?;
        }

        let mut waiters = JoinSet::new();
        for child in &children {
            let child = Arc::clone(child);
            waiters.spawn(async move { child.core().executed().await });
        }

        let mut statuses = Vec::with_capacity(children.len());
        while let Some(joined) = waiters.join_next().await {
            let status =
                joined.map_err(|error| Error::Other(format!("child waiter panicked: {error}")))?;
            statuses.push(status);
        }

        let failure = self.merged.lock_ignore_poison().failure().cloned();
        if let Some(report) = failure {
            return Err(Error::MergeConflict(report));
        }
        Ok(aggregate_status(&statuses))
    }

    async fn clean(&self, ctx: &ExecuteContext, delete_output: bool) -> Result<()> {
        for child in self.steps() {
            child.clean(ctx, delete_output).await?;
        }
        Ok(())
    }

    fn input_objects(&self) -> HashMap<ObjectUrl, ObjectId> {
        self.merged.lock_ignore_poison().input_versions()
    }

    fn output_objects(&self) -> HashMap<ObjectUrl, OutputObject> {
        self.merged.lock_ignore_poison().outputs().clone()
    }

    fn children(&self) -> Vec<StepRef> {
        self.steps()
    }

    fn merged_handle(&self) -> Option<Arc<Mutex<MergedMaps>>> {
        Some(Arc::clone(&self.merged))
    }
}

/// Combines child statuses into the composite's own status.
///
/// Any cancelled child cancels the composite; any failure (including a
/// skip caused by a failed prerequisite) fails it; a composite whose
/// children were all cache hits is itself a cache hit; everything else is
/// success. An empty composite is successful.
pub(crate) fn aggregate_status(statuses: &[ResultStatus]) -> ResultStatus {
    if statuses
        .iter()
        .any(|status| *status == ResultStatus::Cancelled)
    {
        return ResultStatus::Cancelled;
    }
    if statuses.iter().any(|status| {
        matches!(
            status,
            ResultStatus::Failed | ResultStatus::NotTriggeredPrerequisiteFailed
        )
    }) {
        return ResultStatus::Failed;
    }
    if !statuses.is_empty()
        && statuses
            .iter()
            .all(|status| *status == ResultStatus::NotTriggeredWasSuccessful)
    {
        return ResultStatus::NotTriggeredWasSuccessful;
    }
    ResultStatus::Successful
}
