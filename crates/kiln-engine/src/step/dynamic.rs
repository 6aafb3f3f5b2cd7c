//! Dynamic composite step fed by a step provider at runtime.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::task::JoinSet;

use kiln_core::{Error, IgnoreLock as _, ObjectId, ObjectUrl, Result, ResultStatus};

use crate::context::ExecuteContext;
use crate::step::list::aggregate_status;
use crate::step::{BuildStep, OutputObject, StepCore, StepRef};
use crate::transaction::MergedMaps;

/// Priority bound passed to a provider when only urgent work may start.
/// Urgent steps carry a negative priority.
pub const URGENT_PRIORITY: i32 = -1;

/// Source of dynamically discovered build steps.
///
/// The dynamic step polls the provider whenever it has spare capacity.
/// `max_priority` of `Some(bound)` restricts the answer to steps whose
/// priority is `bound` or lower; the provider must hold everything else
/// back until asked again without a bound.
#[async_trait]
pub trait StepProvider: Send + Sync {
    /// Next step to run, or `None` if nothing eligible is queued right
    /// now. Returning `None` does not end the feed; only
    /// [`DynamicStep::complete_feed`] does.
    async fn next_step(&self, max_priority: Option<i32>) -> Option<StepRef>;
}

/// Composite step whose children are produced by a [`StepProvider`] while
/// the build runs.
///
/// The step keeps up to `max_parallel` children in flight, plus up to
/// `max_urgent_parallel` extra slots reserved for urgent (negative
/// priority) work, and keeps polling until the feed is completed and every
/// child has settled. Finished children merge into the step's output maps
/// exactly like list children do.
pub struct DynamicStep {
    core: StepCore,
    provider: Box<dyn StepProvider>,
    max_parallel: usize,
    max_urgent_parallel: usize,
    new_work: Notify,
    feed_complete: AtomicBool,
    merged: Arc<Mutex<MergedMaps>>,
}

impl DynamicStep {
    /// Creates a dynamic step polling `provider`.
    pub fn new(
        title: impl Into<String>,
        provider: impl StepProvider + 'static,
        max_parallel: usize,
        max_urgent_parallel: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            core: StepCore::new(title),
            provider: Box::new(provider),
            max_parallel: max_parallel.max(1),
            max_urgent_parallel,
            new_work: Notify::new(),
            feed_complete: AtomicBool::new(false),
            merged: Arc::new(Mutex::new(MergedMaps::default())),
        })
    }

    /// Signals that the provider may have new work queued.
    pub fn notify_new_work(&self) {
        self.new_work.notify_one();
    }

    /// Ends the feed: once the provider runs dry and every child settled,
    /// the step completes. New work notifications after this are ignored.
    pub fn complete_feed(&self) {
        self.feed_complete.store(true, Ordering::SeqCst);
        self.new_work.notify_one();
    }

    fn feed_completed(&self) -> bool {
        self.feed_complete.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BuildStep for DynamicStep {
    fn core(&self) -> &StepCore {
        &self.core
    }

    async fn execute(&self, ctx: &ExecuteContext) -> Result<ResultStatus> {
        let cancel = ctx.cancel_token();
        let mut in_flight: Vec<StepRef> = Vec::new();
        let mut waiters: JoinSet<()> = JoinSet::new();
        let mut statuses = Vec::new();

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let mut running = Vec::new();
            for child in in_flight.drain(..) {
                let status = child.core().status();
                if status.is_terminal() {
                    statuses.push(status);
                } else {
                    running.push(child);
                }
            }
            in_flight = running;

            let capacity = self.max_parallel + self.max_urgent_parallel;
            if in_flight.len() < capacity {
                // Past the normal budget only the urgent slots are left.
                let max_priority =
                    (in_flight.len() >= self.max_parallel).then_some(URGENT_PRIORITY);
                if let Some(child) = self.provider.next_step(max_priority).await {
                    ctx.schedule(&child)?;
                    let waiter = Arc::clone(&child);
                    waiters.spawn(async move {
                        waiter.core().executed().await;
                    });
                    in_flight.push(child);
                    continue;
                }
                if self.feed_completed() && in_flight.is_empty() {
                    break;
                }
            }

            tokio::select! {
                joined = waiters.join_next(), if !waiters.is_empty() => {
                    if let Some(Err(error)) = joined {
                        return Err(Error::Other(format!("child waiter panicked: {error}")));
                    }
                }
                () = self.new_work.notified() => {}
                () = cancel.cancelled() => {}
            }
        }

        // Cancelled or feed done with stragglers; settle what is left.
        for child in in_flight {
            statuses.push(child.core().executed().await);
        }
        while waiters.join_next().await.is_some() {}

        let failure = self.merged.lock_ignore_poison().failure().cloned();
        if let Some(report) = failure {
            return Err(Error::MergeConflict(report));
        }
        if cancel.is_cancelled() {
            return Ok(ResultStatus::Cancelled);
        }
        Ok(aggregate_status(&statuses))
    }

    async fn clean(&self, _ctx: &ExecuteContext, _delete_output: bool) -> Result<()> {
        // Children only exist while the provider feeds a run; there is
        // nothing recorded on the dynamic step itself to clean.
        Ok(())
    }

    fn input_objects(&self) -> HashMap<ObjectUrl, ObjectId> {
        self.merged.lock_ignore_poison().input_versions()
    }

    fn output_objects(&self) -> HashMap<ObjectUrl, OutputObject> {
        self.merged.lock_ignore_poison().outputs().clone()
    }

    fn merged_handle(&self) -> Option<Arc<Mutex<MergedMaps>>> {
        Some(Arc::clone(&self.merged))
    }
}
