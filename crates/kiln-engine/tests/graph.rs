//! End-to-end tests of graph semantics: inferred dependencies, failure
//! propagation, dedup, merge conflicts and cancellation.
#![allow(clippy::unwrap_used, clippy::expect_used)]

mod support;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::json;

use kiln_core::{BuildMode, BuildResultCode, ObjectId, ObjectUrl, Result, ResultStatus};
use kiln_engine::{Builder, BuildStep, ExecuteContext, ListStep, OutputObject, StepCore};

use support::TestCommand;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_consumer_waits_for_inferred_producer() {
    support::init_logging();
    let builder = Builder::in_memory("pipeline");

    // The consumer is registered first; order in the list must not matter.
    let consumer = builder.root().add_command(Arc::new(
        TestCommand::new("assemble scene")
            .reads("textures/grass")
            .produces("scenes/forest", b"scene"),
    ));
    let producer = builder.root().add_command(Arc::new(
        TestCommand::new("compile texture")
            .delayed(30)
            .produces("textures/grass", b"pixels"),
    ));

    assert_eq!(
        builder.run_async(BuildMode::Build).await.unwrap(),
        BuildResultCode::Successful
    );
    assert_eq!(producer.core().status(), ResultStatus::Successful);
    assert_eq!(consumer.core().status(), ResultStatus::Successful);

    // The consumer read the object the producer registered.
    assert!(builder.content_index().get("scenes/forest").is_some());
    let recorded = consumer.result().unwrap();
    assert_eq!(
        recorded
            .input_dependency_versions
            .get(&ObjectUrl::content("textures/grass")),
        Some(&ObjectId::digest(b"pixels"))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failure_skips_dependents_but_not_siblings() {
    let builder = Builder::in_memory("propagation");

    let producer = builder.root().add_command(Arc::new(
        TestCommand::new("compile texture")
            .produces("textures/grass", b"")
            .failing(),
    ));
    let consumer = builder.root().add_command(Arc::new(
        TestCommand::new("assemble scene")
            .reads("textures/grass")
            .produces("scenes/forest", b"scene"),
    ));
    let bystander = builder
        .root()
        .add_command(Arc::new(TestCommand::new("compile font").produces("fonts/atlas", b"glyphs")));

    assert_eq!(
        builder.run_async(BuildMode::Build).await.unwrap(),
        BuildResultCode::BuildError
    );
    assert_eq!(producer.core().status(), ResultStatus::Failed);
    assert_eq!(
        consumer.core().status(),
        ResultStatus::NotTriggeredPrerequisiteFailed
    );
    assert_eq!(bystander.core().status(), ResultStatus::Successful);
    assert_eq!(builder.step_counter().get(ResultStatus::Failed), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_identical_concurrent_commands_execute_once() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let builder = Builder::in_memory("dedup");

    let twin = || {
        Arc::new(
            TestCommand::new("compile texture")
                .with_parameters(json!({ "source": "grass.png", "format": "bc7" }))
                .produces("textures/grass", b"pixels")
                .delayed(40)
                .counting(Arc::clone(&invocations)),
        )
    };
    let first = builder.root().add_command(twin());
    let second = builder.root().add_command(twin());

    assert_eq!(
        builder.run_async(BuildMode::Build).await.unwrap(),
        BuildResultCode::Successful
    );
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    assert!(first.core().status().is_successful());
    assert!(second.core().status().is_successful());

    // Both observe the same output set.
    assert_eq!(
        first.result().unwrap().output_objects,
        second.result().unwrap().output_objects
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unordered_concurrent_read_write_fails_the_composite() {
    let objects = Arc::new(kiln_store::MemoryObjectStore::new());
    let builder = Builder::new(
        "conflict",
        Arc::clone(&objects) as Arc<dyn kiln_store::ObjectStore>,
        Arc::new(kiln_store::MemoryRecordStore::new()),
        Arc::new(kiln_store::ContentIndex::new()),
    );

    // Seed a previous version of the location so the reader can resolve
    // it no matter who finishes first.
    use kiln_store::ObjectStore as _;
    let stale = objects.put(b"stale pixels").await.unwrap();
    builder.content_index().set("textures/grass", stale);

    // No edge between them: the reader has no output location, so the
    // resolver cannot order it after the producer.
    let barrier = Arc::new(tokio::sync::Barrier::new(2));
    let writer = builder.root().add_command(Arc::new(
        TestCommand::new("recompile texture")
            .produces("textures/grass", b"fresh pixels")
            .rendezvous(Arc::clone(&barrier)),
    ));
    let reader = builder.root().add_command(Arc::new(
        TestCommand::new("bake lightmap")
            .reads("textures/grass")
            .rendezvous(barrier),
    ));

    assert_eq!(
        builder.run_async(BuildMode::Build).await.unwrap(),
        BuildResultCode::BuildError
    );

    // Neither command failed; the composite rejected the merge.
    assert!(writer.core().status().is_successful());
    assert!(reader.core().status().is_successful());
    assert_eq!(builder.step_counter().get(ResultStatus::Failed), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unchained_pre_hook_fails_without_running_the_body() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let builder = Builder::in_memory("pre-hook");

    let step = builder.root().add_command(Arc::new(
        TestCommand::new("compile texture")
            .produces("textures/grass", b"pixels")
            .unchained_pre_hook()
            .counting(Arc::clone(&invocations)),
    ));

    assert_eq!(
        builder.run_async(BuildMode::Build).await.unwrap(),
        BuildResultCode::BuildError
    );
    assert_eq!(step.core().status(), ResultStatus::Failed);
    assert_eq!(invocations.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unchained_post_hook_fails_the_step_after_the_body() {
    let invocations = Arc::new(AtomicUsize::new(0));
    let builder = Builder::in_memory("post-hook");

    let step = builder.root().add_command(Arc::new(
        TestCommand::new("compile texture")
            .produces("textures/grass", b"pixels")
            .unchained_post_hook()
            .counting(Arc::clone(&invocations)),
    ));

    assert_eq!(
        builder.run_async(BuildMode::Build).await.unwrap(),
        BuildResultCode::BuildError
    );
    // The body ran, but the result is discarded and nothing is recorded.
    assert_eq!(step.core().status(), ResultStatus::Failed);
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    assert!(step.result().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_children_inherit_the_composite_priority() {
    let builder = Builder::in_memory("priority");

    let group = ListStep::new("background group");
    group.core().set_priority(7);
    let child = group.add_command(Arc::new(
        TestCommand::new("compile texture").produces("textures/grass", b"pixels"),
    ));
    builder.root().add(group.clone());

    assert_eq!(
        builder.run_async(BuildMode::Build).await.unwrap(),
        BuildResultCode::Successful
    );
    assert_eq!(group.core().priority(), Some(7));
    assert_eq!(child.core().priority(), Some(7));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancellation_stops_the_run() {
    let builder = Arc::new(Builder::in_memory("cancel"));
    let stuck = builder.root().add_command(Arc::new(
        TestCommand::new("never finishes").awaiting_cancel(),
    ));

    let run = {
        let builder = Arc::clone(&builder);
        tokio::spawn(async move { builder.run_async(BuildMode::Build).await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    builder.cancel_build();

    assert_eq!(run.await.unwrap().unwrap(), BuildResultCode::Cancelled);
    assert_eq!(stuck.core().status(), ResultStatus::Cancelled);
}

/// A step that finishes without publishing a terminal status.
struct RogueStep {
    core: StepCore,
}

#[async_trait]
impl BuildStep for RogueStep {
    fn core(&self) -> &StepCore {
        &self.core
    }

    async fn execute(&self, _ctx: &ExecuteContext) -> Result<ResultStatus> {
        Ok(ResultStatus::NotProcessed)
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

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_non_terminal_step_is_a_fatal_engine_error() {
    let builder = Builder::in_memory("invariant");
    builder.root().add(Arc::new(RogueStep {
        core: StepCore::new("rogue"),
    }));

    let error = builder.run_async(BuildMode::Build).await.unwrap_err();
    assert!(matches!(error, kiln_core::Error::InvariantViolation(_)));
}
