//! The pluggable command contract and its execution-side collaborators.

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::cancel::CancelToken;
use crate::error::Result;
use crate::log::LogLevel;
use crate::object::ObjectId;
use crate::url::ObjectUrl;

/// Tracks whether a command hook chained to the base implementation.
///
/// `pre_execute`/`post_execute` overrides must call
/// [`HookContext::acknowledge_base_call`] (the base behavior). The leaf
/// step checks the flag after invoking the hook and fails the command if
/// an override dropped the chain.
#[derive(Debug, Default)]
pub struct HookContext {
    base_called: bool,
}

impl HookContext {
    /// Creates a context with an unacknowledged base call.
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the base implementation as having run.
    pub fn acknowledge_base_call(&mut self) {
        self.base_called = true;
    }

    /// Whether the base implementation ran.
    pub fn base_call_acknowledged(&self) -> bool {
        self.base_called
    }
}

/// Engine-provided services available to a running command.
///
/// Commands resolve their declared inputs, read and write store blobs,
/// register output objects and emit replayable log messages exclusively
/// through this context; they never touch the store or the transaction
/// directly.
#[async_trait]
pub trait CommandContext: Send {
    /// Resolves a url to the object currently backing it, consulting the
    /// enclosing output transaction and the content index.
    fn resolve(&self, url: &ObjectUrl) -> Option<ObjectId>;

    /// Reads a blob from the object store.
    async fn get_object(&self, id: ObjectId) -> Result<Vec<u8>>;

    /// Writes a blob to the object store, returning its id.
    async fn put_object(&mut self, data: &[u8]) -> Result<ObjectId>;

    /// Registers an output object produced by this execution. The output
    /// becomes visible to later resolutions within the same transaction
    /// and is merged into the enclosing composite on completion.
    fn register_output(&mut self, url: ObjectUrl, id: ObjectId);

    /// Attaches a symbolic tag to an output location.
    fn tag_output(&mut self, url: ObjectUrl, tag: String);

    /// Emits a log message recorded for cache replay.
    fn log(&mut self, level: LogLevel, text: String);

    /// Cancellation signal for the current run. Long-running commands
    /// must poll it.
    fn cancel_token(&self) -> &CancelToken;
}

/// A pluggable unit of work wrapped by a leaf build step.
///
/// Implementations are the actual compilers (texture converters, shader
/// compilers, ...). The engine only depends on this contract to schedule,
/// cache and deduplicate them.
#[async_trait]
pub trait Command: Send + Sync {
    /// Human-readable name used in logs and progress reporting.
    fn title(&self) -> String;

    /// Logical location this command is the canonical producer of, if any.
    /// Used to infer prerequisite edges between steps.
    fn output_location(&self) -> Option<ObjectUrl> {
        None
    }

    /// Inputs deducible without running the command.
    fn input_files(&self) -> Vec<ObjectUrl> {
        Vec::new()
    }

    /// Parameters contributing to the command hash. Two commands with
    /// equal parameters, version tag and input hashes are considered
    /// interchangeable by the cache and the dedup table.
    fn parameters(&self) -> JsonValue;

    /// Version tag of the command implementation. Bump it to invalidate
    /// cached results when the implementation changes behavior.
    fn version_tag(&self) -> String {
        String::from("1")
    }

    /// Whether to bypass the result cache and always execute.
    fn should_force_execution(&self) -> bool {
        false
    }

    /// Whether the command runs in a separate OS process. Informational
    /// for monitoring collaborators.
    fn should_spawn_new_process(&self) -> bool {
        false
    }

    /// Requests cancellation of an in-flight execution.
    fn cancel(&self) {}

    /// Hook invoked strictly before execution. Overrides must call
    /// `hooks.acknowledge_base_call()`.
    fn pre_execute(&self, hooks: &mut HookContext) {
        hooks.acknowledge_base_call();
    }

    /// Hook invoked strictly after execution. Overrides must call
    /// `hooks.acknowledge_base_call()`.
    fn post_execute(&self, hooks: &mut HookContext) {
        hooks.acknowledge_base_call();
    }

    /// Runs the command. Outputs and log messages are registered through
    /// the context.
    ///
    /// # Errors
    /// Returns an error if the underlying work fails; the enclosing step
    /// reports `Failed` and siblings are unaffected.
    async fn execute(&self, ctx: &mut dyn CommandContext) -> Result<()>;
}
