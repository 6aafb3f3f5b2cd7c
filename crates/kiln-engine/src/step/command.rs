//! Leaf step wrapping one pluggable command.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock, Weak};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;

use kiln_core::{
    CancelToken, Command, CommandContext, CommandResultEntry, Error, HookContext, IgnoreLock as _,
    LogLevel, ObjectId, ObjectUrl, Result, ResultStatus, UrlKind,
};

use crate::context::{BuildContext, ExecuteContext};
use crate::step::{BuildStep, OutputObject, StepCore};
use crate::transaction::BuildTransaction;

/// Leaf build step executing one [`Command`].
///
/// The step is responsible for everything around the command body: hashing
/// its inputs and parameters, probing the result cache, deduplicating
/// against an identical concurrently running command, invoking the
/// pre/post hooks and persisting the result record.
pub struct CommandStep {
    core: StepCore,
    command: Arc<dyn Command>,
    self_ref: OnceLock<Weak<CommandStep>>,
    result: Mutex<Option<CommandResultEntry>>,
    inputs: Mutex<HashMap<ObjectUrl, ObjectId>>,
    outputs: Mutex<HashMap<ObjectUrl, OutputObject>>,
}

/// Outcome of the dedup claim for a command hash.
enum Claim {
    /// This step owns the execution.
    Owner,
    /// An identical command is already executing; follow its result.
    Follower(Arc<CommandStep>),
    /// A twin finished between the cache probe and the claim.
    CacheHit(CommandResultEntry),
}

impl CommandStep {
    /// Wraps a command in a leaf step.
    pub fn new(command: Arc<dyn Command>) -> Arc<Self> {
        let step = Arc::new(Self {
            core: StepCore::new(command.title()),
            command,
            self_ref: OnceLock::new(),
            result: Mutex::new(None),
            inputs: Mutex::new(HashMap::new()),
            outputs: Mutex::new(HashMap::new()),
        });
        let _ = step.self_ref.set(Arc::downgrade(&step));
        step
    }

    /// The wrapped command.
    pub fn command(&self) -> &Arc<dyn Command> {
        &self.command
    }

    /// Result record of the last execution or cache hit, if any.
    pub fn result(&self) -> Option<CommandResultEntry> {
        self.result.lock_ignore_poison().clone()
    }

    fn self_arc(&self) -> Result<Arc<CommandStep>> {
        self.self_ref
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| {
                Error::InvariantViolation(format!(
                    "command step {} was not constructed through CommandStep::new",
                    self.core.title()
                ))
            })
    }

    /// Hash of one declared input, `None` if it cannot be computed.
    async fn hash_input(&self, ctx: &ExecuteContext, url: &ObjectUrl) -> Option<ObjectId> {
        match url.kind {
            UrlKind::File => ctx
                .build()
                .tracker
                .file_hash(Path::new(&url.path))
                .await
                .ok(),
            UrlKind::Content => ctx.transaction().resolve(url),
        }
    }

    /// Computes the command hash: format version, command version tag,
    /// parameters and the hash of every declared input. `None` means an
    /// input could not be hashed; the step fails without executing.
    async fn compute_command_hash(
        &self,
        ctx: &ExecuteContext,
    ) -> Option<(ObjectId, BTreeMap<ObjectUrl, ObjectId>)> {
        let mut input_versions = BTreeMap::new();
        let mut declared = self.command.input_files();
        declared.sort();
        declared.dedup();
        for url in declared {
            match self.hash_input(ctx, &url).await {
                Some(id) if !id.is_empty() => {
                    input_versions.insert(url, id);
                }
                _ => {
                    ctx.logger().log(
                        LogLevel::Error,
                        format!("cannot hash input {url}; the command cannot run"),
                    );
                    return None;
                }
            }
        }

        let fingerprint = serde_json::json!({
            "format": crate::CACHE_FORMAT_VERSION,
            "tag": self.command.version_tag(),
            "parameters": self.command.parameters(),
            "inputs": &input_versions,
        });
        let hash = ObjectId::of_json(&fingerprint);
        if hash.is_empty() {
            ctx.logger().log(
                LogLevel::Error,
                "cannot serialize command parameters for hashing".to_owned(),
            );
            return None;
        }
        Some((hash, input_versions))
    }

    /// Newest cache record under `hash` whose inputs still match and whose
    /// outputs are all still present in the object store.
    async fn find_matching_entry(
        &self,
        ctx: &ExecuteContext,
        hash: ObjectId,
    ) -> Result<Option<CommandResultEntry>> {
        let entries = ctx.build().records.enumerate(hash).await?;
        'candidate: for entry in entries.into_iter().rev() {
            for (url, recorded) in &entry.input_dependency_versions {
                if self.hash_input(ctx, url).await != Some(*recorded) {
                    continue 'candidate;
                }
            }
            for id in entry.output_objects.values() {
                if !ctx.build().objects.exists(*id).await {
                    continue 'candidate;
                }
            }
            return Ok(Some(entry));
        }
        Ok(None)
    }

    /// Claims the right to execute `hash`, or resolves to an existing
    /// execution or a just-landed cache record.
    async fn claim_execution(&self, ctx: &ExecuteContext, hash: ObjectId) -> Result<Claim> {
        let claim = match ctx.build().in_progress.entry(hash) {
            Entry::Occupied(entry) => Claim::Follower(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                entry.insert(self.self_arc()?);
                Claim::Owner
            }
        };

        if matches!(claim, Claim::Owner) && !self.command.should_force_execution() {
            // A twin may have finished and unregistered between our cache
            // probe and the claim; probe once more now that we hold it.
            match self.find_matching_entry(ctx, hash).await {
                Ok(Some(entry)) => {
                    ctx.build().in_progress.remove(&hash);
                    return Ok(Claim::CacheHit(entry));
                }
                Ok(None) => {}
                Err(error) => {
                    ctx.build().in_progress.remove(&hash);
                    return Err(error);
                }
            }
        }
        Ok(claim)
    }

    /// Installs a result record as this step's outcome.
    fn install_entry(&self, ctx: &ExecuteContext, entry: &CommandResultEntry, replay_logs: bool) {
        if replay_logs {
            ctx.logger().replay(&entry.log_messages);
        }

        let mut tags: HashMap<ObjectUrl, Vec<String>> = HashMap::new();
        for (url, tag) in &entry.tag_symbols {
            tags.entry(url.clone()).or_default().push(tag.clone());
        }

        let mut outputs = HashMap::new();
        for (url, id) in &entry.output_objects {
            ctx.transaction().write(url.clone(), *id);
            outputs.insert(
                url.clone(),
                OutputObject {
                    id: *id,
                    producer: self.core.id(),
                    generation: 0,
                    tags: tags.remove(url).unwrap_or_default(),
                },
            );
        }
        *self.outputs.lock_ignore_poison() = outputs;
        *self.inputs.lock_ignore_poison() = entry
            .input_dependency_versions
            .iter()
            .map(|(url, id)| (url.clone(), *id))
            .collect();
        *self.result.lock_ignore_poison() = Some(entry.clone());
    }

    /// Runs the command body with the I/O monitor watching the execution
    /// window.
    async fn run_command(
        &self,
        ctx: &ExecuteContext,
        hash: ObjectId,
        input_versions: BTreeMap<ObjectUrl, ObjectId>,
    ) -> Result<ResultStatus> {
        let declared: Vec<ObjectUrl> = input_versions.keys().cloned().collect();
        ctx.build()
            .io_monitor
            .command_started(self.core.id(), self.core.title(), &declared);

        let outcome = self.execute_command(ctx, hash, input_versions).await;

        let written: Vec<(ObjectUrl, ObjectId)> = self
            .outputs
            .lock_ignore_poison()
            .iter()
            .map(|(url, output)| (url.clone(), output.id))
            .collect();
        ctx.build()
            .io_monitor
            .command_finished(self.core.id(), &written);
        outcome
    }

    async fn execute_command(
        &self,
        ctx: &ExecuteContext,
        hash: ObjectId,
        input_versions: BTreeMap<ObjectUrl, ObjectId>,
    ) -> Result<ResultStatus> {
        let mut hooks = HookContext::new();
        self.command.pre_execute(&mut hooks);
        if !hooks.base_call_acknowledged() {
            ctx.logger().log(
                LogLevel::Error,
                "pre_execute override did not chain to the base implementation".to_owned(),
            );
            return Ok(ResultStatus::Failed);
        }

        if ctx.cancel_token().is_cancelled() {
            return Ok(ResultStatus::Cancelled);
        }

        let mut execution = CommandExecution {
            build: ctx.build(),
            transaction: ctx.transaction(),
            logger: ctx.logger(),
            outputs: BTreeMap::new(),
            tags: Vec::new(),
        };
        match self.command.execute(&mut execution).await {
            Ok(()) => {}
            Err(Error::Cancelled) => return Ok(ResultStatus::Cancelled),
            Err(error) => {
                ctx.logger()
                    .log(LogLevel::Error, format!("command failed: {error}"));
                return Ok(ResultStatus::Failed);
            }
        }
        let CommandExecution { outputs, tags, .. } = execution;

        let mut hooks = HookContext::new();
        self.command.post_execute(&mut hooks);
        if !hooks.base_call_acknowledged() {
            ctx.logger().log(
                LogLevel::Error,
                "post_execute override did not chain to the base implementation".to_owned(),
            );
            return Ok(ResultStatus::Failed);
        }

        let entry = CommandResultEntry {
            input_dependency_versions: input_versions,
            output_objects: outputs,
            log_messages: ctx.logger().messages(),
            tag_symbols: tags,
        };
        ctx.build().records.append(hash, &entry).await?;
        self.install_entry(ctx, &entry, false);
        Ok(ResultStatus::Successful)
    }
}

#[async_trait]
impl BuildStep for CommandStep {
    fn core(&self) -> &StepCore {
        &self.core
    }

    fn output_location(&self) -> Option<ObjectUrl> {
        self.command.output_location()
    }

    async fn execute(&self, ctx: &ExecuteContext) -> Result<ResultStatus> {
        let Some((hash, input_versions)) = self.compute_command_hash(ctx).await else {
            return Ok(ResultStatus::Failed);
        };

        if !self.command.should_force_execution() {
            if let Some(entry) = self.find_matching_entry(ctx, hash).await? {
                self.install_entry(ctx, &entry, true);
                return Ok(ResultStatus::NotTriggeredWasSuccessful);
            }
        }

        match self.claim_execution(ctx, hash).await? {
            Claim::Owner => {
                let outcome = self.run_command(ctx, hash, input_versions).await;
                ctx.build().in_progress.remove(&hash);
                outcome
            }
            Claim::Follower(other) => {
                let status = other.core().executed().await;
                if status.is_successful() {
                    if let Some(entry) = other.result() {
                        self.install_entry(ctx, &entry, true);
                        return Ok(status);
                    }
                    return Ok(ResultStatus::Failed);
                }
                match status {
                    ResultStatus::Cancelled => Ok(ResultStatus::Cancelled),
                    _ => Ok(ResultStatus::Failed),
                }
            }
            Claim::CacheHit(entry) => {
                self.install_entry(ctx, &entry, true);
                Ok(ResultStatus::NotTriggeredWasSuccessful)
            }
        }
    }

    async fn clean(&self, ctx: &ExecuteContext, delete_output: bool) -> Result<()> {
        let Some((hash, _)) = self.compute_command_hash(ctx).await else {
            ctx.logger().log(
                LogLevel::Warning,
                "inputs cannot be hashed; nothing to clean".to_owned(),
            );
            return Ok(());
        };

        let build = ctx.build();
        if delete_output {
            for entry in build.records.enumerate(hash).await? {
                for id in entry.output_objects.values() {
                    build.objects.delete(*id).await?;
                }
            }
        }
        build.records.clear(hash).await
    }

    fn input_objects(&self) -> HashMap<ObjectUrl, ObjectId> {
        self.inputs.lock_ignore_poison().clone()
    }

    fn output_objects(&self) -> HashMap<ObjectUrl, OutputObject> {
        self.outputs.lock_ignore_poison().clone()
    }

    fn as_command(&self) -> Option<&CommandStep> {
        Some(self)
    }
}

/// [`CommandContext`] implementation backing one command body invocation.
struct CommandExecution<'a> {
    build: &'a Arc<BuildContext>,
    transaction: &'a BuildTransaction,
    logger: &'a crate::progress::StepLogger,
    outputs: BTreeMap<ObjectUrl, ObjectId>,
    tags: Vec<(ObjectUrl, String)>,
}

#[async_trait]
impl CommandContext for CommandExecution<'_> {
    fn resolve(&self, url: &ObjectUrl) -> Option<ObjectId> {
        self.transaction.resolve(url)
    }

    async fn get_object(&self, id: ObjectId) -> Result<Vec<u8>> {
        self.build.objects.get(id).await
    }

    async fn put_object(&mut self, data: &[u8]) -> Result<ObjectId> {
        self.build.objects.put(data).await
    }

    fn register_output(&mut self, url: ObjectUrl, id: ObjectId) {
        self.transaction.write(url.clone(), id);
        self.outputs.insert(url, id);
    }

    fn tag_output(&mut self, url: ObjectUrl, tag: String) {
        self.tags.push((url, tag));
    }

    fn log(&mut self, level: LogLevel, text: String) {
        self.logger.log(level, text);
    }

    fn cancel_token(&self) -> &CancelToken {
        &self.build.cancel
    }
}
