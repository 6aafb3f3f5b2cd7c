//! Shared test commands and instrumentation.
#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value as JsonValue, json};

use kiln_core::{Command, CommandContext, Error, HookContext, LogLevel, ObjectUrl, Result};

/// Installs a subscriber surfacing engine traces under `RUST_LOG`.
pub fn init_logging() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Tracks how many command bodies run at once and the high-water mark.
#[derive(Debug, Default)]
pub struct ConcurrencyGauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl ConcurrencyGauge {
    pub fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    pub fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// Configurable command for engine tests: declares inputs, writes payloads
/// to content locations, optionally fails, sleeps or counts invocations.
pub struct TestCommand {
    title: String,
    parameters: JsonValue,
    inputs: Vec<ObjectUrl>,
    location: Option<ObjectUrl>,
    outputs: Vec<(ObjectUrl, Vec<u8>)>,
    fail: bool,
    force: bool,
    delay: Option<Duration>,
    invocations: Option<Arc<AtomicUsize>>,
    gauge: Option<Arc<ConcurrencyGauge>>,
    await_cancel: bool,
    rendezvous: Option<Arc<tokio::sync::Barrier>>,
    chain_pre_hook: bool,
    chain_post_hook: bool,
}

impl TestCommand {
    pub fn new(title: &str) -> Self {
        Self {
            title: title.to_owned(),
            parameters: json!({ "title": title }),
            inputs: Vec::new(),
            location: None,
            outputs: Vec::new(),
            fail: false,
            force: false,
            delay: None,
            invocations: None,
            gauge: None,
            await_cancel: false,
            rendezvous: None,
            chain_pre_hook: true,
            chain_post_hook: true,
        }
    }

    /// Declares this command the producer of a content location and makes
    /// it write `payload` there.
    pub fn produces(mut self, location: &str, payload: &[u8]) -> Self {
        let url = ObjectUrl::content(location);
        self.location = Some(url.clone());
        self.outputs.push((url, payload.to_vec()));
        self
    }

    /// Adds an extra output without making it the canonical location.
    pub fn also_writes(mut self, location: &str, payload: &[u8]) -> Self {
        self.outputs.push((ObjectUrl::content(location), payload.to_vec()));
        self
    }

    /// Declares a content input.
    pub fn reads(mut self, location: &str) -> Self {
        self.inputs.push(ObjectUrl::content(location));
        self
    }

    /// Declares a physical file input.
    pub fn reads_file(mut self, path: &str) -> Self {
        self.inputs.push(ObjectUrl::file(path));
        self
    }

    /// Overrides the hashed parameters, for building identical twins.
    pub fn with_parameters(mut self, parameters: JsonValue) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }

    pub fn delayed(mut self, millis: u64) -> Self {
        self.delay = Some(Duration::from_millis(millis));
        self
    }

    /// Counts body invocations into `counter`.
    pub fn counting(mut self, counter: Arc<AtomicUsize>) -> Self {
        self.invocations = Some(counter);
        self
    }

    pub fn gauged(mut self, gauge: Arc<ConcurrencyGauge>) -> Self {
        self.gauge = Some(gauge);
        self
    }

    /// Makes the body block until the build is cancelled.
    pub fn awaiting_cancel(mut self) -> Self {
        self.await_cancel = true;
        self
    }

    /// Makes the body wait on `barrier` so a group of commands provably
    /// executes concurrently.
    pub fn rendezvous(mut self, barrier: Arc<tokio::sync::Barrier>) -> Self {
        self.rendezvous = Some(barrier);
        self
    }

    /// Makes `pre_execute` drop the base-call chain, like a buggy
    /// override.
    pub fn unchained_pre_hook(mut self) -> Self {
        self.chain_pre_hook = false;
        self
    }

    /// Makes `post_execute` drop the base-call chain.
    pub fn unchained_post_hook(mut self) -> Self {
        self.chain_post_hook = false;
        self
    }

    async fn run_body(&self, ctx: &mut dyn CommandContext) -> Result<()> {
        if let Some(barrier) = &self.rendezvous {
            barrier.wait().await;
        }
        for url in &self.inputs {
            if url.is_content() {
                let id = ctx
                    .resolve(url)
                    .ok_or_else(|| Error::Command(format!("cannot resolve {url}")))?;
                ctx.get_object(id).await?;
            }
        }

        if self.await_cancel {
            ctx.cancel_token().cancelled().await;
            return Err(Error::Cancelled);
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail {
            return Err(Error::Command(format!("{} was told to fail", self.title)));
        }

        for (url, payload) in &self.outputs {
            let id = ctx.put_object(payload).await?;
            ctx.register_output(url.clone(), id);
        }
        ctx.log(LogLevel::Info, format!("{} done", self.title));
        Ok(())
    }
}

#[async_trait]
impl Command for TestCommand {
    fn title(&self) -> String {
        self.title.clone()
    }

    fn output_location(&self) -> Option<ObjectUrl> {
        self.location.clone()
    }

    fn input_files(&self) -> Vec<ObjectUrl> {
        self.inputs.clone()
    }

    fn parameters(&self) -> JsonValue {
        self.parameters.clone()
    }

    fn should_force_execution(&self) -> bool {
        self.force
    }

    fn pre_execute(&self, hooks: &mut HookContext) {
        if self.chain_pre_hook {
            hooks.acknowledge_base_call();
        }
    }

    fn post_execute(&self, hooks: &mut HookContext) {
        if self.chain_post_hook {
            hooks.acknowledge_base_call();
        }
    }

    async fn execute(&self, ctx: &mut dyn CommandContext) -> Result<()> {
        if let Some(counter) = &self.invocations {
            counter.fetch_add(1, Ordering::SeqCst);
        }
        if let Some(gauge) = &self.gauge {
            gauge.enter();
        }
        let outcome = self.run_body(ctx).await;
        if let Some(gauge) = &self.gauge {
            gauge.exit();
        }
        outcome
    }
}
