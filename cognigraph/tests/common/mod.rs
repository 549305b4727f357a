//! Fixtures shared by the integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use cognigraph::graph::NodeConfig;
use cognigraph::registry::single_output;
use cognigraph::{
    Builtins, CapabilityInvoker, CapabilityOutcome, CollaboratorError, Engine, Message, ModelClient, ModelOptions,
    ModelReply, NodeContext, NodeExecutionError, NodeExecutor, NodeExecutorRegistry, PersonaContext, PortSpec,
    PortValues, StaticContextProvider, TokenUsage,
};

/// Replies `<role> saw <n> messages`, counting calls
#[derive(Default)]
pub struct CountingModel {
    pub calls: AtomicUsize,
}

impl CountingModel {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelClient for CountingModel {
    async fn call_model(
        &self,
        role: &str,
        messages: &[Message],
        _options: &ModelOptions,
    ) -> Result<ModelReply, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ModelReply {
            content: format!("{} saw {} messages", role, messages.len()),
            usage: TokenUsage::new(messages.len() as u64, 4),
        })
    }

    fn name(&self) -> &str {
        "counting"
    }
}

/// Plays back canned replies in order, repeating the last one
pub struct ScriptModel {
    replies: Vec<String>,
    calls: AtomicUsize,
}

impl ScriptModel {
    pub fn new(replies: &[&str]) -> Self {
        Self {
            replies: replies.iter().map(|r| r.to_string()).collect(),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ModelClient for ScriptModel {
    async fn call_model(
        &self,
        _role: &str,
        _messages: &[Message],
        _options: &ModelOptions,
    ) -> Result<ModelReply, CollaboratorError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let content = self
            .replies
            .get(call)
            .or_else(|| self.replies.last())
            .cloned()
            .unwrap_or_default();
        Ok(ModelReply {
            content,
            usage: TokenUsage::new(1, 1),
        })
    }

    fn name(&self) -> &str {
        "script"
    }
}

/// Replies `<role> call <n>: <last message>`, numbering calls from 1
#[derive(Default)]
pub struct TaggingModel {
    calls: AtomicUsize,
}

#[async_trait]
impl ModelClient for TaggingModel {
    async fn call_model(
        &self,
        role: &str,
        messages: &[Message],
        _options: &ModelOptions,
    ) -> Result<ModelReply, CollaboratorError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let last = messages.last().map(|m| m.content.as_str()).unwrap_or_default();
        Ok(ModelReply {
            content: format!("{} call {}: {}", role, call, last),
            usage: TokenUsage::new(1, 1),
        })
    }

    fn name(&self) -> &str {
        "tagging"
    }
}

/// Always unavailable
pub struct DownModel;

#[async_trait]
impl ModelClient for DownModel {
    async fn call_model(
        &self,
        _role: &str,
        _messages: &[Message],
        _options: &ModelOptions,
    ) -> Result<ModelReply, CollaboratorError> {
        Err(CollaboratorError::unavailable("model", "connection refused"))
    }

    fn name(&self) -> &str {
        "down"
    }
}

pub struct EchoCapabilities;

#[async_trait]
impl CapabilityInvoker for EchoCapabilities {
    async fn execute_capability(&self, name: &str, args: &Value) -> Result<CapabilityOutcome, CollaboratorError> {
        Ok(CapabilityOutcome::ok(json!({ "capability": name, "args": args })))
    }
}

pub fn persona() -> Arc<StaticContextProvider> {
    Arc::new(StaticContextProvider::new(PersonaContext {
        persona_summary: "a patient tutor".into(),
        ..Default::default()
    }))
}

/// `delay`: waits `delayMs`, then outputs `value` (or its input) on `output`
pub struct DelayExecutor;

#[async_trait]
impl NodeExecutor for DelayExecutor {
    fn ports(&self, _config: &NodeConfig) -> PortSpec {
        PortSpec::new().optional("input").output("output")
    }

    async fn execute(
        &self,
        inputs: PortValues,
        config: &NodeConfig,
        _ctx: &NodeContext,
    ) -> Result<PortValues, NodeExecutionError> {
        let delay = config.get("delayMs").and_then(Value::as_u64).unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(delay)).await;
        let value = config
            .get("value")
            .cloned()
            .or_else(|| inputs.get("input").cloned())
            .unwrap_or(Value::Null);
        Ok(single_output("output", value))
    }
}

/// `fail`: always fails with a non-retryable error
pub struct FailExecutor;

#[async_trait]
impl NodeExecutor for FailExecutor {
    fn ports(&self, _config: &NodeConfig) -> PortSpec {
        PortSpec::new().optional("input").output("output")
    }

    async fn execute(
        &self,
        _inputs: PortValues,
        _config: &NodeConfig,
        _ctx: &NodeContext,
    ) -> Result<PortValues, NodeExecutionError> {
        Err(NodeExecutionError::fatal("boom"))
    }
}

/// `flaky`: fails with a retryable error until `failures` attempts have run
pub struct FlakyExecutor {
    pub failures: usize,
    pub attempts: AtomicUsize,
}

impl FlakyExecutor {
    pub fn new(failures: usize) -> Self {
        Self {
            failures,
            attempts: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl NodeExecutor for FlakyExecutor {
    fn ports(&self, _config: &NodeConfig) -> PortSpec {
        PortSpec::new().required("input").output("output")
    }

    async fn execute(
        &self,
        inputs: PortValues,
        _config: &NodeConfig,
        _ctx: &NodeContext,
    ) -> Result<PortValues, NodeExecutionError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.failures {
            return Err(NodeExecutionError::retryable(format!("transient failure {}", attempt + 1)));
        }
        Ok(single_output("output", inputs.get("input").cloned().unwrap_or(Value::Null)))
    }
}

/// `scratch_marker`: its very first attempt writes `failedAttempt` to scratch
/// and fails retryably. Every successful attempt outputs whether that key is
/// visible.
#[derive(Default)]
pub struct ScratchMarkerExecutor {
    pub attempts: AtomicUsize,
}

#[async_trait]
impl NodeExecutor for ScratchMarkerExecutor {
    fn ports(&self, _config: &NodeConfig) -> PortSpec {
        PortSpec::new().optional("input").optional("feedback").output("output")
    }

    async fn execute(
        &self,
        _inputs: PortValues,
        _config: &NodeConfig,
        ctx: &NodeContext,
    ) -> Result<PortValues, NodeExecutionError> {
        let seen = ctx.scratch_get("failedAttempt").is_some();
        if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
            ctx.scratch_set("failedAttempt", json!(true));
            return Err(NodeExecutionError::retryable("first attempt always fails"));
        }
        Ok(single_output("output", json!(seen)))
    }
}

/// Built-ins over the given model, plus `delay` and `fail`
pub fn registry_with_model(model: Arc<dyn ModelClient>) -> NodeExecutorRegistry {
    let registry = Builtins::new(persona(), model, Arc::new(EchoCapabilities)).registry();
    registry.register("delay", Arc::new(DelayExecutor));
    registry.register("fail", Arc::new(FailExecutor));
    registry
}

pub fn registry() -> NodeExecutorRegistry {
    registry_with_model(Arc::new(CountingModel::default()))
}

pub fn engine() -> Engine {
    Engine::new(Arc::new(registry()))
}
