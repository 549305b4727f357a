//! Contracts for the services the engine reaches outside itself
//!
//! The engine never knows how personas are stored, which model backend
//! answers, or what a capability does. Built-in executors talk to these
//! traits only; hosts plug in real implementations.

use std::pin::Pin;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::CollaboratorError;

/// Role of a chat message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A single chat message sent to a model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Read-only persona context for one request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonaContext {
    pub persona_summary: String,
    #[serde(default)]
    pub conversation_history: Vec<Message>,
    #[serde(default)]
    pub retrieved_memories: Vec<String>,
}

/// Loads persona/conversation context for a request
#[async_trait]
pub trait ContextProvider: Send + Sync {
    async fn load_context(&self, request_id: &str) -> Result<PersonaContext, CollaboratorError>;
}

/// Token usage statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn new(input: u64, output: u64) -> Self {
        Self {
            input_tokens: input,
            output_tokens: output,
            total_tokens: input + output,
        }
    }
}

impl std::ops::Add for TokenUsage {
    type Output = Self;

    fn add(self, other: Self) -> Self::Output {
        Self {
            input_tokens: self.input_tokens + other.input_tokens,
            output_tokens: self.output_tokens + other.output_tokens,
            total_tokens: self.total_tokens + other.total_tokens,
        }
    }
}

impl std::ops::AddAssign for TokenUsage {
    fn add_assign(&mut self, other: Self) {
        *self = *self + other;
    }
}

/// Per-call model options
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
}

/// Complete model reply
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelReply {
    pub content: String,
    pub usage: TokenUsage,
}

/// One streamed fragment of a model reply
#[derive(Debug, Clone, PartialEq)]
pub struct ModelChunk {
    pub content: String,
    /// Usage, normally only on the final chunk
    pub usage: Option<TokenUsage>,
}

pub type ModelStream = Pin<Box<dyn Stream<Item = Result<ModelChunk, CollaboratorError>> + Send>>;

/// The LLM-call function consumed by `call_model` nodes
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn call_model(
        &self,
        role: &str,
        messages: &[Message],
        options: &ModelOptions,
    ) -> Result<ModelReply, CollaboratorError>;

    /// Streaming variant.
    ///
    /// Default implementation falls back to `call_model` and yields the whole
    /// reply as one chunk.
    async fn stream_model(
        &self,
        role: &str,
        messages: &[Message],
        options: &ModelOptions,
    ) -> Result<ModelStream, CollaboratorError> {
        let reply = self.call_model(role, messages, options).await?;
        let chunk = ModelChunk {
            content: reply.content,
            usage: Some(reply.usage),
        };
        Ok(Box::pin(futures::stream::once(async move { Ok(chunk) })))
    }

    /// Client name for logging
    fn name(&self) -> &str;
}

/// Result of invoking a capability
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityOutcome {
    pub success: bool,
    pub output: Value,
}

impl CapabilityOutcome {
    pub fn ok(output: impl Into<Value>) -> Self {
        Self {
            success: true,
            output: output.into(),
        }
    }

    pub fn failed(output: impl Into<Value>) -> Self {
        Self {
            success: false,
            output: output.into(),
        }
    }
}

/// Invokes named capabilities (skills/tools); semantics are opaque to the engine
#[async_trait]
pub trait CapabilityInvoker: Send + Sync {
    async fn execute_capability(
        &self,
        name: &str,
        args: &Value,
    ) -> Result<CapabilityOutcome, CollaboratorError>;
}

/// Structured audit record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub request_id: String,
    pub graph_id: String,
    pub kind: String,
    pub detail: Value,
    pub at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(
        request_id: impl Into<String>,
        graph_id: impl Into<String>,
        kind: impl Into<String>,
        detail: Value,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            graph_id: graph_id.into(),
            kind: kind.into(),
            detail,
            at: Utc::now(),
        }
    }
}

/// Audit sink. Failures to record never abort a request.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, event: AuditEvent) -> Result<(), CollaboratorError>;
}

/// Fire-and-forget an audit event on a background task
pub fn record_detached(sink: Arc<dyn AuditSink>, event: AuditEvent) {
    tokio::spawn(async move {
        let kind = event.kind.clone();
        if let Err(e) = sink.record(event).await {
            warn!(kind = %kind, error = %e, "Failed to record audit event");
        }
    });
}

/// Context provider returning the same context for every request
#[derive(Debug, Clone, Default)]
pub struct StaticContextProvider {
    context: PersonaContext,
}

impl StaticContextProvider {
    pub fn new(context: PersonaContext) -> Self {
        Self { context }
    }
}

#[async_trait]
impl ContextProvider for StaticContextProvider {
    async fn load_context(&self, _request_id: &str) -> Result<PersonaContext, CollaboratorError> {
        Ok(self.context.clone())
    }
}

/// Audit sink that drops everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopAuditSink;

#[async_trait]
impl AuditSink for NoopAuditSink {
    async fn record(&self, _event: AuditEvent) -> Result<(), CollaboratorError> {
        Ok(())
    }
}

/// Audit sink keeping events in memory
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, event: AuditEvent) -> Result<(), CollaboratorError> {
        self.events
            .lock()
            .map_err(|_| CollaboratorError::failed("audit", "event log poisoned"))?
            .push(event);
        Ok(())
    }
}
