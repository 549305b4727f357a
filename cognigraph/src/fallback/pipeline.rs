//! Request pipelines behind the fallback coordinator
//!
//! A [`Pipeline`] turns one request into one final value, reporting what it
//! does into the request's [`Reporter`]. The graph engine is one pipeline;
//! [`LegacyPipeline`] (a single direct model call) is the alternate.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::collaborators::{ContextProvider, Message, ModelClient, ModelOptions};
use crate::engine::{Engine, RunOptions};
use crate::error::{CollaboratorError, EngineError, PipelineError};
use crate::graph::GraphDocument;
use crate::registry::value_text;
use crate::telemetry::{NodeResult, NodeStatus, Reporter};

/// Node id the legacy pipeline reports its single step under
pub const LEGACY_NODE_ID: &str = "legacy";

/// One user request as seen by a pipeline
#[derive(Debug, Clone)]
pub struct PipelineRequest {
    pub request_id: String,
    pub input: Value,
    pub cancel: CancellationToken,
    pub deadline: Option<Instant>,
}

impl PipelineRequest {
    pub fn new(input: Value) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            input,
            cancel: CancellationToken::new(),
            deadline: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn run_options(&self) -> RunOptions {
        let options = RunOptions::new()
            .with_request_id(self.request_id.clone())
            .with_cancel(self.cancel.clone());
        match self.deadline {
            Some(deadline) => options.with_deadline(deadline),
            None => options,
        }
    }
}

/// Strategy producing a final value for a request
#[async_trait]
pub trait Pipeline: Send + Sync {
    /// Identifier used as the trace's graph id
    fn name(&self) -> &str;

    async fn run(&self, request: &PipelineRequest, reporter: &mut Reporter) -> Result<Value, PipelineError>;
}

/// Validates a graph document (through the engine's cache) and executes it
#[derive(Debug, Clone)]
pub struct GraphPipeline {
    engine: Engine,
    document: GraphDocument,
}

impl GraphPipeline {
    pub fn new(engine: Engine, document: GraphDocument) -> Self {
        Self { engine, document }
    }

    pub fn document(&self) -> &GraphDocument {
        &self.document
    }
}

#[async_trait]
impl Pipeline for GraphPipeline {
    fn name(&self) -> &str {
        &self.document.id
    }

    async fn run(&self, request: &PipelineRequest, reporter: &mut Reporter) -> Result<Value, PipelineError> {
        let graph = self.engine.validate(&self.document)?;
        let output = self
            .engine
            .execute(graph, request.input.clone(), request.run_options(), reporter)
            .await?;
        Ok(output)
    }
}

/// Single-shot conversational reply: persona context plus one streamed model call
pub struct LegacyPipeline {
    context: Arc<dyn ContextProvider>,
    model: Arc<dyn ModelClient>,
    system_prompt: Option<String>,
    options: ModelOptions,
}

impl LegacyPipeline {
    pub fn new(context: Arc<dyn ContextProvider>, model: Arc<dyn ModelClient>) -> Self {
        Self {
            context,
            model,
            system_prompt: None,
            options: ModelOptions::default(),
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_options(mut self, options: ModelOptions) -> Self {
        self.options = options;
        self
    }

    async fn transcript(&self, request: &PipelineRequest) -> Result<Vec<Message>, PipelineError> {
        let text = request
            .input
            .get("message")
            .map(value_text)
            .unwrap_or_else(|| value_text(&request.input));
        if text.is_empty() {
            return Err(CollaboratorError::failed("legacy", "request has no message").into());
        }

        // Missing persona context degrades the reply, it does not fail it
        let persona = match self.context.load_context(&request.request_id).await {
            Ok(persona) => Some(persona),
            Err(e) => {
                warn!(request_id = %request.request_id, error = %e, "Legacy pipeline continuing without context");
                None
            }
        };

        let mut system = self.system_prompt.clone().unwrap_or_default();
        let mut messages = Vec::new();
        if let Some(persona) = persona {
            if !persona.persona_summary.is_empty() {
                if !system.is_empty() {
                    system.push_str("\n\n");
                }
                system.push_str(&persona.persona_summary);
            }
            if !system.is_empty() {
                messages.push(Message::system(system));
            }
            messages.extend(persona.conversation_history);
        } else if !system.is_empty() {
            messages.push(Message::system(system));
        }
        messages.push(Message::user(text));
        Ok(messages)
    }

    async fn respond(&self, request: &PipelineRequest, reporter: &mut Reporter) -> Result<Value, PipelineError> {
        let messages = self.transcript(request).await?;
        let mut stream = self
            .model
            .stream_model("assistant", &messages, &self.options)
            .await?;

        let mut content = String::new();
        loop {
            tokio::select! {
                _ = request.cancel.cancelled() => return Err(EngineError::Cancelled.into()),
                chunk = stream.next() => match chunk {
                    Some(chunk) => {
                        let chunk = chunk?;
                        if !chunk.content.is_empty() {
                            reporter.on_node_token(LEGACY_NODE_ID, chunk.content.clone());
                            content.push_str(&chunk.content);
                        }
                    }
                    None => break,
                },
            }
        }
        Ok(Value::String(content))
    }
}

#[async_trait]
impl Pipeline for LegacyPipeline {
    fn name(&self) -> &str {
        "legacy"
    }

    async fn run(&self, request: &PipelineRequest, reporter: &mut Reporter) -> Result<Value, PipelineError> {
        if request.cancel.is_cancelled() {
            return Err(EngineError::Cancelled.into());
        }
        debug!(request_id = %request.request_id, model = self.model.name(), "Running legacy pipeline");

        reporter.on_node_start(LEGACY_NODE_ID, None);
        let started = Instant::now();
        let result = self.respond(request, reporter).await;

        let (status, value, error) = match &result {
            Ok(value) => (NodeStatus::Success, serde_json::json!({ "content": value }), None),
            Err(e) => (NodeStatus::Error, Value::Null, Some(e.to_string())),
        };
        reporter.on_node_finish(NodeResult {
            node_id: LEGACY_NODE_ID.to_string(),
            status,
            value,
            duration_ms: started.elapsed().as_millis() as u64,
            error,
            iteration: None,
            attempts: 1,
        });
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{PersonaContext, StaticContextProvider};
    use crate::telemetry::EventKind;
    use crate::testing::EchoModel;
    use serde_json::json;

    fn legacy() -> LegacyPipeline {
        let context = StaticContextProvider::new(PersonaContext {
            persona_summary: "calm".into(),
            ..Default::default()
        });
        LegacyPipeline::new(Arc::new(context), Arc::new(EchoModel)).with_system_prompt("Be brief.")
    }

    #[tokio::test]
    async fn test_legacy_replies_and_reports() {
        let mut reporter = Reporter::detached("r", "legacy");
        let request = PipelineRequest::new(json!({"message": "hello"}));

        let output = legacy().run(&request, &mut reporter).await.unwrap();
        assert_eq!(output, json!("assistant: hello"));

        let kinds: Vec<_> = reporter.events().iter().map(|e| &e.kind).collect();
        assert!(matches!(kinds[0], EventKind::NodeStarted { .. }));
        assert!(matches!(kinds[1], EventKind::NodeToken { .. }));
        assert!(matches!(kinds[2], EventKind::NodeFinished { .. }));
    }

    #[tokio::test]
    async fn test_legacy_rejects_empty_message() {
        let mut reporter = Reporter::detached("r", "legacy");
        let request = PipelineRequest::new(json!({"message": ""}));
        let err = legacy().run(&request, &mut reporter).await.unwrap_err();
        assert!(matches!(err, PipelineError::Collaborator(_)));
    }

    #[tokio::test]
    async fn test_legacy_honours_cancellation() {
        let mut reporter = Reporter::detached("r", "legacy");
        let request = PipelineRequest::new(json!("hi"));
        request.cancel.cancel();
        let err = legacy().run(&request, &mut reporter).await.unwrap_err();
        assert!(err.is_cancelled());
        assert!(reporter.events().is_empty());
    }

    #[test]
    fn test_run_options_carry_request_identity() {
        let request = PipelineRequest::new(json!(1)).with_request_id("abc");
        let options = request.run_options();
        assert_eq!(options.request_id, "abc");
        assert!(options.deadline.is_none());
    }
}
