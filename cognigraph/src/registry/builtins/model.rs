//! `call_model` node
//!
//! Builds a chat transcript from its inputs, streams the reply through the
//! [`ModelClient`], and forwards every chunk as a token event.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};

use super::parse_config;
use crate::collaborators::{Message, ModelClient, ModelOptions, PersonaContext, TokenUsage};
use crate::engine::context::NodeContext;
use crate::error::NodeExecutionError;
use crate::graph::NodeConfig;
use crate::registry::{value_text, NodeExecutor, PortSpec, PortValues};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CallModelConfig {
    #[serde(default = "default_role")]
    role: String,
    /// System prompt placed before any persona summary
    #[serde(default)]
    system: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    temperature: Option<f64>,
    #[serde(default)]
    max_tokens: Option<u64>,
    /// Forward chunks as token events
    #[serde(default = "default_stream")]
    stream: bool,
}

fn default_role() -> String {
    "assistant".to_string()
}

fn default_stream() -> bool {
    true
}

impl CallModelConfig {
    fn options(&self) -> ModelOptions {
        ModelOptions {
            model: self.model.clone(),
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        }
    }
}

/// `call_model`: optional inputs `context`, `messages`, `input`, `feedback`;
/// outputs `content` and `usage`
pub struct CallModelExecutor {
    client: Arc<dyn ModelClient>,
}

impl CallModelExecutor {
    pub fn new(client: Arc<dyn ModelClient>) -> Self {
        Self { client }
    }
}

/// Assemble the transcript in a fixed order: system, history, prior
/// messages, user input, loop feedback
fn build_messages(config: &CallModelConfig, inputs: &PortValues) -> Vec<Message> {
    let mut messages = Vec::new();

    let persona = inputs
        .get("context")
        .and_then(|value| serde_json::from_value::<PersonaContext>(value.clone()).ok());

    let mut system = config.system.clone().unwrap_or_default();
    match (&persona, inputs.get("context")) {
        (Some(persona), _) => {
            append_paragraph(&mut system, &persona.persona_summary);
            if !persona.retrieved_memories.is_empty() {
                let memories = persona
                    .retrieved_memories
                    .iter()
                    .map(|m| format!("- {}", m))
                    .collect::<Vec<_>>()
                    .join("\n");
                append_paragraph(&mut system, &format!("Relevant memories:\n{}", memories));
            }
        }
        (None, Some(other)) => append_paragraph(&mut system, &value_text(other)),
        (None, None) => {}
    }
    if !system.is_empty() {
        messages.push(Message::system(system));
    }

    if let Some(persona) = persona {
        messages.extend(persona.conversation_history);
    }

    if let Some(prior) = inputs
        .get("messages")
        .and_then(|value| serde_json::from_value::<Vec<Message>>(value.clone()).ok())
    {
        messages.extend(prior);
    }

    if let Some(input) = inputs.get("input") {
        let text = input
            .get("message")
            .map(value_text)
            .unwrap_or_else(|| value_text(input));
        if !text.is_empty() {
            messages.push(Message::user(text));
        }
    }

    if let Some(feedback) = inputs.get("feedback").map(value_text) {
        if !feedback.is_empty() {
            messages.push(Message::user(format!("Feedback on the previous attempt:\n{}", feedback)));
        }
    }

    messages
}

fn append_paragraph(target: &mut String, text: &str) {
    if text.is_empty() {
        return;
    }
    if !target.is_empty() {
        target.push_str("\n\n");
    }
    target.push_str(text);
}

#[async_trait]
impl NodeExecutor for CallModelExecutor {
    fn ports(&self, _config: &NodeConfig) -> PortSpec {
        PortSpec::new()
            .optional("context")
            .optional("messages")
            .optional("input")
            .optional("feedback")
            .output("content")
            .output("usage")
    }

    fn check_config(&self, config: &NodeConfig) -> Result<(), String> {
        let parsed: CallModelConfig = parse_config(config)?;
        match parsed.temperature {
            Some(t) if !(0.0..=2.0).contains(&t) => Err(format!("temperature {} out of range 0.0..=2.0", t)),
            _ => Ok(()),
        }
    }

    async fn execute(
        &self,
        inputs: PortValues,
        config: &NodeConfig,
        ctx: &NodeContext,
    ) -> Result<PortValues, NodeExecutionError> {
        let config: CallModelConfig = parse_config(config).map_err(NodeExecutionError::invalid_config)?;
        let messages = build_messages(&config, &inputs);
        if !messages.iter().any(|m| m.role != crate::collaborators::Role::System) {
            return Err(NodeExecutionError::fatal("no user or history messages to send"));
        }

        // Every model failure is worth another attempt
        let model_error = |e: crate::error::CollaboratorError| NodeExecutionError::retryable(e.to_string());

        let mut stream = self
            .client
            .stream_model(&config.role, &messages, &config.options())
            .await
            .map_err(model_error)?;

        let mut content = String::new();
        let mut usage = TokenUsage::default();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(model_error)?;
            if config.stream {
                ctx.emit_token(chunk.content.as_str());
            }
            content.push_str(&chunk.content);
            if let Some(chunk_usage) = chunk.usage {
                usage += chunk_usage;
            }
        }

        let mut out = PortValues::new();
        out.insert("content".into(), Value::String(content));
        out.insert("usage".into(), json!(usage));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{ModelChunk, ModelReply, ModelStream, Role};
    use crate::engine::context::detached_node_context;
    use crate::error::CollaboratorError;
    use std::sync::Mutex;

    /// Streams the reply word by word and remembers the last transcript
    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<Message>>,
    }

    #[async_trait]
    impl ModelClient for Recorder {
        async fn call_model(
            &self,
            _role: &str,
            _messages: &[Message],
            _options: &ModelOptions,
        ) -> Result<ModelReply, CollaboratorError> {
            unreachable!("streaming path only")
        }

        async fn stream_model(
            &self,
            role: &str,
            messages: &[Message],
            _options: &ModelOptions,
        ) -> Result<ModelStream, CollaboratorError> {
            *self.seen.lock().unwrap() = messages.to_vec();
            let chunks = vec![
                Ok(ModelChunk {
                    content: format!("{} ", role),
                    usage: None,
                }),
                Ok(ModelChunk {
                    content: "says hi".into(),
                    usage: Some(TokenUsage::new(4, 2)),
                }),
            ];
            Ok(Box::pin(futures::stream::iter(chunks)))
        }

        fn name(&self) -> &str {
            "recorder"
        }
    }

    struct Broken;

    #[async_trait]
    impl ModelClient for Broken {
        async fn call_model(
            &self,
            _role: &str,
            _messages: &[Message],
            _options: &ModelOptions,
        ) -> Result<ModelReply, CollaboratorError> {
            Err(CollaboratorError::failed("model", "bad request"))
        }

        fn name(&self) -> &str {
            "broken"
        }
    }

    fn config(value: Value) -> NodeConfig {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_streams_tokens_and_collects_reply() {
        let client = Arc::new(Recorder::default());
        let executor = CallModelExecutor::new(client.clone());
        let (ctx, mut rx) = detached_node_context("llm");

        let mut inputs = PortValues::new();
        inputs.insert(
            "context".into(),
            json!({"personaSummary": "terse", "conversationHistory": [{"role": "assistant", "content": "earlier"}]}),
        );
        inputs.insert("input".into(), json!({"message": "hello"}));
        inputs.insert("feedback".into(), json!("be shorter"));

        let out = executor
            .execute(inputs, &config(json!({"role": "planner", "system": "Plan."})), &ctx)
            .await
            .unwrap();

        assert_eq!(out["content"], json!("planner says hi"));
        assert_eq!(out["usage"]["total_tokens"], json!(6));
        assert_eq!(rx.try_recv().unwrap().chunk, "planner ");
        assert_eq!(rx.try_recv().unwrap().chunk, "says hi");

        let seen = client.seen.lock().unwrap().clone();
        assert_eq!(seen[0], Message::system("Plan.\n\nterse"));
        assert_eq!(seen[1], Message::assistant("earlier"));
        assert_eq!(seen[2], Message::user("hello"));
        assert!(seen[3].content.contains("be shorter"));
    }

    #[tokio::test]
    async fn test_silent_mode_emits_no_tokens() {
        let executor = CallModelExecutor::new(Arc::new(Recorder::default()));
        let (ctx, mut rx) = detached_node_context("llm");
        let mut inputs = PortValues::new();
        inputs.insert("input".into(), json!("hi"));

        executor
            .execute(inputs, &config(json!({"stream": false})), &ctx)
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_model_failures_are_retryable() {
        let executor = CallModelExecutor::new(Arc::new(Broken));
        let (ctx, _rx) = detached_node_context("llm");
        let mut inputs = PortValues::new();
        inputs.insert("input".into(), json!("hi"));

        let err = executor.execute(inputs, &NodeConfig::new(), &ctx).await.unwrap_err();
        assert!(err.retryable);
    }

    #[tokio::test]
    async fn test_empty_transcript_is_fatal() {
        let executor = CallModelExecutor::new(Arc::new(Recorder::default()));
        let (ctx, _rx) = detached_node_context("llm");
        let err = executor
            .execute(PortValues::new(), &config(json!({"system": "only system"})), &ctx)
            .await
            .unwrap_err();
        assert!(!err.retryable);
        assert_eq!(Role::System, Message::system("x").role);
    }

    #[test]
    fn test_rejects_out_of_range_temperature() {
        let executor = CallModelExecutor::new(Arc::new(Recorder::default()));
        assert!(executor.check_config(&config(json!({"temperature": 3.5}))).is_err());
        assert!(executor.check_config(&config(json!({"temperature": 0.7}))).is_ok());
    }
}
