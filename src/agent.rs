//! # Agent Module
//!
//! Wires the collaborators a graph run needs for the command line: persona
//! context from a JSON file, a model client (Ollama through Rig, or a scripted
//! offline model), local capabilities and an audit sink that logs.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rig::client::{CompletionClient, ProviderClient};
use rig::providers::ollama;
use serde_json::json;
use tracing::{debug, info};

use cognigraph::{
    AuditEvent, AuditSink, Builtins, CapabilityInvoker, CollaboratorError, ContextProvider, LegacyPipeline,
    Message, ModelChunk, ModelClient, ModelOptions, ModelReply, ModelStream, PersonaContext, RigModelClient,
    Role, StaticContextProvider, TokenUsage,
};

use crate::capabilities::LocalCapabilities;
use crate::config::Config;

// =============================================================================
// SYSTEM PROMPT
// =============================================================================
/// Prompt for the fallback pipeline's single model call.
const FALLBACK_SYSTEM_PROMPT: &str = "You are a helpful assistant. \
The detailed reasoning pipeline is unavailable, so answer the user directly and briefly.";

// =============================================================================
// COLLABORATORS
// =============================================================================
/// Everything outside the engine a CLI run talks to
#[derive(Clone)]
pub struct Collaborators {
    pub context: Arc<dyn ContextProvider>,
    pub model: Arc<dyn ModelClient>,
    pub capabilities: Arc<dyn CapabilityInvoker>,
    pub audit: Arc<dyn AuditSink>,
}

impl Collaborators {
    /// Build the collaborators described by `config`.
    ///
    /// `offline` swaps Ollama for [`ScriptedModel`], which needs no server.
    pub fn from_config(config: &Config, offline: bool) -> Result<Self> {
        let persona = match &config.persona_file {
            Some(path) => load_persona(path)?,
            None => PersonaContext::default(),
        };

        let model: Arc<dyn ModelClient> = if offline {
            info!("Using the scripted offline model");
            Arc::new(ScriptedModel)
        } else {
            ollama_model(config)
        };

        Ok(Self {
            context: Arc::new(StaticContextProvider::new(persona)),
            model,
            capabilities: Arc::new(LocalCapabilities::new()),
            audit: Arc::new(LogAuditSink),
        })
    }

    pub fn builtins(&self) -> Builtins {
        Builtins::new(self.context.clone(), self.model.clone(), self.capabilities.clone())
    }

    pub fn legacy_pipeline(&self, config: &Config) -> LegacyPipeline {
        LegacyPipeline::new(self.context.clone(), self.model.clone())
            .with_system_prompt(FALLBACK_SYSTEM_PROMPT)
            .with_options(ModelOptions {
                temperature: Some(config.temperature),
                ..Default::default()
            })
    }
}

fn load_persona(path: &Path) -> Result<PersonaContext> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read persona file {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("Invalid persona file {}", path.display()))
}

/// Ollama through Rig. `ollama::Client::from_env()` reads OLLAMA_API_BASE_URL.
fn ollama_model(config: &Config) -> Arc<dyn ModelClient> {
    std::env::set_var("OLLAMA_API_BASE_URL", &config.ollama_host);
    let client = ollama::Client::from_env();

    debug!(
        host = %config.ollama_host,
        model = %config.model,
        "Connected to Ollama"
    );

    let agent = client
        .agent(&config.model)
        .temperature(config.temperature)
        .build();
    Arc::new(RigModelClient::with_name(agent, format!("ollama/{}", config.model)))
}

// =============================================================================
// SCRIPTED MODEL
// =============================================================================
/// Deterministic offline model for demos and smoke tests.
///
/// A `planner` asks for `word_count` on the first pass and answers once it
/// has seen an observation; every other role echoes the user's last message.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScriptedModel;

impl ScriptedModel {
    fn reply(role: &str, messages: &[Message]) -> String {
        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User && !m.content.starts_with("Feedback on the previous attempt"))
            .map(|m| m.content.as_str())
            .unwrap_or("");
        let has_feedback = messages
            .iter()
            .any(|m| m.role == Role::User && m.content.contains("Observation:"));

        match role {
            "planner" if has_feedback => format!("FINAL ANSWER: I looked into \"{}\".", last_user),
            "planner" => format!("ACTION: word_count {}", json!({ "text": last_user })),
            _ => format!("You said: {}", last_user),
        }
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    async fn call_model(
        &self,
        role: &str,
        messages: &[Message],
        _options: &ModelOptions,
    ) -> Result<ModelReply, CollaboratorError> {
        let content = Self::reply(role, messages);
        let words = content.split_whitespace().count() as u64;
        Ok(ModelReply {
            content,
            usage: TokenUsage::new(messages.len() as u64, words),
        })
    }

    async fn stream_model(
        &self,
        role: &str,
        messages: &[Message],
        options: &ModelOptions,
    ) -> Result<ModelStream, CollaboratorError> {
        let reply = self.call_model(role, messages, options).await?;
        let mut chunks: Vec<Result<ModelChunk, CollaboratorError>> = reply
            .content
            .split_inclusive(' ')
            .map(|word| {
                Ok(ModelChunk {
                    content: word.to_string(),
                    usage: None,
                })
            })
            .collect();
        chunks.push(Ok(ModelChunk {
            content: String::new(),
            usage: Some(reply.usage),
        }));
        Ok(Box::pin(futures::stream::iter(chunks)))
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

// =============================================================================
// AUDIT
// =============================================================================
/// Audit sink writing structured log lines under the `audit` target
#[derive(Debug, Clone, Copy, Default)]
pub struct LogAuditSink;

#[async_trait]
impl AuditSink for LogAuditSink {
    async fn record(&self, event: AuditEvent) -> Result<(), CollaboratorError> {
        info!(
            target: "audit",
            request_id = %event.request_id,
            graph_id = %event.graph_id,
            kind = %event.kind,
            detail = %event.detail,
            "Audit event"
        );
        Ok(())
    }
}
