//! Shared fixtures for unit tests

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::collaborators::{
    CapabilityInvoker, CapabilityOutcome, Message, ModelClient, ModelOptions, ModelReply,
    PersonaContext, StaticContextProvider, TokenUsage,
};
use crate::error::CollaboratorError;
use crate::registry::builtins::Builtins;
use crate::registry::NodeExecutorRegistry;

/// Replies `<role>: <last message>`
pub(crate) struct EchoModel;

#[async_trait]
impl ModelClient for EchoModel {
    async fn call_model(
        &self,
        role: &str,
        messages: &[Message],
        _options: &ModelOptions,
    ) -> Result<ModelReply, CollaboratorError> {
        let last = messages.last().map(|m| m.content.as_str()).unwrap_or("");
        Ok(ModelReply {
            content: format!("{}: {}", role, last),
            usage: TokenUsage::new(1, 1),
        })
    }

    fn name(&self) -> &str {
        "echo"
    }
}

/// Returns its arguments as the output
pub(crate) struct EchoCapabilities;

#[async_trait]
impl CapabilityInvoker for EchoCapabilities {
    async fn execute_capability(
        &self,
        name: &str,
        args: &Value,
    ) -> Result<CapabilityOutcome, CollaboratorError> {
        Ok(CapabilityOutcome::ok(json!({ "capability": name, "args": args })))
    }
}

pub(crate) fn test_builtins() -> Builtins {
    Builtins::new(
        Arc::new(StaticContextProvider::new(PersonaContext {
            persona_summary: "test persona".into(),
            ..Default::default()
        })),
        Arc::new(EchoModel),
        Arc::new(EchoCapabilities),
    )
}

/// Registry with every built-in wired to echo collaborators
pub(crate) fn test_registry() -> NodeExecutorRegistry {
    test_builtins().registry()
}
