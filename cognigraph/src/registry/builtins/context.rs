//! `fetch_context` node

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::collaborators::ContextProvider;
use crate::engine::context::NodeContext;
use crate::error::NodeExecutionError;
use crate::graph::NodeConfig;
use crate::registry::{NodeExecutor, PortSpec, PortValues};

/// Loads persona context for the request.
///
/// The optional `input` port only orders the node after an upstream one.
/// Outputs the whole context plus its three parts on separate ports.
pub struct FetchContextExecutor {
    provider: Arc<dyn ContextProvider>,
}

impl FetchContextExecutor {
    pub fn new(provider: Arc<dyn ContextProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl NodeExecutor for FetchContextExecutor {
    fn ports(&self, _config: &NodeConfig) -> PortSpec {
        PortSpec::new()
            .optional("input")
            .output("context")
            .output("persona")
            .output("history")
            .output("memories")
    }

    async fn execute(
        &self,
        _inputs: PortValues,
        _config: &NodeConfig,
        ctx: &NodeContext,
    ) -> Result<PortValues, NodeExecutionError> {
        let context = self.provider.load_context(ctx.request_id()).await?;

        let mut out = PortValues::new();
        out.insert(
            "context".into(),
            serde_json::to_value(&context).map_err(|e| NodeExecutionError::fatal(e.to_string()))?,
        );
        out.insert("persona".into(), Value::String(context.persona_summary));
        out.insert("history".into(), json!(context.conversation_history));
        out.insert("memories".into(), json!(context.retrieved_memories));
        Ok(out)
    }
}
