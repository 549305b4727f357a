//! Built-in node executors
//!
//! | Type tag              | Inputs                                   | Outputs                          |
//! |-----------------------|------------------------------------------|----------------------------------|
//! | `passthrough`         | `input`*                                 | `output`                         |
//! | `merge`               | any port                                 | `merged`                         |
//! | `emit_stream_chunk`   | `text`*                                  | `text`                           |
//! | `route_by_condition`  | `input`*                                 | one port per branch              |
//! | `fetch_context`       | `input`                                  | `context` `persona` `history` `memories` |
//! | `call_model`          | `context` `messages` `input` `feedback`  | `content` `usage`                |
//! | `execute_capability`  | `input` `args`                           | `output` `success`               |
//! | `format_observation`  | `result`* `context`                      | `observation`                    |
//! | `check_completion`    | `input`* `observation`                   | `result` `continue` `feedback`   |
//!
//! `*` marks required inputs.

pub mod capability;
pub mod condition;
pub mod context;
pub mod flow;
pub mod model;
pub mod observe;
pub mod route;

use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;

pub use capability::ExecuteCapabilityExecutor;
pub use condition::{is_truthy, BranchCondition};
pub use context::FetchContextExecutor;
pub use flow::{EmitStreamChunkExecutor, MergeExecutor, MergeStrategy, PassthroughExecutor};
pub use model::CallModelExecutor;
pub use observe::{CheckCompletionExecutor, FormatObservationExecutor};
pub use route::{RouteBranch, RouteByConditionExecutor, RouteConfig};

use super::{NodeExecutor, NodeExecutorRegistry};
use crate::collaborators::{CapabilityInvoker, ContextProvider, ModelClient};
use crate::graph::NodeConfig;

/// Collaborators the built-in executors are wired to
#[derive(Clone)]
pub struct Builtins {
    pub context: Arc<dyn ContextProvider>,
    pub model: Arc<dyn ModelClient>,
    pub capabilities: Arc<dyn CapabilityInvoker>,
}

impl Builtins {
    pub fn new(
        context: Arc<dyn ContextProvider>,
        model: Arc<dyn ModelClient>,
        capabilities: Arc<dyn CapabilityInvoker>,
    ) -> Self {
        Self {
            context,
            model,
            capabilities,
        }
    }

    /// Every built-in type tag with its executor
    pub fn executors(&self) -> HashMap<String, Arc<dyn NodeExecutor>> {
        let entries: Vec<(&str, Arc<dyn NodeExecutor>)> = vec![
            ("passthrough", Arc::new(PassthroughExecutor)),
            ("merge", Arc::new(MergeExecutor)),
            ("emit_stream_chunk", Arc::new(EmitStreamChunkExecutor)),
            ("route_by_condition", Arc::new(RouteByConditionExecutor)),
            ("fetch_context", Arc::new(FetchContextExecutor::new(self.context.clone()))),
            ("call_model", Arc::new(CallModelExecutor::new(self.model.clone()))),
            (
                "execute_capability",
                Arc::new(ExecuteCapabilityExecutor::new(self.capabilities.clone())),
            ),
            ("format_observation", Arc::new(FormatObservationExecutor)),
            ("check_completion", Arc::new(CheckCompletionExecutor)),
        ];
        entries
            .into_iter()
            .map(|(tag, executor)| (tag.to_string(), executor))
            .collect()
    }

    /// Swap the built-ins into a registry in one step
    pub fn install(&self, registry: &NodeExecutorRegistry) {
        registry.replace_all(self.executors());
    }

    /// A fresh registry holding only the built-ins
    pub fn registry(&self) -> NodeExecutorRegistry {
        let registry = NodeExecutorRegistry::new();
        self.install(&registry);
        registry
    }
}

/// Deserialize a node config into a typed struct
pub(crate) fn parse_config<T: DeserializeOwned>(config: &NodeConfig) -> Result<T, String> {
    serde_json::from_value(Value::Object(config.clone())).map_err(|e| e.to_string())
}
