//! `execute_capability` node
//!
//! The capability name comes from config or from the plan fed into `input`:
//! either an object `{"capability": .., "args": ..}` or a text line of the
//! form `ACTION: <name> <args>`, where args are JSON or free text. A plan
//! that requests no action passes through unchanged.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::parse_config;
use crate::collaborators::CapabilityInvoker;
use crate::engine::context::NodeContext;
use crate::error::NodeExecutionError;
use crate::graph::NodeConfig;
use crate::registry::{NodeExecutor, PortSpec, PortValues};

const ACTION_PREFIX: &str = "ACTION:";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CapabilityConfig {
    #[serde(default)]
    capability: Option<String>,
    /// Static args merged under whatever the inputs provide
    #[serde(default)]
    args: Map<String, Value>,
    /// Turn `success: false` into a node failure
    #[serde(default)]
    fail_on_error: bool,
}

/// A capability call extracted from inputs
#[derive(Debug, Clone, PartialEq)]
struct Invocation {
    name: String,
    args: Value,
}

fn parse_action_line(text: &str) -> Option<Invocation> {
    let line = text
        .lines()
        .map(str::trim)
        .find(|line| line.starts_with(ACTION_PREFIX))?;
    let rest = line[ACTION_PREFIX.len()..].trim();
    let (name, raw_args) = match rest.split_once(char::is_whitespace) {
        Some((name, args)) => (name, args.trim()),
        None => (rest, ""),
    };
    if name.is_empty() {
        return None;
    }
    let args = serde_json::from_str(raw_args).unwrap_or_else(|_| json!({ "input": raw_args }));
    Some(Invocation {
        name: name.to_string(),
        args,
    })
}

fn resolve(config: &CapabilityConfig, inputs: &PortValues) -> Option<Invocation> {
    let input = inputs.get("input");

    let requested = match input {
        Some(Value::Object(obj)) => obj.get("capability").and_then(Value::as_str).map(|name| Invocation {
            name: name.to_string(),
            args: obj.get("args").cloned().unwrap_or(Value::Null),
        }),
        Some(Value::String(text)) => parse_action_line(text),
        _ => None,
    };

    let mut invocation = match (config.capability.as_ref(), requested) {
        (Some(name), requested) => Invocation {
            name: name.clone(),
            args: requested
                .map(|r| r.args)
                .or_else(|| input.map(|i| json!({ "input": i })))
                .unwrap_or(Value::Null),
        },
        (None, Some(requested)) => requested,
        (None, None) => return None,
    };

    if let Some(args) = inputs.get("args") {
        invocation.args = args.clone();
    }

    let mut merged = config.args.clone();
    match invocation.args {
        Value::Object(map) => merged.extend(map),
        Value::Null => {}
        other => {
            merged.insert("input".into(), other);
        }
    }
    invocation.args = Value::Object(merged);
    Some(invocation)
}

/// `execute_capability`: optional inputs `input`, `args`; outputs `output`, `success`
pub struct ExecuteCapabilityExecutor {
    invoker: Arc<dyn CapabilityInvoker>,
}

impl ExecuteCapabilityExecutor {
    pub fn new(invoker: Arc<dyn CapabilityInvoker>) -> Self {
        Self { invoker }
    }
}

#[async_trait]
impl NodeExecutor for ExecuteCapabilityExecutor {
    fn ports(&self, _config: &NodeConfig) -> PortSpec {
        PortSpec::new()
            .optional("input")
            .optional("args")
            .output("output")
            .output("success")
    }

    fn check_config(&self, config: &NodeConfig) -> Result<(), String> {
        parse_config::<CapabilityConfig>(config).map(|_| ())
    }

    async fn execute(
        &self,
        inputs: PortValues,
        config: &NodeConfig,
        ctx: &NodeContext,
    ) -> Result<PortValues, NodeExecutionError> {
        let config: CapabilityConfig = parse_config(config).map_err(NodeExecutionError::invalid_config)?;

        let mut out = PortValues::new();
        let Some(invocation) = resolve(&config, &inputs) else {
            out.insert(
                "output".into(),
                inputs.get("input").cloned().unwrap_or(Value::Null),
            );
            out.insert("success".into(), Value::Bool(true));
            return Ok(out);
        };

        tracing::debug!(
            node_id = %ctx.node_id(),
            capability = %invocation.name,
            "Invoking capability"
        );
        let outcome = self
            .invoker
            .execute_capability(&invocation.name, &invocation.args)
            .await?;

        if !outcome.success && config.fail_on_error {
            return Err(NodeExecutionError::fatal(format!(
                "capability '{}' failed: {}",
                invocation.name, outcome.output
            )));
        }

        out.insert("output".into(), outcome.output);
        out.insert("success".into(), Value::Bool(outcome.success));
        Ok(out)
    }
}
