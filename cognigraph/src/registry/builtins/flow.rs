//! Data-flow nodes: passthrough, merge, and stream emission

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::parse_config;
use crate::engine::context::NodeContext;
use crate::error::NodeExecutionError;
use crate::graph::NodeConfig;
use crate::registry::{require, single_output, value_text, NodeExecutor, PortSpec, PortValues};

/// `passthrough`: copies `input` to `output`
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughExecutor;

#[async_trait]
impl NodeExecutor for PassthroughExecutor {
    fn ports(&self, _config: &NodeConfig) -> PortSpec {
        PortSpec::new().required("input").output("output")
    }

    async fn execute(
        &self,
        inputs: PortValues,
        _config: &NodeConfig,
        _ctx: &NodeContext,
    ) -> Result<PortValues, NodeExecutionError> {
        let value = require(&inputs, "input")?.clone();
        Ok(single_output("output", value))
    }
}

/// How a merge node combines its inputs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Object keyed by input port name
    #[default]
    Object,
    /// Values ordered by input port name
    Array,
    /// First value by input port name
    First,
    /// Text of every value joined by a blank line
    Concat,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct MergeConfig {
    #[serde(default)]
    strategy: MergeStrategy,
}

/// `merge`: explicit fan-in over any number of input ports.
///
/// Inputs arrive in a `BTreeMap`, so the result depends only on port names
/// and never on which branch finished first.
#[derive(Debug, Default, Clone, Copy)]
pub struct MergeExecutor;

#[async_trait]
impl NodeExecutor for MergeExecutor {
    fn ports(&self, _config: &NodeConfig) -> PortSpec {
        PortSpec::new().open().output("merged")
    }

    fn check_config(&self, config: &NodeConfig) -> Result<(), String> {
        parse_config::<MergeConfig>(config).map(|_| ())
    }

    async fn execute(
        &self,
        inputs: PortValues,
        config: &NodeConfig,
        _ctx: &NodeContext,
    ) -> Result<PortValues, NodeExecutionError> {
        let MergeConfig { strategy } = parse_config(config).map_err(NodeExecutionError::invalid_config)?;

        let merged = match strategy {
            MergeStrategy::Object => Value::Object(inputs.into_iter().collect()),
            MergeStrategy::Array => Value::Array(inputs.into_values().collect()),
            MergeStrategy::First => inputs.into_values().next().unwrap_or(Value::Null),
            MergeStrategy::Concat => Value::String(
                inputs
                    .values()
                    .map(value_text)
                    .filter(|text| !text.is_empty())
                    .collect::<Vec<_>>()
                    .join("\n\n"),
            ),
        };
        Ok(single_output("merged", merged))
    }
}

/// `emit_stream_chunk`: streams `text` to the caller and passes it on
#[derive(Debug, Default, Clone, Copy)]
pub struct EmitStreamChunkExecutor;

#[async_trait]
impl NodeExecutor for EmitStreamChunkExecutor {
    fn ports(&self, _config: &NodeConfig) -> PortSpec {
        PortSpec::new().required("text").output("text")
    }

    async fn execute(
        &self,
        inputs: PortValues,
        config: &NodeConfig,
        ctx: &NodeContext,
    ) -> Result<PortValues, NodeExecutionError> {
        let text = value_text(require(&inputs, "text")?);
        let prefix = config.get("prefix").and_then(Value::as_str).unwrap_or("");
        ctx.emit_token(format!("{}{}", prefix, text));
        Ok(single_output("text", Value::String(text)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::context::detached_node_context;
    use serde_json::json;

    fn inputs(pairs: &[(&str, Value)]) -> PortValues {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn strategy(name: &str) -> NodeConfig {
        json!({ "strategy": name }).as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_passthrough() {
        let (ctx, _rx) = detached_node_context("p");
        let out = PassthroughExecutor
            .execute(inputs(&[("input", json!(7))]), &NodeConfig::new(), &ctx)
            .await
            .unwrap();
        assert_eq!(out["output"], json!(7));

        let err = PassthroughExecutor
            .execute(PortValues::new(), &NodeConfig::new(), &ctx)
            .await
            .unwrap_err();
        assert!(err.message.contains("input"));
    }

    #[tokio::test]
    async fn test_merge_strategies_order_by_port() {
        let (ctx, _rx) = detached_node_context("m");
        let values = inputs(&[("b", json!("second")), ("a", json!("first"))]);

        let out = MergeExecutor
            .execute(values.clone(), &NodeConfig::new(), &ctx)
            .await
            .unwrap();
        assert_eq!(out["merged"], json!({"a": "first", "b": "second"}));

        let out = MergeExecutor.execute(values.clone(), &strategy("array"), &ctx).await.unwrap();
        assert_eq!(out["merged"], json!(["first", "second"]));

        let out = MergeExecutor.execute(values.clone(), &strategy("first"), &ctx).await.unwrap();
        assert_eq!(out["merged"], json!("first"));

        let out = MergeExecutor.execute(values, &strategy("concat"), &ctx).await.unwrap();
        assert_eq!(out["merged"], json!("first\n\nsecond"));
    }

    #[test]
    fn test_merge_rejects_unknown_strategy() {
        assert!(MergeExecutor.check_config(&strategy("zip")).is_err());
    }

    #[tokio::test]
    async fn test_emit_stream_chunk() {
        let (ctx, mut rx) = detached_node_context("emit");
        let config = json!({"prefix": "> "}).as_object().cloned().unwrap();
        let out = EmitStreamChunkExecutor
            .execute(inputs(&[("text", json!("thinking"))]), &config, &ctx)
            .await
            .unwrap();
        assert_eq!(out["text"], json!("thinking"));
        assert_eq!(rx.try_recv().unwrap().chunk, "> thinking");
    }
}
