//! Conditional routing node
//!
//! Declares one output port per branch (plus the default) and activates
//! exactly one of them per invocation by emitting only that port. Links out of
//! the ports left silent are dead, and the scheduler skips what they feed.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::condition::{select, BranchCondition};
use super::parse_config;
use crate::engine::context::NodeContext;
use crate::error::NodeExecutionError;
use crate::graph::NodeConfig;
use crate::registry::{require, single_output, NodeExecutor, PortSpec, PortValues};

/// One routing branch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteBranch {
    /// Output port activated when the condition holds
    pub port: String,

    /// Overrides the node-level field for this branch
    #[serde(default)]
    pub field: Option<String>,

    pub condition: BranchCondition,
}

/// Config of a `route_by_condition` node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Path into the input evaluated by every branch (empty = whole input)
    #[serde(default)]
    pub field: String,

    /// Checked in order; the first match wins
    pub branches: Vec<RouteBranch>,

    /// Port activated when no branch matches
    #[serde(default)]
    pub default: Option<String>,
}

impl RouteConfig {
    /// Distinct output ports in declaration order
    fn ports(&self) -> Vec<String> {
        let mut ports: Vec<String> = Vec::new();
        for port in self
            .branches
            .iter()
            .map(|b| &b.port)
            .chain(self.default.iter())
        {
            if !ports.contains(port) {
                ports.push(port.clone());
            }
        }
        ports
    }

    fn choose(&self, input: &Value) -> Option<&str> {
        self.branches
            .iter()
            .find(|branch| {
                let path = branch.field.as_deref().unwrap_or(&self.field);
                select(input, path)
                    .map(|value| branch.condition.evaluate(value))
                    .unwrap_or(false)
            })
            .map(|branch| branch.port.as_str())
            .or(self.default.as_deref())
    }
}

/// `route_by_condition`: input `input`; one output port per branch
#[derive(Debug, Default, Clone, Copy)]
pub struct RouteByConditionExecutor;

#[async_trait]
impl NodeExecutor for RouteByConditionExecutor {
    fn ports(&self, config: &NodeConfig) -> PortSpec {
        let spec = PortSpec::new().required("input");
        match parse_config::<RouteConfig>(config) {
            Ok(route) => route.ports().into_iter().fold(spec, PortSpec::output),
            Err(_) => spec,
        }
    }

    fn check_config(&self, config: &NodeConfig) -> Result<(), String> {
        let route: RouteConfig = parse_config(config)?;
        if route.branches.is_empty() && route.default.is_none() {
            return Err("route needs at least one branch or a default".to_string());
        }
        for branch in &route.branches {
            branch.condition.check()?;
        }
        Ok(())
    }

    async fn execute(
        &self,
        inputs: PortValues,
        config: &NodeConfig,
        _ctx: &NodeContext,
    ) -> Result<PortValues, NodeExecutionError> {
        let route: RouteConfig = parse_config(config).map_err(NodeExecutionError::invalid_config)?;
        let input = require(&inputs, "input")?;

        let port = route
            .choose(input)
            .ok_or_else(|| NodeExecutionError::fatal("no branch matched and no default port"))?;
        Ok(single_output(port, input.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::context::detached_node_context;
    use serde_json::json;

    fn config() -> NodeConfig {
        json!({
            "field": "/mode",
            "branches": [
                {"port": "fast", "condition": {"op": "equals", "value": "conversational"}},
                {"port": "fast", "field": "/message", "condition": {"op": "matches", "pattern": "(?i)^(hi|hello|thanks)\\b"}},
                {"port": "loop", "condition": {"op": "equals", "value": "agentic"}}
            ],
            "default": "loop"
        })
        .as_object()
        .cloned()
        .unwrap()
    }

    fn input(value: Value) -> PortValues {
        let mut inputs = PortValues::new();
        inputs.insert("input".into(), value);
        inputs
    }

    #[test]
    fn test_ports_follow_branches() {
        let spec = RouteByConditionExecutor.ports(&config());
        assert_eq!(spec.outputs, vec!["fast".to_string(), "loop".to_string()]);
        assert!(RouteByConditionExecutor.check_config(&config()).is_ok());
    }

    #[tokio::test]
    async fn test_activates_exactly_one_port() {
        let (ctx, _rx) = detached_node_context("route");
        let out = RouteByConditionExecutor
            .execute(input(json!({"mode": "conversational"})), &config(), &ctx)
            .await
            .unwrap();
        assert_eq!(out.keys().collect::<Vec<_>>(), vec!["fast"]);

        let out = RouteByConditionExecutor
            .execute(input(json!({"message": "Hello!"})), &config(), &ctx)
            .await
            .unwrap();
        assert!(out.contains_key("fast"));

        let out = RouteByConditionExecutor
            .execute(input(json!({"message": "plan a trip"})), &config(), &ctx)
            .await
            .unwrap();
        assert_eq!(out.keys().collect::<Vec<_>>(), vec!["loop"]);
    }

    #[tokio::test]
    async fn test_no_match_without_default_is_fatal() {
        let (ctx, _rx) = detached_node_context("route");
        let config = json!({"branches": [{"port": "a", "condition": {"op": "is_falsy"}}]})
            .as_object()
            .cloned()
            .unwrap();
        let err = RouteByConditionExecutor
            .execute(input(json!("text")), &config, &ctx)
            .await
            .unwrap_err();
        assert!(!err.retryable);
    }

    #[test]
    fn test_rejects_bad_config() {
        let empty = NodeConfig::new();
        assert!(RouteByConditionExecutor.check_config(&empty).is_err());

        let bad_regex = json!({"branches": [{"port": "a", "condition": {"op": "matches", "pattern": "("}}]})
            .as_object()
            .cloned()
            .unwrap();
        assert!(RouteByConditionExecutor.check_config(&bad_regex).is_err());
    }
}
