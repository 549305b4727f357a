//! Control-loop nodes: `format_observation` and `check_completion`

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use super::condition::compiled_pattern;
use super::parse_config;
use crate::engine::context::NodeContext;
use crate::error::NodeExecutionError;
use crate::graph::NodeConfig;
use crate::registry::{require, single_output, value_text, NodeExecutor, PortSpec, PortValues};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObservationConfig {
    /// `{result}` and `{context}` are substituted
    #[serde(default = "default_template")]
    template: String,
    #[serde(default = "default_max_chars")]
    max_chars: usize,
}

fn default_template() -> String {
    "Observation: {result}".to_string()
}

fn default_max_chars() -> usize {
    2000
}

/// Cut `text` to at most `max` chars, marking the cut
fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((cut, _)) => format!("{}…", &text[..cut]),
        None => text.to_string(),
    }
}

/// `format_observation`: turns a capability result into text for the next plan
#[derive(Debug, Default, Clone, Copy)]
pub struct FormatObservationExecutor;

#[async_trait]
impl NodeExecutor for FormatObservationExecutor {
    fn ports(&self, _config: &NodeConfig) -> PortSpec {
        PortSpec::new()
            .required("result")
            .optional("context")
            .output("observation")
    }

    fn check_config(&self, config: &NodeConfig) -> Result<(), String> {
        let parsed: ObservationConfig = parse_config(config)?;
        if parsed.max_chars == 0 {
            return Err("maxChars must be positive".to_string());
        }
        Ok(())
    }

    async fn execute(
        &self,
        inputs: PortValues,
        config: &NodeConfig,
        _ctx: &NodeContext,
    ) -> Result<PortValues, NodeExecutionError> {
        let config: ObservationConfig = parse_config(config).map_err(NodeExecutionError::invalid_config)?;
        let result = truncate_chars(&value_text(require(&inputs, "result")?), config.max_chars);
        let context = inputs.get("context").map(value_text).unwrap_or_default();

        let observation = config
            .template
            .replace("{result}", &result)
            .replace("{context}", &context);
        Ok(single_output("observation", Value::String(observation)))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CompletionConfig {
    #[serde(default = "default_done_marker")]
    done_marker: String,
    /// Alternative completion test over the input text
    #[serde(default)]
    completion_pattern: Option<String>,
    /// Never report completion (the loop runs to its bound)
    #[serde(default)]
    force_continue: bool,
}

fn default_done_marker() -> String {
    "FINAL ANSWER".to_string()
}

/// `check_completion`: decides whether the plan/act/observe loop goes again.
///
/// Outputs `result` (the answer so far), `continue` (boolean, the usual loop
/// continue condition), and `feedback` for the next planning pass.
#[derive(Debug, Default, Clone, Copy)]
pub struct CheckCompletionExecutor;

#[async_trait]
impl NodeExecutor for CheckCompletionExecutor {
    fn ports(&self, _config: &NodeConfig) -> PortSpec {
        PortSpec::new()
            .required("input")
            .optional("observation")
            .output("result")
            .output("continue")
            .output("feedback")
    }

    fn check_config(&self, config: &NodeConfig) -> Result<(), String> {
        let parsed: CompletionConfig = parse_config(config)?;
        if let Some(pattern) = &parsed.completion_pattern {
            compiled_pattern(pattern).map_err(|e| format!("invalid completionPattern: {}", e))?;
        }
        Ok(())
    }

    async fn execute(
        &self,
        inputs: PortValues,
        config: &NodeConfig,
        ctx: &NodeContext,
    ) -> Result<PortValues, NodeExecutionError> {
        let config: CompletionConfig = parse_config(config).map_err(NodeExecutionError::invalid_config)?;
        let text = value_text(require(&inputs, "input")?);

        let marker_at = text.find(&config.done_marker);
        let pattern_hit = match &config.completion_pattern {
            Some(pattern) => compiled_pattern(pattern)
                .map_err(NodeExecutionError::invalid_config)?
                .is_match(&text),
            None => false,
        };
        let done = !config.force_continue && (marker_at.is_some() || pattern_hit);

        let result = match marker_at {
            Some(at) if done => text[at + config.done_marker.len()..]
                .trim_start_matches(|c: char| c == ':' || c.is_whitespace())
                .trim_end()
                .to_string(),
            _ => text.trim().to_string(),
        };

        let feedback = if done {
            String::new()
        } else {
            match inputs.get("observation").map(value_text) {
                Some(observation) if !observation.is_empty() => observation,
                _ => format!("Not finished. Continue, and reply with '{}' once done.", config.done_marker),
            }
        };

        let checks = ctx
            .scratch_get("checks")
            .and_then(Value::as_u64)
            .unwrap_or(0)
            + 1;
        ctx.scratch_set("checks", json!(checks));

        let mut out = PortValues::new();
        out.insert("result".into(), Value::String(result));
        out.insert("continue".into(), Value::Bool(!done));
        out.insert("feedback".into(), Value::String(feedback));
        Ok(out)
    }
}
