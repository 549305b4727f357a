//! Persisted trace records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::event::{NodeResult, StreamEvent};

/// How a request ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceOutcome {
    /// The graph produced the result
    Completed,
    /// The alternate pipeline produced the result
    Fallback,
    Failed,
    Cancelled,
}

impl std::fmt::Display for TraceOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TraceOutcome::Completed => "completed",
            TraceOutcome::Fallback => "fallback",
            TraceOutcome::Failed => "failed",
            TraceOutcome::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Informational notes attached to a trace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum TraceAnnotation {
    LoopCapReached { group_id: String, iterations: u32 },
    Fallback { reason: String },
}

/// Append-only record of one request.
///
/// `events` holds exactly what the live stream carried, in the same order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceRecord {
    pub request_id: String,
    pub graph_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub node_results: Vec<NodeResult>,
    #[serde(default)]
    pub annotations: Vec<TraceAnnotation>,
    #[serde(default)]
    pub events: Vec<StreamEvent>,
    pub outcome: TraceOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TraceRecord {
    /// Results of one node, in invocation order
    pub fn results_for<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a NodeResult> + 'a {
        self.node_results.iter().filter(move |r| r.node_id == node_id)
    }

    pub fn loop_caps(&self) -> impl Iterator<Item = (&str, u32)> {
        self.annotations.iter().filter_map(|a| match a {
            TraceAnnotation::LoopCapReached { group_id, iterations } => Some((group_id.as_str(), *iterations)),
            _ => None,
        })
    }

    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }
}
