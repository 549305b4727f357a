//! Stream events and node results

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outcome of one node invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Success,
    Error,
    Skipped,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStatus::Success => write!(f, "success"),
            NodeStatus::Error => write!(f, "error"),
            NodeStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// Result of one node invocation, as streamed and persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeResult {
    pub node_id: String,
    pub status: NodeStatus,
    /// Output ports as an object; null when skipped or failed
    pub value: Value,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Loop pass this invocation belonged to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u32>,
    #[serde(default)]
    pub attempts: u32,
}

impl NodeResult {
    pub fn skipped(node_id: impl Into<String>, iteration: Option<u32>) -> Self {
        Self {
            node_id: node_id.into(),
            status: NodeStatus::Skipped,
            value: Value::Null,
            duration_ms: 0,
            error: None,
            iteration,
            attempts: 0,
        }
    }
}

/// One event on the caller-facing stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    /// Monotonic per request, shared by the live stream and the trace
    pub seq: u64,
    #[serde(flatten)]
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum EventKind {
    NodeStarted {
        node_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        iteration: Option<u32>,
    },
    /// Incremental text; reconcile against `GraphCompleted`
    NodeToken { node_id: String, chunk: String },
    NodeFinished { node_id: String, result: NodeResult },
    /// A loop group exited at its iteration bound (informational)
    LoopCapReached { group_id: String, iterations: u32 },
    /// Authoritative final result
    GraphCompleted { final_output: Value, fallback: bool },
    GraphFailed { error: String },
    GraphFallback { reason: String },
    GraphCancelled { reason: String },
}

impl EventKind {
    /// Whether this event ends the stream
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventKind::GraphCompleted { .. } | EventKind::GraphFailed { .. } | EventKind::GraphCancelled { .. }
        )
    }

    pub fn node_id(&self) -> Option<&str> {
        match self {
            EventKind::NodeStarted { node_id, .. }
            | EventKind::NodeToken { node_id, .. }
            | EventKind::NodeFinished { node_id, .. } => Some(node_id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_wire_format() {
        let event = StreamEvent {
            seq: 3,
            kind: EventKind::NodeToken {
                node_id: "llm".into(),
                chunk: "Hel".into(),
            },
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({"seq": 3, "event": "nodeToken", "nodeId": "llm", "chunk": "Hel"})
        );

        let back: StreamEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_terminal_events() {
        assert!(EventKind::GraphCompleted {
            final_output: json!("x"),
            fallback: false
        }
        .is_terminal());
        assert!(!EventKind::GraphFallback { reason: "r".into() }.is_terminal());
        assert!(!EventKind::LoopCapReached {
            group_id: "g".into(),
            iterations: 3
        }
        .is_terminal());
    }

    #[test]
    fn test_skipped_result() {
        let result = NodeResult::skipped("n", Some(2));
        assert_eq!(result.status, NodeStatus::Skipped);
        assert_eq!(result.value, Value::Null);
        assert_eq!(serde_json::to_value(&result).unwrap()["status"], json!("skipped"));
    }
}
