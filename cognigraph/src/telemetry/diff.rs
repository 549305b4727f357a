//! Regression diffing of trace records
//!
//! Compares what two runs did, not how long they took: node results are
//! matched by `(node_id, occurrence)` and timing, sequence numbers and
//! attempt counts are ignored.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;
use serde_json::Value;

use super::event::{NodeResult, NodeStatus};
use super::trace::{TraceOutcome, TraceRecord};

/// A difference in one node invocation
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "change", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum NodeChange {
    /// Only the second trace ran this invocation
    Added { status: NodeStatus },
    /// Only the first trace ran this invocation
    Removed { status: NodeStatus },
    Status { before: NodeStatus, after: NodeStatus },
    Value { before: Value, after: Value },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeDiff {
    pub node_id: String,
    /// 0-based invocation index of the node within its trace
    pub occurrence: usize,
    #[serde(flatten)]
    pub change: NodeChange,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceDiff {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<(TraceOutcome, TraceOutcome)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_output: Option<(Option<Value>, Option<Value>)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loop_caps: Option<(Vec<(String, u32)>, Vec<(String, u32)>)>,
    pub nodes: Vec<NodeDiff>,
}

impl TraceDiff {
    pub fn is_empty(&self) -> bool {
        self.outcome.is_none() && self.final_output.is_none() && self.loop_caps.is_none() && self.nodes.is_empty()
    }
}

fn keyed(trace: &TraceRecord) -> BTreeMap<(String, usize), &NodeResult> {
    let mut seen: BTreeMap<&str, usize> = BTreeMap::new();
    let mut keyed = BTreeMap::new();
    for result in &trace.node_results {
        let occurrence = seen.entry(result.node_id.as_str()).or_insert(0);
        keyed.insert((result.node_id.clone(), *occurrence), result);
        *occurrence += 1;
    }
    keyed
}

fn loop_caps(trace: &TraceRecord) -> Vec<(String, u32)> {
    trace.loop_caps().map(|(g, n)| (g.to_string(), n)).collect()
}

/// Compare two traces, typically of two graph versions given the same input
pub fn diff_traces(before: &TraceRecord, after: &TraceRecord) -> TraceDiff {
    let mut diff = TraceDiff::default();

    if before.outcome != after.outcome {
        diff.outcome = Some((before.outcome, after.outcome));
    }
    if before.final_output != after.final_output {
        diff.final_output = Some((before.final_output.clone(), after.final_output.clone()));
    }
    let (caps_before, caps_after) = (loop_caps(before), loop_caps(after));
    if caps_before != caps_after {
        diff.loop_caps = Some((caps_before, caps_after));
    }

    let (a, b) = (keyed(before), keyed(after));
    for (key, old) in &a {
        let change = match b.get(key) {
            None => Some(NodeChange::Removed { status: old.status }),
            Some(new) if new.status != old.status => Some(NodeChange::Status {
                before: old.status,
                after: new.status,
            }),
            Some(new) if new.value != old.value => Some(NodeChange::Value {
                before: old.value.clone(),
                after: new.value.clone(),
            }),
            Some(_) => None,
        };
        if let Some(change) = change {
            diff.nodes.push(NodeDiff {
                node_id: key.0.clone(),
                occurrence: key.1,
                change,
            });
        }
    }
    for (key, new) in &b {
        if !a.contains_key(key) {
            diff.nodes.push(NodeDiff {
                node_id: key.0.clone(),
                occurrence: key.1,
                change: NodeChange::Added { status: new.status },
            });
        }
    }
    diff.nodes.sort_by(|x, y| (&x.node_id, x.occurrence).cmp(&(&y.node_id, y.occurrence)));
    diff
}

impl fmt::Display for TraceDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return writeln!(f, "no differences");
        }
        if let Some((a, b)) = &self.outcome {
            writeln!(f, "outcome: {} -> {}", a, b)?;
        }
        if let Some((a, b)) = &self.final_output {
            let show = |v: &Option<Value>| v.as_ref().map(Value::to_string).unwrap_or_else(|| "-".into());
            writeln!(f, "final output: {} -> {}", show(a), show(b))?;
        }
        if let Some((a, b)) = &self.loop_caps {
            writeln!(f, "loop caps: {:?} -> {:?}", a, b)?;
        }
        for node in &self.nodes {
            let label = format!("{}#{}", node.node_id, node.occurrence);
            match &node.change {
                NodeChange::Added { status } => writeln!(f, "+ {} ({})", label, status)?,
                NodeChange::Removed { status } => writeln!(f, "- {} ({})", label, status)?,
                NodeChange::Status { before, after } => writeln!(f, "~ {} status {} -> {}", label, before, after)?,
                NodeChange::Value { before, after } => writeln!(f, "~ {} value {} -> {}", label, before, after)?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::reporter::{GraphOutcome, Reporter};
    use serde_json::json;

    fn result(node_id: &str, status: NodeStatus, value: Value, duration_ms: u64) -> NodeResult {
        NodeResult {
            node_id: node_id.into(),
            status,
            value,
            duration_ms,
            error: None,
            iteration: None,
            attempts: 1,
        }
    }

    fn trace(results: Vec<NodeResult>, output: Value) -> TraceRecord {
        let mut reporter = Reporter::detached("r", "g");
        for r in results {
            reporter.on_node_finish(r);
        }
        reporter.on_graph_finish(GraphOutcome::Completed { output, fallback: false })
    }

    #[test]
    fn test_timing_is_ignored() {
        let a = trace(vec![result("a", NodeStatus::Success, json!(1), 5)], json!(1));
        let b = trace(vec![result("a", NodeStatus::Success, json!(1), 500)], json!(1));
        let diff = diff_traces(&a, &b);
        assert!(diff.is_empty());
        assert_eq!(diff.to_string(), "no differences\n");
    }

    #[test]
    fn test_detects_changes_per_occurrence() {
        let a = trace(
            vec![
                result("plan", NodeStatus::Success, json!("v1"), 1),
                result("plan", NodeStatus::Success, json!("v2"), 1),
                result("side", NodeStatus::Success, json!(0), 1),
            ],
            json!("v2"),
        );
        let b = trace(
            vec![
                result("plan", NodeStatus::Success, json!("v1"), 1),
                result("plan", NodeStatus::Success, json!("changed"), 1),
                result("side", NodeStatus::Skipped, Value::Null, 0),
                result("extra", NodeStatus::Success, json!(1), 1),
            ],
            json!("changed"),
        );

        let diff = diff_traces(&a, &b);
        assert!(diff.final_output.is_some());
        assert!(diff.outcome.is_none());
        assert_eq!(diff.nodes.len(), 3);
        assert_eq!(diff.nodes[0].node_id, "extra");
        assert!(matches!(diff.nodes[0].change, NodeChange::Added { .. }));
        assert_eq!((diff.nodes[1].node_id.as_str(), diff.nodes[1].occurrence), ("plan", 1));
        assert!(matches!(diff.nodes[2].change, NodeChange::Status { after: NodeStatus::Skipped, .. }));
    }
}
