//! Streaming/telemetry reporter
//!
//! One sequence counter feeds both sinks: every event gets its `seq` here and
//! is then pushed to the live channel and appended to the trace, so the two
//! can never disagree on order. The reporter only appends; nothing it holds
//! flows back into scheduling.

use chrono::Utc;
use serde_json::Value;
use tokio::sync::mpsc;

use super::event::{EventKind, NodeResult, StreamEvent};
use super::trace::{TraceAnnotation, TraceOutcome, TraceRecord};

/// Final state handed to [`Reporter::on_graph_finish`]
#[derive(Debug, Clone, PartialEq)]
pub enum GraphOutcome {
    Completed { output: Value, fallback: bool },
    Failed { error: String },
    Cancelled { reason: String },
}

pub type EventSender = mpsc::UnboundedSender<StreamEvent>;

#[derive(Debug)]
pub struct Reporter {
    seq: u64,
    sink: Option<EventSender>,
    record: TraceRecord,
}

impl Reporter {
    /// Reporter that streams to `sink` as well as recording
    pub fn new(request_id: impl Into<String>, graph_id: impl Into<String>, sink: EventSender) -> Self {
        let mut reporter = Self::detached(request_id, graph_id);
        reporter.sink = Some(sink);
        reporter
    }

    /// Reporter that only records
    pub fn detached(request_id: impl Into<String>, graph_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            seq: 0,
            sink: None,
            record: TraceRecord {
                request_id: request_id.into(),
                graph_id: graph_id.into(),
                started_at: now,
                finished_at: now,
                node_results: Vec::new(),
                annotations: Vec::new(),
                events: Vec::new(),
                outcome: TraceOutcome::Failed,
                final_output: None,
                error: None,
            },
        }
    }

    pub fn request_id(&self) -> &str {
        &self.record.request_id
    }

    pub fn graph_id(&self) -> &str {
        &self.record.graph_id
    }

    /// Events emitted so far
    pub fn events(&self) -> &[StreamEvent] {
        &self.record.events
    }

    fn emit(&mut self, kind: EventKind) {
        self.seq += 1;
        let event = StreamEvent { seq: self.seq, kind };
        if let Some(sink) = &self.sink {
            // A dropped receiver only ends the live view; the trace keeps going
            if sink.send(event.clone()).is_err() {
                self.sink = None;
            }
        }
        self.record.events.push(event);
    }

    pub fn on_node_start(&mut self, node_id: &str, iteration: Option<u32>) {
        self.emit(EventKind::NodeStarted {
            node_id: node_id.to_string(),
            iteration,
        });
    }

    pub fn on_node_token(&mut self, node_id: &str, chunk: String) {
        self.emit(EventKind::NodeToken {
            node_id: node_id.to_string(),
            chunk,
        });
    }

    pub fn on_node_finish(&mut self, result: NodeResult) {
        self.record.node_results.push(result.clone());
        self.emit(EventKind::NodeFinished {
            node_id: result.node_id.clone(),
            result,
        });
    }

    pub fn on_loop_cap_reached(&mut self, group_id: &str, iterations: u32) {
        self.record.annotations.push(TraceAnnotation::LoopCapReached {
            group_id: group_id.to_string(),
            iterations,
        });
        self.emit(EventKind::LoopCapReached {
            group_id: group_id.to_string(),
            iterations,
        });
    }

    pub fn on_graph_fallback(&mut self, reason: &str) {
        self.record.annotations.push(TraceAnnotation::Fallback {
            reason: reason.to_string(),
        });
        self.emit(EventKind::GraphFallback {
            reason: reason.to_string(),
        });
    }

    /// Emit the terminal event and seal the trace
    pub fn on_graph_finish(mut self, outcome: GraphOutcome) -> TraceRecord {
        match outcome {
            GraphOutcome::Completed { output, fallback } => {
                self.record.outcome = if fallback {
                    TraceOutcome::Fallback
                } else {
                    TraceOutcome::Completed
                };
                self.record.final_output = Some(output.clone());
                self.emit(EventKind::GraphCompleted {
                    final_output: output,
                    fallback,
                });
            }
            GraphOutcome::Failed { error } => {
                self.record.outcome = TraceOutcome::Failed;
                self.record.error = Some(error.clone());
                self.emit(EventKind::GraphFailed { error });
            }
            GraphOutcome::Cancelled { reason } => {
                self.record.outcome = TraceOutcome::Cancelled;
                self.record.error = Some(reason.clone());
                self.emit(EventKind::GraphCancelled { reason });
            }
        }
        self.record.finished_at = Utc::now();
        self.record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::event::NodeStatus;
    use serde_json::json;

    fn success(node_id: &str) -> NodeResult {
        NodeResult {
            node_id: node_id.into(),
            status: NodeStatus::Success,
            value: json!({"output": 1}),
            duration_ms: 5,
            error: None,
            iteration: None,
            attempts: 1,
        }
    }

    #[test]
    fn test_live_stream_and_trace_agree() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut reporter = Reporter::new("r1", "g1", tx);

        reporter.on_node_start("a", None);
        reporter.on_node_token("a", "par".into());
        reporter.on_node_finish(success("a"));
        reporter.on_loop_cap_reached("loop", 3);
        let trace = reporter.on_graph_finish(GraphOutcome::Completed {
            output: json!("done"),
            fallback: false,
        });

        let mut live = Vec::new();
        while let Ok(event) = rx.try_recv() {
            live.push(event);
        }
        assert_eq!(live, trace.events);
        let seqs: Vec<u64> = live.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);

        assert_eq!(trace.outcome, TraceOutcome::Completed);
        assert_eq!(trace.node_results.len(), 1);
        assert_eq!(trace.loop_caps().collect::<Vec<_>>(), vec![("loop", 3)]);
    }

    #[test]
    fn test_fallback_and_failure_outcomes() {
        let mut reporter = Reporter::detached("r1", "g1");
        reporter.on_graph_fallback("node 'x' failed");
        let trace = reporter.on_graph_finish(GraphOutcome::Completed {
            output: json!("legacy"),
            fallback: true,
        });
        assert_eq!(trace.outcome, TraceOutcome::Fallback);
        assert!(matches!(trace.annotations[0], TraceAnnotation::Fallback { .. }));

        let trace = Reporter::detached("r2", "g1").on_graph_finish(GraphOutcome::Failed {
            error: "boom".into(),
        });
        assert_eq!(trace.outcome, TraceOutcome::Failed);
        assert_eq!(trace.final_output, None);
        assert_eq!(trace.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_dropped_receiver_keeps_recording() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let mut reporter = Reporter::new("r1", "g1", tx);
        reporter.on_node_start("a", None);
        reporter.on_node_start("b", None);
        assert_eq!(reporter.events().len(), 2);
    }
}
