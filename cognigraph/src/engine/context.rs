//! Per-request execution state
//!
//! [`ExecutionContext`] is created fresh for every request and owned by the
//! one scheduler driving it. Executors never see it directly: each invocation
//! gets a [`NodeContext`] holding a read-only view of the node's scratch scope
//! plus a buffer of pending writes, which the scheduler applies only when the node
//! succeeds. There is never more than one writer.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::registry::PortValues;

/// Incremental text produced by a running node
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TokenChunk {
    pub node: usize,
    pub chunk: String,
}

pub(crate) type TokenSender = mpsc::UnboundedSender<TokenChunk>;

/// State of one request, owned by its scheduler
#[derive(Debug)]
pub struct ExecutionContext {
    request_id: String,
    initial_input: Value,
    node_outputs: Vec<Option<PortValues>>,
    scratch: BTreeMap<String, Value>,
    cancel: CancellationToken,
    deadline: Instant,
    iteration_counts: BTreeMap<String, u32>,
}

impl ExecutionContext {
    pub fn new(
        request_id: impl Into<String>,
        initial_input: Value,
        node_count: usize,
        cancel: CancellationToken,
        deadline: Instant,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            initial_input,
            node_outputs: vec![None; node_count],
            scratch: BTreeMap::new(),
            cancel,
            deadline,
            iteration_counts: BTreeMap::new(),
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn initial_input(&self) -> &Value {
        &self.initial_input
    }

    pub fn output(&self, node: usize) -> Option<&PortValues> {
        self.node_outputs.get(node).and_then(Option::as_ref)
    }

    /// Value on one output port of a finished node
    pub fn port_value(&self, node: usize, port: &str) -> Option<&Value> {
        self.output(node).and_then(|outputs| outputs.get(port))
    }

    pub(crate) fn set_output(&mut self, node: usize, outputs: PortValues) {
        self.node_outputs[node] = Some(outputs);
    }

    pub(crate) fn clear_output(&mut self, node: usize) {
        self.node_outputs[node] = None;
    }

    pub fn scratch(&self) -> &BTreeMap<String, Value> {
        &self.scratch
    }

    pub(crate) fn apply_writes(&mut self, writes: Vec<(String, Value)>) {
        self.scratch.extend(writes);
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn deadline_passed(&self) -> bool {
        Instant::now() >= self.deadline
    }

    pub fn iteration_count(&self, group_id: &str) -> u32 {
        self.iteration_counts.get(group_id).copied().unwrap_or(0)
    }

    /// Start the next pass of a loop group; returns the new count
    pub(crate) fn begin_pass(&mut self, group_id: &str) -> u32 {
        let count = self.iteration_counts.entry(group_id.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    /// Build the view handed to one executor invocation
    pub(crate) fn node_context(
        &self,
        node: usize,
        node_id: &str,
        iteration: Option<u32>,
        tokens: TokenSender,
    ) -> NodeContext {
        let prefix = scope_prefix(node_id);
        let scratch = self
            .scratch
            .iter()
            .filter_map(|(key, value)| {
                key.strip_prefix(&prefix)
                    .map(|local| (local.to_string(), value.clone()))
            })
            .collect();

        NodeContext {
            request_id: self.request_id.clone(),
            node,
            node_id: node_id.to_string(),
            iteration,
            scratch,
            writes: Mutex::new(Vec::new()),
            tokens,
            cancel: self.cancel.clone(),
        }
    }
}

fn scope_prefix(node_id: &str) -> String {
    format!("{}.", node_id)
}

/// What an executor sees of the request while it runs
#[derive(Debug)]
pub struct NodeContext {
    request_id: String,
    node: usize,
    node_id: String,
    iteration: Option<u32>,
    scratch: BTreeMap<String, Value>,
    writes: Mutex<Vec<(String, Value)>>,
    tokens: TokenSender,
    cancel: CancellationToken,
}

impl NodeContext {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Current loop pass (1-based) when the node is in a loop group
    pub fn iteration(&self) -> Option<u32> {
        self.iteration
    }

    /// Read a key in this node's scratch scope, as of dispatch
    pub fn scratch_get(&self, key: &str) -> Option<&Value> {
        self.scratch.get(key)
    }

    /// Write a key in this node's scratch scope; visible to later invocations
    /// once this one succeeds
    pub fn scratch_set(&self, key: impl Into<String>, value: Value) {
        let key = format!("{}{}", scope_prefix(&self.node_id), key.into());
        self.writes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((key, value));
    }

    /// Stream a partial text chunk to the caller
    pub fn emit_token(&self, chunk: impl Into<String>) {
        let chunk = chunk.into();
        if chunk.is_empty() {
            return;
        }
        // Receiver gone means the run is over; the chunk has nowhere to go
        let _ = self.tokens.send(TokenChunk {
            node: self.node,
            chunk,
        });
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the request is cancelled
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub(crate) fn take_writes(&self) -> Vec<(String, Value)> {
        std::mem::take(&mut *self.writes.lock().unwrap_or_else(|poisoned| poisoned.into_inner()))
    }
}

/// Standalone context for driving an executor outside the engine
#[cfg(test)]
pub(crate) fn detached_node_context(node_id: &str) -> (NodeContext, mpsc::UnboundedReceiver<TokenChunk>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let ctx = ExecutionContext::new("test-request", Value::Null, 1, CancellationToken::new(), Instant::now())
        .node_context(0, node_id, None, tx);
    (ctx, rx)
}
