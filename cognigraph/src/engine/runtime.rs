//! Execution scheduler
//!
//! One request is driven by one task. Node executor calls are futures polled
//! together in a [`FuturesUnordered`], so data-independent branches overlap
//! without any thread-level parallelism inside the request.
//!
//! # Algorithm
//!
//! The plan's units (plain nodes and collapsed loop groups) are activated in
//! topological order once all their predecessor units are done. Inside an
//! active unit a node is decided as soon as every non-feedback input link is
//! settled:
//!
//! - any live link, or no links at all (entry): the node runs
//! - every link dead, or a required port's link dead: the node is skipped
//!
//! A link is dead when its source was skipped, failed, or finished without
//! emitting that port (an inactive route branch). Decisions depend only on the
//! graph and on node results, never on completion order.
//!
//! A loop group runs its members once per pass. After a pass its continue
//! port is checked; a truthy value starts another pass while the count is
//! below the bound. Feedback links carry the previous pass's values.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, info_span, warn, Instrument};

use super::config::{EngineConfig, RetryPolicy, RunOptions};
use super::context::{ExecutionContext, NodeContext, TokenChunk, TokenSender};
use crate::error::{EngineError, NodeExecutionError};
use crate::graph::{Graph, PlanUnit};
use crate::registry::builtins::is_truthy;
use crate::registry::{PortSpec, PortValues};
use crate::telemetry::{NodeResult, NodeStatus, Reporter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeState {
    Pending,
    /// Ready, waiting for an in-flight slot
    Queued,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl NodeState {
    fn is_settled(self) -> bool {
        matches!(self, NodeState::Succeeded | NodeState::Failed | NodeState::Skipped)
    }

    fn name(self) -> &'static str {
        match self {
            NodeState::Pending => "pending",
            NodeState::Queued => "queued",
            NodeState::Running => "running",
            NodeState::Succeeded => "succeeded",
            NodeState::Failed => "failed",
            NodeState::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnitState {
    Waiting,
    Active,
    Done,
}

/// What a finished node future hands back
struct Completion {
    node: usize,
    iteration: Option<u32>,
    result: Result<PortValues, NodeExecutionError>,
    attempts: u32,
    duration: Duration,
    /// Scratch writes of the successful attempt
    writes: Vec<(String, Value)>,
}

enum Readiness {
    NotReady,
    Skip,
    Run(PortValues),
}

pub(crate) struct Scheduler<'r> {
    graph: Arc<Graph>,
    config: EngineConfig,
    ctx: ExecutionContext,
    reporter: &'r mut Reporter,
    states: Vec<NodeState>,
    units: Vec<UnitState>,
    /// Value carried by each feedback link into the current pass
    feedback: Vec<Option<Value>>,
    queue: VecDeque<(usize, PortValues)>,
    running: FuturesUnordered<BoxFuture<'static, Completion>>,
    tokens_tx: TokenSender,
    tokens_rx: mpsc::UnboundedReceiver<TokenChunk>,
    budget: Duration,
}

impl<'r> Scheduler<'r> {
    pub(crate) fn new(
        graph: Arc<Graph>,
        config: EngineConfig,
        input: Value,
        options: RunOptions,
        reporter: &'r mut Reporter,
    ) -> Self {
        let now = Instant::now();
        let deadline = options.deadline.unwrap_or(now + config.request_timeout);
        let node_count = graph.nodes().len();
        let ctx = ExecutionContext::new(
            options.request_id,
            input,
            node_count,
            options.cancel.child_token(),
            deadline,
        );
        let (tokens_tx, tokens_rx) = mpsc::unbounded_channel();

        Self {
            states: vec![NodeState::Pending; node_count],
            units: vec![UnitState::Waiting; graph.plan().unit_count()],
            feedback: vec![None; graph.links().len()],
            queue: VecDeque::new(),
            running: FuturesUnordered::new(),
            budget: deadline.saturating_duration_since(now),
            graph,
            config,
            ctx,
            reporter,
            tokens_tx,
            tokens_rx,
        }
    }

    /// Run the graph to its terminal output
    pub(crate) async fn run(self) -> Result<Value, EngineError> {
        let span = info_span!(
            "graph_run",
            request_id = %self.ctx.request_id(),
            graph_id = %self.graph.id()
        );
        self.drive().instrument(span).await
    }

    async fn drive(mut self) -> Result<Value, EngineError> {
        let cancel = self.ctx.cancel_token().clone();
        let deadline = tokio::time::Instant::from_std(self.ctx.deadline());

        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        info!(nodes = self.graph.nodes().len(), "Graph run started");

        self.advance();
        loop {
            if self.units.iter().all(|&u| u == UnitState::Done) {
                return self.final_output();
            }
            if self.running.is_empty() {
                let pending: Vec<&str> = self
                    .states
                    .iter()
                    .enumerate()
                    .filter(|(_, s)| !s.is_settled())
                    .map(|(n, _)| self.graph.node(n).id.as_str())
                    .collect();
                return Err(EngineError::Stalled(format!(
                    "no runnable nodes; unsettled: {}",
                    pending.join(", ")
                )));
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(self.wind_down(EngineError::Cancelled).await);
                }
                _ = tokio::time::sleep_until(deadline) => {
                    let err = EngineError::Timeout(self.budget);
                    return Err(self.wind_down(err).await);
                }
                Some(token) = self.tokens_rx.recv() => self.forward_token(token),
                Some(done) = self.running.next() => {
                    // Chunks sent before completion belong before the finish event
                    self.drain_tokens();
                    if let Err(err) = self.complete(done) {
                        return Err(self.wind_down(err).await);
                    }
                    self.advance();
                }
            }
        }
    }

    /// Decide and queue everything that can move, to a fixpoint
    fn advance(&mut self) {
        let graph = self.graph.clone();
        let plan = graph.plan();
        loop {
            let mut progressed = false;
            for u in 0..self.units.len() {
                match self.units[u] {
                    UnitState::Waiting => {
                        if plan.unit_preds[u].iter().all(|&p| self.units[p] == UnitState::Done) {
                            self.units[u] = UnitState::Active;
                            if let PlanUnit::Loop(g) = plan.units[u] {
                                self.begin_pass(g);
                            }
                            progressed = true;
                        }
                    }
                    UnitState::Active => progressed |= self.step_unit(u),
                    UnitState::Done => {}
                }
            }
            if !progressed {
                break;
            }
        }
        self.fill_slots();
    }

    fn step_unit(&mut self, u: usize) -> bool {
        let graph = self.graph.clone();
        match graph.plan().units[u] {
            PlanUnit::Node(n) => {
                let progressed = self.try_start(n);
                if self.states[n].is_settled() {
                    self.units[u] = UnitState::Done;
                    return true;
                }
                progressed
            }
            PlanUnit::Loop(g) => {
                let members = &graph.loop_group(g).members;
                let mut progressed = false;
                for &m in members {
                    progressed |= self.try_start(m);
                }
                if members.iter().all(|&m| self.states[m].is_settled()) {
                    self.end_pass(g, u);
                    progressed = true;
                }
                progressed
            }
        }
    }

    fn try_start(&mut self, n: usize) -> bool {
        if self.states[n] != NodeState::Pending {
            return false;
        }
        match self.readiness(n) {
            Readiness::NotReady => false,
            Readiness::Skip => {
                self.states[n] = NodeState::Skipped;
                let node_id = &self.graph.node(n).id;
                debug!(node_id = %node_id, "Node skipped");
                let result = NodeResult::skipped(node_id.clone(), self.iteration_of(n));
                self.reporter.on_node_finish(result);
                true
            }
            Readiness::Run(inputs) => {
                self.states[n] = NodeState::Queued;
                self.queue.push_back((n, inputs));
                true
            }
        }
    }

    fn readiness(&self, n: usize) -> Readiness {
        let graph = &self.graph;
        let node = graph.node(n);
        let mut inputs = PortValues::new();
        let mut live = 0usize;
        let mut dead_required = false;

        for &l in graph.incoming(n) {
            let link = graph.link(l);
            if link.feedback {
                if let Some(value) = &self.feedback[l] {
                    inputs.insert(link.to_port.clone(), value.clone());
                }
                continue;
            }

            let value = match self.states[link.from] {
                NodeState::Succeeded => self.ctx.port_value(link.from, &link.from_port),
                NodeState::Failed | NodeState::Skipped => None,
                _ => return Readiness::NotReady,
            };
            match value {
                Some(value) => {
                    live += 1;
                    inputs.insert(link.to_port.clone(), value.clone());
                }
                None => {
                    if node.ports.input(&link.to_port).is_some_and(|p| p.required) {
                        dead_required = true;
                    }
                }
            }
        }

        if node.entry {
            for port in entry_ports(&node.ports) {
                inputs
                    .entry(port)
                    .or_insert_with(|| self.ctx.initial_input().clone());
            }
            return Readiness::Run(inputs);
        }

        if dead_required || live == 0 {
            Readiness::Skip
        } else {
            Readiness::Run(inputs)
        }
    }

    fn fill_slots(&mut self) {
        while self.running.len() < self.config.max_in_flight {
            let Some((n, inputs)) = self.queue.pop_front() else {
                break;
            };
            self.dispatch(n, inputs);
        }
    }

    fn dispatch(&mut self, n: usize, inputs: PortValues) {
        let graph = self.graph.clone();
        let node = graph.node(n);
        let iteration = self.iteration_of(n);

        self.states[n] = NodeState::Running;
        self.reporter.on_node_start(&node.id, iteration);
        debug!(node_id = %node.id, node_type = %node.node_type, ?iteration, "Node dispatched");

        let node_ctx = self
            .ctx
            .node_context(n, &node.id, iteration, self.tokens_tx.clone());
        let timeout = node.timeout.unwrap_or(self.config.node_timeout);
        let span = info_span!("node", node_id = %node.id, node_type = %node.node_type);
        let future = run_node(
            graph.clone(),
            n,
            inputs,
            node_ctx,
            timeout,
            self.config.retry_policy.clone(),
            iteration,
        )
        .instrument(span)
        .boxed();
        self.running.push(future);
    }

    /// Fold a finished node into the context. An error is returned only for a
    /// failure on the path to the terminal.
    fn complete(&mut self, done: Completion) -> Result<(), EngineError> {
        let graph = self.graph.clone();
        let node = graph.node(done.node);
        let duration_ms = done.duration.as_millis() as u64;

        match done.result {
            Ok(mut outputs) => {
                outputs.retain(|port, _| {
                    let declared = node.ports.has_output(port);
                    if !declared {
                        warn!(node_id = %node.id, port = %port, "Dropping undeclared output port");
                    }
                    declared
                });
                debug!(node_id = %node.id, duration_ms, attempts = done.attempts, "Node finished");

                let value = Value::Object(outputs.clone().into_iter().collect());
                self.ctx.apply_writes(done.writes);
                self.ctx.set_output(done.node, outputs);
                self.states[done.node] = NodeState::Succeeded;
                self.reporter.on_node_finish(NodeResult {
                    node_id: node.id.clone(),
                    status: NodeStatus::Success,
                    value,
                    duration_ms,
                    error: None,
                    iteration: done.iteration,
                    attempts: done.attempts,
                });
            }
            Err(error) => {
                self.states[done.node] = NodeState::Failed;
                self.reporter.on_node_finish(NodeResult {
                    node_id: node.id.clone(),
                    status: NodeStatus::Error,
                    value: Value::Null,
                    duration_ms,
                    error: Some(error.to_string()),
                    iteration: done.iteration,
                    attempts: done.attempts,
                });

                if graph.plan().is_on_terminal_path(done.node) {
                    return Err(EngineError::node_failed(node.id.clone(), error));
                }
                warn!(node_id = %node.id, error = %error, "Node off the terminal path failed; skipping its dependents");
            }
        }
        Ok(())
    }

    /// Start the next pass of a loop group
    fn begin_pass(&mut self, g: usize) {
        let graph = self.graph.clone();
        let group = graph.loop_group(g);

        for &l in &group.feedback_links {
            let link = graph.link(l);
            self.feedback[l] = self.ctx.port_value(link.from, &link.from_port).cloned();
        }
        for &m in &group.members {
            self.states[m] = NodeState::Pending;
            self.ctx.clear_output(m);
        }
        let pass = self.ctx.begin_pass(&group.id);
        debug!(group_id = %group.id, pass, "Loop pass started");
    }

    fn end_pass(&mut self, g: usize, u: usize) {
        let graph = self.graph.clone();
        let group = graph.loop_group(g);
        let count = self.ctx.iteration_count(&group.id);
        let wants_more = self
            .ctx
            .port_value(group.continue_node, &group.continue_port)
            .is_some_and(is_truthy);

        if wants_more && count < group.max_iterations {
            self.begin_pass(g);
            return;
        }
        if wants_more {
            warn!(group_id = %group.id, iterations = count, "Loop group reached its iteration cap");
            self.reporter.on_loop_cap_reached(&group.id, count);
        } else {
            debug!(group_id = %group.id, iterations = count, "Loop group finished");
        }
        self.units[u] = UnitState::Done;
    }

    fn iteration_of(&self, n: usize) -> Option<u32> {
        self.graph
            .node(n)
            .loop_group
            .map(|g| self.ctx.iteration_count(&self.graph.loop_group(g).id))
    }

    fn forward_token(&mut self, token: TokenChunk) {
        let node_id = &self.graph.node(token.node).id;
        self.reporter.on_node_token(node_id, token.chunk);
    }

    fn drain_tokens(&mut self) {
        while let Ok(token) = self.tokens_rx.try_recv() {
            self.forward_token(token);
        }
    }

    fn final_output(&self) -> Result<Value, EngineError> {
        let terminal = self.graph.terminal_index();
        let node_id = self.graph.terminal().id.clone();
        match self.states[terminal] {
            NodeState::Succeeded => self
                .ctx
                .port_value(terminal, self.graph.output_port())
                .cloned()
                .ok_or_else(|| EngineError::TerminalOutputMissing {
                    node_id,
                    port: self.graph.output_port().to_string(),
                }),
            other => Err(EngineError::TerminalUnavailable {
                node_id,
                status: other.name().to_string(),
            }),
        }
    }

    /// Stop dispatching, give in-flight nodes the grace period, record what
    /// they did, and drop the rest. Nothing computed here reaches the caller.
    async fn wind_down(&mut self, reason: EngineError) -> EngineError {
        self.ctx.cancel_token().cancel();
        for (n, _) in std::mem::take(&mut self.queue) {
            self.states[n] = NodeState::Pending;
        }

        let grace = tokio::time::Instant::now() + self.config.cancel_grace;
        while !self.running.is_empty() {
            match tokio::time::timeout_at(grace, self.running.next()).await {
                Ok(Some(done)) => {
                    self.drain_tokens();
                    self.record_abandoned(done);
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(in_flight = self.running.len(), "Grace period elapsed; dropping in-flight nodes");
                    break;
                }
            }
        }
        self.running.clear();

        for n in 0..self.states.len() {
            if self.states[n] == NodeState::Running {
                self.states[n] = NodeState::Failed;
                self.reporter.on_node_finish(NodeResult {
                    node_id: self.graph.node(n).id.clone(),
                    status: NodeStatus::Error,
                    value: Value::Null,
                    duration_ms: 0,
                    error: Some(format!("abandoned: {}", reason)),
                    iteration: self.iteration_of(n),
                    attempts: 0,
                });
            }
        }

        warn!(reason = %reason, "Graph run stopped");
        reason
    }

    /// Trace a node that finished during wind-down without routing its outputs
    fn record_abandoned(&mut self, done: Completion) {
        let node_id = self.graph.node(done.node).id.clone();
        let (status, value, error) = match done.result {
            Ok(outputs) => (
                NodeStatus::Success,
                Value::Object(outputs.into_iter().collect()),
                None,
            ),
            Err(e) => (NodeStatus::Error, Value::Null, Some(e.to_string())),
        };
        self.states[done.node] = if status == NodeStatus::Success {
            NodeState::Succeeded
        } else {
            NodeState::Failed
        };
        self.reporter.on_node_finish(NodeResult {
            node_id,
            status,
            value,
            duration_ms: done.duration.as_millis() as u64,
            error,
            iteration: done.iteration,
            attempts: done.attempts,
        });
    }
}

/// Ports an entry node receives the request input on: its required inputs,
/// plus `input` when it accepts one
fn entry_ports(ports: &PortSpec) -> Vec<String> {
    let mut names: Vec<String> = ports.required_inputs().map(str::to_string).collect();
    if ports.accepts_input("input") && !names.iter().any(|p| p == "input") {
        names.push("input".to_string());
    }
    names
}

/// One node invocation with timeout and local retries
async fn run_node(
    graph: Arc<Graph>,
    n: usize,
    inputs: PortValues,
    ctx: NodeContext,
    timeout: Duration,
    retry: RetryPolicy,
    iteration: Option<u32>,
) -> Completion {
    let node = graph.node(n);
    let started = Instant::now();
    let mut attempts: u32 = 0;

    let result = loop {
        attempts += 1;
        let call = node.executor().execute(inputs.clone(), &node.config, &ctx);
        let outcome = match tokio::time::timeout(timeout, call).await {
            Ok(outcome) => outcome,
            Err(_) => Err(NodeExecutionError::timeout(timeout)),
        };

        match outcome {
            Err(error)
                if error.retryable
                    && retry.should_retry(attempts as usize - 1)
                    && !ctx.is_cancelled() =>
            {
                // A failed attempt leaves no scratch behind
                drop(ctx.take_writes());
                let delay = retry.delay_for_attempt(attempts as usize - 1);
                warn!(
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Retrying node"
                );
                tokio::time::sleep(delay).await;
            }
            other => break other,
        }
    };

    let writes = ctx.take_writes();
    Completion {
        node: n,
        iteration,
        writes: if result.is_ok() { writes } else { Vec::new() },
        result,
        attempts,
        duration: started.elapsed(),
    }
}
