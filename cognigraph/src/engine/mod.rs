//! Graph execution engine
//!
//! [`Engine`] ties the registry, the validation cache, runtime limits and an
//! optional trace store together. [`Engine::run`] drives a validated graph on
//! a background task and hands back the live [`EventStream`];
//! [`Engine::execute`] is the same run against a caller-owned [`Reporter`].
//!
//! ```rust,ignore
//! let engine = Engine::new(Arc::new(builtins.registry()));
//! let graph = engine.validate(&templates::plan_act_observe(3))?;
//! let (events, trace) = engine
//!     .run(graph, json!({"message": "hello"}), RunOptions::new())
//!     .finish()
//!     .await?;
//! ```

pub mod config;
pub mod context;
mod runtime;

use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};

pub use config::{EngineConfig, RetryPolicy, RunOptions};
pub use context::{ExecutionContext, NodeContext};

use crate::error::{EngineError, ValidationErrors};
use crate::graph::{Graph, GraphCache, GraphDocument};
use crate::registry::NodeExecutorRegistry;
use crate::telemetry::{EventStream, GraphOutcome, Reporter, TraceRecord, TraceStore};
use runtime::Scheduler;

#[derive(Clone)]
pub struct Engine {
    registry: Arc<NodeExecutorRegistry>,
    cache: Arc<GraphCache>,
    config: EngineConfig,
    traces: Option<Arc<dyn TraceStore>>,
}

impl Engine {
    pub fn new(registry: Arc<NodeExecutorRegistry>) -> Self {
        Self {
            registry,
            cache: Arc::new(GraphCache::new()),
            config: EngineConfig::default(),
            traces: None,
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Share a validation cache with other engines
    pub fn with_cache(mut self, cache: Arc<GraphCache>) -> Self {
        self.cache = cache;
        self
    }

    /// Persist a trace record for every run
    pub fn with_trace_store(mut self, store: Arc<dyn TraceStore>) -> Self {
        self.traces = Some(store);
        self
    }

    pub fn registry(&self) -> &Arc<NodeExecutorRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<GraphCache> {
        &self.cache
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn trace_store(&self) -> Option<&Arc<dyn TraceStore>> {
        self.traces.as_ref()
    }

    /// Validate a document, reusing a cached graph for identical content
    pub fn validate(&self, document: &GraphDocument) -> Result<Arc<Graph>, ValidationErrors> {
        self.cache.get_or_validate(document, &self.registry)
    }

    /// Run a graph to its final output, reporting into `reporter`.
    ///
    /// The reporter is not sealed; the caller decides the outcome.
    pub async fn execute(
        &self,
        graph: Arc<Graph>,
        input: Value,
        options: RunOptions,
        reporter: &mut Reporter,
    ) -> Result<Value, EngineError> {
        Scheduler::new(graph, self.config.clone(), input, options, reporter)
            .run()
            .await
    }

    /// Run a graph on a background task, streaming its events.
    ///
    /// The stream always ends with one terminal event. Dropping it cancels
    /// the request.
    pub fn run(&self, graph: Arc<Graph>, input: Value, options: RunOptions) -> EventStream {
        let engine = self.clone();
        let request_id = options.request_id.clone();
        let cancel = options.cancel.clone();

        EventStream::spawn(request_id, graph.id().to_string(), cancel, move |mut reporter| async move {
            let outcome = match engine.execute(graph, input, options, &mut reporter).await {
                Ok(output) => GraphOutcome::Completed {
                    output,
                    fallback: false,
                },
                Err(err @ (EngineError::Cancelled | EngineError::Timeout(_))) => GraphOutcome::Cancelled {
                    reason: err.to_string(),
                },
                Err(err) => GraphOutcome::Failed {
                    error: err.to_string(),
                },
            };
            let trace = reporter.on_graph_finish(outcome);
            info!(
                request_id = %trace.request_id,
                graph_id = %trace.graph_id,
                outcome = %trace.outcome,
                duration_ms = trace.duration_ms(),
                "Graph run finished"
            );
            engine.persist(&trace).await;
            trace
        })
    }

    /// Append a trace to the store, if any. Failures are logged, never raised.
    pub(crate) async fn persist(&self, trace: &TraceRecord) {
        if let Some(store) = &self.traces {
            if let Err(e) = store.append(trace).await {
                warn!(request_id = %trace.request_id, error = %e, "Failed to persist trace");
            }
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("registry_generation", &self.registry.generation())
            .field("trace_store", &self.traces.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphBuilder;
    use crate::telemetry::{EventKind, NodeStatus, TraceOutcome};
    use crate::testing::test_registry;
    use serde_json::json;
    use std::time::Duration;

    static_assertions::assert_impl_all!(Engine: Send, Sync, Clone);

    fn engine() -> Engine {
        Engine::new(Arc::new(test_registry()))
    }

    #[tokio::test]
    async fn test_linear_run() {
        let doc = GraphBuilder::new("linear")
            .node("a", "passthrough")
            .node("b", "passthrough")
            .link("a", "output", "b", "input")
            .build();
        let engine = engine();
        let graph = engine.validate(&doc).unwrap();

        let (events, trace) = engine
            .run(graph, json!("hi"), RunOptions::new().with_request_id("req-1"))
            .finish()
            .await
            .unwrap();

        assert_eq!(trace.outcome, TraceOutcome::Completed);
        assert_eq!(trace.final_output, Some(json!("hi")));
        assert_eq!(trace.request_id, "req-1");
        assert!(matches!(events.last().unwrap().kind, EventKind::GraphCompleted { .. }));
        let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
        assert!(seqs.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn test_route_skips_inactive_branch() {
        let doc = GraphBuilder::new("routed")
            .node_with(
                "route",
                "route_by_condition",
                json!({
                    "field": "/kind",
                    "branches": [{"port": "left", "condition": {"op": "equals", "value": "l"}}],
                    "default": "right"
                }),
            )
            .node("left", "passthrough")
            .node("right", "passthrough")
            .node_with("join", "merge", json!({"strategy": "first"}))
            .link("route", "left", "left", "input")
            .link("route", "right", "right", "input")
            .link("left", "output", "join", "a")
            .link("right", "output", "join", "b")
            .build();
        let engine = engine();
        let graph = engine.validate(&doc).unwrap();

        let (_, trace) = engine
            .run(graph, json!({"kind": "l"}), RunOptions::new())
            .finish()
            .await
            .unwrap();

        assert_eq!(trace.outcome, TraceOutcome::Completed);
        let right: Vec<_> = trace.results_for("right").collect();
        assert_eq!(right.len(), 1);
        assert_eq!(right[0].status, NodeStatus::Skipped);
        assert_eq!(trace.final_output, Some(json!({"kind": "l"})));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let doc = GraphBuilder::new("one").node("a", "passthrough").build();
        let engine = engine();
        let graph = engine.validate(&doc).unwrap();
        let options = RunOptions::new();
        options.cancel.cancel();

        let (events, trace) = engine.run(graph, json!(1), options).finish().await.unwrap();
        assert_eq!(trace.outcome, TraceOutcome::Cancelled);
        assert!(trace.final_output.is_none());
        assert!(matches!(events.last().unwrap().kind, EventKind::GraphCancelled { .. }));
    }

    #[tokio::test]
    async fn test_deadline_in_the_past_times_out() {
        let doc = GraphBuilder::new("one").node("a", "passthrough").build();
        let engine = engine().with_config(EngineConfig::default().with_cancel_grace(Duration::from_millis(10)));
        let graph = engine.validate(&doc).unwrap();
        let mut reporter = Reporter::detached("r", "one");

        let err = engine
            .execute(graph, json!(1), RunOptions::new().with_timeout(Duration::ZERO), &mut reporter)
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }
}
