//! Fallback coordinator
//!
//! Runs the primary pipeline and, when it fails or its graph is rejected,
//! logs a structured failure and answers through the alternate pipeline.
//! Callers see exactly one of: a complete result, a result tagged as
//! fallback, or an explicit failure. Cancellation is never retried through
//! the fallback.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use super::pipeline::{Pipeline, PipelineRequest};
use crate::collaborators::{record_detached, AuditEvent, AuditSink, NoopAuditSink};
use crate::error::{EngineError, FallbackFailed, PipelineError};
use crate::telemetry::{EventStream, GraphOutcome, Reporter, TraceRecord, TraceStore};

/// Coordinator lifecycle for one request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CoordinatorState {
    NotAttempted,
    Running,
    Completed,
    Failed,
    FallbackRunning,
    FallbackCompleted,
    FallbackFailed,
    Cancelled,
}

impl CoordinatorState {
    pub fn can_transition_to(self, next: CoordinatorState) -> bool {
        use CoordinatorState::*;
        matches!(
            (self, next),
            (NotAttempted, Running)
                // Rejected before execution
                | (NotAttempted, Failed)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Failed, FallbackRunning)
                | (FallbackRunning, FallbackCompleted)
                | (FallbackRunning, FallbackFailed)
                | (FallbackRunning, Cancelled)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CoordinatorState::Completed
                | CoordinatorState::FallbackCompleted
                | CoordinatorState::FallbackFailed
                | CoordinatorState::Cancelled
        )
    }
}

/// What the caller gets back
#[derive(Debug, Clone, PartialEq)]
pub enum CoordinatedOutcome {
    Completed(Value),
    /// Produced by the alternate pipeline after the primary failed
    Fallback { output: Value, reason: String },
    Failed(FallbackFailed),
    Cancelled(String),
}

impl CoordinatedOutcome {
    pub fn output(&self) -> Option<&Value> {
        match self {
            CoordinatedOutcome::Completed(output) | CoordinatedOutcome::Fallback { output, .. } => Some(output),
            _ => None,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, CoordinatedOutcome::Fallback { .. })
    }

    fn to_graph_outcome(&self) -> GraphOutcome {
        match self {
            CoordinatedOutcome::Completed(output) => GraphOutcome::Completed {
                output: output.clone(),
                fallback: false,
            },
            CoordinatedOutcome::Fallback { output, .. } => GraphOutcome::Completed {
                output: output.clone(),
                fallback: true,
            },
            CoordinatedOutcome::Failed(err) => GraphOutcome::Failed { error: err.to_string() },
            CoordinatedOutcome::Cancelled(reason) => GraphOutcome::Cancelled { reason: reason.clone() },
        }
    }
}

/// Outcome plus the states the coordinator went through
#[derive(Debug, Clone, PartialEq)]
pub struct Coordination {
    pub outcome: CoordinatedOutcome,
    pub states: Vec<CoordinatorState>,
}

struct StateLog {
    states: Vec<CoordinatorState>,
}

impl StateLog {
    fn new() -> Self {
        Self {
            states: vec![CoordinatorState::NotAttempted],
        }
    }

    fn current(&self) -> CoordinatorState {
        self.states
            .last()
            .copied()
            .unwrap_or(CoordinatorState::NotAttempted)
    }

    fn advance(&mut self, next: CoordinatorState) {
        let current = self.current();
        if !current.can_transition_to(next) {
            warn!(from = ?current, to = ?next, "Unexpected coordinator transition");
        }
        debug!(from = ?current, to = ?next, "Coordinator transition");
        self.states.push(next);
    }

    fn finish(self, outcome: CoordinatedOutcome) -> Coordination {
        Coordination {
            outcome,
            states: self.states,
        }
    }
}

#[derive(Clone)]
pub struct FallbackCoordinator {
    primary: Arc<dyn Pipeline>,
    fallback: Arc<dyn Pipeline>,
    audit: Arc<dyn AuditSink>,
    fallback_timeout: Duration,
    traces: Option<Arc<dyn TraceStore>>,
}

impl FallbackCoordinator {
    pub fn new(primary: Arc<dyn Pipeline>, fallback: Arc<dyn Pipeline>) -> Self {
        Self {
            primary,
            fallback,
            audit: Arc::new(NoopAuditSink),
            fallback_timeout: Duration::from_secs(30),
            traces: None,
        }
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    /// Budget for the alternate pipeline, counted from when it starts
    pub fn with_fallback_timeout(mut self, timeout: Duration) -> Self {
        self.fallback_timeout = timeout;
        self
    }

    pub fn with_trace_store(mut self, store: Arc<dyn TraceStore>) -> Self {
        self.traces = Some(store);
        self
    }

    pub fn graph_id(&self) -> &str {
        self.primary.name()
    }

    /// Resolve one request, reporting into a caller-owned reporter
    pub async fn execute(&self, request: &PipelineRequest, reporter: &mut Reporter) -> Coordination {
        let mut log = StateLog::new();

        log.advance(CoordinatorState::Running);
        let primary_err = match self.primary.run(request, reporter).await {
            Ok(output) => {
                log.advance(CoordinatorState::Completed);
                return log.finish(CoordinatedOutcome::Completed(output));
            }
            Err(err) if err.is_cancelled() || request.cancel.is_cancelled() => {
                log.advance(CoordinatorState::Cancelled);
                return log.finish(CoordinatedOutcome::Cancelled(err.to_string()));
            }
            Err(err) => err,
        };

        log.advance(CoordinatorState::Failed);
        self.report_failure(request, &primary_err);
        let reason = primary_err.to_string();
        reporter.on_graph_fallback(&reason);

        log.advance(CoordinatorState::FallbackRunning);
        let fallback_request = PipelineRequest {
            deadline: Some(Instant::now() + self.fallback_timeout),
            ..request.clone()
        };
        let attempt = tokio::time::timeout(self.fallback_timeout, self.fallback.run(&fallback_request, reporter)).await;
        let fallback_err = match attempt {
            Ok(Ok(output)) => {
                info!(request_id = %request.request_id, graph_id = %self.graph_id(), "Served request through fallback");
                log.advance(CoordinatorState::FallbackCompleted);
                return log.finish(CoordinatedOutcome::Fallback { output, reason });
            }
            Ok(Err(err)) if err.is_cancelled() || request.cancel.is_cancelled() => {
                log.advance(CoordinatorState::Cancelled);
                return log.finish(CoordinatedOutcome::Cancelled(err.to_string()));
            }
            Ok(Err(err)) => err,
            Err(_) => PipelineError::Engine(EngineError::Timeout(self.fallback_timeout)),
        };

        log.advance(CoordinatorState::FallbackFailed);
        let failure = FallbackFailed {
            primary: primary_err,
            fallback: fallback_err,
        };
        error!(
            graph_id = %self.graph_id(),
            request_id = %request.request_id,
            error = %failure,
            "Fallback pipeline failed"
        );
        record_detached(
            self.audit.clone(),
            AuditEvent::new(
                request.request_id.clone(),
                self.graph_id(),
                "fallback_failed",
                json!({ "error": failure.to_string() }),
            ),
        );
        log.finish(CoordinatedOutcome::Failed(failure))
    }

    /// Resolve one request on a background task, streaming its events
    pub fn run(&self, request: PipelineRequest) -> EventStream {
        let coordinator = self.clone();
        let cancel = request.cancel.clone();

        EventStream::spawn(
            request.request_id.clone(),
            self.graph_id().to_string(),
            cancel,
            move |mut reporter| async move {
                let coordination = coordinator.execute(&request, &mut reporter).await;
                let trace = reporter.on_graph_finish(coordination.outcome.to_graph_outcome());
                info!(
                    request_id = %trace.request_id,
                    graph_id = %trace.graph_id,
                    outcome = %trace.outcome,
                    duration_ms = trace.duration_ms(),
                    "Request finished"
                );
                coordinator.persist(&trace).await;
                trace
            },
        )
    }

    /// Structured failure event, logged and audited before the fallback runs
    fn report_failure(&self, request: &PipelineRequest, err: &PipelineError) {
        let node_id = err.failing_node().unwrap_or("-");
        error!(
            graph_id = %self.graph_id(),
            request_id = %request.request_id,
            node_id = %node_id,
            error = %err,
            "Graph pipeline failed; invoking fallback"
        );
        record_detached(
            self.audit.clone(),
            AuditEvent::new(
                request.request_id.clone(),
                self.graph_id(),
                "graph_failed",
                json!({ "nodeId": err.failing_node(), "error": err.to_string() }),
            ),
        );
    }

    async fn persist(&self, trace: &TraceRecord) {
        if let Some(store) = &self.traces {
            if let Err(e) = store.append(trace).await {
                warn!(request_id = %trace.request_id, error = %e, "Failed to persist trace");
            }
        }
    }
}

impl std::fmt::Debug for FallbackCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackCoordinator")
            .field("primary", &self.primary.name())
            .field("fallback", &self.fallback.name())
            .field("fallback_timeout", &self.fallback_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::MemoryAuditSink;
    use crate::error::{CollaboratorError, NodeExecutionError};
    use async_trait::async_trait;

    struct Fixed(Result<Value, PipelineError>);

    #[async_trait]
    impl Pipeline for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn run(&self, _request: &PipelineRequest, _reporter: &mut Reporter) -> Result<Value, PipelineError> {
            self.0.clone()
        }
    }

    fn failing() -> Arc<dyn Pipeline> {
        Arc::new(Fixed(Err(EngineError::node_failed("plan", NodeExecutionError::fatal("boom")).into())))
    }

    #[test]
    fn test_state_transitions() {
        use CoordinatorState::*;
        assert!(NotAttempted.can_transition_to(Running));
        assert!(Failed.can_transition_to(FallbackRunning));
        assert!(!Completed.can_transition_to(FallbackRunning));
        assert!(!FallbackFailed.can_transition_to(Running));
        assert!(FallbackFailed.is_terminal());
        assert!(!Failed.is_terminal());
    }

    #[tokio::test]
    async fn test_primary_success_skips_fallback() {
        let coordinator = FallbackCoordinator::new(Arc::new(Fixed(Ok(Value::from(1)))), failing());
        let mut reporter = Reporter::detached("r", "fixed");
        let result = coordinator
            .execute(&PipelineRequest::new(Value::Null), &mut reporter)
            .await;
        assert_eq!(result.outcome, CoordinatedOutcome::Completed(Value::from(1)));
        assert_eq!(result.states.last(), Some(&CoordinatorState::Completed));
    }

    #[tokio::test]
    async fn test_failure_is_tagged_as_fallback_and_audited() {
        let audit = Arc::new(MemoryAuditSink::new());
        let coordinator = FallbackCoordinator::new(failing(), Arc::new(Fixed(Ok(Value::from("safe")))))
            .with_audit(audit.clone());
        let mut reporter = Reporter::detached("r", "fixed");

        let result = coordinator
            .execute(&PipelineRequest::new(Value::Null), &mut reporter)
            .await;
        assert!(result.outcome.is_fallback());
        assert_eq!(result.outcome.output(), Some(&Value::from("safe")));
        assert_eq!(
            result.states,
            vec![
                CoordinatorState::NotAttempted,
                CoordinatorState::Running,
                CoordinatorState::Failed,
                CoordinatorState::FallbackRunning,
                CoordinatorState::FallbackCompleted,
            ]
        );

        // Audit is fire-and-forget
        tokio::task::yield_now().await;
        for _ in 0..10 {
            if !audit.events().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let events = audit.events();
        assert_eq!(events[0].kind, "graph_failed");
        assert_eq!(events[0].detail["nodeId"], "plan");
    }

    #[tokio::test]
    async fn test_both_failing_is_explicit_failure() {
        let fallback = Arc::new(Fixed(Err(CollaboratorError::unavailable("model", "down").into())));
        let coordinator = FallbackCoordinator::new(failing(), fallback);
        let mut reporter = Reporter::detached("r", "fixed");

        let result = coordinator
            .execute(&PipelineRequest::new(Value::Null), &mut reporter)
            .await;
        let CoordinatedOutcome::Failed(failure) = result.outcome else {
            panic!("expected failure");
        };
        assert_eq!(failure.primary.failing_node(), Some("plan"));
        assert!(matches!(failure.fallback, PipelineError::Collaborator(_)));
    }

    #[tokio::test]
    async fn test_cancellation_bypasses_fallback() {
        let primary = Arc::new(Fixed(Err(EngineError::Cancelled.into())));
        let coordinator = FallbackCoordinator::new(primary, Arc::new(Fixed(Ok(Value::Null))));
        let mut reporter = Reporter::detached("r", "fixed");

        let result = coordinator
            .execute(&PipelineRequest::new(Value::Null), &mut reporter)
            .await;
        assert!(matches!(result.outcome, CoordinatedOutcome::Cancelled(_)));
        assert!(reporter.events().is_empty());
    }
}
