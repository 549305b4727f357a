//! Integration Tests for the Scheduler
//!
//! These tests verify:
//! - Final output independent of node completion order
//! - Independent branches running concurrently
//! - Skip propagation from inactive routes
//! - Failure handling on and off the terminal path
//! - Retries, node timeouts and cancellation

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio_util::sync::CancellationToken;

use cognigraph::{
    Engine, EngineConfig, EngineError, EventKind, GraphBuilder, GraphDocument, NodeStatus, Reporter, RetryPolicy,
    RunOptions, TraceOutcome,
};
use common::{engine, registry, FlakyExecutor};

/// Two delayed branches joined by a merge
fn fan_in(delay_a: u64, delay_b: u64) -> GraphDocument {
    GraphBuilder::new("fan_in")
        .node_with("a", "delay", json!({ "delayMs": delay_a, "value": "A" }))
        .node_with("b", "delay", json!({ "delayMs": delay_b, "value": "B" }))
        .node_with("join", "merge", json!({ "strategy": "array" }))
        .link("a", "output", "join", "a")
        .link("b", "output", "join", "b")
        .build()
}

// =============================================================================
// Determinism and concurrency
// =============================================================================

#[tokio::test]
async fn test_output_independent_of_completion_order() {
    let engine = engine();
    let mut outputs = Vec::new();

    for (delay_a, delay_b) in [(60, 0), (0, 60)] {
        let graph = engine.validate(&fan_in(delay_a, delay_b)).unwrap();
        let (events, trace) = engine.run(graph, json!(null), RunOptions::new()).finish().await.unwrap();
        assert_eq!(trace.outcome, TraceOutcome::Completed);

        let finished: Vec<&str> = events
            .iter()
            .filter_map(|e| match &e.kind {
                EventKind::NodeFinished { node_id, .. } => Some(node_id.as_str()),
                _ => None,
            })
            .collect();
        let first = if delay_a > delay_b { "b" } else { "a" };
        assert_eq!(finished[0], first, "faster branch should finish first");

        outputs.push(trace.final_output);
    }

    assert_eq!(outputs[0], outputs[1]);
    assert_eq!(outputs[0], Some(json!(["A", "B"])));
}

#[tokio::test]
async fn test_independent_branches_run_concurrently() {
    let engine = engine();
    let graph = engine.validate(&fan_in(150, 150)).unwrap();

    let started = Instant::now();
    let (_, trace) = engine.run(graph, json!(null), RunOptions::new()).finish().await.unwrap();

    assert_eq!(trace.outcome, TraceOutcome::Completed);
    assert!(
        started.elapsed() < Duration::from_millis(280),
        "branches ran one after another: {:?}",
        started.elapsed()
    );
}

#[tokio::test]
async fn test_max_in_flight_of_one_serializes_branches() {
    let engine = engine().with_config(EngineConfig::default().with_max_in_flight(1));
    let graph = engine.validate(&fan_in(80, 80)).unwrap();

    let started = Instant::now();
    let (_, trace) = engine.run(graph, json!(null), RunOptions::new()).finish().await.unwrap();

    assert_eq!(trace.final_output, Some(json!(["A", "B"])));
    assert!(started.elapsed() >= Duration::from_millis(160));
}

// =============================================================================
// Skip propagation
// =============================================================================

#[tokio::test]
async fn test_inactive_route_skips_its_whole_branch() {
    let doc = GraphBuilder::new("routed")
        .node_with(
            "route",
            "route_by_condition",
            json!({
                "field": "/kind",
                "branches": [{ "port": "left", "condition": { "op": "equals", "value": "l" } }],
                "default": "right"
            }),
        )
        .node("left", "passthrough")
        .node("left_more", "passthrough")
        .node("right", "passthrough")
        .node_with("join", "merge", json!({ "strategy": "first" }))
        .link("route", "left", "left", "input")
        .link("left", "output", "left_more", "input")
        .link("route", "right", "right", "input")
        .link("left_more", "output", "join", "a")
        .link("right", "output", "join", "b")
        .build();
    let engine = engine();
    let graph = engine.validate(&doc).unwrap();

    let (events, trace) = engine
        .run(graph, json!({ "kind": "r", "text": "hi" }), RunOptions::new())
        .finish()
        .await
        .unwrap();

    assert_eq!(trace.outcome, TraceOutcome::Completed);
    assert_eq!(trace.final_output, Some(json!({ "kind": "r", "text": "hi" })));
    for skipped in ["left", "left_more"] {
        let results: Vec<_> = trace.results_for(skipped).collect();
        assert_eq!(results.len(), 1, "{} should be reported once", skipped);
        assert_eq!(results[0].status, NodeStatus::Skipped);
    }

    // Skipped nodes never start
    assert!(!events
        .iter()
        .any(|e| matches!(&e.kind, EventKind::NodeStarted { node_id, .. } if node_id.starts_with("left"))));
}

// =============================================================================
// Failures
// =============================================================================

#[tokio::test]
async fn test_failure_off_terminal_path_is_isolated() {
    let doc = GraphBuilder::new("side_failure")
        .node("input", "passthrough")
        .node("main", "passthrough")
        .node("side", "fail")
        .node("side_after", "passthrough")
        .link("input", "output", "main", "input")
        .link("input", "output", "side", "input")
        .link("side", "output", "side_after", "input")
        .terminal("main")
        .build();
    let engine = engine();
    let graph = engine.validate(&doc).unwrap();

    let (_, trace) = engine.run(graph, json!("ok"), RunOptions::new()).finish().await.unwrap();

    assert_eq!(trace.outcome, TraceOutcome::Completed);
    assert_eq!(trace.final_output, Some(json!("ok")));
    let side: Vec<_> = trace.results_for("side").collect();
    assert_eq!(side[0].status, NodeStatus::Error);
    assert_eq!(side[0].error.as_deref(), Some("boom"));
    assert_eq!(trace.results_for("side_after").next().unwrap().status, NodeStatus::Skipped);
}

#[tokio::test]
async fn test_failure_on_terminal_path_fails_the_run() {
    let doc = GraphBuilder::new("broken")
        .node("input", "passthrough")
        .node("middle", "fail")
        .node("out", "passthrough")
        .link("input", "output", "middle", "input")
        .link("middle", "output", "out", "input")
        .build();
    let engine = engine();
    let graph = engine.validate(&doc).unwrap();

    let mut reporter = Reporter::detached("req", "broken");
    let err = engine
        .execute(graph.clone(), json!(1), RunOptions::new(), &mut reporter)
        .await
        .unwrap_err();
    assert_eq!(err.failing_node(), Some("middle"));
    assert!(matches!(err, EngineError::NodeFailed { .. }));

    let (events, trace) = engine.run(graph, json!(1), RunOptions::new()).finish().await.unwrap();
    assert_eq!(trace.outcome, TraceOutcome::Failed);
    assert!(trace.final_output.is_none());
    assert!(trace.error.unwrap().contains("middle"));
    assert!(matches!(events.last().unwrap().kind, EventKind::GraphFailed { .. }));
}

#[tokio::test]
async fn test_retryable_failure_is_retried() {
    let registry = registry();
    let flaky = Arc::new(FlakyExecutor::new(1));
    registry.register("flaky", flaky.clone());
    let retry = RetryPolicy::new(1).with_backoff_base(Duration::from_millis(5));
    let engine = Engine::new(Arc::new(registry)).with_config(EngineConfig::default().with_retry_policy(retry));

    let doc = GraphBuilder::new("retry").node("wobbly", "flaky").build();
    let graph = engine.validate(&doc).unwrap();
    let (_, trace) = engine.run(graph, json!("x"), RunOptions::new()).finish().await.unwrap();

    assert_eq!(trace.outcome, TraceOutcome::Completed);
    assert_eq!(flaky.attempts.load(Ordering::SeqCst), 2);
    assert_eq!(trace.results_for("wobbly").next().unwrap().attempts, 2);
}

#[tokio::test]
async fn test_retries_exhausted() {
    let registry = registry();
    registry.register("flaky", Arc::new(FlakyExecutor::new(5)));
    let engine = Engine::new(Arc::new(registry)).with_config(
        EngineConfig::default().with_retry_policy(RetryPolicy::new(2).with_backoff_base(Duration::from_millis(1))),
    );

    let doc = GraphBuilder::new("retry").node("wobbly", "flaky").build();
    let graph = engine.validate(&doc).unwrap();
    let (_, trace) = engine.run(graph, json!("x"), RunOptions::new()).finish().await.unwrap();

    assert_eq!(trace.outcome, TraceOutcome::Failed);
    let result = trace.results_for("wobbly").next().unwrap();
    assert_eq!(result.status, NodeStatus::Error);
    assert_eq!(result.attempts, 3);
}

#[tokio::test]
async fn test_node_timeout() {
    let doc = GraphBuilder::new("slow")
        .node_with("sleepy", "delay", json!({ "delayMs": 2_000 }))
        .timeout_ms(50)
        .build();
    let engine = engine().with_config(EngineConfig::default().with_retry_policy(RetryPolicy::no_retry()));
    let graph = engine.validate(&doc).unwrap();

    let started = Instant::now();
    let (_, trace) = engine.run(graph, json!(null), RunOptions::new()).finish().await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(trace.outcome, TraceOutcome::Failed);
    let result = trace.results_for("sleepy").next().unwrap();
    assert!(result.error.as_deref().unwrap().contains("timed out"));
}

// =============================================================================
// Cancellation
// =============================================================================

#[tokio::test]
async fn test_cancel_mid_run() {
    let engine = engine().with_config(EngineConfig::default().with_cancel_grace(Duration::from_millis(20)));
    let graph = engine.validate(&fan_in(5_000, 5_000)).unwrap();
    let cancel = CancellationToken::new();

    let stream = engine.run(graph, json!(null), RunOptions::new().with_cancel(cancel.clone()));
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();

    let started = Instant::now();
    let (events, trace) = stream.finish().await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(trace.outcome, TraceOutcome::Cancelled);
    assert!(trace.final_output.is_none());
    assert!(matches!(events.last().unwrap().kind, EventKind::GraphCancelled { .. }));
    assert!(!events.iter().any(|e| matches!(e.kind, EventKind::GraphCompleted { .. })));
}

#[tokio::test]
async fn test_request_deadline() {
    let engine = engine().with_config(EngineConfig::default().with_cancel_grace(Duration::from_millis(20)));
    let graph = engine.validate(&fan_in(5_000, 0)).unwrap();

    let (_, trace) = engine
        .run(graph, json!(null), RunOptions::new().with_timeout(Duration::from_millis(100)))
        .finish()
        .await
        .unwrap();

    assert_eq!(trace.outcome, TraceOutcome::Cancelled);
    assert!(trace.error.unwrap_or_default().contains("timed out"));
}
