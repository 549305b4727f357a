//! Ready-made graph documents
//!
//! - [`conversational`]: context plus one model call
//! - [`plan_act_observe`]: the bounded plan, act, observe, check loop
//! - [`cognitive_router`]: routes trivially conversational requests to the
//!   cheap branch and everything else through the loop
//!
//! Every template starts with an `input` passthrough node, the single entry
//! that receives the request input.

use serde_json::json;

use crate::graph::{GraphBuilder, GraphDocument};

/// Loop group id used by [`plan_act_observe`] and [`cognitive_router`]
pub const AGENT_LOOP: &str = "agent_loop";

const ASSISTANT_PROMPT: &str = "You are a helpful assistant. Answer directly and concisely.";

const PLANNER_PROMPT: &str = "Work on the user's request step by step. \
When a tool would help, reply with a single line `ACTION: <capability> <json args>`. \
When you can answer, reply with `FINAL ANSWER: <answer>`.";

/// Greetings and thanks that never need the planning loop
const SMALL_TALK_PATTERN: &str = r"(?i)^\s*(hi|hello|hey|good (morning|evening)|thanks|thank you)\b";

/// `input -> context -> reply`
pub fn conversational() -> GraphDocument {
    GraphBuilder::new("conversational")
        .name("Conversational")
        .cognitive_mode("conversational")
        .node("input", "passthrough")
        .node("context", "fetch_context")
        .node_with(
            "reply",
            "call_model",
            json!({ "role": "assistant", "system": ASSISTANT_PROMPT }),
        )
        .link("input", "output", "context", "input")
        .link("input", "output", "reply", "input")
        .link("context", "context", "reply", "context")
        .build()
}

/// Add the loop body, fed from `source.port`, with its own context node
fn with_agent_loop(builder: GraphBuilder, source: &str, port: &str, max_iterations: u32) -> GraphBuilder {
    builder
        .node("loop_context", "fetch_context")
        .node_with(
            "plan",
            "call_model",
            json!({ "role": "planner", "system": PLANNER_PROMPT }),
        )
        .node("act", "execute_capability")
        .node("observe", "format_observation")
        .node("check", "check_completion")
        .link(source, port, "loop_context", "input")
        .link(source, port, "plan", "input")
        .link("loop_context", "context", "plan", "context")
        .link("plan", "content", "act", "input")
        .link("act", "output", "observe", "result")
        .link("plan", "content", "check", "input")
        .link("observe", "observation", "check", "observation")
        .link("check", "feedback", "plan", "feedback")
        .loop_group(
            AGENT_LOOP,
            &["plan", "act", "observe", "check"],
            max_iterations,
            "check",
            "continue",
        )
}

/// Plan, act, observe, check; at most `max_iterations` passes
pub fn plan_act_observe(max_iterations: u32) -> GraphDocument {
    let builder = GraphBuilder::new("plan_act_observe")
        .name("Plan / act / observe")
        .cognitive_mode("agentic")
        .node("input", "passthrough");
    with_agent_loop(builder, "input", "output", max_iterations)
        .terminal("check")
        .terminal_port("result")
        .build()
}

/// Route small talk to a single model call, everything else through the loop.
///
/// The request input may carry `mode` (`conversational` or `agentic`) to force
/// a branch, and `message` with the user text.
pub fn cognitive_router(max_iterations: u32) -> GraphDocument {
    let builder = GraphBuilder::new("cognitive_router")
        .name("Cognitive router")
        .cognitive_mode("dual")
        .node("input", "passthrough")
        .node_with(
            "route",
            "route_by_condition",
            json!({
                "field": "/mode",
                "branches": [
                    { "port": "conversational", "condition": { "op": "equals", "value": "conversational" } },
                    { "port": "agentic", "condition": { "op": "equals", "value": "agentic" } },
                    { "port": "conversational", "field": "/message",
                      "condition": { "op": "matches", "pattern": SMALL_TALK_PATTERN } },
                    { "port": "conversational", "field": "",
                      "condition": { "op": "matches", "pattern": SMALL_TALK_PATTERN } }
                ],
                "default": "agentic"
            }),
        )
        .node("reply_context", "fetch_context")
        .node_with(
            "reply",
            "call_model",
            json!({ "role": "assistant", "system": ASSISTANT_PROMPT }),
        )
        .node_with("answer", "merge", json!({ "strategy": "first" }))
        .link("input", "output", "route", "input")
        .link("route", "conversational", "reply_context", "input")
        .link("route", "conversational", "reply", "input")
        .link("reply_context", "context", "reply", "context")
        .link("reply", "content", "answer", "conversational");

    with_agent_loop(builder, "route", "agentic", max_iterations)
        .link("check", "result", "answer", "agentic")
        .build()
}
