//! cognigraph: cognitive graph execution engine
//!
//! Declarative node graphs (context fetch, model calls, capability calls,
//! routing, observation) validated once and executed per request.
//! - Graph documents (JSON/YAML or [`GraphBuilder`]) validated into an immutable [`Graph`]
//! - Node executors looked up by type tag in a [`NodeExecutorRegistry`]
//! - A scheduler running independent branches concurrently, with bounded loop groups
//! - Streamed [`StreamEvent`]s plus an append-only [`TraceRecord`] per request
//! - A [`FallbackCoordinator`] answering through a simpler pipeline when a graph fails
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use cognigraph::{templates, Builtins, Engine, RunOptions};
//!
//! let builtins = Builtins::new(context, model, capabilities);
//! let engine = Engine::new(Arc::new(builtins.registry()));
//! let graph = engine.validate(&templates::cognitive_router(5))?;
//!
//! let mut events = engine.run(graph, serde_json::json!({"message": "hi"}), RunOptions::new());
//! while let Some(event) = events.next().await {
//!     println!("{}", serde_json::to_string(&event)?);
//! }
//! ```

pub mod collaborators;
pub mod compat;
pub mod engine;
pub mod error;
pub mod fallback;
pub mod graph;
pub mod registry;
pub mod telemetry;
pub mod templates;

#[cfg(test)]
mod testing;

// Re-exports for convenience
pub use collaborators::{
    AuditEvent, AuditSink, CapabilityInvoker, CapabilityOutcome, ContextProvider, MemoryAuditSink, Message,
    ModelChunk, ModelClient, ModelOptions, ModelReply, ModelStream, NoopAuditSink, PersonaContext, Role,
    StaticContextProvider, TokenUsage,
};
pub use error::{
    CollaboratorError, EngineError, FallbackFailed, GraphLoadError, NodeExecutionError, PipelineError,
    RegistryError, TraceStoreError, ValidationError, ValidationErrors,
};

pub use engine::{Engine, EngineConfig, NodeContext, RetryPolicy, RunOptions};
pub use graph::{Graph, GraphBuilder, GraphCache, GraphDocument};
pub use registry::builtins::Builtins;
pub use registry::{NodeExecutor, NodeExecutorRegistry, PortSpec, PortValues};

pub use telemetry::{
    diff_traces, EventKind, EventStream, FileTraceStore, MemoryTraceStore, NodeResult, NodeStatus, Reporter,
    StreamEvent, TraceAnnotation, TraceDiff, TraceOutcome, TraceRecord, TraceStore,
};

pub use fallback::{
    CoordinatedOutcome, Coordination, FallbackCoordinator, GraphPipeline, LegacyPipeline, Pipeline,
    PipelineRequest,
};

pub use compat::RigModelClient;
