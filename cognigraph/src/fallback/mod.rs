//! Graph pipeline with a simpler alternate behind it

pub mod coordinator;
pub mod pipeline;

pub use coordinator::{CoordinatedOutcome, Coordination, CoordinatorState, FallbackCoordinator};
pub use pipeline::{GraphPipeline, LegacyPipeline, Pipeline, PipelineRequest, LEGACY_NODE_ID};
