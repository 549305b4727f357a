//! Graph definition and validation
//!
//! Documents ([`GraphDocument`]) are parsed from JSON/YAML or built with
//! [`GraphBuilder`], then validated into an executable [`Graph`].

pub mod builder;
pub mod cache;
pub mod document;
pub mod model;
pub mod plan;
pub mod validate;
pub mod visualization;

pub use builder::GraphBuilder;
pub use cache::{CacheStats, GraphCache};
pub use document::{GraphDocument, LinkDocument, LoopGroupDocument, NodeConfig, NodeDocument, PortRef};
pub use model::{Graph, Link, LoopGroup, Node};
pub use plan::{ExecutionPlan, PlanUnit};
pub use validate::{validate, validate_with_snapshot};
