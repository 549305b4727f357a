//! Error types for the cognitive graph engine
//!
//! Validation problems are collected (never short-circuited) so a caller sees
//! every defect of a graph document at once. Runtime errors follow the
//! taxonomy the scheduler and fallback coordinator act on.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Direction of a node port, used in port-related diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortDirection {
    Input,
    Output,
}

impl fmt::Display for PortDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortDirection::Input => write!(f, "input"),
            PortDirection::Output => write!(f, "output"),
        }
    }
}

/// A single defect found while validating a graph document
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("graph '{graph_id}' has no nodes")]
    EmptyGraph { graph_id: String },

    #[error("duplicate node id '{node_id}'")]
    DuplicateNodeId { node_id: String },

    #[error("node '{node_id}' has unregistered type '{node_type}'")]
    UnknownNodeType { node_id: String, node_type: String },

    #[error("node '{node_id}' has invalid config: {message}")]
    InvalidConfig { node_id: String, message: String },

    #[error("link {link} references unknown node '{node_id}'")]
    DanglingLink { link: String, node_id: String },

    #[error("link {link} references unknown {direction} port '{port}' on node '{node_id}'")]
    UnknownPort {
        link: String,
        node_id: String,
        port: String,
        direction: PortDirection,
    },

    #[error("input port '{port}' on node '{node_id}' has {count} incoming links; fan-in requires a merge node")]
    PortFanIn {
        node_id: String,
        port: String,
        count: usize,
    },

    #[error("required input '{port}' on node '{node_id}' is not satisfied by a link or the initial input")]
    UnsatisfiedInput { node_id: String, port: String },

    #[error("cycle through [{}] is not declared as a loop group", .node_ids.join(", "))]
    UndeclaredCycle { node_ids: Vec<String> },

    #[error("duplicate loop group id '{group_id}'")]
    DuplicateLoopGroup { group_id: String },

    #[error("loop group '{group_id}' names unknown node '{node_id}'")]
    UnknownLoopMember { group_id: String, node_id: String },

    #[error("node '{node_id}' belongs to several loop groups [{}]", .groups.join(", "))]
    OverlappingLoopGroups { node_id: String, groups: Vec<String> },

    #[error("loop group '{group_id}' must allow at least one iteration")]
    InvalidLoopBound { group_id: String },

    #[error("loop group '{group_id}' continue condition {node_id}.{port} is not an output of a member node")]
    InvalidContinueCondition {
        group_id: String,
        node_id: String,
        port: String,
    },

    #[error("loop group '{group_id}' is still cyclic after removing its feedback links")]
    CyclicLoopBody { group_id: String },

    #[error("a path leaves loop group '{group_id}' and re-enters it")]
    LoopGroupReentered { group_id: String },

    #[error("graph has no terminal node")]
    NoTerminal,

    #[error("graph has several terminal candidates [{}]; name the expected terminal", .candidates.join(", "))]
    AmbiguousTerminal { candidates: Vec<String> },

    #[error("terminal '{node_id}' is not a node without outgoing links")]
    InvalidTerminal { node_id: String },

    #[error("terminal '{node_id}' has no output port '{port}'")]
    UnknownTerminalPort { node_id: String, port: String },
}

impl ValidationError {
    /// Node the defect is attached to, if any
    pub fn node_id(&self) -> Option<&str> {
        match self {
            ValidationError::DuplicateNodeId { node_id }
            | ValidationError::UnknownNodeType { node_id, .. }
            | ValidationError::InvalidConfig { node_id, .. }
            | ValidationError::DanglingLink { node_id, .. }
            | ValidationError::UnknownPort { node_id, .. }
            | ValidationError::PortFanIn { node_id, .. }
            | ValidationError::UnsatisfiedInput { node_id, .. }
            | ValidationError::UnknownLoopMember { node_id, .. }
            | ValidationError::OverlappingLoopGroups { node_id, .. }
            | ValidationError::InvalidContinueCondition { node_id, .. }
            | ValidationError::InvalidTerminal { node_id }
            | ValidationError::UnknownTerminalPort { node_id, .. } => Some(node_id),
            _ => None,
        }
    }
}

/// Every defect found in one document
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("graph validation failed: {}", .0.iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; "))]
pub struct ValidationErrors(pub Vec<ValidationError>);

impl ValidationErrors {
    pub fn iter(&self) -> impl Iterator<Item = &ValidationError> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// First node id mentioned by any of the errors
    pub fn first_node_id(&self) -> Option<&str> {
        self.0.iter().find_map(|e| e.node_id())
    }
}

impl From<Vec<ValidationError>> for ValidationErrors {
    fn from(errors: Vec<ValidationError>) -> Self {
        Self(errors)
    }
}

/// Typed failure returned by a node executor
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct NodeExecutionError {
    /// Whether the scheduler may retry the node
    pub retryable: bool,
    pub message: String,
}

impl NodeExecutionError {
    /// A transient failure (network, model backend) worth retrying
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            retryable: true,
            message: message.into(),
        }
    }

    /// A failure that will not go away on retry
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            retryable: false,
            message: message.into(),
        }
    }

    pub fn timeout(after: Duration) -> Self {
        Self::retryable(format!("node timed out after {:?}", after))
    }

    pub fn missing_input(port: &str) -> Self {
        Self::fatal(format!("missing input '{}'", port))
    }

    pub fn invalid_config(message: impl fmt::Display) -> Self {
        Self::fatal(format!("invalid config: {}", message))
    }
}

impl From<CollaboratorError> for NodeExecutionError {
    fn from(err: CollaboratorError) -> Self {
        let retryable = err.is_transient();
        Self {
            retryable,
            message: err.to_string(),
        }
    }
}

/// Errors from the node executor registry
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("no executor registered for node type '{0}'")]
    NotFound(String),
}

/// Errors reported by external collaborators (context provider, model, capabilities, audit)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CollaboratorError {
    /// Backend unreachable or temporarily failing
    #[error("{service} unavailable: {message}")]
    Unavailable { service: String, message: String },

    /// Backend answered but refused or failed the request
    #[error("{service} failed: {message}")]
    Failed { service: String, message: String },

    #[error("unknown capability '{0}'")]
    UnknownCapability(String),
}

impl CollaboratorError {
    pub fn unavailable(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Unavailable {
            service: service.into(),
            message: message.into(),
        }
    }

    pub fn failed(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed {
            service: service.into(),
            message: message.into(),
        }
    }

    /// Whether a retry could plausibly succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, CollaboratorError::Unavailable { .. })
    }
}

/// Errors that end a graph run
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    /// A node on the path to the terminal failed after retries
    #[error("node '{node_id}' failed: {error}")]
    NodeFailed {
        node_id: String,
        error: NodeExecutionError,
    },

    /// The terminal node was skipped or failed
    #[error("terminal node '{node_id}' produced no result ({status})")]
    TerminalUnavailable { node_id: String, status: String },

    #[error("terminal node '{node_id}' did not produce port '{port}'")]
    TerminalOutputMissing { node_id: String, port: String },

    /// Request deadline passed
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// Caller abandoned the request
    #[error("request cancelled")]
    Cancelled,

    /// Scheduler could make no progress; indicates an inconsistent plan
    #[error("scheduler stalled: {0}")]
    Stalled(String),

    /// The background task driving the request panicked or was aborted
    #[error("engine task failed: {0}")]
    TaskFailed(String),
}

impl EngineError {
    pub fn node_failed(node_id: impl Into<String>, error: NodeExecutionError) -> Self {
        Self::NodeFailed {
            node_id: node_id.into(),
            error,
        }
    }

    /// Node id responsible for the failure, if a single node is to blame
    pub fn failing_node(&self) -> Option<&str> {
        match self {
            EngineError::NodeFailed { node_id, .. }
            | EngineError::TerminalUnavailable { node_id, .. }
            | EngineError::TerminalOutputMissing { node_id, .. } => Some(node_id),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, EngineError::Timeout(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, EngineError::Cancelled)
    }
}

/// Errors from trace persistence
#[derive(Debug, Error)]
pub enum TraceStoreError {
    /// Trace records are append-only
    #[error("trace for request '{0}' already exists")]
    AlreadyExists(String),

    #[error("trace I/O error: {0}")]
    Io(String),

    #[error("trace serialization error: {0}")]
    Serialization(String),

    #[error("trace compression error: {0}")]
    Compression(String),
}

impl TraceStoreError {
    pub fn io(message: impl fmt::Display) -> Self {
        Self::Io(message.to_string())
    }

    pub fn serialization(message: impl fmt::Display) -> Self {
        Self::Serialization(message.to_string())
    }
}

/// Errors loading a graph document from disk or text
#[derive(Debug, Error)]
pub enum GraphLoadError {
    #[error("failed to read graph document {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON graph document: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid YAML graph document: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Why a pipeline could not produce a result
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Rejected(#[from] ValidationErrors),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),
}

impl PipelineError {
    pub fn failing_node(&self) -> Option<&str> {
        match self {
            PipelineError::Rejected(errors) => errors.first_node_id(),
            PipelineError::Engine(err) => err.failing_node(),
            PipelineError::Collaborator(_) => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, PipelineError::Engine(EngineError::Cancelled))
    }
}

/// Both the primary and the alternate pipeline failed
#[derive(Debug, Clone, PartialEq, Error)]
#[error("fallback failed: primary: {primary}; fallback: {fallback}")]
pub struct FallbackFailed {
    pub primary: PipelineError,
    pub fallback: PipelineError,
}
