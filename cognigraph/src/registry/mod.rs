//! Node executor registry
//!
//! Maps a node type tag to a statically-typed executor. The scheduler only
//! ever calls through [`NodeExecutor`]; adding a node type is a registration
//! call, never a special case in the engine.
//!
//! The registry is process-wide and read-mostly. Every mutation builds a new
//! map and swaps it in whole, so a concurrent reader sees either the old or the
//! new set of executors and never a half-registered type.

pub mod builtins;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use serde_json::Value;

use crate::engine::context::NodeContext;
use crate::error::{NodeExecutionError, RegistryError};
use crate::graph::NodeConfig;

/// Port name to value, for both inputs and outputs
pub type PortValues = BTreeMap<String, Value>;

/// A declared input port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputPort {
    pub name: String,
    pub required: bool,
}

/// Port contract of a node type, possibly depending on its config
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortSpec {
    pub inputs: Vec<InputPort>,
    /// Ordered; the first port is the node's primary output
    pub outputs: Vec<String>,
    /// Accept links into any input port name (merge-like nodes)
    pub open_inputs: bool,
}

impl PortSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn required(mut self, name: impl Into<String>) -> Self {
        self.inputs.push(InputPort {
            name: name.into(),
            required: true,
        });
        self
    }

    pub fn optional(mut self, name: impl Into<String>) -> Self {
        self.inputs.push(InputPort {
            name: name.into(),
            required: false,
        });
        self
    }

    pub fn output(mut self, name: impl Into<String>) -> Self {
        self.outputs.push(name.into());
        self
    }

    pub fn open(mut self) -> Self {
        self.open_inputs = true;
        self
    }

    pub fn input(&self, name: &str) -> Option<&InputPort> {
        self.inputs.iter().find(|p| p.name == name)
    }

    pub fn accepts_input(&self, name: &str) -> bool {
        self.open_inputs || self.input(name).is_some()
    }

    pub fn has_output(&self, name: &str) -> bool {
        self.outputs.iter().any(|p| p == name)
    }

    pub fn required_inputs(&self) -> impl Iterator<Item = &str> {
        self.inputs
            .iter()
            .filter(|p| p.required)
            .map(|p| p.name.as_str())
    }
}

/// The executor contract every node type implements.
///
/// `execute` borrows the [`NodeContext`] only for the duration of the call;
/// the borrow checker guarantees nothing from one request survives into the
/// next.
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    /// Port contract for a node with this config
    fn ports(&self, config: &NodeConfig) -> PortSpec;

    /// Reject configs the executor can never run with
    fn check_config(&self, _config: &NodeConfig) -> Result<(), String> {
        Ok(())
    }

    async fn execute(
        &self,
        inputs: PortValues,
        config: &NodeConfig,
        ctx: &NodeContext,
    ) -> Result<PortValues, NodeExecutionError>;
}

/// Immutable set of executors at one point in time
#[derive(Default, Clone)]
pub struct RegistrySnapshot {
    executors: HashMap<String, Arc<dyn NodeExecutor>>,
    generation: u64,
}

impl RegistrySnapshot {
    pub fn resolve(&self, type_tag: &str) -> Result<Arc<dyn NodeExecutor>, RegistryError> {
        self.executors
            .get(type_tag)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(type_tag.to_string()))
    }

    /// Bumped on every mutation of the registry
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn type_tags(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = self.executors.keys().map(String::as_str).collect();
        tags.sort_unstable();
        tags
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}

impl fmt::Debug for RegistrySnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistrySnapshot")
            .field("types", &self.type_tags())
            .field("generation", &self.generation)
            .finish()
    }
}

/// Process-wide registry of node executors
pub struct NodeExecutorRegistry {
    current: ArcSwap<RegistrySnapshot>,
}

impl Default for NodeExecutorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeExecutorRegistry {
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(RegistrySnapshot::default()),
        }
    }

    /// Register (or replace) the executor for a type tag
    pub fn register(&self, type_tag: impl Into<String>, executor: Arc<dyn NodeExecutor>) {
        let type_tag = type_tag.into();
        self.current.rcu(|current| {
            let mut next = RegistrySnapshot::clone(current);
            next.executors.insert(type_tag.clone(), executor.clone());
            next.generation = current.generation + 1;
            next
        });
    }

    /// Remove a type tag; returns whether it was registered
    pub fn unregister(&self, type_tag: &str) -> bool {
        let mut removed = false;
        self.current.rcu(|current| {
            let mut next = RegistrySnapshot::clone(current);
            removed = next.executors.remove(type_tag).is_some();
            next.generation = current.generation + 1;
            next
        });
        removed
    }

    /// Hot-reload: swap in a complete new set of executors at once
    pub fn replace_all(&self, executors: HashMap<String, Arc<dyn NodeExecutor>>) {
        self.current.rcu(|current| RegistrySnapshot {
            executors: executors.clone(),
            generation: current.generation + 1,
        });
    }

    pub fn resolve(&self, type_tag: &str) -> Result<Arc<dyn NodeExecutor>, RegistryError> {
        self.current.load().resolve(type_tag)
    }

    pub fn contains(&self, type_tag: &str) -> bool {
        self.current.load().executors.contains_key(type_tag)
    }

    /// Consistent view for a whole validation pass
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.current.load_full()
    }

    pub fn generation(&self) -> u64 {
        self.current.load().generation
    }
}

impl fmt::Debug for NodeExecutorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("NodeExecutorRegistry")
            .field(&*self.current.load())
            .finish()
    }
}

/// Read a required input
pub fn require<'a>(inputs: &'a PortValues, port: &str) -> Result<&'a Value, NodeExecutionError> {
    inputs
        .get(port)
        .ok_or_else(|| NodeExecutionError::missing_input(port))
}

/// Render a port value as text: strings verbatim, everything else as JSON
pub fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Single-entry output map
pub fn single_output(port: &str, value: Value) -> PortValues {
    let mut out = PortValues::new();
    out.insert(port.to_string(), value);
    out
}
