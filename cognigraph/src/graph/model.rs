//! Validated, indexed graph
//!
//! A [`Graph`] only exists after validation succeeded. Nodes and links are
//! addressed by index; executors were resolved from one registry snapshot, so
//! a later registry swap never changes a graph already handed to the engine.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::document::NodeConfig;
use super::plan::ExecutionPlan;
use crate::registry::{NodeExecutor, PortSpec};

/// A node with its resolved executor and effective port contract
#[derive(Clone)]
pub struct Node {
    pub id: String,
    pub node_type: String,
    pub config: NodeConfig,
    pub ports: PortSpec,
    pub timeout: Option<Duration>,
    /// Index of the loop group this node belongs to
    pub loop_group: Option<usize>,
    /// No incoming links apart from loop feedback; receives the initial input
    pub entry: bool,
    pub(crate) executor: Arc<dyn NodeExecutor>,
}

impl Node {
    pub fn executor(&self) -> &Arc<dyn NodeExecutor> {
        &self.executor
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.node_type == other.node_type
            && self.config == other.config
            && self.ports == other.ports
            && self.timeout == other.timeout
            && self.loop_group == other.loop_group
            && self.entry == other.entry
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("node_type", &self.node_type)
            .field("config", &self.config)
            .field("ports", &self.ports)
            .field("timeout", &self.timeout)
            .field("loop_group", &self.loop_group)
            .field("entry", &self.entry)
            .finish()
    }
}

/// A resolved link between two node ports
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub from: usize,
    pub from_port: String,
    pub to: usize,
    pub to_port: String,
    /// Carries a value from one loop pass into the next
    pub feedback: bool,
}

/// A bounded loop group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopGroup {
    pub id: String,
    /// Members in evaluation order for one pass
    pub members: Vec<usize>,
    pub max_iterations: u32,
    pub continue_node: usize,
    pub continue_port: String,
    pub feedback_links: Vec<usize>,
}

impl LoopGroup {
    pub fn contains(&self, node: usize) -> bool {
        self.members.contains(&node)
    }
}

/// A validated graph, ready to execute
#[derive(Debug, Clone, PartialEq)]
pub struct Graph {
    pub(crate) id: String,
    pub(crate) name: String,
    pub(crate) cognitive_mode: Option<String>,
    pub(crate) nodes: Vec<Node>,
    pub(crate) links: Vec<Link>,
    pub(crate) loop_groups: Vec<LoopGroup>,
    pub(crate) terminal: usize,
    pub(crate) output_port: String,
    pub(crate) incoming: Vec<Vec<usize>>,
    pub(crate) outgoing: Vec<Vec<usize>>,
    pub(crate) index: HashMap<String, usize>,
    pub(crate) plan: ExecutionPlan,
    pub(crate) content_hash: String,
}

impl Graph {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cognitive_mode(&self) -> Option<&str> {
        self.cognitive_mode.as_deref()
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node(&self, idx: usize) -> &Node {
        &self.nodes[idx]
    }

    pub fn node_index(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn node_by_id(&self, id: &str) -> Option<&Node> {
        self.node_index(id).map(|idx| &self.nodes[idx])
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    pub fn link(&self, idx: usize) -> &Link {
        &self.links[idx]
    }

    /// Indices of links into a node
    pub fn incoming(&self, node: usize) -> &[usize] {
        &self.incoming[node]
    }

    /// Indices of links out of a node
    pub fn outgoing(&self, node: usize) -> &[usize] {
        &self.outgoing[node]
    }

    pub fn loop_groups(&self) -> &[LoopGroup] {
        &self.loop_groups
    }

    pub fn loop_group(&self, idx: usize) -> &LoopGroup {
        &self.loop_groups[idx]
    }

    pub fn terminal(&self) -> &Node {
        &self.nodes[self.terminal]
    }

    pub fn terminal_index(&self) -> usize {
        self.terminal
    }

    /// Terminal port carrying the final output
    pub fn output_port(&self) -> &str {
        &self.output_port
    }

    pub fn plan(&self) -> &ExecutionPlan {
        &self.plan
    }

    /// Hash of the document this graph was validated from
    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }
}
