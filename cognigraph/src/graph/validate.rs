//! Graph validation
//!
//! `validate` is a pure function of the document and one registry snapshot.
//! It collects every defect instead of stopping at the first, and only
//! produces a [`Graph`] when there are none.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use tracing::debug;

use super::document::GraphDocument;
use super::model::{Graph, Link, LoopGroup, Node};
use super::plan::ExecutionPlan;
use crate::error::{PortDirection, ValidationError, ValidationErrors};
use crate::registry::{InputPort, NodeExecutorRegistry, RegistrySnapshot};

/// Validate a document against the currently registered node types
pub fn validate(
    document: &GraphDocument,
    registry: &NodeExecutorRegistry,
) -> Result<Graph, ValidationErrors> {
    validate_with_snapshot(document, &registry.snapshot())
}

/// Validate against an explicit registry snapshot
pub fn validate_with_snapshot(
    document: &GraphDocument,
    registry: &RegistrySnapshot,
) -> Result<Graph, ValidationErrors> {
    let mut errors = Vec::new();

    if document.nodes.is_empty() {
        return Err(ValidationErrors(vec![ValidationError::EmptyGraph {
            graph_id: document.id.clone(),
        }]));
    }

    // Nodes: ids, types, configs, effective ports
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut ids: Vec<String> = Vec::with_capacity(document.nodes.len());
    let mut nodes: Vec<Option<Node>> = Vec::with_capacity(document.nodes.len());
    for doc in &document.nodes {
        if index.contains_key(&doc.id) {
            errors.push(ValidationError::DuplicateNodeId {
                node_id: doc.id.clone(),
            });
            continue;
        }
        index.insert(doc.id.clone(), nodes.len());
        ids.push(doc.id.clone());

        let executor = match registry.resolve(&doc.node_type) {
            Ok(executor) => executor,
            Err(_) => {
                errors.push(ValidationError::UnknownNodeType {
                    node_id: doc.id.clone(),
                    node_type: doc.node_type.clone(),
                });
                nodes.push(None);
                continue;
            }
        };

        if let Err(message) = executor.check_config(&doc.config) {
            errors.push(ValidationError::InvalidConfig {
                node_id: doc.id.clone(),
                message,
            });
        }

        let mut ports = executor.ports(&doc.config);
        if let Some(inputs) = &doc.inputs {
            for name in inputs {
                if ports.input(name).is_none() {
                    ports.inputs.push(InputPort {
                        name: name.clone(),
                        required: false,
                    });
                }
            }
        }
        if let Some(outputs) = &doc.outputs {
            ports.outputs = outputs.clone();
        }

        nodes.push(Some(Node {
            id: doc.id.clone(),
            node_type: doc.node_type.clone(),
            config: doc.config.clone(),
            ports,
            timeout: doc.timeout_ms.map(Duration::from_millis),
            loop_group: None,
            entry: false,
            executor,
        }));
    }
    let node_count = nodes.len();

    // Links: endpoints and ports
    let mut links: Vec<Link> = Vec::new();
    for doc in &document.links {
        let label = doc.to_string();
        let from = index.get(&doc.from.node_id).copied();
        let to = index.get(&doc.to.node_id).copied();
        for (endpoint, port_ref) in [(from, &doc.from), (to, &doc.to)] {
            if endpoint.is_none() {
                errors.push(ValidationError::DanglingLink {
                    link: label.clone(),
                    node_id: port_ref.node_id.clone(),
                });
            }
        }
        let (Some(from), Some(to)) = (from, to) else {
            continue;
        };

        let mut ports_ok = true;
        if let Some(node) = &nodes[from] {
            if !node.ports.has_output(&doc.from.port) {
                ports_ok = false;
                errors.push(ValidationError::UnknownPort {
                    link: label.clone(),
                    node_id: node.id.clone(),
                    port: doc.from.port.clone(),
                    direction: PortDirection::Output,
                });
            }
        }
        if let Some(node) = &nodes[to] {
            if !node.ports.accepts_input(&doc.to.port) {
                ports_ok = false;
                errors.push(ValidationError::UnknownPort {
                    link: label.clone(),
                    node_id: node.id.clone(),
                    port: doc.to.port.clone(),
                    direction: PortDirection::Input,
                });
            }
        }
        if ports_ok {
            links.push(Link {
                from,
                from_port: doc.from.port.clone(),
                to,
                to_port: doc.to.port.clone(),
                feedback: false,
            });
        }
    }

    // One link per input port
    let mut fan_in: BTreeMap<(usize, &str), usize> = BTreeMap::new();
    for link in &links {
        *fan_in.entry((link.to, link.to_port.as_str())).or_default() += 1;
    }
    for ((node, port), count) in &fan_in {
        if *count > 1 {
            errors.push(ValidationError::PortFanIn {
                node_id: ids[*node].clone(),
                port: port.to_string(),
                count: *count,
            });
        }
    }

    let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); node_count];
    for link in &links {
        adjacency[link.from].push(link.to);
    }

    // Loop groups: membership and bounds
    let mut node_group: Vec<Option<usize>> = vec![None; node_count];
    let mut memberships: BTreeMap<usize, Vec<String>> = BTreeMap::new();
    let mut groups: Vec<LoopGroup> = Vec::new();
    let mut group_ids: BTreeSet<&str> = BTreeSet::new();
    for doc in &document.loop_groups {
        if !group_ids.insert(doc.id.as_str()) {
            errors.push(ValidationError::DuplicateLoopGroup {
                group_id: doc.id.clone(),
            });
            continue;
        }
        if doc.max_iterations == 0 {
            errors.push(ValidationError::InvalidLoopBound {
                group_id: doc.id.clone(),
            });
        }

        let mut members = Vec::new();
        for member in &doc.node_ids {
            match index.get(member) {
                Some(&idx) => {
                    if !members.contains(&idx) {
                        members.push(idx);
                        memberships.entry(idx).or_default().push(doc.id.clone());
                    }
                }
                None => errors.push(ValidationError::UnknownLoopMember {
                    group_id: doc.id.clone(),
                    node_id: member.clone(),
                }),
            }
        }

        let condition = &doc.continue_condition;
        let continue_node = index.get(&condition.node_id).copied().filter(|idx| {
            members.contains(idx)
                && nodes[*idx]
                    .as_ref()
                    .map_or(true, |n| n.ports.has_output(&condition.port))
        });
        let Some(continue_node) = continue_node else {
            errors.push(ValidationError::InvalidContinueCondition {
                group_id: doc.id.clone(),
                node_id: condition.node_id.clone(),
                port: condition.port.clone(),
            });
            continue;
        };

        let g = groups.len();
        for &m in &members {
            node_group[m] = Some(g);
        }
        groups.push(LoopGroup {
            id: doc.id.clone(),
            members,
            max_iterations: doc.max_iterations,
            continue_node,
            continue_port: condition.port.clone(),
            feedback_links: Vec::new(),
        });
    }
    for (node, group_names) in &memberships {
        if group_names.len() > 1 {
            errors.push(ValidationError::OverlappingLoopGroups {
                node_id: ids[*node].clone(),
                groups: group_names.clone(),
            });
        }
    }

    // Every cycle must sit inside exactly one declared group
    for component in strongly_connected_components(&adjacency) {
        let is_cycle = component.len() > 1 || adjacency[component[0]].contains(&component[0]);
        if !is_cycle {
            continue;
        }
        let first_group = node_group[component[0]];
        let contained = first_group.is_some()
            && component
                .iter()
                .all(|&n| node_group[n] == first_group && memberships[&n].len() == 1);
        if !contained {
            let mut members = component.clone();
            members.sort_unstable();
            errors.push(ValidationError::UndeclaredCycle {
                node_ids: members.into_iter().map(|n| ids[n].clone()).collect(),
            });
        }
    }

    // Feedback links and per-pass body order
    for (g, group) in groups.iter_mut().enumerate() {
        for l in back_edges(&group.members, &links, &node_group, g) {
            links[l].feedback = true;
            group.feedback_links.push(l);
        }

        match body_order(&group.members, &links) {
            Some(order) => group.members = order,
            None => errors.push(ValidationError::CyclicLoopBody {
                group_id: group.id.clone(),
            }),
        }
    }

    let mut incoming: Vec<Vec<usize>> = vec![Vec::new(); node_count];
    let mut outgoing: Vec<Vec<usize>> = vec![Vec::new(); node_count];
    for (i, link) in links.iter().enumerate() {
        incoming[link.to].push(i);
        outgoing[link.from].push(i);
    }

    // Required inputs
    for (idx, node) in nodes.iter_mut().enumerate() {
        let Some(node) = node else { continue };
        node.loop_group = node_group[idx];
        node.entry = incoming[idx].iter().all(|&l| links[l].feedback);
        if node.entry {
            continue;
        }
        for port in node.ports.required_inputs() {
            let fed = incoming[idx]
                .iter()
                .any(|&l| !links[l].feedback && links[l].to_port == port);
            if !fed {
                errors.push(ValidationError::UnsatisfiedInput {
                    node_id: node.id.clone(),
                    port: port.to_string(),
                });
            }
        }
    }

    // Terminal: a node whose only outgoing links feed back into its loop
    let candidates: Vec<usize> = (0..node_count)
        .filter(|&n| outgoing[n].iter().all(|&l| links[l].feedback))
        .collect();
    let terminal = match &document.terminal {
        Some(expected) => match index.get(expected) {
            Some(&idx) if candidates.contains(&idx) => Some(idx),
            _ => {
                errors.push(ValidationError::InvalidTerminal {
                    node_id: expected.clone(),
                });
                None
            }
        },
        None => match candidates.as_slice() {
            [] => {
                errors.push(ValidationError::NoTerminal);
                None
            }
            [only] => Some(*only),
            many => {
                errors.push(ValidationError::AmbiguousTerminal {
                    candidates: many
                        .iter()
                        .map(|&n| ids[n].clone())
                        .collect(),
                });
                None
            }
        },
    };

    let mut output_port = String::new();
    if let Some(Some(node)) = terminal.map(|t| &nodes[t]) {
        let port = document
            .terminal_port
            .clone()
            .or_else(|| node.ports.outputs.first().cloned());
        match port {
            Some(port) if node.ports.has_output(&port) => output_port = port,
            other => errors.push(ValidationError::UnknownTerminalPort {
                node_id: node.id.clone(),
                port: other.unwrap_or_default(),
            }),
        }
    }

    if !errors.is_empty() {
        debug!(graph_id = %document.id, errors = errors.len(), "Graph rejected");
        return Err(ValidationErrors(errors));
    }

    // No errors means every node resolved and a terminal was chosen
    let nodes: Vec<Node> = nodes.into_iter().flatten().collect();
    let Some(terminal) = terminal else {
        return Err(ValidationErrors(vec![ValidationError::NoTerminal]));
    };

    let plan = ExecutionPlan::build(node_count, &links, &groups, &node_group, terminal)
        .map_err(ValidationErrors)?;

    debug!(
        graph_id = %document.id,
        nodes = nodes.len(),
        links = links.len(),
        loop_groups = groups.len(),
        "Graph validated"
    );

    Ok(Graph {
        id: document.id.clone(),
        name: document.name.clone(),
        cognitive_mode: document.cognitive_mode.clone(),
        nodes,
        links,
        loop_groups: groups,
        terminal,
        output_port,
        incoming,
        outgoing,
        index,
        plan,
        content_hash: document.content_hash(),
    })
}

/// Links that close a cycle inside group `g`.
///
/// Depth-first search over the group's internal links, started from each
/// member in declared order; a link into a node still on the search path is
/// a back edge. The first declared member therefore opens every pass, and
/// removing the back edges always leaves the body acyclic.
fn back_edges(members: &[usize], links: &[Link], node_group: &[Option<usize>], g: usize) -> Vec<usize> {
    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Mark {
        Unseen,
        OnPath,
        Done,
    }

    fn visit(
        v: usize,
        internal: &BTreeMap<usize, Vec<(usize, usize)>>,
        marks: &mut BTreeMap<usize, Mark>,
        back: &mut Vec<usize>,
    ) {
        marks.insert(v, Mark::OnPath);
        for &(l, w) in internal.get(&v).into_iter().flatten() {
            match marks.get(&w).copied().unwrap_or(Mark::Unseen) {
                Mark::Unseen => visit(w, internal, marks, back),
                Mark::OnPath => back.push(l),
                Mark::Done => {}
            }
        }
        marks.insert(v, Mark::Done);
    }

    let mut internal: BTreeMap<usize, Vec<(usize, usize)>> = BTreeMap::new();
    for (l, link) in links.iter().enumerate() {
        if node_group[link.from] == Some(g) && node_group[link.to] == Some(g) {
            internal.entry(link.from).or_default().push((l, link.to));
        }
    }

    let mut marks: BTreeMap<usize, Mark> = BTreeMap::new();
    let mut back = Vec::new();
    for &m in members {
        if !marks.contains_key(&m) {
            visit(m, &internal, &mut marks, &mut back);
        }
    }
    back.sort_unstable();
    back
}

/// Topological order of a group's members over non-feedback links, keeping
/// the declared member order among independent nodes
fn body_order(members: &[usize], links: &[Link]) -> Option<Vec<usize>> {
    let mut remaining: BTreeMap<usize, usize> = members.iter().map(|&m| (m, 0)).collect();
    for link in links.iter().filter(|l| !l.feedback) {
        if remaining.contains_key(&link.from) {
            if let Some(count) = remaining.get_mut(&link.to) {
                *count += 1;
            }
        }
    }

    let mut order = Vec::with_capacity(members.len());
    let mut done: BTreeSet<usize> = BTreeSet::new();
    while order.len() < members.len() {
        let next = members
            .iter()
            .copied()
            .find(|m| !done.contains(m) && remaining[m] == 0)?;
        done.insert(next);
        order.push(next);
        for link in links.iter().filter(|l| !l.feedback && l.from == next) {
            if let Some(count) = remaining.get_mut(&link.to) {
                *count -= 1;
            }
        }
    }
    Some(order)
}

/// Tarjan's strongly connected components
fn strongly_connected_components(adjacency: &[Vec<usize>]) -> Vec<Vec<usize>> {
    struct Tarjan<'a> {
        adjacency: &'a [Vec<usize>],
        index: Vec<Option<usize>>,
        lowlink: Vec<usize>,
        on_stack: Vec<bool>,
        stack: Vec<usize>,
        next_index: usize,
        components: Vec<Vec<usize>>,
    }

    impl Tarjan<'_> {
        fn connect(&mut self, v: usize) {
            self.index[v] = Some(self.next_index);
            self.lowlink[v] = self.next_index;
            self.next_index += 1;
            self.stack.push(v);
            self.on_stack[v] = true;

            for &w in &self.adjacency[v] {
                match self.index[w] {
                    None => {
                        self.connect(w);
                        self.lowlink[v] = self.lowlink[v].min(self.lowlink[w]);
                    }
                    Some(w_index) if self.on_stack[w] => {
                        self.lowlink[v] = self.lowlink[v].min(w_index);
                    }
                    Some(_) => {}
                }
            }

            if Some(self.lowlink[v]) == self.index[v] {
                let mut component = Vec::new();
                while let Some(w) = self.stack.pop() {
                    self.on_stack[w] = false;
                    component.push(w);
                    if w == v {
                        break;
                    }
                }
                self.components.push(component);
            }
        }
    }

    let n = adjacency.len();
    let mut tarjan = Tarjan {
        adjacency,
        index: vec![None; n],
        lowlink: vec![0; n],
        on_stack: vec![false; n],
        stack: Vec::new(),
        next_index: 0,
        components: Vec::new(),
    };
    for v in 0..n {
        if tarjan.index[v].is_none() {
            tarjan.connect(v);
        }
    }
    tarjan.components
}
