//! Execution plan: the graph's skeleton with every loop group collapsed
//!
//! Plain nodes and whole loop groups become scheduling units. Units are
//! ordered topologically; ties are broken by document order so the plan is
//! identical every time the same document is validated.

use std::collections::BTreeSet;

use super::model::{Link, LoopGroup};
use crate::error::ValidationError;

/// A scheduling unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanUnit {
    /// A node outside any loop group
    Node(usize),
    /// A loop group, by index
    Loop(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
    /// Units in topological order
    pub units: Vec<PlanUnit>,
    /// Unit (position in `units`) of every node
    pub unit_of_node: Vec<usize>,
    /// Predecessor units of every unit
    pub unit_preds: Vec<Vec<usize>>,
    /// Nodes whose failure prevents a terminal result
    pub terminal_path: Vec<bool>,
}

impl ExecutionPlan {
    pub(crate) fn build(
        node_count: usize,
        links: &[Link],
        loop_groups: &[LoopGroup],
        node_group: &[Option<usize>],
        terminal: usize,
    ) -> Result<Self, Vec<ValidationError>> {
        // Provisional unit ids: loop groups first, then loose nodes
        let mut provisional = vec![0usize; node_count];
        let mut kinds: Vec<PlanUnit> = loop_groups
            .iter()
            .enumerate()
            .map(|(g, _)| PlanUnit::Loop(g))
            .collect();
        for node in 0..node_count {
            match node_group[node] {
                Some(g) => provisional[node] = g,
                None => {
                    provisional[node] = kinds.len();
                    kinds.push(PlanUnit::Node(node));
                }
            }
        }

        // Sort key: lowest node index in the unit (document order)
        let mut first_node = vec![usize::MAX; kinds.len()];
        for node in 0..node_count {
            let u = provisional[node];
            first_node[u] = first_node[u].min(node);
        }

        let mut succs: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); kinds.len()];
        let mut preds: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); kinds.len()];
        for link in links.iter().filter(|l| !l.feedback) {
            let (a, b) = (provisional[link.from], provisional[link.to]);
            if a != b {
                succs[a].insert(b);
                preds[b].insert(a);
            }
        }

        // Kahn's algorithm
        let mut remaining: Vec<usize> = preds.iter().map(BTreeSet::len).collect();
        let mut ready: BTreeSet<(usize, usize)> = (0..kinds.len())
            .filter(|&u| remaining[u] == 0)
            .map(|u| (first_node[u], u))
            .collect();
        let mut order = Vec::with_capacity(kinds.len());
        while let Some(&(key, u)) = ready.iter().next() {
            ready.remove(&(key, u));
            order.push(u);
            for &s in &succs[u] {
                remaining[s] -= 1;
                if remaining[s] == 0 {
                    ready.insert((first_node[s], s));
                }
            }
        }

        if order.len() < kinds.len() {
            // Every real cycle sits inside one group, so what is left over is a
            // group whose outputs flow back into it from outside
            let errors = (0..kinds.len())
                .filter(|&u| remaining[u] > 0)
                .filter_map(|u| match kinds[u] {
                    PlanUnit::Loop(g) => Some(ValidationError::LoopGroupReentered {
                        group_id: loop_groups[g].id.clone(),
                    }),
                    PlanUnit::Node(_) => None,
                })
                .collect();
            return Err(errors);
        }

        let mut position = vec![0usize; kinds.len()];
        for (pos, &u) in order.iter().enumerate() {
            position[u] = pos;
        }

        let units: Vec<PlanUnit> = order.iter().map(|&u| kinds[u]).collect();
        let unit_of_node: Vec<usize> = provisional.iter().map(|&u| position[u]).collect();
        let unit_preds: Vec<Vec<usize>> = order
            .iter()
            .map(|&u| {
                let mut p: Vec<usize> = preds[u].iter().map(|&q| position[q]).collect();
                p.sort_unstable();
                p
            })
            .collect();

        let terminal_path = terminal_ancestors(node_count, links, loop_groups, node_group, terminal);

        Ok(Self {
            units,
            unit_of_node,
            unit_preds,
            terminal_path,
        })
    }

    pub fn is_on_terminal_path(&self, node: usize) -> bool {
        self.terminal_path.get(node).copied().unwrap_or(false)
    }

    pub fn unit_count(&self) -> usize {
        self.units.len()
    }
}

/// Ancestors of the terminal. A loop group touching the path is on it as a whole.
fn terminal_ancestors(
    node_count: usize,
    links: &[Link],
    loop_groups: &[LoopGroup],
    node_group: &[Option<usize>],
    terminal: usize,
) -> Vec<bool> {
    let mut incoming: Vec<Vec<usize>> = vec![Vec::new(); node_count];
    for link in links {
        incoming[link.to].push(link.from);
    }

    let mut on_path = vec![false; node_count];
    let mut stack = vec![terminal];
    while let Some(node) = stack.pop() {
        if on_path[node] {
            continue;
        }
        on_path[node] = true;
        stack.extend(incoming[node].iter().copied());
        if let Some(g) = node_group[node] {
            stack.extend(loop_groups[g].members.iter().copied());
        }
    }
    on_path
}
