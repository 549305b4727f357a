//! Mermaid diagram generation for validated graphs
//!
//! # Node Shapes
//!
//! | Node type            | Shape             | Mermaid Syntax   |
//! |----------------------|-------------------|------------------|
//! | call_model           | Rectangle         | `id[label]`      |
//! | execute_capability   | Subroutine        | `id[[label]]`    |
//! | route_by_condition   | Diamond           | `id{label}`      |
//! | fetch_context        | Cylinder          | `id[(label)]`    |
//! | merge                | Reverse Para.     | `id[\label/]`    |
//! | check_completion     | Hexagon           | `id{{label}}`    |
//! | terminal node        | Stadium           | `id([label])`    |
//! | anything else        | Rounded Rectangle | `id(label)`      |
//!
//! Loop groups render as subgraphs; feedback links are dotted.

use std::fmt::Write;

use super::model::Graph;

/// Sanitize a node ID for use as a Mermaid node identifier.
///
/// Mermaid node IDs must be alphanumeric (plus underscores).
pub fn sanitize_id(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

/// Render a node with the shape for its type
pub fn render_node(id: &str, node_type: &str, is_terminal: bool) -> String {
    let safe_id = sanitize_id(id);
    if is_terminal {
        return format!("    {}([{}])", safe_id, id);
    }
    match node_type {
        "call_model" => format!("    {}[{}]", safe_id, id),
        "execute_capability" => format!("    {}[[{}]]", safe_id, id),
        "route_by_condition" => format!("    {}{{{}}}", safe_id, id),
        "fetch_context" => format!("    {}[({})]", safe_id, id),
        "merge" => format!("    {}[\\{}/]", safe_id, id),
        "check_completion" => format!("    {}{{{{{}}}}}", safe_id, id),
        _ => format!("    {}({})", safe_id, id),
    }
}

/// Render a link.
///
/// - Forward links: solid arrow labelled with the ports
/// - Feedback links: dotted arrow `-. "label" .->`
pub fn render_link(from: &str, to: &str, label: &str, feedback: bool) -> String {
    let from_safe = sanitize_id(from);
    let to_safe = sanitize_id(to);
    if feedback {
        format!("    {} -. \"{}\" .-> {}", from_safe, label, to_safe)
    } else {
        format!("    {} -->|{}| {}", from_safe, label, to_safe)
    }
}

impl Graph {
    /// Generate a Mermaid flowchart of this graph
    pub fn to_mermaid(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "graph TD");

        for group in &self.loop_groups {
            let _ = writeln!(
                output,
                "    subgraph {}[\"{} (max {})\"]",
                sanitize_id(&group.id),
                group.id,
                group.max_iterations
            );
            for &member in &group.members {
                let node = &self.nodes[member];
                let _ = writeln!(
                    output,
                    "    {}",
                    render_node(&node.id, &node.node_type, member == self.terminal)
                );
            }
            let _ = writeln!(output, "    end");
        }

        for (idx, node) in self.nodes.iter().enumerate() {
            if node.loop_group.is_none() {
                let _ = writeln!(
                    output,
                    "{}",
                    render_node(&node.id, &node.node_type, idx == self.terminal)
                );
            }
        }

        let _ = writeln!(output);

        for link in &self.links {
            let label = if link.from_port == link.to_port {
                link.from_port.clone()
            } else {
                format!("{}→{}", link.from_port, link.to_port)
            };
            let _ = writeln!(
                output,
                "{}",
                render_link(
                    &self.nodes[link.from].id,
                    &self.nodes[link.to].id,
                    &label,
                    link.feedback
                )
            );
        }

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::validate::validate;
    use crate::testing::test_registry;

    #[test]
    fn test_sanitize_id() {
        assert_eq!(sanitize_id("simple"), "simple");
        assert_eq!(sanitize_id("with-dash"), "with_dash");
        assert_eq!(sanitize_id("with.dot"), "with_dot");
        assert_eq!(sanitize_id("a/b/c"), "a_b_c");
    }

    #[test]
    fn test_render_node_shapes() {
        assert_eq!(render_node("llm", "call_model", false), "    llm[llm]");
        assert_eq!(render_node("route", "route_by_condition", false), "    route{route}");
        assert_eq!(render_node("check", "check_completion", false), "    check{{check}}");
        assert_eq!(render_node("out", "call_model", true), "    out([out])");
        assert_eq!(render_node("p", "passthrough", false), "    p(p)");
    }

    #[test]
    fn test_render_links() {
        assert_eq!(
            render_link("a", "b", "output→input", false),
            "    a -->|output→input| b"
        );
        assert_eq!(
            render_link("check", "llm", "feedback", true),
            "    check -. \"feedback\" .-> llm"
        );
    }

    #[test]
    fn test_graph_mermaid_has_loop_subgraph() {
        let registry = test_registry();
        let graph = validate(&crate::templates::plan_act_observe(3), &registry).unwrap();
        let mermaid = graph.to_mermaid();

        assert!(mermaid.starts_with("graph TD"));
        assert!(mermaid.contains("subgraph agent_loop"));
        assert!(mermaid.contains(".->"));
        assert!(mermaid.contains("-->"));
    }
}
