//! Fluent builder for graph documents
//!
//! ```rust,ignore
//! let doc = GraphBuilder::new("chat")
//!     .node("ctx", "fetch_context")
//!     .node_with("llm", "call_model", json!({"role": "assistant"}))
//!     .link("ctx", "context", "llm", "context")
//!     .build();
//! ```

use serde_json::Value;

use super::document::{GraphDocument, LinkDocument, LoopGroupDocument, NodeConfig, NodeDocument, PortRef};

/// Builder producing a [`GraphDocument`]; validation happens separately
#[derive(Debug, Clone)]
pub struct GraphBuilder {
    document: GraphDocument,
}

impl GraphBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            document: GraphDocument {
                name: id.clone(),
                id,
                cognitive_mode: None,
                nodes: Vec::new(),
                links: Vec::new(),
                loop_groups: Vec::new(),
                terminal: None,
                terminal_port: None,
            },
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.document.name = name.into();
        self
    }

    pub fn cognitive_mode(mut self, mode: impl Into<String>) -> Self {
        self.document.cognitive_mode = Some(mode.into());
        self
    }

    /// Add a node with an empty config
    pub fn node(self, id: impl Into<String>, node_type: impl Into<String>) -> Self {
        self.node_with(id, node_type, Value::Null)
    }

    /// Add a node; `config` must be a JSON object (anything else means empty)
    pub fn node_with(mut self, id: impl Into<String>, node_type: impl Into<String>, config: Value) -> Self {
        let config = match config {
            Value::Object(map) => map,
            _ => NodeConfig::new(),
        };
        self.document.nodes.push(NodeDocument {
            id: id.into(),
            node_type: node_type.into(),
            config,
            inputs: None,
            outputs: None,
            timeout_ms: None,
        });
        self
    }

    /// Set a timeout on the most recently added node
    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        if let Some(node) = self.document.nodes.last_mut() {
            node.timeout_ms = Some(timeout_ms);
        }
        self
    }

    pub fn link(
        mut self,
        from: impl Into<String>,
        from_port: impl Into<String>,
        to: impl Into<String>,
        to_port: impl Into<String>,
    ) -> Self {
        self.document.links.push(LinkDocument {
            from: PortRef::new(from, from_port),
            to: PortRef::new(to, to_port),
        });
        self
    }

    pub fn loop_group(
        mut self,
        id: impl Into<String>,
        node_ids: &[&str],
        max_iterations: u32,
        condition_node: impl Into<String>,
        condition_port: impl Into<String>,
    ) -> Self {
        self.document.loop_groups.push(LoopGroupDocument {
            id: id.into(),
            node_ids: node_ids.iter().map(|s| s.to_string()).collect(),
            max_iterations,
            continue_condition: PortRef::new(condition_node, condition_port),
        });
        self
    }

    pub fn terminal(mut self, node_id: impl Into<String>) -> Self {
        self.document.terminal = Some(node_id.into());
        self
    }

    pub fn terminal_port(mut self, port: impl Into<String>) -> Self {
        self.document.terminal_port = Some(port.into());
        self
    }

    pub fn build(self) -> GraphDocument {
        self.document
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builder_produces_document() {
        let doc = GraphBuilder::new("g")
            .name("Example")
            .cognitive_mode("agentic")
            .node("a", "passthrough")
            .node_with("b", "call_model", json!({"role": "planner"}))
            .timeout_ms(250)
            .link("a", "output", "b", "input")
            .loop_group("l", &["b"], 2, "b", "content")
            .terminal("b")
            .build();

        assert_eq!(doc.name, "Example");
        assert_eq!(doc.nodes.len(), 2);
        assert_eq!(doc.nodes[1].config["role"], json!("planner"));
        assert_eq!(doc.nodes[1].timeout_ms, Some(250));
        assert_eq!(doc.links[0].from, PortRef::new("a", "output"));
        assert_eq!(doc.loop_groups[0].node_ids, vec!["b".to_string()]);
        assert_eq!(doc.terminal.as_deref(), Some("b"));
    }

    #[test]
    fn test_non_object_config_is_empty() {
        let doc = GraphBuilder::new("g").node_with("a", "passthrough", json!(42)).build();
        assert!(doc.nodes[0].config.is_empty());
    }
}
