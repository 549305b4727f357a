//! Declarative graph documents
//!
//! This is the persisted form of a graph, loaded from JSON or YAML:
//!
//! ```json
//! {
//!   "id": "chat", "name": "Chat", "cognitiveMode": "dual",
//!   "nodes": [{ "id": "ctx", "type": "fetch_context", "config": {} }],
//!   "links": [{ "from": { "nodeId": "ctx", "port": "context" },
//!               "to":   { "nodeId": "llm", "port": "context" } }],
//!   "loopGroups": [{ "id": "loop", "nodeIds": ["llm", "check"], "maxIterations": 3,
//!                    "continueCondition": { "nodeId": "check", "port": "continue" } }]
//! }
//! ```

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::GraphLoadError;

/// Opaque per-node configuration
pub type NodeConfig = Map<String, Value>;

/// Reference to a port on a node
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortRef {
    pub node_id: String,
    pub port: String,
}

impl PortRef {
    pub fn new(node_id: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            port: port.into(),
        }
    }
}

impl fmt::Display for PortRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.node_id, self.port)
    }
}

/// A node as written in a document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeDocument {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub config: NodeConfig,
    /// Overrides the executor's declared input ports
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<Vec<String>>,
    /// Overrides the executor's declared output ports
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Vec<String>>,
    /// Per-node timeout; falls back to the engine's node timeout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// A directed link between two ports
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LinkDocument {
    pub from: PortRef,
    pub to: PortRef,
}

impl fmt::Display for LinkDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.from, self.to)
    }
}

/// A bounded, re-enterable set of nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopGroupDocument {
    pub id: String,
    pub node_ids: Vec<String>,
    pub max_iterations: u32,
    pub continue_condition: PortRef,
}

/// Top-level graph document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphDocument {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Routing hint, e.g. "conversational" or "agentic"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cognitive_mode: Option<String>,
    pub nodes: Vec<NodeDocument>,
    #[serde(default)]
    pub links: Vec<LinkDocument>,
    #[serde(default)]
    pub loop_groups: Vec<LoopGroupDocument>,
    /// Expected terminal node, required when several nodes qualify
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal: Option<String>,
    /// Terminal port carrying the final output; defaults to its first output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal_port: Option<String>,
}

impl GraphDocument {
    pub fn from_json(text: &str) -> Result<Self, GraphLoadError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_yaml(text: &str) -> Result<Self, GraphLoadError> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Load a document, choosing the format from the file extension
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, GraphLoadError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| GraphLoadError::Io {
            path: path.display().to_string(),
            source,
        })?;

        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml(&text),
            _ => Self::from_json(&text),
        }
    }

    pub fn to_json_pretty(&self) -> Result<String, GraphLoadError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Name the expected terminal node
    pub fn with_terminal(mut self, node_id: impl Into<String>) -> Self {
        self.terminal = Some(node_id.into());
        self
    }

    /// SHA-256 over a canonical encoding with object keys sorted, so two
    /// documents that differ only in key order hash identically.
    pub fn content_hash(&self) -> String {
        let value = serde_json::to_value(self).unwrap_or(Value::Null);
        let mut canonical = String::new();
        write_canonical(&value, &mut canonical);
        hex::encode(Sha256::digest(canonical.as_bytes()))
    }

    pub fn node(&self, id: &str) -> Option<&NodeDocument> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"{
        "id": "g1",
        "name": "Example",
        "cognitiveMode": "agentic",
        "nodes": [
            {"id": "ctx", "type": "fetch_context", "config": {}},
            {"id": "llm", "type": "call_model", "config": {"role": "assistant"}, "timeoutMs": 500}
        ],
        "links": [
            {"from": {"nodeId": "ctx", "port": "context"}, "to": {"nodeId": "llm", "port": "context"}}
        ],
        "loopGroups": []
    }"#;

    #[test]
    fn test_parse_json_document() {
        let doc = GraphDocument::from_json(DOC).unwrap();
        assert_eq!(doc.id, "g1");
        assert_eq!(doc.cognitive_mode.as_deref(), Some("agentic"));
        assert_eq!(doc.nodes.len(), 2);
        assert_eq!(doc.nodes[1].node_type, "call_model");
        assert_eq!(doc.nodes[1].timeout_ms, Some(500));
        assert_eq!(doc.links[0].to, PortRef::new("llm", "context"));
        assert_eq!(doc.links[0].to_string(), "ctx.context -> llm.context");
    }

    #[test]
    fn test_parse_yaml_document() {
        let yaml = r#"
id: g2
nodes:
  - id: a
    type: passthrough
loopGroups:
  - id: l
    nodeIds: [a]
    maxIterations: 2
    continueCondition: { nodeId: a, port: output }
"#;
        let doc = GraphDocument::from_yaml(yaml).unwrap();
        assert_eq!(doc.id, "g2");
        assert!(doc.links.is_empty());
        assert_eq!(doc.loop_groups[0].max_iterations, 2);
        assert!(doc.nodes[0].config.is_empty());
    }

    #[test]
    fn test_content_hash_ignores_config_key_order() {
        let a = GraphDocument::from_json(
            r#"{"id":"g","nodes":[{"id":"n","type":"t","config":{"x":1,"y":2}}]}"#,
        )
        .unwrap();
        let b = GraphDocument::from_json(
            r#"{"id":"g","nodes":[{"id":"n","type":"t","config":{"y":2,"x":1}}]}"#,
        )
        .unwrap();
        assert_eq!(a.content_hash(), b.content_hash());

        let c = a.clone().with_terminal("n");
        assert_ne!(a.content_hash(), c.content_hash());
    }

    #[test]
    fn test_from_path_reads_yaml_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.yaml");
        std::fs::write(&path, "id: g\nnodes:\n  - id: n\n    type: passthrough\n").unwrap();
        let doc = GraphDocument::from_path(&path).unwrap();
        assert_eq!(doc.nodes[0].id, "n");

        let missing = GraphDocument::from_path(dir.path().join("nope.json"));
        assert!(matches!(missing, Err(GraphLoadError::Io { .. })));
    }
}
