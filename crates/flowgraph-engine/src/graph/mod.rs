//! Graph model: definitions, validation and published graphs.
//!
//! A workflow is authored as a [`GraphDefinition`] (plain serde data) and
//! published into an immutable [`Graph`]. Publishing runs every structural
//! check once; the scheduler then walks the published arena by index and
//! never re-validates. Loop nodes hold their body as a nested `Graph`,
//! executed once per iteration without mutating the outer graph.

pub mod catalog;
pub mod edge;
pub mod node;
pub mod validate;

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use flowgraph_core::error::ValidationError;

use crate::adapter::NodeRegistry;

pub use catalog::GraphCatalog;
pub use edge::{EdgeDefinition, EdgeKind, GraphEdge};
pub use node::{
    Binding, GraphNode, InputBinding, JoinMode, LoopConfig, LoopSpec, NodeDefinition,
    LOOP_NODE_TYPE,
};
pub use validate::validate;

/// A graph as authored: serde-friendly, unvalidated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphDefinition {
    /// Empty for loop bodies.
    #[serde(default)]
    pub id: String,
    #[serde(default = "default_version")]
    pub version: u32,
    pub nodes: Vec<NodeDefinition>,
    #[serde(default)]
    pub edges: Vec<EdgeDefinition>,
    pub entry_node_id: String,
}

fn default_version() -> u32 {
    1
}

impl GraphDefinition {
    pub fn new(id: impl Into<String>, version: u32, entry_node_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version,
            nodes: vec![],
            edges: vec![],
            entry_node_id: entry_node_id.into(),
        }
    }

    /// A loop body rooted at `entry_node_id`.
    pub fn body(entry_node_id: impl Into<String>) -> Self {
        Self::new("", 1, entry_node_id)
    }

    pub fn node(mut self, node: NodeDefinition) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn edge(mut self, edge: EdgeDefinition) -> Self {
        self.edges.push(edge);
        self
    }

    /// Add an unconditional edge with a generated id.
    pub fn connect(self, source: &str, target: &str) -> Self {
        let id = format!("{}->{}", source, target);
        self.edge(EdgeDefinition::new(id, source, target))
    }

    /// Parse a definition from JSON.
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

/// A validated, immutable graph. Nodes and edges live in arenas and refer
/// to each other by index.
#[derive(Debug)]
pub struct Graph {
    id: String,
    version: u32,
    nodes: Vec<GraphNode>,
    edges: Vec<GraphEdge>,
    index: HashMap<String, usize>,
    entry: usize,
    order: Vec<usize>,
}

impl Graph {
    /// Validate `definition` against the registered node types and publish it.
    pub fn publish(
        definition: &GraphDefinition,
        registry: &NodeRegistry,
    ) -> Result<Arc<Self>, ValidationError> {
        validate::build(definition, registry, &validate::Visibility::default()).map(Arc::new)
    }

    pub(crate) fn from_parts(
        definition: &GraphDefinition,
        nodes: Vec<GraphNode>,
        edges: Vec<GraphEdge>,
        index: HashMap<String, usize>,
        entry: usize,
        order: Vec<usize>,
    ) -> Self {
        Self {
            id: definition.id.clone(),
            version: definition.version,
            nodes,
            edges,
            index,
            entry,
            order,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn entry(&self) -> usize {
        self.entry
    }

    pub fn node(&self, idx: usize) -> &GraphNode {
        &self.nodes[idx]
    }

    pub fn edge(&self, idx: usize) -> &GraphEdge {
        &self.edges[idx]
    }

    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    pub fn edges(&self) -> &[GraphEdge] {
        &self.edges
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn node_by_id(&self, id: &str) -> Option<&GraphNode> {
        self.index_of(id).map(|i| &self.nodes[i])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Node indices in a topological order (entry first).
    pub fn topo_order(&self) -> &[usize] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_definition_from_json_defaults() {
        let def = GraphDefinition::from_json(
            r#"{
                "id": "wf",
                "nodes": [
                    {"id": "start", "type": "start"},
                    {"id": "end", "type": "end", "inputs": {"x": "start.x"}}
                ],
                "edges": [{"id": "e1", "source": "start", "target": "end"}],
                "entry_node_id": "start"
            }"#,
        )
        .unwrap();
        assert_eq!(def.version, 1);
        assert_eq!(def.nodes.len(), 2);
        assert_eq!(def.nodes[0].config, json!(null));
        assert_eq!(def.edges[0].kind, EdgeKind::Normal);
    }

    #[test]
    fn test_publish_builds_adjacency() {
        let registry = NodeRegistry::with_builtins();
        let def = GraphDefinition::new("wf", 2, "start")
            .node(NodeDefinition::new("start", "start"))
            .node(NodeDefinition::new("a", "passthrough").with_input("v", "inputs.v"))
            .node(NodeDefinition::new("b", "passthrough").with_input("v", "inputs.v"))
            .node(NodeDefinition::new("end", "end").with_input("both", vec!["a.v", "b.v"]))
            .connect("start", "a")
            .connect("start", "b")
            .connect("a", "end")
            .connect("b", "end");

        let graph = Graph::publish(&def, &registry).unwrap();
        assert_eq!(graph.id(), "wf");
        assert_eq!(graph.version(), 2);
        assert_eq!(graph.node(graph.entry()).id, "start");

        let end = graph.node_by_id("end").unwrap();
        assert_eq!(end.incoming.len(), 2);
        assert!(end.is_sink());
        assert_eq!(graph.node_by_id("start").unwrap().outgoing.len(), 2);

        let order: Vec<&str> = graph
            .topo_order()
            .iter()
            .map(|&i| graph.node(i).id.as_str())
            .collect();
        assert_eq!(order.first(), Some(&"start"));
        assert_eq!(order.last(), Some(&"end"));
    }
}
