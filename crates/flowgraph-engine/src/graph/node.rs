use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use flowgraph_core::config::RetryPolicy;
use flowgraph_core::types::ValueType;

use super::{Graph, GraphDefinition};
use crate::expr::{Expr, VarRef};

/// Type tag reserved for loop nodes, which the scheduler runs itself.
pub const LOOP_NODE_TYPE: &str = "loop";

/// How a node with several incoming edges decides whether to run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinMode {
    /// Run when at least one incoming edge is active.
    #[default]
    Any,
    /// Run only when every incoming edge is active.
    ///
    /// Opt-in exception to the default skip rule: a node with some active
    /// and some skipped incoming edges is SKIPPED rather than run.
    All,
}

/// Where a node input comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InputBinding {
    /// A single reference such as `fetch.body`.
    One(String),
    /// Several references, bound as an array in declaration order.
    Many(Vec<String>),
}

impl From<&str> for InputBinding {
    fn from(reference: &str) -> Self {
        Self::One(reference.to_string())
    }
}

impl From<Vec<&str>> for InputBinding {
    fn from(references: Vec<&str>) -> Self {
        Self::Many(references.into_iter().map(String::from).collect())
    }
}

/// A node as written in a graph definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDefinition {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    /// Handler-specific configuration.
    #[serde(default)]
    pub config: serde_json::Value,
    /// Local input name -> variable reference(s).
    #[serde(default)]
    pub inputs: BTreeMap<String, InputBinding>,
    /// Declared output schema. Empty = any keys accepted.
    #[serde(default)]
    pub outputs: BTreeMap<String, ValueType>,
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
    /// Per-attempt timeout.
    #[serde(default, alias = "timeout")]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub join: JoinMode,
    /// Loop body, for nodes of type `loop`.
    #[serde(default)]
    pub body: Option<Box<GraphDefinition>>,
}

impl NodeDefinition {
    pub fn new(id: impl Into<String>, node_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            config: serde_json::Value::Null,
            inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
            retry_policy: None,
            timeout_ms: None,
            join: JoinMode::Any,
            body: None,
        }
    }

    /// A `loop` node iterating `body` according to `config`.
    pub fn looping(id: impl Into<String>, config: serde_json::Value, body: GraphDefinition) -> Self {
        Self::new(id, LOOP_NODE_TYPE)
            .with_config(config)
            .with_body(body)
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    pub fn with_input(mut self, name: impl Into<String>, binding: impl Into<InputBinding>) -> Self {
        self.inputs.insert(name.into(), binding.into());
        self
    }

    pub fn with_output(mut self, key: impl Into<String>, value_type: ValueType) -> Self {
        self.outputs.insert(key.into(), value_type);
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_join(mut self, join: JoinMode) -> Self {
        self.join = join;
        self
    }

    pub fn with_body(mut self, body: GraphDefinition) -> Self {
        self.body = Some(Box::new(body));
        self
    }
}

/// Loop node configuration, read from the node's `config`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoopConfig {
    /// Reference to an array; one iteration per element.
    #[serde(default)]
    pub items: Option<String>,
    /// Upper bound on iterations.
    #[serde(default)]
    pub max_iterations: Option<usize>,
    /// Stop after the iteration where this evaluates true.
    #[serde(default)]
    pub break_condition: Option<String>,
    /// Reference collected from each iteration. Default: merged sink outputs.
    #[serde(default)]
    pub output: Option<String>,
}

/// Validated loop settings plus the published body.
#[derive(Debug)]
pub struct LoopSpec {
    pub items: Option<VarRef>,
    pub max_iterations: Option<usize>,
    pub break_condition: Option<Expr>,
    pub output: Option<VarRef>,
    pub body: Arc<Graph>,
}

/// A published input binding.
#[derive(Debug, Clone, PartialEq)]
pub enum Binding {
    One(VarRef),
    Many(Vec<VarRef>),
}

impl Binding {
    pub fn references(&self) -> Vec<&VarRef> {
        match self {
            Self::One(r) => vec![r],
            Self::Many(refs) => refs.iter().collect(),
        }
    }
}

/// A node in a published graph.
#[derive(Debug)]
pub struct GraphNode {
    pub id: String,
    pub node_type: String,
    pub config: Arc<serde_json::Value>,
    pub inputs: Vec<(String, Binding)>,
    pub outputs: BTreeMap<String, ValueType>,
    pub retry_policy: Option<RetryPolicy>,
    pub timeout_ms: Option<u64>,
    pub join: JoinMode,
    /// Incoming edge indices, in declaration order.
    pub incoming: Vec<usize>,
    /// Outgoing edge indices, in declaration order.
    pub outgoing: Vec<usize>,
    pub error_edge: Option<usize>,
    pub loop_spec: Option<LoopSpec>,
}

impl GraphNode {
    pub fn is_loop(&self) -> bool {
        self.loop_spec.is_some()
    }

    /// No outgoing edges of any kind.
    pub fn is_sink(&self) -> bool {
        self.outgoing.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_node_builder() {
        let node = NodeDefinition::new("fetch", "http")
            .with_config(json!({"url": "https://example.com"}))
            .with_input("query", "inputs.q")
            .with_output("body", ValueType::String)
            .with_retry(RetryPolicy::immediate(3))
            .with_timeout_ms(5_000);

        assert_eq!(node.id, "fetch");
        assert_eq!(node.node_type, "http");
        assert_eq!(node.inputs["query"], InputBinding::One("inputs.q".into()));
        assert_eq!(node.outputs["body"], ValueType::String);
        assert_eq!(node.retry_policy.unwrap().max_attempts, 3);
        assert_eq!(node.timeout_ms, Some(5_000));
        assert_eq!(node.join, JoinMode::Any);
    }

    #[test]
    fn test_node_definition_from_json() {
        let node: NodeDefinition = serde_json::from_value(json!({
            "id": "merge",
            "type": "join",
            "inputs": {"branches": ["a.out", "b.out"]},
            "join": "all",
            "timeout": 250
        }))
        .unwrap();
        assert_eq!(node.node_type, "join");
        assert_eq!(node.join, JoinMode::All);
        assert_eq!(node.timeout_ms, Some(250));
        assert_eq!(
            node.inputs["branches"],
            InputBinding::Many(vec!["a.out".into(), "b.out".into()])
        );
        assert!(node.retry_policy.is_none());
    }

    #[test]
    fn test_loop_config_rejects_unknown_fields() {
        let ok: LoopConfig =
            serde_json::from_value(json!({"items": "start.list", "output": "double.value"}))
                .unwrap();
        assert_eq!(ok.items.as_deref(), Some("start.list"));
        assert!(serde_json::from_value::<LoopConfig>(json!({"itmes": "x.y"})).is_err());
    }
}
