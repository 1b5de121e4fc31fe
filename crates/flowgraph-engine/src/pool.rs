//! Variable pool: the per-run store nodes read their inputs from.
//!
//! Values are keyed by scope and output key. Each scope is written by
//! exactly one node invocation and is write-once per key, so the scheduler
//! can own the pool outright and hand out resolved inputs without locking.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use flowgraph_core::error::{FlowError, NodeError, Result};
use flowgraph_core::types::{Outputs, ValueType};

use crate::expr::{navigate, VarRef};
use crate::graph::Graph;

/// Output keys written for a node that failed and routed through its error edge.
pub const ERROR_MESSAGE_KEY: &str = "error_message";
pub const ERROR_TYPE_KEY: &str = "error_type";

/// Namespace a node invocation writes into.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Top-level node of a run.
    Node(String),
    /// Node inside a loop body, for one iteration.
    Iteration { node_id: String, index: usize },
}

impl Scope {
    pub fn node_id(&self) -> &str {
        match self {
            Self::Node(id) => id,
            Self::Iteration { node_id, .. } => node_id,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Node(id) => f.write_str(id),
            Self::Iteration { node_id, index } => write!(f, "{}[{}]", node_id, index),
        }
    }
}

#[derive(Debug, Clone)]
struct IterationFrame {
    index: usize,
    index_value: Value,
    item: Value,
}

/// Scoped variable store for one run, or one loop iteration of a run.
#[derive(Debug, Clone)]
pub struct VariablePool {
    graph: Arc<Graph>,
    run_inputs: Arc<Outputs>,
    values: HashMap<Scope, Outputs>,
    frame: Option<IterationFrame>,
    /// Frozen view of the enclosing pool, for loop iterations.
    parent: Option<Arc<VariablePool>>,
}

impl VariablePool {
    /// A run-level pool. `graph` supplies the output schemas.
    pub fn new(graph: Arc<Graph>, run_inputs: Arc<Outputs>) -> Self {
        Self {
            graph,
            run_inputs,
            values: HashMap::new(),
            frame: None,
            parent: None,
        }
    }

    /// An isolated pool for iteration `index` of a loop whose body is `body`.
    /// Reads of nodes outside the body go to `parent`.
    pub fn for_iteration(parent: Arc<VariablePool>, body: Arc<Graph>, index: usize, item: Value) -> Self {
        Self {
            graph: body,
            run_inputs: parent.run_inputs.clone(),
            values: HashMap::new(),
            frame: Some(IterationFrame {
                index,
                index_value: Value::from(index),
                item,
            }),
            parent: Some(parent),
        }
    }

    pub fn run_inputs(&self) -> &Arc<Outputs> {
        &self.run_inputs
    }

    pub fn iteration(&self) -> Option<usize> {
        self.frame.as_ref().map(|f| f.index)
    }

    /// The scope `node_id` writes into from this pool.
    pub fn scope_for(&self, node_id: &str) -> Scope {
        match &self.frame {
            Some(frame) => Scope::Iteration {
                node_id: node_id.to_string(),
                index: frame.index,
            },
            None => Scope::Node(node_id.to_string()),
        }
    }

    /// Write a single output value.
    pub fn write(&mut self, scope: &Scope, key: &str, value: Value) -> Result<()> {
        self.check_write(scope, key, &value)?;
        self.values
            .entry(scope.clone())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    /// Write a node's full output set. Either every key is stored or none is.
    pub fn commit(&mut self, scope: &Scope, outputs: Outputs) -> Result<()> {
        for (key, value) in &outputs {
            self.check_write(scope, key, value)?;
        }
        self.values.entry(scope.clone()).or_default().extend(outputs);
        Ok(())
    }

    /// Record a routed failure so error-edge targets can read it.
    pub fn commit_error(&mut self, scope: &Scope, error: &NodeError) {
        let outputs = self.values.entry(scope.clone()).or_default();
        outputs.insert(ERROR_MESSAGE_KEY.into(), Value::String(error.message.clone()));
        outputs.insert(ERROR_TYPE_KEY.into(), Value::String(error.kind.to_string()));
    }

    fn check_write(&self, scope: &Scope, key: &str, value: &Value) -> Result<()> {
        let node_id = scope.node_id();
        let undeclared = || FlowError::UndeclaredOutput {
            node_id: node_id.to_string(),
            key: key.to_string(),
        };
        let node = self.graph.node_by_id(node_id).ok_or_else(undeclared)?;
        if !node.outputs.is_empty() {
            let expected = node.outputs.get(key).ok_or_else(undeclared)?;
            if !expected.accepts(value) {
                return Err(FlowError::TypeMismatch {
                    node_id: node_id.to_string(),
                    key: key.to_string(),
                    expected: *expected,
                    actual: ValueType::of(value),
                });
            }
        }
        if self.values.get(scope).is_some_and(|o| o.contains_key(key)) {
            return Err(FlowError::DuplicateWrite {
                node_id: scope.to_string(),
                key: key.to_string(),
            });
        }
        Ok(())
    }

    /// Resolve a dotted reference, failing if the producer has not completed.
    pub fn read(&self, reference: &str) -> Result<&Value> {
        let r = VarRef::parse(reference).map_err(FlowError::UnresolvedReference)?;
        self.lookup(&r)
            .ok_or_else(|| FlowError::UnresolvedReference(reference.to_string()))
    }

    /// Resolve a reference, `None` if it cannot be resolved yet (or ever).
    pub fn lookup(&self, r: &VarRef) -> Option<&Value> {
        let key = r.key()?;
        let base = match r.root() {
            "inputs" => self.run_inputs.get(key),
            "iteration" => {
                let frame = self.frame.as_ref()?;
                match key {
                    "index" => Some(&frame.index_value),
                    "item" => Some(&frame.item),
                    _ => None,
                }
            }
            root if self.graph.contains(root) => self
                .values
                .get(&self.scope_for(root))
                .and_then(|outputs| outputs.get(key)),
            _ => return self.parent.as_deref()?.lookup(r),
        };
        navigate(base?, r.path())
    }

    /// Whether `node_id` has committed outputs in this pool's scope.
    pub fn is_complete(&self, node_id: &str) -> bool {
        self.values.contains_key(&self.scope_for(node_id))
    }

    /// Committed outputs of a node of this pool's graph.
    pub fn outputs_of(&self, node_id: &str) -> Option<&Outputs> {
        self.values.get(&self.scope_for(node_id))
    }
}
