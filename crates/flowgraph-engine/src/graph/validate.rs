use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use flowgraph_core::error::ValidationError;

use super::edge::{EdgeKind, GraphEdge};
use super::node::{Binding, GraphNode, InputBinding, LoopConfig, LoopSpec, LOOP_NODE_TYPE};
use super::{Graph, GraphDefinition};
use crate::adapter::NodeRegistry;
use crate::expr::{Expr, VarRef};

/// Scope names that cannot be used as node ids.
pub const RESERVED_SCOPES: [&str; 2] = ["inputs", "iteration"];

/// Names a graph may reference besides its own nodes.
#[derive(Debug, Clone, Default)]
pub(crate) struct Visibility {
    /// Validating a loop body: `iteration.*` is readable.
    in_body: bool,
    /// Node ids of the enclosing graphs that are complete before the body runs.
    outer: HashSet<String>,
}

/// Check a definition without publishing it.
pub fn validate(definition: &GraphDefinition, registry: &NodeRegistry) -> Result<(), ValidationError> {
    build(definition, registry, &Visibility::default()).map(|_| ())
}

pub(crate) fn build(
    def: &GraphDefinition,
    registry: &NodeRegistry,
    vis: &Visibility,
) -> Result<Graph, ValidationError> {
    // Ids
    if def.nodes.is_empty() {
        return Err(ValidationError::Empty);
    }
    let mut index = HashMap::with_capacity(def.nodes.len());
    for (i, node) in def.nodes.iter().enumerate() {
        if RESERVED_SCOPES.contains(&node.id.as_str()) {
            return Err(ValidationError::ReservedNodeId(node.id.clone()));
        }
        if index.insert(node.id.clone(), i).is_some() {
            return Err(ValidationError::DuplicateNode(node.id.clone()));
        }
    }
    let mut edge_ids = HashSet::with_capacity(def.edges.len());
    for edge in &def.edges {
        if !edge_ids.insert(edge.id.as_str()) {
            return Err(ValidationError::DuplicateEdge(edge.id.clone()));
        }
    }

    // Endpoints and single entry
    let entry = *index
        .get(&def.entry_node_id)
        .ok_or_else(|| ValidationError::MissingEntry(def.entry_node_id.clone()))?;

    let n = def.nodes.len();
    let mut incoming: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut outgoing: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut endpoints = Vec::with_capacity(def.edges.len());
    for (ei, edge) in def.edges.iter().enumerate() {
        let resolve = |id: &String| {
            index.get(id).copied().ok_or_else(|| ValidationError::DanglingEdge {
                edge: edge.id.clone(),
                node: id.clone(),
            })
        };
        let source = resolve(&edge.source)?;
        let target = resolve(&edge.target)?;
        if source == target {
            return Err(ValidationError::SelfLoop(edge.id.clone()));
        }
        outgoing[source].push(ei);
        incoming[target].push(ei);
        endpoints.push((source, target));
    }

    if !incoming[entry].is_empty() {
        return Err(ValidationError::EntryHasIncoming(def.entry_node_id.clone()));
    }
    let extra_roots: Vec<String> = (0..n)
        .filter(|&i| i != entry && incoming[i].is_empty())
        .map(|i| def.nodes[i].id.clone())
        .collect();
    if !extra_roots.is_empty() {
        return Err(ValidationError::MultipleEntries(extra_roots));
    }

    // Acyclicity (Kahn)
    let mut in_degree: Vec<usize> = incoming.iter().map(Vec::len).collect();
    let mut queue: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(n);
    while let Some(u) = queue.pop_front() {
        order.push(u);
        for &ei in &outgoing[u] {
            let target = endpoints[ei].1;
            in_degree[target] -= 1;
            if in_degree[target] == 0 {
                queue.push_back(target);
            }
        }
    }
    if order.len() < n {
        let stuck = (0..n)
            .filter(|&i| in_degree[i] > 0)
            .map(|i| def.nodes[i].id.clone())
            .collect();
        return Err(ValidationError::Cycle(stuck));
    }

    let mut ancestors: Vec<HashSet<usize>> = vec![HashSet::new(); n];
    for &u in &order {
        for &ei in &incoming[u] {
            let source = endpoints[ei].0;
            let inherited = ancestors[source].clone();
            ancestors[u].extend(inherited);
            ancestors[u].insert(source);
        }
    }

    // Node types and configs
    for node in &def.nodes {
        if node.node_type == LOOP_NODE_TYPE {
            continue;
        }
        let handler = registry
            .get(&node.node_type)
            .ok_or_else(|| ValidationError::UnknownNodeType {
                node: node.id.clone(),
                node_type: node.node_type.clone(),
            })?;
        handler
            .validate(&node.config)
            .map_err(|message| ValidationError::InvalidConfig {
                node: node.id.clone(),
                message,
            })?;
        if node.body.is_some() {
            return Err(ValidationError::InvalidConfig {
                node: node.id.clone(),
                message: "only loop nodes carry a body".into(),
            });
        }
    }

    // References
    let mut bindings = Vec::with_capacity(n);
    for (i, node) in def.nodes.iter().enumerate() {
        let mut bound = Vec::with_capacity(node.inputs.len());
        for (name, binding) in &node.inputs {
            let parse = |s: &str| {
                VarRef::parse(s).map_err(|message| ValidationError::InvalidConfig {
                    node: node.id.clone(),
                    message: format!("input '{}': {}", name, message),
                })
            };
            let binding = match binding {
                InputBinding::One(s) => Binding::One(parse(s)?),
                InputBinding::Many(list) => {
                    Binding::Many(list.iter().map(|s| parse(s)).collect::<Result<_, _>>()?)
                }
            };
            for r in binding.references() {
                check_reference(r, &node.id, |j| ancestors[i].contains(&j), &index, vis)?;
            }
            bound.push((name.clone(), binding));
        }
        bindings.push(bound);
    }

    let mut conditions = Vec::with_capacity(def.edges.len());
    for (ei, edge) in def.edges.iter().enumerate() {
        let Some(source_text) = &edge.condition else {
            conditions.push(None);
            continue;
        };
        let expr = Expr::parse(source_text).map_err(|message| ValidationError::InvalidCondition {
            edge: edge.id.clone(),
            message,
        })?;
        let source = endpoints[ei].0;
        for r in expr.references() {
            check_reference(
                r,
                &edge.id,
                |j| j == source || ancestors[source].contains(&j),
                &index,
                vis,
            )?;
        }
        conditions.push(Some(expr));
    }

    // Error edges
    let mut error_edges = vec![None; n];
    for (i, node) in def.nodes.iter().enumerate() {
        for &ei in &outgoing[i] {
            let edge = &def.edges[ei];
            if edge.kind != EdgeKind::Error {
                continue;
            }
            if edge.condition.is_some() || edge.branch.is_some() {
                return Err(ValidationError::GuardedErrorEdge(edge.id.clone()));
            }
            if error_edges[i].replace(ei).is_some() {
                return Err(ValidationError::MultipleErrorEdges(node.id.clone()));
            }
        }
    }

    // Loops
    let mut loop_specs = Vec::with_capacity(n);
    for (i, node) in def.nodes.iter().enumerate() {
        if node.node_type != LOOP_NODE_TYPE {
            loop_specs.push(None);
            continue;
        }
        let invalid = |message: String| ValidationError::InvalidConfig {
            node: node.id.clone(),
            message,
        };
        let body_def = node
            .body
            .as_deref()
            .ok_or_else(|| invalid("loop node requires a body".into()))?;
        let config: LoopConfig = if node.config.is_null() {
            LoopConfig::default()
        } else {
            serde_json::from_value(node.config.clone()).map_err(|e| invalid(e.to_string()))?
        };
        if config.items.is_none() && config.max_iterations.is_none() {
            return Err(invalid("loop requires `items` or `max_iterations`".into()));
        }

        let items = match &config.items {
            Some(s) => {
                let r = VarRef::parse(s).map_err(&invalid)?;
                check_reference(&r, &node.id, |j| ancestors[i].contains(&j), &index, vis)?;
                Some(r)
            }
            None => None,
        };

        let mut body_vis = Visibility {
            in_body: true,
            outer: vis.outer.clone(),
        };
        body_vis
            .outer
            .extend(ancestors[i].iter().map(|&j| def.nodes[j].id.clone()));
        let body = build(body_def, registry, &body_vis).map_err(|e| ValidationError::LoopBody {
            node: node.id.clone(),
            source: Box::new(e),
        })?;

        let body_only = |r: &VarRef| -> Result<(), ValidationError> {
            let visible = match r.root() {
                "iteration" => matches!(r.key(), Some("index" | "item")),
                root => body.contains(root) && r.key().is_some(),
            };
            if visible {
                Ok(())
            } else {
                Err(ValidationError::ForwardReference {
                    owner: node.id.clone(),
                    reference: r.to_string(),
                })
            }
        };
        let break_condition = match &config.break_condition {
            Some(s) => {
                let expr = Expr::parse(s).map_err(|e| invalid(format!("break_condition: {}", e)))?;
                for r in expr.references() {
                    body_only(r)?;
                }
                Some(expr)
            }
            None => None,
        };
        let output = match &config.output {
            Some(s) => {
                let r = VarRef::parse(s).map_err(|e| invalid(format!("output: {}", e)))?;
                body_only(&r)?;
                Some(r)
            }
            None => None,
        };

        loop_specs.push(Some(LoopSpec {
            items,
            max_iterations: config.max_iterations,
            break_condition,
            output,
            body: Arc::new(body),
        }));
    }

    // Assemble
    let edges = def
        .edges
        .iter()
        .zip(conditions)
        .zip(&endpoints)
        .map(|((edge, condition), &(source, target))| GraphEdge {
            id: edge.id.clone(),
            source,
            target,
            condition,
            branch: edge.branch.clone(),
            kind: edge.kind,
        })
        .collect();

    let nodes = def
        .nodes
        .iter()
        .zip(bindings)
        .zip(loop_specs)
        .zip(incoming.into_iter().zip(outgoing))
        .zip(error_edges)
        .map(|((((node, inputs), loop_spec), (incoming, outgoing)), error_edge)| GraphNode {
            id: node.id.clone(),
            node_type: node.node_type.clone(),
            config: Arc::new(node.config.clone()),
            inputs,
            outputs: node.outputs.clone(),
            retry_policy: node.retry_policy.clone(),
            timeout_ms: node.timeout_ms,
            join: node.join,
            incoming,
            outgoing,
            error_edge,
            loop_spec,
        })
        .collect();

    Ok(Graph::from_parts(def, nodes, edges, index, entry, order))
}

/// A reference is visible to `owner` if it names run inputs, the current
/// iteration (inside a loop body), an allowed node of this graph, or a node
/// of an enclosing graph that completes before the body runs.
fn check_reference(
    r: &VarRef,
    owner: &str,
    allowed: impl Fn(usize) -> bool,
    index: &HashMap<String, usize>,
    vis: &Visibility,
) -> Result<(), ValidationError> {
    let visible = r.key().is_some()
        && match r.root() {
            "inputs" => true,
            "iteration" if vis.in_body => matches!(r.key(), Some("index" | "item")),
            root => match index.get(root) {
                Some(&j) => allowed(j),
                None => vis.outer.contains(root),
            },
        };
    if visible {
        Ok(())
    } else {
        Err(ValidationError::ForwardReference {
            owner: owner.to_string(),
            reference: r.to_string(),
        })
    }
}
