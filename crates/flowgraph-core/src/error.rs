use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{RunStatus, ValueType};

#[derive(Debug, Error)]
pub enum FlowError {
    // Graph errors
    #[error("Graph validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("Graph not found: {id} v{version}")]
    GraphNotFound { id: String, version: u32 },

    #[error("Graph already published: {id} v{version}")]
    GraphExists { id: String, version: u32 },

    // Variable pool errors
    #[error("Type mismatch for {node_id}.{key}: expected {expected}, got {actual}")]
    TypeMismatch {
        node_id: String,
        key: String,
        expected: ValueType,
        actual: ValueType,
    },

    #[error("Output {node_id}.{key} is not declared in the node's output schema")]
    UndeclaredOutput { node_id: String, key: String },

    #[error("Variable {node_id}.{key} already written in this scope")]
    DuplicateWrite { node_id: String, key: String },

    #[error("Unresolved reference: {0}")]
    UnresolvedReference(String),

    // Run errors
    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Invalid run transition: {from} -> {to}")]
    InvalidTransition { from: RunStatus, to: RunStatus },

    #[error("Run {run_id} is still {status}")]
    RunActive { run_id: String, status: RunStatus },

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, FlowError>;

/// Reasons a graph definition is rejected at publish time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("graph has no nodes")]
    Empty,

    #[error("duplicate node id: {0}")]
    DuplicateNode(String),

    #[error("duplicate edge id: {0}")]
    DuplicateEdge(String),

    #[error("node id '{0}' is reserved")]
    ReservedNodeId(String),

    #[error("entry node '{0}' does not exist")]
    MissingEntry(String),

    #[error("entry node '{0}' has incoming edges")]
    EntryHasIncoming(String),

    #[error("nodes without incoming edges besides the entry: {0:?}")]
    MultipleEntries(Vec<String>),

    #[error("edge '{edge}' references unknown node '{node}'")]
    DanglingEdge { edge: String, node: String },

    #[error("edge '{0}' connects a node to itself")]
    SelfLoop(String),

    #[error("cycle detected through nodes {0:?}")]
    Cycle(Vec<String>),

    #[error("node '{node}' has unknown type '{node_type}'")]
    UnknownNodeType { node: String, node_type: String },

    #[error("node '{node}' has invalid config: {message}")]
    InvalidConfig { node: String, message: String },

    #[error("edge '{edge}' has invalid condition: {message}")]
    InvalidCondition { edge: String, message: String },

    #[error("'{owner}' references '{reference}' which is not produced upstream")]
    ForwardReference { owner: String, reference: String },

    #[error("node '{0}' has more than one error edge")]
    MultipleErrorEdges(String),

    #[error("error edge '{0}' cannot carry a condition or branch")]
    GuardedErrorEdge(String),

    #[error("loop node '{node}' body is invalid: {source}")]
    LoopBody {
        node: String,
        #[source]
        source: Box<ValidationError>,
    },
}

/// Classification of a node execution failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeErrorKind {
    /// The handler reported a failure.
    Handler,
    /// An attempt exceeded the node's timeout.
    Timeout,
    /// The run was cancelled or timed out while the node was in flight.
    Cancelled,
    /// Inputs or config could not be used by the handler.
    InvalidInput,
}

impl std::fmt::Display for NodeErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Handler => "handler",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::InvalidInput => "invalid_input",
        };
        f.write_str(s)
    }
}

/// A failure reported by (or on behalf of) a node handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("{kind}: {message}")]
pub struct NodeError {
    pub kind: NodeErrorKind,
    pub message: String,
}

impl NodeError {
    pub fn handler(message: impl Into<String>) -> Self {
        Self {
            kind: NodeErrorKind::Handler,
            message: message.into(),
        }
    }

    pub fn timeout(timeout_ms: u64) -> Self {
        Self {
            kind: NodeErrorKind::Timeout,
            message: format!("attempt exceeded {}ms", timeout_ms),
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self {
            kind: NodeErrorKind::Cancelled,
            message: message.into(),
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self {
            kind: NodeErrorKind::InvalidInput,
            message: message.into(),
        }
    }

    /// Whether another attempt may succeed. Cancellation is final.
    pub fn is_retryable(&self) -> bool {
        !matches!(self.kind, NodeErrorKind::Cancelled)
    }
}

pub type NodeResult<T> = std::result::Result<T, NodeError>;

/// Why a run ended in FAILED.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// One or more nodes failed without an error edge.
    NodeErrors,
    /// The run exceeded its deadline.
    Timeout,
    /// The scheduler could not continue (e.g. a node task panicked).
    Internal,
}

/// A node failure contributing to a failed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeFailure {
    pub node_id: String,
    pub error: NodeError,
}

/// Terminal aggregate for a FAILED run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFailure {
    pub reason: FailureReason,
    pub message: String,
    #[serde(default)]
    pub errors: Vec<NodeFailure>,
}

impl RunFailure {
    pub fn from_nodes(errors: Vec<NodeFailure>) -> Self {
        let message = errors
            .iter()
            .map(|f| format!("{}: {}", f.node_id, f.error))
            .collect::<Vec<_>>()
            .join("; ");
        Self {
            reason: FailureReason::NodeErrors,
            message,
            errors,
        }
    }

    pub fn timeout(timeout_ms: u64) -> Self {
        Self {
            reason: FailureReason::Timeout,
            message: format!("run exceeded {}ms", timeout_ms),
            errors: vec![],
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            reason: FailureReason::Internal,
            message: message.into(),
            errors: vec![],
        }
    }
}

impl std::fmt::Display for RunFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_failure_aggregates_node_errors() {
        let failure = RunFailure::from_nodes(vec![
            NodeFailure {
                node_id: "fetch".into(),
                error: NodeError::handler("connection reset"),
            },
            NodeFailure {
                node_id: "parse".into(),
                error: NodeError::timeout(500),
            },
        ]);
        assert_eq!(failure.reason, FailureReason::NodeErrors);
        assert_eq!(failure.errors.len(), 2);
        assert!(failure.message.contains("fetch: handler: connection reset"));
        assert!(failure.message.contains("parse: timeout: attempt exceeded 500ms"));
    }

    #[test]
    fn test_cancelled_is_not_retryable() {
        assert!(NodeError::handler("x").is_retryable());
        assert!(NodeError::timeout(10).is_retryable());
        assert!(!NodeError::cancelled("stop").is_retryable());
    }

    #[test]
    fn test_node_error_serde() {
        let err = NodeError::timeout(250);
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "timeout");
        let back: NodeError = serde_json::from_value(json).unwrap();
        assert_eq!(back, err);
    }

    #[test]
    fn test_loop_body_error_display() {
        let err = ValidationError::LoopBody {
            node: "each".into(),
            source: Box::new(ValidationError::Cycle(vec!["a".into(), "b".into()])),
        };
        assert!(err.to_string().contains("loop node 'each' body is invalid"));
    }
}
