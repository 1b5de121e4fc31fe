use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{NodeError, NodeResult, RunFailure};

/// JSON object used for node inputs and outputs.
pub type Outputs = serde_json::Map<String, serde_json::Value>;

/// Unique run identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_str(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle of a run. Only the run controller moves a run between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Paused,
    Succeeded,
    Failed,
    Stopped,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Stopped)
    }

    /// Whether the state machine allows `self -> next`.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Stopped)
                | (Pending, Failed)
                | (Running, Paused)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Stopped)
                | (Paused, Running)
                | (Paused, Succeeded)
                | (Paused, Stopped)
                | (Paused, Failed)
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// State of a single node instance within a run (or loop iteration).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    Retrying,
    Succeeded,
    Failed,
    Skipped,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }
}

/// Declared type of a node output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
    Null,
    Any,
}

impl ValueType {
    /// The narrowest type describing `value`.
    pub fn of(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(_) => Self::Boolean,
            serde_json::Value::Number(n) if n.is_i64() || n.is_u64() => Self::Integer,
            serde_json::Value::Number(_) => Self::Number,
            serde_json::Value::String(_) => Self::String,
            serde_json::Value::Array(_) => Self::Array,
            serde_json::Value::Object(_) => Self::Object,
        }
    }

    /// Whether `value` satisfies this declared type. `null` is accepted for
    /// every type so optional outputs can be written explicitly.
    pub fn accepts(&self, value: &serde_json::Value) -> bool {
        let actual = Self::of(value);
        match self {
            Self::Any => true,
            _ if actual == Self::Null => true,
            Self::Number => matches!(actual, Self::Number | Self::Integer),
            other => *other == actual,
        }
    }
}

impl std::fmt::Display for ValueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Array => "array",
            Self::Null => "null",
            Self::Any => "any",
        };
        f.write_str(s)
    }
}

/// Snapshot of a run's lifecycle state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: RunId,
    pub graph_id: String,
    pub graph_version: u32,
    pub status: RunStatus,
    /// Node ids currently ready or running.
    pub frontier: BTreeSet<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Merged outputs of the run's succeeded sink nodes.
    #[serde(default)]
    pub outputs: Outputs,
    #[serde(default)]
    pub error: Option<RunFailure>,
}

impl RunState {
    pub fn new(run_id: RunId, graph_id: impl Into<String>, graph_version: u32) -> Self {
        Self {
            run_id,
            graph_id: graph_id.into(),
            graph_version,
            status: RunStatus::Pending,
            frontier: BTreeSet::new(),
            started_at: None,
            finished_at: None,
            outputs: Outputs::new(),
            error: None,
        }
    }
}

/// Audit record of one node invocation (one per run, or per loop iteration).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExecutionRecord {
    pub run_id: RunId,
    pub node_id: String,
    /// Enclosing loop node, for nodes inside a loop body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration: Option<usize>,
    pub status: NodeStatus,
    pub inputs: Outputs,
    pub outputs: Outputs,
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<NodeError>,
}

impl NodeExecutionRecord {
    pub fn new(run_id: RunId, node_id: impl Into<String>) -> Self {
        Self {
            run_id,
            node_id: node_id.into(),
            parent: None,
            iteration: None,
            status: NodeStatus::Pending,
            inputs: Outputs::new(),
            outputs: Outputs::new(),
            attempts: 0,
            started_at: None,
            finished_at: None,
            error: None,
        }
    }
}

/// Run state plus every node record produced so far.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub state: RunState,
    pub records: Vec<NodeExecutionRecord>,
}

impl RunSnapshot {
    /// Latest top-level record for `node_id`.
    pub fn record(&self, node_id: &str) -> Option<&NodeExecutionRecord> {
        self.records
            .iter()
            .rev()
            .find(|r| r.node_id == node_id && r.parent.is_none())
    }

    /// Status of a top-level node, `Pending` if it never produced a record.
    pub fn node_status(&self, node_id: &str) -> NodeStatus {
        self.record(node_id)
            .map(|r| r.status)
            .unwrap_or(NodeStatus::Pending)
    }
}

/// Kind of progress event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventType {
    RunStarted,
    NodeStarted,
    NodeOutputChunk,
    NodeRetrying,
    NodeSucceeded,
    NodeFailed,
    NodeSkipped,
    RunPaused,
    RunResumed,
    RunSucceeded,
    RunFailed,
    RunStopped,
}

impl EventType {
    pub fn is_run_terminal(&self) -> bool {
        matches!(self, Self::RunSucceeded | Self::RunFailed | Self::RunStopped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RunStarted => "run-started",
            Self::NodeStarted => "node-started",
            Self::NodeOutputChunk => "node-output-chunk",
            Self::NodeRetrying => "node-retrying",
            Self::NodeSucceeded => "node-succeeded",
            Self::NodeFailed => "node-failed",
            Self::NodeSkipped => "node-skipped",
            Self::RunPaused => "run-paused",
            Self::RunResumed => "run-resumed",
            Self::RunSucceeded => "run-succeeded",
            Self::RunFailed => "run-failed",
            Self::RunStopped => "run-stopped",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A streaming delta from a node handler.
#[derive(Debug, Clone)]
pub enum StreamDelta {
    /// A chunk of partial output, forwarded as a `node-output-chunk` event.
    Chunk(serde_json::Value),

    /// Terminal result; must be the last item of the stream.
    Done {
        outputs: Outputs,
        branch: Option<String>,
    },
}

/// Context passed to node handlers for one attempt.
#[derive(Clone)]
pub struct NodeContext {
    pub run_id: RunId,
    pub node_id: String,
    pub node_type: String,
    pub config: Arc<serde_json::Value>,
    /// Inputs resolved from the variable pool.
    pub inputs: Outputs,
    /// Run-global inputs the run was started with.
    pub run_inputs: Arc<Outputs>,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Loop iteration index, for nodes inside a loop body.
    pub iteration: Option<usize>,
    pub cancel: CancellationToken,
}

impl NodeContext {
    /// Fetch an input by local name.
    pub fn input(&self, name: &str) -> Option<&serde_json::Value> {
        self.inputs.get(name)
    }

    /// Deserialize the node config into a typed struct.
    pub fn config_as<T: serde::de::DeserializeOwned>(&self) -> NodeResult<T> {
        serde_json::from_value((*self.config).clone())
            .map_err(|e| NodeError::invalid_input(format!("invalid config: {}", e)))
    }
}

impl std::fmt::Debug for NodeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeContext")
            .field("run_id", &self.run_id)
            .field("node_id", &self.node_id)
            .field("node_type", &self.node_type)
            .field("attempt", &self.attempt)
            .field("iteration", &self.iteration)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

/// Progress event broadcast to all subscribers.
///
/// Delivery is at-least-once; subscribers deduplicate on
/// `(run_id, node_id, event_type, sequence)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    pub run_id: RunId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    pub event_type: EventType,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    /// Monotonic per run.
    pub sequence: u64,
}

impl RunEvent {
    pub fn dedup_key(&self) -> (RunId, Option<String>, EventType, u64) {
        (
            self.run_id.clone(),
            self.node_id.clone(),
            self.event_type,
            self.sequence,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_run_status_transitions() {
        assert!(RunStatus::Pending.can_transition_to(RunStatus::Running));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Paused));
        assert!(RunStatus::Paused.can_transition_to(RunStatus::Running));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Stopped));
        assert!(!RunStatus::Succeeded.can_transition_to(RunStatus::Running));
        assert!(!RunStatus::Stopped.can_transition_to(RunStatus::Failed));
        assert!(!RunStatus::Pending.can_transition_to(RunStatus::Succeeded));
    }

    #[test]
    fn test_value_type_accepts() {
        assert!(ValueType::Number.accepts(&json!(3)));
        assert!(ValueType::Number.accepts(&json!(3.5)));
        assert!(ValueType::Integer.accepts(&json!(3)));
        assert!(!ValueType::Integer.accepts(&json!(3.5)));
        assert!(!ValueType::String.accepts(&json!(1)));
        assert!(ValueType::String.accepts(&json!(null)));
        assert!(ValueType::Any.accepts(&json!({"a": 1})));
        assert!(ValueType::Array.accepts(&json!([1, 2])));
    }

    #[test]
    fn test_value_type_serde_lowercase() {
        let t: ValueType = serde_json::from_value(json!("boolean")).unwrap();
        assert_eq!(t, ValueType::Boolean);
        assert_eq!(t.to_string(), "boolean");
    }

    #[test]
    fn test_event_type_kebab_case() {
        let json = serde_json::to_value(EventType::NodeOutputChunk).unwrap();
        assert_eq!(json, json!("node-output-chunk"));
        assert_eq!(EventType::RunStopped.as_str(), "run-stopped");
        assert!(EventType::RunFailed.is_run_terminal());
        assert!(!EventType::NodeFailed.is_run_terminal());
    }

    #[test]
    fn test_snapshot_ignores_loop_body_records() {
        let run_id = RunId::new();
        let mut top = NodeExecutionRecord::new(run_id.clone(), "double");
        top.status = NodeStatus::Skipped;
        let mut inner = NodeExecutionRecord::new(run_id.clone(), "double");
        inner.parent = Some("each".into());
        inner.iteration = Some(0);
        inner.status = NodeStatus::Succeeded;

        let snapshot = RunSnapshot {
            state: RunState::new(run_id, "wf", 1),
            records: vec![top, inner],
        };
        assert_eq!(snapshot.node_status("double"), NodeStatus::Skipped);
        assert_eq!(snapshot.node_status("missing"), NodeStatus::Pending);
    }
}
