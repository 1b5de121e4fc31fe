use futures::future::BoxFuture;
use futures::stream::BoxStream;

use crate::error::{NodeResult, Result};
use crate::types::*;

/// What a handler hands back to the executor adapter.
pub enum HandlerOutput {
    /// A single final result.
    Complete {
        outputs: Outputs,
        /// Branch handle selected by the node; routes `branch`-tagged edges.
        branch: Option<String>,
    },
    /// A finite, non-restartable sequence of chunks ending in
    /// [`StreamDelta::Done`].
    Stream(BoxStream<'static, NodeResult<StreamDelta>>),
}

impl HandlerOutput {
    pub fn outputs(outputs: Outputs) -> Self {
        Self::Complete {
            outputs,
            branch: None,
        }
    }

    pub fn branch(outputs: Outputs, branch: impl Into<String>) -> Self {
        Self::Complete {
            outputs,
            branch: Some(branch.into()),
        }
    }
}

impl std::fmt::Debug for HandlerOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Complete { outputs, branch } => f
                .debug_struct("Complete")
                .field("outputs", outputs)
                .field("branch", branch)
                .finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Node handler: the pluggable unit of work behind a node type.
///
/// Implemented by model runtimes, tool engines, retrieval systems and code
/// sandboxes. Handlers never see the variable pool; they receive resolved
/// inputs and report failures as [`crate::error::NodeError`].
pub trait NodeHandler: Send + Sync + 'static {
    /// Type tag used in graph definitions (e.g. "llm", "http").
    fn node_type(&self) -> &str;

    /// Check a node's config at publish time.
    fn validate(&self, config: &serde_json::Value) -> std::result::Result<(), String> {
        let _ = config;
        Ok(())
    }

    /// Run one attempt. `ctx.cancel` is advisory: handlers should stop early
    /// when it fires, but the engine never aborts them.
    fn execute(&self, ctx: NodeContext) -> BoxFuture<'_, NodeResult<HandlerOutput>>;
}

/// Persistence collaborator: append-only sink for run transitions and
/// node execution records.
pub trait RunStore: Send + Sync + 'static {
    /// Append a run state transition.
    fn record_run(&self, state: &RunState) -> BoxFuture<'_, Result<()>>;

    /// Append a node execution record.
    fn record_node(&self, record: &NodeExecutionRecord) -> BoxFuture<'_, Result<()>>;
}
