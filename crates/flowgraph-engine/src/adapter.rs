//! Node executor adapter: the single place node handlers are invoked.
//!
//! Each attempt runs on its own task with a child cancellation token, so a
//! panicking handler becomes a [`NodeError`] and a timed-out handler is
//! signalled and left to finish on its own instead of being aborted.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::json;
use tokio::sync::OwnedSemaphorePermit;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use flowgraph_core::config::RetryPolicy;
use flowgraph_core::error::{NodeError, NodeResult};
use flowgraph_core::traits::{HandlerOutput, NodeHandler};
use flowgraph_core::types::{EventType, NodeContext, NodeStatus, Outputs, StreamDelta};

use crate::emitter::scoped_payload;
use crate::graph::{Graph, GraphNode, LOOP_NODE_TYPE};
use crate::pool::VariablePool;
use crate::scheduler::{run_loop, RunEnv};

/// Registry of node handlers, keyed by type tag.
///
/// Populated at startup, then shared read-only behind an `Arc`.
pub struct NodeRegistry {
    handlers: HashMap<String, Arc<dyn NodeHandler>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler under its `node_type()`. Replaces any previous one.
    pub fn register(&mut self, handler: impl NodeHandler) {
        self.register_arc(Arc::new(handler));
    }

    pub fn register_arc(&mut self, handler: Arc<dyn NodeHandler>) {
        let node_type = handler.node_type().to_string();
        if node_type == LOOP_NODE_TYPE {
            warn!("Ignoring handler for reserved node type 'loop'");
            return;
        }
        self.handlers.insert(node_type, handler);
    }

    pub fn get(&self, node_type: &str) -> Option<Arc<dyn NodeHandler>> {
        self.handlers.get(node_type).cloned()
    }

    pub fn contains(&self, node_type: &str) -> bool {
        self.handlers.contains_key(node_type)
    }

    /// Registered type tags, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(|s| s.as_str()).collect();
        types.sort_unstable();
        types
    }

    /// Create a registry with the built-in node types registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(crate::builtin::StartNode);
        registry.register(crate::builtin::EndNode);
        registry.register(crate::builtin::PassthroughNode);
        registry.register(crate::builtin::JoinNode);
        registry.register(crate::builtin::IfElseNode);
        registry
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// One node invocation handed from the scheduler to the adapter.
#[derive(Clone)]
pub(crate) struct NodeJob {
    pub env: RunEnv,
    pub graph: Arc<Graph>,
    pub node: usize,
    pub inputs: Outputs,
    pub run_inputs: Arc<Outputs>,
    /// Enclosing loop node, for body nodes.
    pub parent: Option<String>,
    pub iteration: Option<usize>,
    pub cancel: CancellationToken,
    /// Frozen pool snapshot, for loop nodes.
    pub pool: Option<Arc<VariablePool>>,
}

impl NodeJob {
    pub fn node(&self) -> &GraphNode {
        self.graph.node(self.node)
    }
}

/// Final result of a node once retries are exhausted or it succeeded.
#[derive(Debug)]
pub(crate) struct NodeOutcome {
    pub result: NodeResult<Completion>,
    pub attempts: u32,
}

#[derive(Debug, Clone)]
pub(crate) struct Completion {
    pub outputs: Outputs,
    pub branch: Option<String>,
}

/// Runs node attempts with timeouts and retries.
pub struct NodeExecutor {
    registry: Arc<NodeRegistry>,
    default_retry: RetryPolicy,
    default_timeout_ms: Option<u64>,
}

impl NodeExecutor {
    pub fn new(
        registry: Arc<NodeRegistry>,
        default_retry: RetryPolicy,
        default_timeout_ms: Option<u64>,
    ) -> Self {
        Self {
            registry,
            default_retry,
            default_timeout_ms,
        }
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    /// Run a node to a final outcome, retrying per its policy.
    pub(crate) async fn execute(&self, job: NodeJob) -> NodeOutcome {
        let node = job.node();
        let policy = node.retry_policy.as_ref().unwrap_or(&self.default_retry);
        let max_attempts = policy.max_attempts.max(1);
        let timeout_ms = node.timeout_ms.or(self.default_timeout_ms);
        let run_id = job.env.run.run_id().clone();

        let mut attempt = 1;
        loop {
            if attempt > 1 {
                job.env.run.update_record(&node.id, job.parent.as_deref(), job.iteration, |r| {
                    r.status = NodeStatus::Running;
                    r.attempts = attempt;
                });
            }

            let error = match self.attempt(&job, attempt, timeout_ms).await {
                Ok(completion) => {
                    return NodeOutcome {
                        result: Ok(completion),
                        attempts: attempt,
                    }
                }
                Err(e) => e,
            };

            if attempt >= max_attempts || !error.is_retryable() || job.cancel.is_cancelled() {
                debug!(run_id = %run_id, node_id = %node.id, attempt, error = %error, "Node attempts exhausted");
                return NodeOutcome {
                    result: Err(error),
                    attempts: attempt,
                };
            }

            let backoff = policy.backoff(attempt);
            warn!(
                run_id = %run_id,
                node_id = %node.id,
                attempt,
                max_attempts,
                backoff_ms = backoff.as_millis() as u64,
                error = %error,
                "Retrying node"
            );
            job.env.run.update_record(&node.id, job.parent.as_deref(), job.iteration, |r| {
                r.status = NodeStatus::Retrying;
                r.error = Some(error.clone());
            });
            job.env.run.emitter().node_event(
                &node.id,
                EventType::NodeRetrying,
                scoped_payload(
                    job.parent.as_deref(),
                    job.iteration,
                    json!({
                        "attempt": attempt,
                        "max_attempts": max_attempts,
                        "backoff_ms": backoff.as_millis() as u64,
                        "error": error,
                    }),
                ),
            );

            tokio::select! {
                _ = job.cancel.cancelled() => {
                    return NodeOutcome {
                        result: Err(NodeError::cancelled("run cancelled before retry")),
                        attempts: attempt,
                    };
                }
                _ = tokio::time::sleep(backoff) => {}
            }
            attempt += 1;
        }
    }

    /// One attempt, bounded by `timeout_ms`.
    ///
    /// Handler attempts hold a run permit until they finish or time out.
    /// Loop nodes hold none; their body nodes take permits of their own.
    async fn attempt(&self, job: &NodeJob, attempt: u32, timeout_ms: Option<u64>) -> NodeResult<Completion> {
        let token = job.cancel.child_token();
        let (handle, _permit) = if job.node().is_loop() {
            (tokio::spawn(run_loop(job.clone(), token.clone())), None)
        } else {
            let handler = self.registry.get(&job.node().node_type).ok_or_else(|| {
                NodeError::invalid_input(format!(
                    "no handler registered for type '{}'",
                    job.node().node_type
                ))
            })?;
            let permit = acquire_permit(job).await?;
            let handle = tokio::spawn(invoke_handler(handler, job.clone(), attempt, token.clone()));
            (handle, Some(permit))
        };

        let joined = match timeout_ms {
            Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    // Signal and detach; the handler finishes on its own.
                    token.cancel();
                    return Err(NodeError::timeout(ms));
                }
            },
            None => handle.await,
        };
        joined.unwrap_or_else(|e| Err(join_error(e)))
    }
}

async fn acquire_permit(job: &NodeJob) -> NodeResult<OwnedSemaphorePermit> {
    tokio::select! {
        permit = job.env.permits.clone().acquire_owned() => {
            permit.map_err(|_| NodeError::cancelled("run permits closed"))
        }
        _ = job.cancel.cancelled() => Err(NodeError::cancelled("run cancelled before dispatch")),
    }
}

async fn invoke_handler(
    handler: Arc<dyn NodeHandler>,
    job: NodeJob,
    attempt: u32,
    token: CancellationToken,
) -> NodeResult<Completion> {
    let node = job.node();
    let ctx = NodeContext {
        run_id: job.env.run.run_id().clone(),
        node_id: node.id.clone(),
        node_type: node.node_type.clone(),
        config: node.config.clone(),
        inputs: job.inputs.clone(),
        run_inputs: job.run_inputs.clone(),
        attempt,
        iteration: job.iteration,
        cancel: token.clone(),
    };

    match handler.execute(ctx).await? {
        HandlerOutput::Complete { outputs, branch } => Ok(Completion { outputs, branch }),
        HandlerOutput::Stream(mut stream) => {
            let mut chunks = 0u64;
            while let Some(delta) = stream.next().await {
                match delta? {
                    StreamDelta::Chunk(chunk) => {
                        // A timed-out attempt may keep streaming; drop its chunks.
                        if token.is_cancelled() {
                            continue;
                        }
                        chunks += 1;
                        job.env.run.emitter().node_event(
                            &node.id,
                            EventType::NodeOutputChunk,
                            scoped_payload(
                                job.parent.as_deref(),
                                job.iteration,
                                json!({"attempt": attempt, "index": chunks - 1, "chunk": chunk}),
                            ),
                        );
                    }
                    StreamDelta::Done { outputs, branch } => {
                        debug!(node_id = %node.id, chunks, "Stream complete");
                        return Ok(Completion { outputs, branch });
                    }
                }
            }
            Err(NodeError::handler("stream ended without a terminal result"))
        }
    }
}

fn join_error(e: JoinError) -> NodeError {
    if e.is_panic() {
        let panic = e.into_panic();
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        NodeError::handler(format!("handler panicked: {}", message))
    } else {
        NodeError::cancelled(format!("handler task aborted: {}", e))
    }
}
