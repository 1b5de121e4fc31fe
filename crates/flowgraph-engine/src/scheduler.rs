//! Scheduler: walks a published graph for one run (or one loop iteration).
//!
//! The scheduler owns the variable pool and every piece of readiness state.
//! Node attempts run as tasks in a `JoinSet`; the dispatch loop reacts to
//! their completion, to cancellation, to pause/resume and to the run
//! deadline. It never changes the run status itself: it returns a proposed
//! [`Outcome`] that the run controller finalizes.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use futures::future::BoxFuture;
use serde_json::{json, Value};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use flowgraph_core::error::{NodeError, NodeFailure, NodeResult, RunFailure};
use flowgraph_core::types::{EventType, NodeExecutionRecord, NodeStatus, Outputs, ValueType};

use crate::adapter::{Completion, NodeExecutor, NodeJob, NodeOutcome};
use crate::controller::RunHandle;
use crate::emitter::scoped_payload;
use crate::expr::VarRef;
use crate::graph::{Binding, Graph, GraphNode, JoinMode};
use crate::pool::VariablePool;

/// Shared, per-run execution environment.
#[derive(Clone)]
pub(crate) struct RunEnv {
    pub run: Arc<RunHandle>,
    pub executor: Arc<NodeExecutor>,
    pub max_concurrency: usize,
    /// Handler attempts in flight across the run, loop bodies included.
    pub permits: Arc<Semaphore>,
    /// `true` while the run is paused.
    pub pause: watch::Receiver<bool>,
}

/// What the scheduler proposes once nothing more can run.
#[derive(Debug)]
pub(crate) enum Outcome {
    /// Merged outputs of the succeeded sink nodes.
    Completed(Outputs),
    Failed(RunFailure),
    Stopped,
    TimedOut,
}

pub(crate) struct SchedulerRun {
    pub outcome: Outcome,
    pub pool: VariablePool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EdgeState {
    Pending,
    Active,
    Skipped,
}

pub(crate) struct Scheduler {
    env: RunEnv,
    graph: Arc<Graph>,
    pool: VariablePool,
    cancel: CancellationToken,
    /// Enclosing loop node, when scheduling a loop body.
    parent: Option<String>,
    deadline: Option<Instant>,
    status: Vec<NodeStatus>,
    /// Readiness has been decided (queued or skipped).
    decided: Vec<bool>,
    edges: Vec<EdgeState>,
    ready: VecDeque<usize>,
    tasks: JoinSet<(usize, NodeOutcome)>,
    failures: Vec<NodeFailure>,
    stopped: bool,
    internal: Option<String>,
}

impl Scheduler {
    pub fn new(
        env: RunEnv,
        graph: Arc<Graph>,
        pool: VariablePool,
        cancel: CancellationToken,
        parent: Option<String>,
        deadline: Option<Instant>,
    ) -> Self {
        let nodes = graph.len();
        let edges = graph.edges().len();
        Self {
            env,
            graph,
            pool,
            cancel,
            parent,
            deadline,
            status: vec![NodeStatus::Pending; nodes],
            decided: vec![false; nodes],
            edges: vec![EdgeState::Pending; edges],
            ready: VecDeque::new(),
            tasks: JoinSet::new(),
            failures: Vec::new(),
            stopped: false,
            internal: None,
        }
    }

    /// Drive the graph to an outcome. Boxed so loop bodies can nest.
    pub fn run(self) -> BoxFuture<'static, SchedulerRun> {
        Box::pin(self.run_inner())
    }

    async fn run_inner(mut self) -> SchedulerRun {
        let entry = self.graph.entry();
        self.decided[entry] = true;
        self.ready.push_back(entry);

        let mut timed_out = false;
        loop {
            while !self.stopped && !self.is_paused() && self.tasks.len() < self.env.max_concurrency {
                let Some(idx) = self.ready.pop_front() else {
                    break;
                };
                self.dispatch(idx);
            }
            self.sync_frontier();

            if self.tasks.is_empty() && (self.stopped || self.ready.is_empty()) {
                break;
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled(), if !self.stopped => {
                    debug!(run_id = %self.env.run.run_id(), in_flight = self.tasks.len(), "Scheduler stopping");
                    self.stopped = true;
                }
                _ = deadline_elapsed(self.deadline) => {
                    timed_out = true;
                    break;
                }
                Ok(()) = self.env.pause.changed() => {}
                Some(joined) = self.tasks.join_next() => match joined {
                    Ok((idx, outcome)) => self.complete(idx, outcome),
                    Err(e) => {
                        error!(run_id = %self.env.run.run_id(), error = %e, "Node task failed to join");
                        self.internal = Some(format!("node task failed: {}", e));
                        self.stopped = true;
                    }
                },
            }
        }

        let outcome = if timed_out {
            self.time_out();
            Outcome::TimedOut
        } else {
            self.finish()
        };
        SchedulerRun {
            outcome,
            pool: self.pool,
        }
    }

    fn is_paused(&self) -> bool {
        *self.env.pause.borrow()
    }

    fn dispatch(&mut self, idx: usize) {
        let graph = self.graph.clone();
        let node = graph.node(idx);
        let inputs = self.bind_inputs(node);

        let mut record = self.record(node);
        record.status = NodeStatus::Running;
        record.inputs = inputs.clone();
        record.attempts = 1;
        record.started_at = Some(Utc::now());
        self.env.run.upsert_record(record);
        self.status[idx] = NodeStatus::Running;

        debug!(run_id = %self.env.run.run_id(), node_id = %node.id, node_type = %node.node_type, "Dispatching node");
        self.emit(node, EventType::NodeStarted, json!({"node_type": node.node_type}));

        let job = NodeJob {
            env: self.env.clone(),
            graph: graph.clone(),
            node: idx,
            inputs,
            run_inputs: self.pool.run_inputs().clone(),
            parent: self.parent.clone(),
            iteration: self.pool.iteration(),
            cancel: self.cancel.clone(),
            pool: node.is_loop().then(|| Arc::new(self.pool.clone())),
        };
        let executor = self.env.executor.clone();
        self.tasks.spawn(async move { (idx, executor.execute(job).await) });
    }

    /// Resolve a node's input bindings. Unresolvable references bind `null`.
    fn bind_inputs(&self, node: &GraphNode) -> Outputs {
        let resolve = |r: &VarRef| self.pool.lookup(r).cloned().unwrap_or(Value::Null);
        node.inputs
            .iter()
            .map(|(name, binding)| {
                let value = match binding {
                    Binding::One(r) => resolve(r),
                    Binding::Many(refs) => Value::Array(refs.iter().map(&resolve).collect()),
                };
                (name.clone(), value)
            })
            .collect()
    }

    fn complete(&mut self, idx: usize, outcome: NodeOutcome) {
        let graph = self.graph.clone();
        let node = graph.node(idx);
        let scope = self.pool.scope_for(&node.id);
        let attempts = outcome.attempts;

        let result = outcome.result.and_then(|completion| {
            self.pool
                .commit(&scope, completion.outputs.clone())
                .map(|_| completion)
                .map_err(|e| NodeError::invalid_input(format!("output rejected: {}", e)))
        });

        match result {
            Ok(completion) => self.succeed(node, idx, completion, attempts),
            Err(error) => self.fail(node, idx, error, attempts),
        }
    }

    fn succeed(&mut self, node: &GraphNode, idx: usize, completion: Completion, attempts: u32) {
        self.status[idx] = NodeStatus::Succeeded;
        self.env.run.update_record(&node.id, self.parent.as_deref(), self.pool.iteration(), |r| {
            r.status = NodeStatus::Succeeded;
            r.outputs = completion.outputs.clone();
            r.attempts = attempts;
            r.error = None;
            r.finished_at = Some(Utc::now());
        });
        self.emit(
            node,
            EventType::NodeSucceeded,
            json!({
                "outputs": completion.outputs,
                "attempts": attempts,
                "branch": completion.branch,
            }),
        );

        if self.stopped {
            return;
        }
        let routed: Vec<(usize, bool)> = node
            .outgoing
            .iter()
            .map(|&e| (e, self.edge_active(e, completion.branch.as_deref())))
            .collect();
        self.resolve(routed);
    }

    fn edge_active(&self, e: usize, branch: Option<&str>) -> bool {
        let edge = self.graph.edge(e);
        if edge.is_error() {
            return false;
        }
        if let Some(wanted) = &edge.branch {
            if branch != Some(wanted.as_str()) {
                return false;
            }
        }
        match &edge.condition {
            Some(condition) => condition.is_true(&|r| self.pool.lookup(r).cloned()),
            None => true,
        }
    }

    fn fail(&mut self, node: &GraphNode, idx: usize, error: NodeError, attempts: u32) {
        self.status[idx] = NodeStatus::Failed;
        self.env.run.update_record(&node.id, self.parent.as_deref(), self.pool.iteration(), |r| {
            r.status = NodeStatus::Failed;
            r.attempts = attempts;
            r.error = Some(error.clone());
            r.finished_at = Some(Utc::now());
        });

        let recovered = node.error_edge.is_some();
        warn!(
            run_id = %self.env.run.run_id(),
            node_id = %node.id,
            attempts,
            recovered,
            error = %error,
            "Node failed"
        );
        self.emit(
            node,
            EventType::NodeFailed,
            json!({"error": error, "attempts": attempts, "recovered": recovered}),
        );

        if let Some(error_edge) = node.error_edge {
            let scope = self.pool.scope_for(&node.id);
            self.pool.commit_error(&scope, &error);
            if self.stopped {
                return;
            }
            let routed = node.outgoing.iter().map(|&e| (e, e == error_edge)).collect();
            self.resolve(routed);
        } else {
            self.failures.push(NodeFailure {
                node_id: node.id.clone(),
                error,
            });
            if self.stopped {
                return;
            }
            self.halt_descendants(idx);
        }
    }

    /// Skip every not-yet-started descendant of a failed node, whatever
    /// their other inputs. Independent branches keep running.
    fn halt_descendants(&mut self, failed: usize) {
        let graph = self.graph.clone();
        let mut seen = vec![false; graph.len()];
        let mut work: VecDeque<usize> = VecDeque::from([failed]);

        while let Some(idx) = work.pop_front() {
            for &e in &graph.node(idx).outgoing {
                if self.edges[e] == EdgeState::Pending {
                    self.edges[e] = EdgeState::Skipped;
                }
                let target = graph.edge(e).target;
                if seen[target] {
                    continue;
                }
                seen[target] = true;
                if self.status[target] != NodeStatus::Pending {
                    continue;
                }
                self.ready.retain(|&r| r != target);
                self.decided[target] = true;
                self.skip(graph.node(target), target);
                work.push_back(target);
            }
        }
    }

    /// Settle edges and decide every target whose incoming edges are all
    /// resolved. Skips propagate through the worklist.
    fn resolve(&mut self, routed: Vec<(usize, bool)>) {
        let graph = self.graph.clone();
        let mut work: VecDeque<(usize, bool)> = routed.into();

        while let Some((e, active)) = work.pop_front() {
            self.edges[e] = if active {
                EdgeState::Active
            } else {
                EdgeState::Skipped
            };

            let target = graph.edge(e).target;
            if self.decided[target] {
                continue;
            }
            let node = graph.node(target);
            if node.incoming.iter().any(|&i| self.edges[i] == EdgeState::Pending) {
                continue;
            }
            self.decided[target] = true;

            let mut states = node.incoming.iter().map(|&i| self.edges[i]);
            let runs = match node.join {
                JoinMode::Any => states.any(|s| s == EdgeState::Active),
                JoinMode::All => states.all(|s| s == EdgeState::Active),
            };
            if runs {
                self.ready.push_back(target);
            } else {
                self.skip(node, target);
                work.extend(node.outgoing.iter().map(|&o| (o, false)));
            }
        }
    }

    fn skip(&mut self, node: &GraphNode, idx: usize) {
        self.status[idx] = NodeStatus::Skipped;
        let mut record = self.record(node);
        record.status = NodeStatus::Skipped;
        record.finished_at = Some(Utc::now());
        self.env.run.upsert_record(record);
        debug!(run_id = %self.env.run.run_id(), node_id = %node.id, "Node skipped");
        self.emit(node, EventType::NodeSkipped, json!({}));
    }

    /// Fail every in-flight node and leave its task running detached.
    fn time_out(&mut self) {
        warn!(run_id = %self.env.run.run_id(), in_flight = self.tasks.len(), "Run deadline reached");
        self.cancel.cancel();
        let graph = self.graph.clone();
        for (idx, node) in graph.nodes().iter().enumerate() {
            if self.status[idx] != NodeStatus::Running {
                continue;
            }
            let error = NodeError::cancelled("run timed out");
            self.status[idx] = NodeStatus::Failed;
            self.env.run.update_record(&node.id, self.parent.as_deref(), self.pool.iteration(), |r| {
                r.status = NodeStatus::Failed;
                r.error = Some(error.clone());
                r.finished_at = Some(Utc::now());
            });
            self.emit(node, EventType::NodeFailed, json!({"error": error, "recovered": false}));
        }
        self.tasks.detach_all();
    }

    fn finish(&mut self) -> Outcome {
        if let Some(message) = self.internal.take() {
            return Outcome::Failed(RunFailure::internal(message));
        }
        if self.stopped {
            return Outcome::Stopped;
        }
        if !self.failures.is_empty() {
            return Outcome::Failed(RunFailure::from_nodes(std::mem::take(&mut self.failures)));
        }

        let mut outputs = Outputs::new();
        for &idx in self.graph.topo_order() {
            let node = self.graph.node(idx);
            if node.is_sink() && self.status[idx] == NodeStatus::Succeeded {
                if let Some(values) = self.pool.outputs_of(&node.id) {
                    outputs.extend(values.clone());
                }
            }
        }
        Outcome::Completed(outputs)
    }

    /// Publish the set of ready or running nodes. Top level only.
    fn sync_frontier(&self) {
        if self.parent.is_some() {
            return;
        }
        let mut frontier: BTreeSet<String> = self
            .status
            .iter()
            .enumerate()
            .filter(|(_, s)| **s == NodeStatus::Running)
            .map(|(i, _)| self.graph.node(i).id.clone())
            .collect();
        frontier.extend(self.ready.iter().map(|&i| self.graph.node(i).id.clone()));
        self.env.run.set_frontier(frontier);
    }

    fn record(&self, node: &GraphNode) -> NodeExecutionRecord {
        let mut record = NodeExecutionRecord::new(self.env.run.run_id().clone(), &node.id);
        record.parent = self.parent.clone();
        record.iteration = self.pool.iteration();
        record
    }

    fn emit(&self, node: &GraphNode, event_type: EventType, payload: Value) {
        let payload = scoped_payload(self.parent.as_deref(), self.pool.iteration(), payload);
        self.env.run.emitter().node_event(&node.id, event_type, payload);
    }
}

async fn deadline_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Execute a loop node: run its body once per iteration, each in an
/// isolated pool scope, and aggregate the per-iteration results.
pub(crate) async fn run_loop(job: NodeJob, cancel: CancellationToken) -> NodeResult<Completion> {
    let node = job.node();
    let spec = node
        .loop_spec
        .as_ref()
        .ok_or_else(|| NodeError::invalid_input(format!("node '{}' is not a loop", node.id)))?;
    let outer = job
        .pool
        .clone()
        .ok_or_else(|| NodeError::invalid_input("loop dispatched without a pool snapshot"))?;

    let items = match &spec.items {
        Some(r) => match outer.lookup(r) {
            None | Some(Value::Null) => Some(Vec::new()),
            Some(Value::Array(items)) => Some(items.clone()),
            Some(other) => {
                return Err(NodeError::invalid_input(format!(
                    "loop items '{}' is {}, expected an array",
                    r,
                    ValueType::of(other)
                )))
            }
        },
        None => None,
    };
    let limit = match (&items, spec.max_iterations) {
        (Some(items), Some(max)) => items.len().min(max),
        (Some(items), None) => items.len(),
        (None, Some(max)) => max,
        (None, None) => 0,
    };

    let mut results = Vec::with_capacity(limit);
    for index in 0..limit {
        if cancel.is_cancelled() {
            return Err(NodeError::cancelled(format!("loop stopped before iteration {}", index)));
        }
        let item = items
            .as_ref()
            .and_then(|items| items.get(index).cloned())
            .unwrap_or(Value::Null);
        let pool = VariablePool::for_iteration(outer.clone(), spec.body.clone(), index, item);
        let run = Scheduler::new(
            job.env.clone(),
            spec.body.clone(),
            pool,
            cancel.clone(),
            Some(node.id.clone()),
            None,
        )
        .run()
        .await;

        match run.outcome {
            Outcome::Completed(sink_outputs) => {
                let result = match &spec.output {
                    Some(r) => run.pool.lookup(r).cloned().unwrap_or(Value::Null),
                    None => Value::Object(sink_outputs),
                };
                results.push(result);
                let done = spec
                    .break_condition
                    .as_ref()
                    .is_some_and(|c| c.is_true(&|r| run.pool.lookup(r).cloned()));
                if done {
                    debug!(node_id = %node.id, iteration = index, "Loop break condition met");
                    break;
                }
            }
            Outcome::Failed(failure) => {
                return Err(NodeError::handler(format!("iteration {} failed: {}", index, failure)));
            }
            Outcome::Stopped | Outcome::TimedOut => {
                return Err(NodeError::cancelled(format!("iteration {} stopped", index)));
            }
        }
    }

    let mut outputs = Outputs::new();
    outputs.insert("iterations".into(), Value::from(results.len()));
    outputs.insert("results".into(), Value::Array(results));
    Ok(Completion {
        outputs,
        branch: None,
    })
}
