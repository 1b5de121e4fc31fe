//! Run controller: owns every run's lifecycle and is the only place a
//! run's status changes.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use flowgraph_core::config::{AppConfig, EngineConfig};
use flowgraph_core::error::{FlowError, Result, RunFailure};
use flowgraph_core::event::EventBus;
use flowgraph_core::traits::RunStore;
use flowgraph_core::types::{
    EventType, NodeExecutionRecord, Outputs, RunEvent, RunId, RunSnapshot, RunState, RunStatus,
};

use crate::adapter::{NodeExecutor, NodeRegistry};
use crate::emitter::RunEmitter;
use crate::graph::{Graph, GraphCatalog, GraphDefinition};
use crate::pool::VariablePool;
use crate::scheduler::{Outcome, RunEnv, Scheduler};

/// Writes queued for the persistence sink.
enum PersistOp {
    Run(RunState),
    Node(NodeExecutionRecord),
    Flush(oneshot::Sender<()>),
}

/// Live state of one run, shared by the controller and the run's scheduler.
pub(crate) struct RunHandle {
    run_id: RunId,
    emitter: Arc<RunEmitter>,
    state: Mutex<RunState>,
    records: Mutex<Vec<NodeExecutionRecord>>,
    status_tx: watch::Sender<RunStatus>,
    pause_tx: watch::Sender<bool>,
    cancel: CancellationToken,
    persist: Option<mpsc::UnboundedSender<PersistOp>>,
}

impl RunHandle {
    fn new(
        state: RunState,
        emitter: Arc<RunEmitter>,
        persist: Option<mpsc::UnboundedSender<PersistOp>>,
    ) -> Self {
        let (status_tx, _) = watch::channel(state.status);
        let (pause_tx, _) = watch::channel(false);
        let handle = Self {
            run_id: state.run_id.clone(),
            emitter,
            state: Mutex::new(state.clone()),
            records: Mutex::new(Vec::new()),
            status_tx,
            pause_tx,
            cancel: CancellationToken::new(),
            persist,
        };
        handle.persist(PersistOp::Run(state));
        handle
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn emitter(&self) -> &Arc<RunEmitter> {
        &self.emitter
    }

    fn state(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn records(&self) -> MutexGuard<'_, Vec<NodeExecutionRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, op: PersistOp) {
        if let Some(tx) = &self.persist {
            let _ = tx.send(op);
        }
    }

    /// Insert a record, replacing the one for the same node instance.
    pub fn upsert_record(&self, record: NodeExecutionRecord) {
        let mut records = self.records();
        let existing = records.iter().rposition(|r| {
            r.node_id == record.node_id && r.parent == record.parent && r.iteration == record.iteration
        });
        match existing {
            Some(pos) => records[pos] = record.clone(),
            None => records.push(record.clone()),
        }
        drop(records);
        self.persist(PersistOp::Node(record));
    }

    /// Modify the record of a node instance in place, if it exists.
    pub fn update_record(
        &self,
        node_id: &str,
        parent: Option<&str>,
        iteration: Option<usize>,
        f: impl FnOnce(&mut NodeExecutionRecord),
    ) {
        let mut records = self.records();
        let Some(record) = records.iter_mut().rev().find(|r| {
            r.node_id == node_id && r.parent.as_deref() == parent && r.iteration == iteration
        }) else {
            return;
        };
        f(record);
        let updated = record.clone();
        drop(records);
        self.persist(PersistOp::Node(updated));
    }

    pub fn set_frontier(&self, frontier: BTreeSet<String>) {
        let mut state = self.state();
        if !state.status.is_terminal() {
            state.frontier = frontier;
        }
    }

    fn status(&self) -> RunStatus {
        *self.status_tx.borrow()
    }

    /// Move the run to `to`, applying `f` to the state under the same lock.
    /// Waiters are not woken until [`RunHandle::notify`].
    fn transition(&self, to: RunStatus, f: impl FnOnce(&mut RunState)) -> Result<RunState> {
        let mut state = self.state();
        let from = state.status;
        if !from.can_transition_to(to) {
            return Err(FlowError::InvalidTransition { from, to });
        }
        state.status = to;
        if to == RunStatus::Running && state.started_at.is_none() {
            state.started_at = Some(Utc::now());
        }
        if to.is_terminal() {
            state.finished_at = Some(Utc::now());
            state.frontier.clear();
        }
        f(&mut state);
        let snapshot = state.clone();
        drop(state);

        debug!(run_id = %self.run_id, %from, %to, "Run transition");
        self.persist(PersistOp::Run(snapshot.clone()));
        Ok(snapshot)
    }

    /// Wake status waiters. Called once the transition's event is emitted.
    fn notify(&self, status: RunStatus) {
        self.status_tx.send_replace(status);
    }

    fn snapshot(&self) -> RunSnapshot {
        RunSnapshot {
            state: self.state().clone(),
            records: self.records().clone(),
        }
    }
}

/// Starts, tracks and controls workflow runs.
///
/// Cheap to share behind an `Arc`; every operation takes `&self`. Runs are
/// driven on spawned tokio tasks, so a controller must be used from within
/// a tokio runtime.
pub struct RunController {
    registry: Arc<NodeRegistry>,
    catalog: GraphCatalog,
    bus: Arc<EventBus>,
    executor: Arc<NodeExecutor>,
    config: EngineConfig,
    runs: RwLock<HashMap<RunId, Arc<RunHandle>>>,
    persist: Option<mpsc::UnboundedSender<PersistOp>>,
}

impl RunController {
    pub fn new(registry: Arc<NodeRegistry>, config: &AppConfig) -> Self {
        let executor = Arc::new(NodeExecutor::new(
            registry.clone(),
            config.retry.clone(),
            config.engine.node_timeout_ms,
        ));
        Self {
            registry,
            catalog: GraphCatalog::new(),
            bus: Arc::new(EventBus::new(config.engine.event_capacity)),
            executor,
            config: config.engine.clone(),
            runs: RwLock::new(HashMap::new()),
            persist: None,
        }
    }

    /// Append run transitions and node records to `store` from a background
    /// worker. Sink errors are logged and never fail a run.
    pub fn with_store(mut self, store: Arc<dyn RunStore>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(persist_worker(store, rx));
        self.persist = Some(tx);
        self
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn catalog(&self) -> &GraphCatalog {
        &self.catalog
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Live events of every run.
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.bus.subscribe()
    }

    /// Validate a definition and add it to the catalog.
    pub fn publish(&self, definition: &GraphDefinition) -> Result<Arc<Graph>> {
        let graph = Graph::publish(definition, &self.registry)?;
        self.catalog.insert(graph.clone())?;
        info!(graph_id = %graph.id(), version = graph.version(), nodes = graph.len(), "Graph published");
        Ok(graph)
    }

    /// Start a run of a published graph from the catalog.
    pub fn start_published(&self, graph_id: &str, version: u32, inputs: Outputs) -> Result<RunId> {
        let graph = self.catalog.get(graph_id, version)?;
        self.start_run(graph, inputs)
    }

    /// Create a run and start scheduling it in the background.
    pub fn start_run(&self, graph: Arc<Graph>, inputs: Outputs) -> Result<RunId> {
        let run_id = RunId::new();
        let emitter = Arc::new(RunEmitter::new(run_id.clone(), self.bus.clone()));
        let state = RunState::new(run_id.clone(), graph.id(), graph.version());
        let handle = Arc::new(RunHandle::new(state, emitter, self.persist.clone()));

        self.runs_mut().insert(run_id.clone(), handle.clone());

        handle.transition(RunStatus::Running, |_| {})?;
        handle.emitter.run_event(
            EventType::RunStarted,
            json!({"graph_id": graph.id(), "graph_version": graph.version()}),
        );
        handle.notify(RunStatus::Running);
        info!(run_id = %run_id, graph_id = %graph.id(), version = graph.version(), "Run started");

        let max_concurrency = self.config.max_concurrency.max(1);
        let env = RunEnv {
            run: handle.clone(),
            executor: self.executor.clone(),
            max_concurrency,
            permits: Arc::new(Semaphore::new(max_concurrency)),
            pause: handle.pause_tx.subscribe(),
        };
        let timeout_ms = self.config.run_timeout_ms;
        tokio::spawn(drive(handle, env, graph, inputs, timeout_ms));
        Ok(run_id)
    }

    /// Stop a run. In-flight handlers see their token cancelled and are left
    /// to finish; nothing new is dispatched.
    pub fn cancel_run(&self, run_id: &RunId) -> Result<()> {
        let handle = self.handle(run_id)?;
        handle.transition(RunStatus::Stopped, |_| {})?;
        handle.cancel.cancel();
        handle
            .emitter
            .run_event(EventType::RunStopped, json!({"reason": "cancelled"}));
        handle.notify(RunStatus::Stopped);
        info!(run_id = %run_id, "Run cancelled");
        Ok(())
    }

    /// Hold dispatch of new nodes. In-flight nodes complete normally.
    pub fn pause_run(&self, run_id: &RunId) -> Result<()> {
        let handle = self.handle(run_id)?;
        handle.transition(RunStatus::Paused, |_| {})?;
        handle.pause_tx.send_replace(true);
        handle.emitter.run_event(EventType::RunPaused, json!({}));
        handle.notify(RunStatus::Paused);
        info!(run_id = %run_id, "Run paused");
        Ok(())
    }

    pub fn resume_run(&self, run_id: &RunId) -> Result<()> {
        let handle = self.handle(run_id)?;
        handle.transition(RunStatus::Running, |_| {})?;
        handle.emitter.run_event(EventType::RunResumed, json!({}));
        handle.notify(RunStatus::Running);
        handle.pause_tx.send_replace(false);
        info!(run_id = %run_id, "Run resumed");
        Ok(())
    }

    /// Current state and node records of a run.
    pub fn query_run(&self, run_id: &RunId) -> Result<RunSnapshot> {
        Ok(self.handle(run_id)?.snapshot())
    }

    /// Wait until the run reaches a terminal status.
    pub async fn wait_run(&self, run_id: &RunId) -> Result<RunSnapshot> {
        let handle = self.handle(run_id)?;
        let mut rx = handle.status_tx.subscribe();
        let reached = rx.wait_for(|status| status.is_terminal()).await.is_ok();
        if !reached {
            debug!(run_id = %run_id, status = %handle.status(), "Status channel closed while waiting");
        }
        Ok(handle.snapshot())
    }

    /// Every event emitted for the run so far, in sequence order.
    pub fn events(&self, run_id: &RunId) -> Result<Vec<RunEvent>> {
        Ok(self.handle(run_id)?.emitter.history())
    }

    /// Events emitted after sequence number `after`.
    pub fn events_since(&self, run_id: &RunId, after: u64) -> Result<Vec<RunEvent>> {
        Ok(self.handle(run_id)?.emitter.history_since(after))
    }

    /// Ids of every run this controller has started.
    pub fn list_runs(&self) -> Vec<RunId> {
        let mut ids: Vec<RunId> = self
            .runs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Archive a terminal run: drop its state, records and event history
    /// from memory. Anything already written to the store is kept.
    pub fn remove_run(&self, run_id: &RunId) -> Result<RunSnapshot> {
        let mut runs = self.runs_mut();
        let handle = runs
            .get(run_id)
            .ok_or_else(|| FlowError::RunNotFound(run_id.to_string()))?;
        let status = handle.status();
        if !status.is_terminal() {
            return Err(FlowError::RunActive {
                run_id: run_id.to_string(),
                status,
            });
        }
        let snapshot = handle.snapshot();
        runs.remove(run_id);
        debug!(run_id = %run_id, "Run removed");
        Ok(snapshot)
    }

    /// Wait for every queued store write to be handed to the sink.
    pub async fn flush_store(&self) {
        let Some(tx) = &self.persist else {
            return;
        };
        let (done_tx, done_rx) = oneshot::channel();
        if tx.send(PersistOp::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    fn handle(&self, run_id: &RunId) -> Result<Arc<RunHandle>> {
        self.runs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(run_id)
            .cloned()
            .ok_or_else(|| FlowError::RunNotFound(run_id.to_string()))
    }

    fn runs_mut(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<RunId, Arc<RunHandle>>> {
        self.runs.write().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn drive(
    handle: Arc<RunHandle>,
    env: RunEnv,
    graph: Arc<Graph>,
    inputs: Outputs,
    timeout_ms: Option<u64>,
) {
    let deadline = timeout_ms.map(|ms| Instant::now() + Duration::from_millis(ms));
    let pool = VariablePool::new(graph.clone(), Arc::new(inputs));
    let run = Scheduler::new(env, graph, pool, handle.cancel.clone(), None, deadline)
        .run()
        .await;
    finalize(&handle, run.outcome, timeout_ms.unwrap_or_default());
}

/// Turn the scheduler's proposal into the run's terminal status.
fn finalize(handle: &RunHandle, outcome: Outcome, timeout_ms: u64) {
    let (status, outputs, failure) = match outcome {
        Outcome::Completed(outputs) => (RunStatus::Succeeded, outputs, None),
        Outcome::Failed(failure) => (RunStatus::Failed, Outputs::new(), Some(failure)),
        Outcome::TimedOut => (
            RunStatus::Failed,
            Outputs::new(),
            Some(RunFailure::timeout(timeout_ms)),
        ),
        Outcome::Stopped => (RunStatus::Stopped, Outputs::new(), None),
    };

    let applied = handle.transition(status, |state| {
        state.outputs = outputs.clone();
        state.error = failure.clone();
    });
    if let Err(e) = applied {
        // Already terminal, typically stopped by cancel_run.
        debug!(run_id = %handle.run_id, error = %e, "Scheduler outcome discarded");
        return;
    }

    let emitter = &handle.emitter;
    match (status, failure) {
        (RunStatus::Succeeded, _) => {
            info!(run_id = %handle.run_id, "Run succeeded");
            emitter.run_event(EventType::RunSucceeded, json!({"outputs": outputs}));
        }
        (RunStatus::Failed, Some(failure)) => {
            warn!(run_id = %handle.run_id, error = %failure, "Run failed");
            emitter.run_event(EventType::RunFailed, json!({"error": failure}));
        }
        _ => {
            info!(run_id = %handle.run_id, "Run stopped");
            emitter.run_event(EventType::RunStopped, json!({}));
        }
    }
    handle.notify(status);
}

async fn persist_worker(store: Arc<dyn RunStore>, mut rx: mpsc::UnboundedReceiver<PersistOp>) {
    while let Some(op) = rx.recv().await {
        let result = match op {
            PersistOp::Run(state) => store.record_run(&state).await,
            PersistOp::Node(record) => store.record_node(&record).await,
            PersistOp::Flush(done) => {
                let _ = done.send(());
                continue;
            }
        };
        if let Err(e) = result {
            warn!(error = %e, "Run store write failed");
        }
    }
    debug!("Persistence worker stopped");
}
