use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use serde_json::Value;

use flowgraph_core::event::EventBus;
use flowgraph_core::types::{EventType, RunEvent, RunId};

/// Per-run event emitter.
///
/// Stamps each event with the run's next sequence number, keeps it for
/// replay and publishes it on the shared bus. Sequence assignment and
/// publication happen under one lock, so bus order matches sequence order.
pub struct RunEmitter {
    run_id: RunId,
    bus: Arc<EventBus>,
    inner: Mutex<EmitterState>,
}

#[derive(Default)]
struct EmitterState {
    next_sequence: u64,
    history: Vec<RunEvent>,
}

impl RunEmitter {
    pub fn new(run_id: RunId, bus: Arc<EventBus>) -> Self {
        Self {
            run_id,
            bus,
            inner: Mutex::new(EmitterState::default()),
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    fn state(&self) -> MutexGuard<'_, EmitterState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn emit(&self, node_id: Option<&str>, event_type: EventType, payload: Value) -> RunEvent {
        let mut state = self.state();
        state.next_sequence += 1;
        let event = RunEvent {
            run_id: self.run_id.clone(),
            node_id: node_id.map(String::from),
            event_type,
            payload,
            timestamp: Utc::now(),
            sequence: state.next_sequence,
        };
        state.history.push(event.clone());
        self.bus.publish(event.clone());
        event
    }

    /// Emit a run-level event.
    pub fn run_event(&self, event_type: EventType, payload: Value) -> RunEvent {
        self.emit(None, event_type, payload)
    }

    /// Emit a node-level event.
    pub fn node_event(&self, node_id: &str, event_type: EventType, payload: Value) -> RunEvent {
        self.emit(Some(node_id), event_type, payload)
    }

    /// Every event emitted so far, in sequence order.
    pub fn history(&self) -> Vec<RunEvent> {
        self.state().history.clone()
    }

    /// Events with a sequence greater than `after`.
    pub fn history_since(&self, after: u64) -> Vec<RunEvent> {
        self.state()
            .history
            .iter()
            .filter(|e| e.sequence > after)
            .cloned()
            .collect()
    }
}

/// Tag a node event payload with its loop position, if any.
pub fn scoped_payload(parent: Option<&str>, iteration: Option<usize>, mut payload: Value) -> Value {
    if let Value::Object(map) = &mut payload {
        if let Some(parent) = parent {
            map.insert("parent".into(), Value::String(parent.to_string()));
        }
        if let Some(iteration) = iteration {
            map.insert("iteration".into(), Value::from(iteration));
        }
    }
    payload
}
