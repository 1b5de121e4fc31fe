#![allow(dead_code)]

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::broadcast;

use flowgraph_core::config::AppConfig;
use flowgraph_core::types::{EventType, Outputs, RunEvent, RunId, RunSnapshot};
use flowgraph_engine::{GraphDefinition, NodeRegistry, RunController};
use flowgraph_test_utils::{outputs, FnHandler};

/// Builtins plus `const` (emits its config object) and `double`
/// (emits `{"value": 2 * v}`).
pub fn registry() -> NodeRegistry {
    let mut registry = NodeRegistry::with_builtins();
    registry.register(FnHandler::new("const", |ctx| match ctx.config.as_ref() {
        Value::Object(map) => Ok(map.clone()),
        _ => Ok(Outputs::new()),
    }));
    registry.register(FnHandler::new("double", |ctx| {
        let v = ctx.input("v").and_then(Value::as_i64).unwrap_or_default();
        Ok(outputs(serde_json::json!({"value": v * 2})))
    }));
    registry
}

pub fn controller(registry: NodeRegistry, config: &AppConfig) -> RunController {
    RunController::new(Arc::new(registry), config)
}

/// Publish `def`, run it with `inputs` and wait for the terminal state.
pub async fn run_to_end(
    controller: &RunController,
    def: &GraphDefinition,
    inputs: Value,
) -> (RunId, RunSnapshot) {
    let graph = controller.publish(def).unwrap();
    let run_id = controller.start_run(graph, outputs(inputs)).unwrap();
    let snapshot = controller.wait_run(&run_id).await.unwrap();
    (run_id, snapshot)
}

/// Position of the first `event_type` event for `node_id` in `events`.
pub fn position(events: &[RunEvent], node_id: &str, event_type: EventType) -> Option<usize> {
    events
        .iter()
        .position(|e| e.node_id.as_deref() == Some(node_id) && e.event_type == event_type)
}

pub fn count(events: &[RunEvent], node_id: &str, event_type: EventType) -> usize {
    events
        .iter()
        .filter(|e| e.node_id.as_deref() == Some(node_id) && e.event_type == event_type)
        .count()
}

/// Receive until `node_id` emits `event_type`.
pub async fn wait_for_event(
    rx: &mut broadcast::Receiver<RunEvent>,
    node_id: &str,
    event_type: EventType,
) -> RunEvent {
    loop {
        let event = rx.recv().await.unwrap();
        if event.node_id.as_deref() == Some(node_id) && event.event_type == event_type {
            return event;
        }
    }
}
