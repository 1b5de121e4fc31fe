use std::sync::Arc;

use serde_json::json;

use flowgraph_core::config::AppConfig;
use flowgraph_core::types::RunStatus;
use flowgraph_engine::{Graph, GraphDefinition, NodeRegistry, RunController};

const TRIAGE: &str = include_str!("../graphs/triage.json");
const CHUNKS: &str = include_str!("../graphs/chunks.json");

fn inputs(value: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
    value.as_object().cloned().expect("object")
}

#[test]
fn test_bundled_graphs_validate() {
    let registry = NodeRegistry::with_builtins();
    for source in [TRIAGE, CHUNKS] {
        let def = GraphDefinition::from_json(source).expect("parse graph");
        Graph::publish(&def, &registry).expect("valid graph");
    }
}

#[tokio::test]
async fn test_triage_routes_by_count() {
    let controller = RunController::new(Arc::new(NodeRegistry::with_builtins()), &AppConfig::default());
    let graph = controller
        .publish(&GraphDefinition::from_json(TRIAGE).unwrap())
        .unwrap();
    let labels = json!({"batch_label": "batch", "single_label": "single"});

    let mut many = inputs(labels.clone());
    many.insert("count".into(), json!(5));
    let run_id = controller.start_run(graph.clone(), many).unwrap();
    let snap = controller.wait_run(&run_id).await.unwrap();
    assert_eq!(snap.state.status, RunStatus::Succeeded);
    assert_eq!(snap.state.outputs["label"], json!("batch"));
    assert_eq!(snap.state.outputs["count"], json!(5));

    let mut one = inputs(labels);
    one.insert("count".into(), json!(1));
    let run_id = controller.start_run(graph, one).unwrap();
    let snap = controller.wait_run(&run_id).await.unwrap();
    assert_eq!(snap.state.outputs["label"], json!("single"));
}

#[tokio::test]
async fn test_chunks_loop_breaks_on_marker() {
    let controller = RunController::new(Arc::new(NodeRegistry::with_builtins()), &AppConfig::default());
    let graph = controller
        .publish(&GraphDefinition::from_json(CHUNKS).unwrap())
        .unwrap();
    let run_id = controller
        .start_run(graph, inputs(json!({"chunks": ["a", "b", "stop", "c"]})))
        .unwrap();
    let snap = controller.wait_run(&run_id).await.unwrap();

    assert_eq!(snap.state.status, RunStatus::Succeeded);
    assert_eq!(snap.state.outputs["kept"], json!(["a", "b", "stop"]));
    assert_eq!(snap.state.outputs["count"], json!(3));
}

#[test]
fn test_rejects_malformed_definitions() {
    let registry = NodeRegistry::with_builtins();
    let cyclic = r#"{
        "id": "bad", "entry_node_id": "start",
        "nodes": [
            {"id": "start", "type": "start"},
            {"id": "a", "type": "passthrough"},
            {"id": "b", "type": "passthrough"}
        ],
        "edges": [
            {"id": "e1", "source": "start", "target": "a"},
            {"id": "e2", "source": "a", "target": "b"},
            {"id": "e3", "source": "b", "target": "a"}
        ]
    }"#;
    let def = GraphDefinition::from_json(cyclic).unwrap();
    assert!(Graph::publish(&def, &registry).is_err());

    let unknown = r#"{
        "id": "bad", "entry_node_id": "start",
        "nodes": [{"id": "start", "type": "teleport"}]
    }"#;
    let def = GraphDefinition::from_json(unknown).unwrap();
    assert!(Graph::publish(&def, &registry).is_err());
}
