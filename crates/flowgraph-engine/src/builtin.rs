//! Built-in node types that need no external collaborator.

use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::Value;

use flowgraph_core::error::{NodeError, NodeResult};
use flowgraph_core::traits::{HandlerOutput, NodeHandler};
use flowgraph_core::types::{NodeContext, Outputs};

use crate::expr::{navigate, Expr, VarRef};

/// Branch handle selected by `if_else` when no case matches.
pub const ELSE_BRANCH: &str = "else";

/// Entry node: exposes the run inputs (and any bound inputs) as outputs.
pub struct StartNode;

impl NodeHandler for StartNode {
    fn node_type(&self) -> &str {
        "start"
    }

    fn execute(&self, ctx: NodeContext) -> BoxFuture<'_, NodeResult<HandlerOutput>> {
        Box::pin(async move {
            let mut outputs = (*ctx.run_inputs).clone();
            outputs.extend(ctx.inputs);
            Ok(HandlerOutput::outputs(outputs))
        })
    }
}

/// Terminal node: its bound inputs become its outputs.
pub struct EndNode;

impl NodeHandler for EndNode {
    fn node_type(&self) -> &str {
        "end"
    }

    fn execute(&self, ctx: NodeContext) -> BoxFuture<'_, NodeResult<HandlerOutput>> {
        Box::pin(async move { Ok(HandlerOutput::outputs(ctx.inputs)) })
    }
}

/// Forwards its inputs unchanged.
pub struct PassthroughNode;

impl NodeHandler for PassthroughNode {
    fn node_type(&self) -> &str {
        "passthrough"
    }

    fn execute(&self, ctx: NodeContext) -> BoxFuture<'_, NodeResult<HandlerOutput>> {
        Box::pin(async move { Ok(HandlerOutput::outputs(ctx.inputs)) })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
enum JoinStrategy {
    /// First non-null value, as `value`.
    #[default]
    First,
    /// Every non-null value in order, as `values`.
    All,
}

#[derive(Debug, Default, Deserialize)]
struct JoinConfig {
    #[serde(default)]
    mode: JoinStrategy,
}

/// Converges branches. Reads the `branches` input (a list binding) if
/// present, otherwise every input in name order. Inputs from skipped
/// branches are null and ignored.
pub struct JoinNode;

impl JoinNode {
    fn config(config: &Value) -> Result<JoinConfig, String> {
        if config.is_null() {
            return Ok(JoinConfig::default());
        }
        serde_json::from_value(config.clone()).map_err(|e| e.to_string())
    }
}

impl NodeHandler for JoinNode {
    fn node_type(&self) -> &str {
        "join"
    }

    fn validate(&self, config: &Value) -> Result<(), String> {
        Self::config(config).map(|_| ())
    }

    fn execute(&self, ctx: NodeContext) -> BoxFuture<'_, NodeResult<HandlerOutput>> {
        Box::pin(async move {
            let config = Self::config(&ctx.config).map_err(NodeError::invalid_input)?;
            let values: Vec<Value> = match ctx.inputs.get("branches") {
                Some(Value::Array(items)) => items.clone(),
                _ => ctx.inputs.values().cloned().collect(),
            };
            let live = values.into_iter().filter(|v| !v.is_null());

            let mut outputs = Outputs::new();
            match config.mode {
                JoinStrategy::First => {
                    outputs.insert("value".into(), live.into_iter().next().unwrap_or(Value::Null));
                }
                JoinStrategy::All => {
                    outputs.insert("values".into(), Value::Array(live.collect()));
                }
            }
            Ok(HandlerOutput::outputs(outputs))
        })
    }
}

#[derive(Debug, Deserialize)]
struct IfElseCase {
    id: String,
    when: String,
}

#[derive(Debug, Deserialize)]
struct IfElseConfig {
    cases: Vec<IfElseCase>,
}

/// Ordered conditional. Each case's `when` is an expression over the node's
/// own inputs (`x > 5`, `resp.status == 200`); the first true case selects
/// its id as the branch handle, otherwise `else`.
pub struct IfElseNode;

impl IfElseNode {
    fn parse(config: &Value) -> Result<Vec<(String, Expr)>, String> {
        let config: IfElseConfig =
            serde_json::from_value(config.clone()).map_err(|e| format!("invalid if_else config: {}", e))?;
        let mut cases = Vec::with_capacity(config.cases.len());
        for case in config.cases {
            if case.id.is_empty() || case.id == ELSE_BRANCH {
                return Err(format!("case id '{}' is reserved or empty", case.id));
            }
            if cases.iter().any(|(id, _)| *id == case.id) {
                return Err(format!("duplicate case id '{}'", case.id));
            }
            let expr = Expr::parse(&case.when).map_err(|e| format!("case '{}': {}", case.id, e))?;
            cases.push((case.id, expr));
        }
        Ok(cases)
    }
}

impl NodeHandler for IfElseNode {
    fn node_type(&self) -> &str {
        "if_else"
    }

    fn validate(&self, config: &Value) -> Result<(), String> {
        Self::parse(config).map(|_| ())
    }

    fn execute(&self, ctx: NodeContext) -> BoxFuture<'_, NodeResult<HandlerOutput>> {
        Box::pin(async move {
            let cases = Self::parse(&ctx.config).map_err(NodeError::invalid_input)?;
            let resolve = |r: &VarRef| navigate(ctx.inputs.get(r.root())?, r.tail()).cloned();
            let selected = cases
                .iter()
                .find(|(_, expr)| expr.is_true(&resolve))
                .map(|(id, _)| id.clone())
                .unwrap_or_else(|| ELSE_BRANCH.to_string());

            let mut outputs = Outputs::new();
            outputs.insert("selected".into(), Value::String(selected.clone()));
            Ok(HandlerOutput::branch(outputs, selected))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowgraph_core::types::RunId;
    use serde_json::json;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn ctx(node_type: &str, config: Value, inputs: Value, run_inputs: Value) -> NodeContext {
        NodeContext {
            run_id: RunId::from_str("test"),
            node_id: "n".into(),
            node_type: node_type.into(),
            config: Arc::new(config),
            inputs: inputs.as_object().cloned().unwrap_or_default(),
            run_inputs: Arc::new(run_inputs.as_object().cloned().unwrap_or_default()),
            attempt: 1,
            iteration: None,
            cancel: CancellationToken::new(),
        }
    }

    fn complete(output: HandlerOutput) -> (Outputs, Option<String>) {
        match output {
            HandlerOutput::Complete { outputs, branch } => (outputs, branch),
            HandlerOutput::Stream(_) => panic!("expected a complete output"),
        }
    }

    #[tokio::test]
    async fn test_start_exposes_run_inputs() {
        let out = StartNode
            .execute(ctx("start", Value::Null, json!({}), json!({"x": 10})))
            .await
            .unwrap();
        let (outputs, branch) = complete(out);
        assert_eq!(outputs["x"], json!(10));
        assert!(branch.is_none());
    }

    #[tokio::test]
    async fn test_join_first_skips_nulls() {
        let out = JoinNode
            .execute(ctx(
                "join",
                Value::Null,
                json!({"branches": [null, "from-b"]}),
                json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(complete(out).0["value"], json!("from-b"));
    }

    #[tokio::test]
    async fn test_join_all_collects_inputs_in_name_order() {
        let out = JoinNode
            .execute(ctx(
                "join",
                json!({"mode": "all"}),
                json!({"a": 1, "b": null, "c": 3}),
                json!({}),
            ))
            .await
            .unwrap();
        assert_eq!(complete(out).0["values"], json!([1, 3]));
    }

    #[test]
    fn test_join_rejects_unknown_mode() {
        assert!(JoinNode.validate(&json!({"mode": "most"})).is_err());
        assert!(JoinNode.validate(&Value::Null).is_ok());
    }

    #[tokio::test]
    async fn test_if_else_selects_first_matching_case() {
        let config = json!({"cases": [
            {"id": "big", "when": "x > 5"},
            {"id": "positive", "when": "x > 0"}
        ]});
        let out = IfElseNode
            .execute(ctx("if_else", config.clone(), json!({"x": 10}), json!({})))
            .await
            .unwrap();
        let (outputs, branch) = complete(out);
        assert_eq!(branch.as_deref(), Some("big"));
        assert_eq!(outputs["selected"], json!("big"));

        let out = IfElseNode
            .execute(ctx("if_else", config.clone(), json!({"x": 2}), json!({})))
            .await
            .unwrap();
        assert_eq!(complete(out).1.as_deref(), Some("positive"));

        let out = IfElseNode
            .execute(ctx("if_else", config, json!({"x": -1}), json!({})))
            .await
            .unwrap();
        assert_eq!(complete(out).1.as_deref(), Some(ELSE_BRANCH));
    }

    #[tokio::test]
    async fn test_if_else_reads_nested_input_fields() {
        let config = json!({"cases": [{"id": "ok", "when": "resp.status == 200"}]});
        let out = IfElseNode
            .execute(ctx("if_else", config, json!({"resp": {"status": 200}}), json!({})))
            .await
            .unwrap();
        assert_eq!(complete(out).1.as_deref(), Some("ok"));
    }

    #[test]
    fn test_if_else_validation() {
        assert!(IfElseNode.validate(&json!({"cases": []})).is_ok());
        assert!(IfElseNode.validate(&Value::Null).is_err());
        assert!(IfElseNode
            .validate(&json!({"cases": [{"id": "else", "when": "x"}]}))
            .is_err());
        assert!(IfElseNode
            .validate(&json!({"cases": [{"id": "a", "when": "x >"}]}))
            .is_err());
        assert!(IfElseNode
            .validate(&json!({"cases": [{"id": "a", "when": "x"}, {"id": "a", "when": "y"}]}))
            .is_err());
    }
}
