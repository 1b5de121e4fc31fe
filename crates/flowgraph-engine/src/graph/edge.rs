use serde::{Deserialize, Serialize};

use crate::expr::Expr;

/// Whether an edge carries normal flow or failure routing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    #[default]
    Normal,
    /// Followed only when the source exhausts its retries.
    Error,
}

/// An edge as written in a graph definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeDefinition {
    pub id: String,
    pub source: String,
    pub target: String,
    /// Boolean expression over upstream outputs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Branch handle the source must select for this edge to be taken.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default)]
    pub kind: EdgeKind,
}

impl EdgeDefinition {
    /// Create an unconditional edge.
    pub fn new(id: impl Into<String>, source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            condition: None,
            branch: None,
            kind: EdgeKind::Normal,
        }
    }

    /// Guard the edge with a condition.
    pub fn when(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    /// Take the edge only when the source selects `branch`.
    pub fn on_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    /// Make this the source's error edge.
    pub fn on_error(mut self) -> Self {
        self.kind = EdgeKind::Error;
        self
    }
}

/// An edge in a published graph. Endpoints are node indices.
#[derive(Debug)]
pub struct GraphEdge {
    pub id: String,
    pub source: usize,
    pub target: usize,
    pub condition: Option<Expr>,
    pub branch: Option<String>,
    pub kind: EdgeKind,
}

impl GraphEdge {
    pub fn is_error(&self) -> bool {
        self.kind == EdgeKind::Error
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edge_builders() {
        let e = EdgeDefinition::new("e1", "a", "b");
        assert_eq!(e.source, "a");
        assert_eq!(e.target, "b");
        assert_eq!(e.kind, EdgeKind::Normal);
        assert!(e.condition.is_none());

        let e = EdgeDefinition::new("e2", "a", "c").when("a.x > 5");
        assert_eq!(e.condition.as_deref(), Some("a.x > 5"));

        let e = EdgeDefinition::new("e3", "check", "yes").on_branch("big");
        assert_eq!(e.branch.as_deref(), Some("big"));

        let e = EdgeDefinition::new("e4", "a", "recover").on_error();
        assert_eq!(e.kind, EdgeKind::Error);
    }

    #[test]
    fn test_serialization_roundtrip() {
        let edge = EdgeDefinition::new("e1", "a", "b").when(r#"a.status == "ok""#);
        let json = serde_json::to_string(&edge).unwrap();
        assert!(!json.contains("branch"));
        let parsed: EdgeDefinition = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, "e1");
        assert_eq!(parsed.condition.as_deref(), Some(r#"a.status == "ok""#));
        assert_eq!(parsed.kind, EdgeKind::Normal);
    }

    #[test]
    fn test_kind_from_json() {
        let edge: EdgeDefinition = serde_json::from_str(
            r#"{"id": "e", "source": "a", "target": "b", "kind": "error"}"#,
        )
        .unwrap();
        assert_eq!(edge.kind, EdgeKind::Error);
    }
}
