use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use flowgraph_core::error::{FlowError, Result};

use super::Graph;

/// Published graphs, addressed by id and version.
#[derive(Default)]
pub struct GraphCatalog {
    graphs: RwLock<BTreeMap<(String, u32), Arc<Graph>>>,
}

impl GraphCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a published graph. A given id+version is published once.
    pub fn insert(&self, graph: Arc<Graph>) -> Result<()> {
        let key = (graph.id().to_string(), graph.version());
        let mut graphs = self
            .graphs
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if graphs.contains_key(&key) {
            return Err(FlowError::GraphExists {
                id: key.0,
                version: key.1,
            });
        }
        graphs.insert(key, graph);
        Ok(())
    }

    pub fn get(&self, id: &str, version: u32) -> Result<Arc<Graph>> {
        self.graphs
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&(id.to_string(), version))
            .cloned()
            .ok_or_else(|| FlowError::GraphNotFound {
                id: id.to_string(),
                version,
            })
    }

    /// Highest published version of `id`.
    pub fn latest(&self, id: &str) -> Option<Arc<Graph>> {
        self.graphs
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .range((id.to_string(), 0)..=(id.to_string(), u32::MAX))
            .next_back()
            .map(|(_, g)| g.clone())
    }

    /// All published (id, version) pairs, sorted.
    pub fn list(&self) -> Vec<(String, u32)> {
        self.graphs
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::NodeRegistry;
    use crate::graph::{GraphDefinition, NodeDefinition};

    fn publish(version: u32) -> Arc<Graph> {
        let def = GraphDefinition::new("wf", version, "start").node(NodeDefinition::new("start", "start"));
        Graph::publish(&def, &NodeRegistry::with_builtins()).unwrap()
    }

    #[test]
    fn test_insert_and_get() {
        let catalog = GraphCatalog::new();
        catalog.insert(publish(1)).unwrap();
        catalog.insert(publish(3)).unwrap();

        assert_eq!(catalog.get("wf", 1).unwrap().version(), 1);
        assert!(matches!(
            catalog.get("wf", 2),
            Err(FlowError::GraphNotFound { version: 2, .. })
        ));
        assert_eq!(catalog.latest("wf").unwrap().version(), 3);
        assert!(catalog.latest("other").is_none());
        assert_eq!(catalog.list(), vec![("wf".to_string(), 1), ("wf".to_string(), 3)]);
    }

    #[test]
    fn test_same_version_published_once() {
        let catalog = GraphCatalog::new();
        catalog.insert(publish(1)).unwrap();
        assert!(matches!(
            catalog.insert(publish(1)),
            Err(FlowError::GraphExists { version: 1, .. })
        ));
    }
}
