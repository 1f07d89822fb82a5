//! Graph store adapter (specification §6, §3.4, §4.10).
//!
//! The wire-level interface in §6 describes a single `execute_query`
//! entry point; since the core only ever issues node/edge upserts, tree
//! walks, and orphan/statistics queries (never arbitrary graph queries),
//! this implementation exposes those as a typed trait instead of a
//! stringly-typed query surface, per the "dynamic dispatch by string
//! matching" redesign strategy in §9. The default implementation is
//! `petgraph`-backed and `parking_lot::RwLock`-guarded, grounded directly
//! in the teacher's `DependencyGraph`.

use async_trait::async_trait;
use parking_lot::RwLock;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use std::collections::HashMap;

use crate::error::{OmniError, OmniResult};
use crate::types::{EdgeKind, GraphNode, ImportAttributes};

/// A `CONTAINS`/`IMPORTS`/`DEFINES` edge with its optional import
/// attributes (§3.4).
#[derive(Debug, Clone)]
pub struct GraphEdge {
    /// Source node key.
    pub from: String,
    /// Target node key.
    pub to: String,
    /// Edge kind.
    pub kind: EdgeKind,
    /// Present only for `IMPORTS` edges.
    pub import_attributes: Option<ImportAttributes>,
}

/// The graph store operations required by the core (§6, §3.4, §4.10).
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Insert the node if absent; idempotent on re-ingest.
    ///
    /// # Errors
    /// Returns an [`OmniError`] on a store-level failure.
    async fn upsert_node(&self, node: GraphNode) -> OmniResult<()>;

    /// Insert the edge if absent; idempotent on re-ingest (§4.8 step 2
    /// "re-emit graph edge (idempotent)").
    ///
    /// # Errors
    /// Returns an [`OmniError`] on a store-level failure.
    async fn upsert_edge(&self, edge: GraphEdge) -> OmniResult<()>;

    /// Fetch a node by key.
    ///
    /// # Errors
    /// Returns an [`OmniError`] on a store-level failure.
    async fn get_node(&self, key: &str) -> OmniResult<Option<GraphNode>>;

    /// Children of `key` reached via `CONTAINS` edges, sorted by name
    /// (§4.10).
    ///
    /// # Errors
    /// Returns an [`OmniError`] on a store-level failure.
    async fn contains_children(&self, key: &str) -> OmniResult<Vec<GraphNode>>;

    /// Targets of outgoing `IMPORTS` edges from `key` (§4.10
    /// `include_dependencies`).
    ///
    /// # Errors
    /// Returns an [`OmniError`] on a store-level failure.
    async fn import_targets(&self, key: &str) -> OmniResult<Vec<String>>;

    /// `FILE` keys with in-degree 0 and out-degree 0 on `IMPORTS` (§3.4,
    /// §8 Orphan soundness).
    ///
    /// # Errors
    /// Returns an [`OmniError`] on a store-level failure.
    async fn orphan_files(&self) -> OmniResult<Vec<String>>;

    /// `|{e: FILE-[:DEFINES]->e}|` for the file at `key` (§3.4 invariant).
    ///
    /// # Errors
    /// Returns an [`OmniError`] on a store-level failure.
    async fn entity_count(&self, key: &str) -> OmniResult<u64>;

    /// `|{t: FILE-[:IMPORTS]->t}|` for the file at `key` (§3.4 invariant).
    ///
    /// # Errors
    /// Returns an [`OmniError`] on a store-level failure.
    async fn import_count(&self, key: &str) -> OmniResult<u64>;
}

struct Inner {
    graph: DiGraph<GraphNode, GraphEdge>,
    key_to_node: HashMap<String, NodeIndex>,
    /// `(from_key, to_key, kind)` set for idempotent edge upserts.
    edge_keys: HashMap<(String, String, &'static str), ()>,
}

/// In-memory [`GraphStore`] implementation, grounded in the teacher's
/// `petgraph::graph::DiGraph` + `RwLock` pattern.
pub struct InMemoryGraphStore {
    inner: RwLock<Inner>,
}

impl Default for InMemoryGraphStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryGraphStore {
    /// Build an empty graph store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                graph: DiGraph::new(),
                key_to_node: HashMap::new(),
                edge_keys: HashMap::new(),
            }),
        }
    }

    fn edge_kind_tag(kind: EdgeKind) -> &'static str {
        match kind {
            EdgeKind::Contains => "CONTAINS",
            EdgeKind::Imports => "IMPORTS",
            EdgeKind::Defines => "DEFINES",
            EdgeKind::References => "REFERENCES",
        }
    }
}

#[async_trait]
impl GraphStore for InMemoryGraphStore {
    async fn upsert_node(&self, node: GraphNode) -> OmniResult<()> {
        let mut inner = self.inner.write();
        let key = node.key();
        if let Some(&idx) = inner.key_to_node.get(&key) {
            inner.graph[idx] = node;
        } else {
            let idx = inner.graph.add_node(node);
            inner.key_to_node.insert(key, idx);
        }
        Ok(())
    }

    async fn upsert_edge(&self, edge: GraphEdge) -> OmniResult<()> {
        let mut inner = self.inner.write();
        let tag = Self::edge_kind_tag(edge.kind);
        let dedup_key = (edge.from.clone(), edge.to.clone(), tag);
        if inner.edge_keys.contains_key(&dedup_key) {
            return Ok(());
        }
        let from_idx = *inner.key_to_node.get(&edge.from).ok_or_else(|| {
            OmniError::NotFound(format!("graph node not found: {}", edge.from))
        })?;
        let to_idx = *inner.key_to_node.get(&edge.to).ok_or_else(|| {
            OmniError::NotFound(format!("graph node not found: {}", edge.to))
        })?;
        inner.graph.add_edge(from_idx, to_idx, edge);
        inner.edge_keys.insert(dedup_key, ());
        Ok(())
    }

    async fn get_node(&self, key: &str) -> OmniResult<Option<GraphNode>> {
        let inner = self.inner.read();
        Ok(inner.key_to_node.get(key).map(|&idx| inner.graph[idx].clone()))
    }

    async fn contains_children(&self, key: &str) -> OmniResult<Vec<GraphNode>> {
        let inner = self.inner.read();
        let Some(&idx) = inner.key_to_node.get(key) else {
            return Ok(Vec::new());
        };
        let mut children: Vec<GraphNode> = inner
            .graph
            .edges_directed(idx, Direction::Outgoing)
            .filter(|e| matches!(e.weight().kind, EdgeKind::Contains))
            .map(|e| inner.graph[e.target()].clone())
            .collect();
        children.sort_by(|a, b| node_name(a).cmp(node_name(b)));
        Ok(children)
    }

    async fn import_targets(&self, key: &str) -> OmniResult<Vec<String>> {
        let inner = self.inner.read();
        let Some(&idx) = inner.key_to_node.get(key) else {
            return Ok(Vec::new());
        };
        Ok(inner
            .graph
            .edges_directed(idx, Direction::Outgoing)
            .filter(|e| matches!(e.weight().kind, EdgeKind::Imports))
            .map(|e| e.weight().to.clone())
            .collect())
    }

    async fn orphan_files(&self) -> OmniResult<Vec<String>> {
        let inner = self.inner.read();
        let mut orphans = Vec::new();
        for (key, &idx) in &inner.key_to_node {
            if !matches!(inner.graph[idx], GraphNode::File { .. }) {
                continue;
            }
            let has_outgoing_import = inner
                .graph
                .edges_directed(idx, Direction::Outgoing)
                .any(|e| matches!(e.weight().kind, EdgeKind::Imports));
            let has_incoming_import = inner
                .graph
                .edges_directed(idx, Direction::Incoming)
                .any(|e| matches!(e.weight().kind, EdgeKind::Imports));
            if !has_outgoing_import && !has_incoming_import {
                orphans.push(key.clone());
            }
        }
        orphans.sort();
        Ok(orphans)
    }

    async fn entity_count(&self, key: &str) -> OmniResult<u64> {
        let inner = self.inner.read();
        let Some(&idx) = inner.key_to_node.get(key) else {
            return Ok(0);
        };
        Ok(inner
            .graph
            .edges_directed(idx, Direction::Outgoing)
            .filter(|e| matches!(e.weight().kind, EdgeKind::Defines))
            .count() as u64)
    }

    async fn import_count(&self, key: &str) -> OmniResult<u64> {
        let inner = self.inner.read();
        let Some(&idx) = inner.key_to_node.get(key) else {
            return Ok(0);
        };
        Ok(inner
            .graph
            .edges_directed(idx, Direction::Outgoing)
            .filter(|e| matches!(e.weight().kind, EdgeKind::Imports))
            .count() as u64)
    }
}

fn node_name(node: &GraphNode) -> &str {
    match node {
        GraphNode::Project { name, .. } => name,
        GraphNode::Dir { name, .. } => name,
        GraphNode::File { name, .. } => name,
        GraphNode::Entity { name, .. } => name,
        GraphNode::ContextItem { id, .. } => id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project(path: &str) -> GraphNode {
        GraphNode::Project { name: path.into(), path: path.into() }
    }

    fn file(path: &str) -> GraphNode {
        GraphNode::File {
            path: path.into(),
            relative_path: path.into(),
            name: path.rsplit('/').next().unwrap_or(path).into(),
            file_type: "python".into(),
            size: 10,
            entity_count: 0,
            import_count: 0,
            last_modified: "2026-01-01T00:00:00Z".into(),
            file_hash: "h".into(),
            entity_id: None,
        }
    }

    #[tokio::test]
    async fn orphan_detection_matches_scenario_5() {
        let store = InMemoryGraphStore::new();
        store.upsert_node(project("repo")).await.expect("project");
        for path in ["main.py", "utils.py", "orphan.py"] {
            store.upsert_node(file(path)).await.expect("file");
        }
        for path in ["main.py", "utils.py", "orphan.py"] {
            store
                .upsert_edge(GraphEdge {
                    from: "project:repo".into(),
                    to: format!("file:{path}"),
                    kind: EdgeKind::Contains,
                    import_attributes: None,
                })
                .await
                .expect("contains");
        }
        store
            .upsert_edge(GraphEdge {
                from: "file:main.py".into(),
                to: "file:utils.py".into(),
                kind: EdgeKind::Imports,
                import_attributes: Some(ImportAttributes::default()),
            })
            .await
            .expect("imports");

        let orphans = store.orphan_files().await.expect("orphans");
        assert_eq!(orphans, vec!["file:orphan.py".to_string()]);
    }

    #[tokio::test]
    async fn edge_upsert_is_idempotent() {
        let store = InMemoryGraphStore::new();
        store.upsert_node(file("a.py")).await.expect("a");
        store.upsert_node(file("b.py")).await.expect("b");
        for _ in 0..3 {
            store
                .upsert_edge(GraphEdge {
                    from: "file:a.py".into(),
                    to: "file:b.py".into(),
                    kind: EdgeKind::Imports,
                    import_attributes: None,
                })
                .await
                .expect("imports");
        }
        assert_eq!(store.import_count("file:a.py").await.expect("count"), 1);
    }

    #[tokio::test]
    async fn contains_children_sorted_alphabetically() {
        let store = InMemoryGraphStore::new();
        store.upsert_node(project("repo")).await.expect("project");
        for path in ["zebra.py", "alpha.py", "mid.py"] {
            store.upsert_node(file(path)).await.expect("file");
            store
                .upsert_edge(GraphEdge {
                    from: "project:repo".into(),
                    to: format!("file:{path}"),
                    kind: EdgeKind::Contains,
                    import_attributes: None,
                })
                .await
                .expect("contains");
        }
        let children = store.contains_children("project:repo").await.expect("children");
        let names: Vec<&str> = children.iter().map(node_name).collect();
        assert_eq!(names, vec!["alpha.py", "mid.py", "zebra.py"]);
    }
}
