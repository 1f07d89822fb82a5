//! Tree visualisation service (specification §4.10).
//!
//! On a `TREE_VISUALIZATION_REQUESTED` envelope, resolves the `PROJECT`
//! node and recursively walks `CONTAINS` children up to `max_depth`,
//! optionally resolving `IMPORTS` targets for `FILE` children. Any store
//! error on a subtree degrades that subtree to empty children rather than
//! failing the whole request (§4.10 "Failure").

use async_trait::async_trait;
use std::sync::Arc;

use crate::adapters::graph_store::GraphStore;
use crate::envelope::{Envelope, Source};
use crate::error::OmniResult;
use crate::handler::{AtomicHandlerMetrics, DeadLetterReason, Handler, HandlerMetrics, Outcome};
use crate::types::{
    EventPayload, GraphNode, TreeNode, TreeStatistics, TreeVisualizationCompleted, TreeVisualizationFailed,
    TreeVisualizationRequested,
};

const EVENT_TYPE: &str = "omninode.intelligence.event.tree_visualization_requested.v1";
const COMPLETED_TYPE: &str = "omninode.intelligence.event.tree_visualization_completed.v1";
const FAILED_TYPE: &str = "omninode.intelligence.event.tree_visualization_failed.v1";

/// Running totals accumulated while walking the tree.
#[derive(Default)]
struct Accumulator {
    directories: u64,
    files: u64,
    imports: u64,
}

/// The tree visualisation service handler (§4.10).
pub struct TreeVisualizationService {
    graph: Arc<dyn GraphStore>,
    source: Source,
    metrics: AtomicHandlerMetrics,
}

impl TreeVisualizationService {
    /// Build a service bound to the graph store it reads from.
    #[must_use]
    pub fn new(graph: Arc<dyn GraphStore>, source: Source) -> Self {
        Self { graph, source, metrics: AtomicHandlerMetrics::default() }
    }

    fn failure_envelope(&self, parent: &Envelope, code: &str, message: String) -> OmniResult<Envelope> {
        parent.derive(
            FAILED_TYPE,
            EventPayload::TreeVisualizationFailed(TreeVisualizationFailed {
                error_code: code.to_string(),
                error_message: message,
            }),
            self.source.clone(),
        )
    }

    /// Resolve a single node's `CONTAINS` children, recursing until
    /// `remaining_depth` is exhausted. Store errors degrade this subtree to
    /// an empty children list instead of propagating (§4.10 "Failure").
    async fn resolve_children(&self, key: &str, remaining_depth: u32, include_dependencies: bool, totals: &mut Accumulator) -> Vec<TreeNode> {
        if remaining_depth == 0 {
            return Vec::new();
        }
        let Ok(mut children) = self.graph.contains_children(key).await else {
            return Vec::new();
        };
        children.sort_by(|a, b| node_name(a).cmp(node_name(b)));

        let mut nodes = Vec::with_capacity(children.len());
        for child in children {
            let child_key = node_key(&child);
            let kind = node_kind(&child);
            match &child {
                GraphNode::Dir { .. } => totals.directories += 1,
                GraphNode::File { .. } => totals.files += 1,
                _ => {}
            }

            let dependencies = if include_dependencies && matches!(child, GraphNode::File { .. }) {
                let targets = self.graph.import_targets(&child_key).await.unwrap_or_default();
                totals.imports += targets.len() as u64;
                targets
            } else {
                Vec::new()
            };

            let grandchildren = Box::pin(self.resolve_children(&child_key, remaining_depth - 1, include_dependencies, totals)).await;
            nodes.push(TreeNode { name: node_name(&child).to_string(), kind: kind.to_string(), children: grandchildren, dependencies });
        }
        nodes
    }
}

fn node_key(node: &GraphNode) -> String {
    match node {
        GraphNode::Project { path, .. } => format!("project:{path}"),
        GraphNode::Dir { path, .. } => format!("dir:{path}"),
        GraphNode::File { path, .. } => format!("file:{path}"),
        GraphNode::Entity { name, .. } => format!("entity:symbol:{name}"),
        GraphNode::ContextItem { id, .. } => format!("context_item:{id}"),
    }
}

fn node_name(node: &GraphNode) -> &str {
    match node {
        GraphNode::Project { name, .. } | GraphNode::Dir { name, .. } | GraphNode::File { name, .. } | GraphNode::Entity { name, .. } => name,
        GraphNode::ContextItem { id, .. } => id,
    }
}

fn node_kind(node: &GraphNode) -> &'static str {
    match node {
        GraphNode::Project { .. } => "project",
        GraphNode::Dir { .. } => "dir",
        GraphNode::File { .. } => "file",
        GraphNode::Entity { .. } => "entity",
        GraphNode::ContextItem { .. } => "context_item",
    }
}

#[async_trait]
impl Handler for TreeVisualizationService {
    fn name(&self) -> &str {
        "tree_visualization_service"
    }

    fn can_handle(&self, event_type: &str) -> bool {
        event_type == EVENT_TYPE
    }

    async fn handle(&self, envelope: Envelope) -> OmniResult<Outcome> {
        self.metrics.record_invocation();
        let EventPayload::TreeVisualizationRequested(req) = &envelope.payload else {
            self.metrics.record_dead_letter();
            return Ok(Outcome::DeadLetter(DeadLetterReason::new(
                "MALFORMED_ENVELOPE",
                "expected a TreeVisualizationRequested payload",
            )));
        };
        let TreeVisualizationRequested { project_name, max_depth, include_dependencies } = req;

        let project_key = format!("project:{project_name}");
        let root_node = match self.graph.get_node(&project_key).await {
            Ok(Some(node)) => node,
            Ok(None) => {
                let failure = self.failure_envelope(
                    &envelope,
                    "PROJECT_NOT_FOUND",
                    format!("no project named '{project_name}' is indexed"),
                )?;
                self.metrics.record_ack();
                return Ok(Outcome::Ack(vec![failure]));
            }
            Err(_) => {
                let failure = self.failure_envelope(
                    &envelope,
                    "PROJECT_NOT_FOUND",
                    format!("failed to resolve project '{project_name}'"),
                )?;
                self.metrics.record_ack();
                return Ok(Outcome::Ack(vec![failure]));
            }
        };

        let mut totals = Accumulator::default();
        let children = self.resolve_children(&project_key, *max_depth, *include_dependencies, &mut totals).await;
        let root = TreeNode { name: node_name(&root_node).to_string(), kind: node_kind(&root_node).to_string(), children, dependencies: Vec::new() };

        let statistics = TreeStatistics {
            directories: totals.directories,
            files: totals.files,
            imports: totals.imports,
            total_nodes: totals.directories + totals.files + 1,
        };

        let completed = envelope.derive(
            COMPLETED_TYPE,
            EventPayload::TreeVisualizationCompleted(TreeVisualizationCompleted { root, statistics }),
            self.source.clone(),
        )?;
        self.metrics.record_ack();
        Ok(Outcome::Ack(vec![completed]))
    }

    fn get_metrics(&self) -> HandlerMetrics {
        self.metrics.snapshot()
    }
}
