//! The idempotent context-item writer (specification §4.8) — the lowest
//! level write primitive mapping each embedded chunk to a
//! `{CREATED | UPDATED | SKIPPED | FAILED}` outcome against the three
//! backing stores, based on positional identity and content fingerprints.

use globset::Glob;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use crate::adapters::graph_store::{GraphEdge, GraphStore};
use crate::adapters::relational_store::{NewContextItem, RelationalStore};
use crate::adapters::vector_store::VectorStore;
use crate::config::BootstrapConfig;
use crate::envelope::{Envelope, Source};
use crate::types::{
    BootstrapTier, BootstrapTierKind, ChunkPosition, ContextBatchIndexed, EdgeKind, EmbeddedChunk,
    EventPayload, GraphNode, WriteOutcome,
};

/// Name of the vector-store collection context items are written to.
pub const CONTEXT_ITEM_COLLECTION: &str = "context_items";

/// Per-chunk result recorded in a [`WriteBatchResult`].
#[derive(Debug, Clone)]
pub struct ChunkWriteResult {
    /// Positional identity of the chunk.
    pub position: ChunkPosition,
    /// The outcome this chunk was classified as.
    pub outcome: WriteOutcome,
    /// Relational-store item id, if the write succeeded (absent on
    /// `FAILED`).
    pub item_id: Option<String>,
    /// Bootstrap tier assigned via first-match glob over `source_ref`
    /// (§3.5, §4.8 step 4).
    pub bootstrap_tier: BootstrapTier,
}

/// Immutable output of a single [`ContextItemWriter::write_batch`] call
/// (§4.8 "Output model is immutable").
#[derive(Debug, Clone)]
pub struct WriteBatchResult {
    /// Count of `CREATED` outcomes.
    pub items_created: u64,
    /// Count of `UPDATED` outcomes.
    pub items_updated: u64,
    /// Count of `SKIPPED` outcomes.
    pub items_skipped: u64,
    /// Count of `FAILED` outcomes.
    pub items_failed: u64,
    /// Total chunks processed.
    pub total_chunks: u64,
    /// Whether the post-write `document_indexed` event was successfully
    /// published (§4.8 "Post-write event").
    pub event_emitted: bool,
    /// Per-chunk results, in input order.
    pub chunks: Vec<ChunkWriteResult>,
}

impl WriteBatchResult {
    /// Relational-store item ids touched by `CREATED` or `UPDATED`
    /// outcomes, in input order (feeds `DocumentIndexCompleted.entity_ids`
    /// / `vector_ids`, §3.2).
    #[must_use]
    pub fn touched_item_ids(&self) -> Vec<String> {
        self.chunks.iter().filter_map(|c| c.item_id.clone()).collect()
    }
}

/// First-match-wins glob classifier for bootstrap tiers (§3.5, §9 Open
/// Question — confidence values are configurable per deployment).
pub struct BootstrapClassifier {
    rules: Vec<(globset::GlobMatcher, BootstrapTier)>,
}

impl BootstrapClassifier {
    /// Compile the classifier from configuration. Malformed glob patterns
    /// are skipped rather than rejected, since they cannot invalidate an
    /// otherwise-healthy deployment; each is logged.
    #[must_use]
    pub fn from_config(config: &BootstrapConfig) -> Self {
        let rules = config
            .tiers
            .iter()
            .filter_map(|rule| {
                let glob = match Glob::new(&rule.pattern) {
                    Ok(g) => g,
                    Err(e) => {
                        tracing::warn!(pattern = %rule.pattern, error = %e, "skipping malformed bootstrap glob");
                        return None;
                    }
                };
                let tier = match rule.tier.as_str() {
                    "validated" => BootstrapTierKind::Validated,
                    _ => BootstrapTierKind::Quarantine,
                };
                Some((glob.compile_matcher(), BootstrapTier { tier, confidence: rule.confidence }))
            })
            .collect();
        Self { rules }
    }

    /// Classify `source_ref`, returning the default (`QUARANTINE`,
    /// confidence 0.0) if nothing matches (§3.5).
    #[must_use]
    pub fn classify(&self, source_ref: &str) -> BootstrapTier {
        self.rules
            .iter()
            .find(|(matcher, _)| matcher.is_match(source_ref))
            .map(|(_, tier)| *tier)
            .unwrap_or_default()
    }
}

/// The idempotent context-item writer (§4.8).
pub struct ContextItemWriter {
    relational: Arc<dyn RelationalStore>,
    vector: Arc<dyn VectorStore>,
    graph: Arc<dyn GraphStore>,
    classifier: BootstrapClassifier,
    source: Source,
}

impl ContextItemWriter {
    /// Build a writer over the three backing stores.
    #[must_use]
    pub fn new(
        relational: Arc<dyn RelationalStore>,
        vector: Arc<dyn VectorStore>,
        graph: Arc<dyn GraphStore>,
        bootstrap: &BootstrapConfig,
        source: Source,
    ) -> Self {
        Self {
            relational,
            vector,
            graph,
            classifier: BootstrapClassifier::from_config(bootstrap),
            source,
        }
    }

    /// Write a batch of chunks sequentially (§4.8 "Ordering": chunks are
    /// processed sequentially within a batch to keep positional conflicts
    /// deterministic). Batches for disjoint `source_ref`s may run
    /// concurrently at the caller's discretion.
    ///
    /// `emit_event`, when true, publishes a `document_indexed` envelope
    /// derived from `parent` once the batch is written; emission failures
    /// are non-blocking and only clear `event_emitted`, never the
    /// counters (§4.8).
    pub async fn write_batch(
        &self,
        chunks: Vec<EmbeddedChunk>,
        emit_event: bool,
        parent: Option<&Envelope>,
        publish: Option<&(dyn Fn(Envelope) -> bool + Send + Sync)>,
    ) -> WriteBatchResult {
        let mut result = WriteBatchResult {
            items_created: 0,
            items_updated: 0,
            items_skipped: 0,
            items_failed: 0,
            total_chunks: chunks.len() as u64,
            event_emitted: false,
            chunks: Vec::with_capacity(chunks.len()),
        };

        for chunk in chunks {
            let bootstrap_tier = self.classifier.classify(&chunk.position.source_ref);
            let (outcome, item_id) = self.write_one(&chunk).await;
            match outcome {
                WriteOutcome::Created => result.items_created += 1,
                WriteOutcome::Updated => result.items_updated += 1,
                WriteOutcome::Skipped => result.items_skipped += 1,
                WriteOutcome::Failed => result.items_failed += 1,
            }
            result.chunks.push(ChunkWriteResult {
                position: chunk.position,
                outcome,
                item_id,
                bootstrap_tier,
            });
        }

        if emit_event {
            result.event_emitted = self.try_emit(&result, parent, publish);
        }

        result
    }

    /// Write a single chunk end-to-end (§4.8 steps 1-3), classifying it as
    /// `CREATED`, `UPDATED`, `SKIPPED`, or `FAILED`.
    async fn write_one(&self, chunk: &EmbeddedChunk) -> (WriteOutcome, Option<String>) {
        if let Err(e) = chunk.validate() {
            tracing::warn!(error = %e, "chunk failed validation, marking FAILED");
            return (WriteOutcome::Failed, None);
        }

        let pos = &chunk.position;
        let existing = match self
            .relational
            .lookup_by_position(&pos.source_ref, pos.character_offset_start, pos.character_offset_end)
            .await
        {
            Ok(row) => row,
            Err(e) => {
                tracing::warn!(error = %e, source_ref = %pos.source_ref, "relational lookup failed");
                return (WriteOutcome::Failed, None);
            }
        };

        match existing {
            None => self.write_created(chunk).await,
            Some(row) if row.fingerprint == chunk.content_fingerprint => {
                (WriteOutcome::Skipped, Some(row.item_id))
            }
            Some(row) => self.write_updated(chunk, row.item_id).await,
        }
    }

    async fn write_created(&self, chunk: &EmbeddedChunk) -> (WriteOutcome, Option<String>) {
        let item_id = Uuid::new_v4().to_string();
        let pos = &chunk.position;

        if let Err(e) = self
            .relational
            .insert_item(NewContextItem {
                item_id: item_id.clone(),
                source_ref: pos.source_ref.clone(),
                character_offset_start: pos.character_offset_start,
                character_offset_end: pos.character_offset_end,
                fingerprint: chunk.content_fingerprint.clone(),
                version_hash: chunk.version_hash.clone(),
            })
            .await
        {
            tracing::warn!(error = %e, item_id, "relational insert failed");
            return (WriteOutcome::Failed, None);
        }

        if self.upsert_vector_and_graph(chunk, &item_id).await.is_err() {
            return (WriteOutcome::Failed, Some(item_id));
        }

        (WriteOutcome::Created, Some(item_id))
    }

    async fn write_updated(&self, chunk: &EmbeddedChunk, item_id: String) -> (WriteOutcome, Option<String>) {
        if let Err(e) = self
            .relational
            .update_item_fingerprint(&item_id, &chunk.content_fingerprint, &chunk.version_hash)
            .await
        {
            tracing::warn!(error = %e, item_id, "relational update failed");
            return (WriteOutcome::Failed, Some(item_id));
        }

        if self.upsert_vector_and_graph(chunk, &item_id).await.is_err() {
            return (WriteOutcome::Failed, Some(item_id));
        }

        (WriteOutcome::Updated, Some(item_id))
    }

    async fn upsert_vector_and_graph(&self, chunk: &EmbeddedChunk, item_id: &str) -> Result<(), ()> {
        let payload = json!({
            "source_ref": chunk.position.source_ref,
            "crawl_scope": chunk.crawl_scope,
            "item_type": chunk.item_type,
        });
        if let Err(e) = self
            .vector
            .upsert_point(CONTEXT_ITEM_COLLECTION, item_id, chunk.embedding.clone(), payload)
            .await
        {
            tracing::warn!(error = %e, item_id, "vector upsert failed");
            return Err(());
        }

        let item_node = GraphNode::ContextItem {
            id: item_id.to_string(),
            source_ref: chunk.position.source_ref.clone(),
        };
        let item_key = item_node.key();
        if let Err(e) = self.graph.upsert_node(item_node).await {
            tracing::warn!(error = %e, item_id, "graph node upsert failed");
            return Err(());
        }

        let source_key = format!("file:{}", chunk.position.source_ref);
        if let Err(e) = self
            .graph
            .upsert_edge(GraphEdge {
                from: item_key,
                to: source_key,
                kind: EdgeKind::References,
                import_attributes: None,
            })
            .await
        {
            tracing::warn!(error = %e, item_id, "graph edge upsert failed");
            return Err(());
        }

        Ok(())
    }

    fn try_emit(
        &self,
        result: &WriteBatchResult,
        parent: Option<&Envelope>,
        publish: Option<&(dyn Fn(Envelope) -> bool + Send + Sync)>,
    ) -> bool {
        let Some(first_source_ref) = result.chunks.first().map(|c| c.position.source_ref.clone()) else {
            return false;
        };
        let payload = EventPayload::ContextBatchIndexed(ContextBatchIndexed {
            source_ref: first_source_ref,
            items_created: result.items_created,
            items_updated: result.items_updated,
            items_skipped: result.items_skipped,
            items_failed: result.items_failed,
        });

        let envelope = match parent {
            Some(parent) => parent.derive("omninode.intelligence.event.document_indexed.v1", payload, self.source.clone()),
            None => Envelope::originate(
                "omninode.intelligence.event.document_indexed.v1",
                Uuid::new_v4(),
                self.source.clone(),
                payload,
            ),
        };

        match (envelope, publish) {
            (Ok(envelope), Some(publish)) => publish(envelope),
            _ => false,
        }
    }
}
