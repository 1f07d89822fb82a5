//! Document indexer orchestrator (specification §4.7).
//!
//! On `DOCUMENT_INDEX_REQUESTED`, fans out to metadata stamping, entity
//! extraction, embedding generation, knowledge-graph upsert, and quality
//! assessment, each behind its own circuit breaker, then reduces the
//! results to a single `DOCUMENT_INDEX_COMPLETED` (or `_FAILED`) envelope.
//! Vector/graph upsert are the only critical sub-calls (§4.7 step 4); a
//! failure anywhere else degrades gracefully into `failed_service` /
//! `partial_results`.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::Semaphore;

use crate::adapters::embedding_service::EmbeddingService;
use crate::adapters::graph_store::{GraphEdge, GraphStore};
use crate::config::IndexerConfig;
use crate::domain::classify_language;
use crate::domain::context_writer::ContextItemWriter;
use crate::envelope::{Envelope, Source};
use crate::error::{OmniError, OmniResult};
use crate::fingerprint::{content_fingerprint, document_hash, version_hash};
use crate::handler::{AtomicHandlerMetrics, DeadLetterReason, Handler, HandlerMetrics, Outcome};
use crate::resilience::CircuitBreakerRegistry;
use crate::types::{
    ChunkPosition, DocumentIndexCompleted, DocumentIndexFailed, DocumentIndexRequested,
    EdgeKind, EmbeddedChunk, EventPayload, GraphNode, ItemType, ServiceTimings,
};

const EVENT_TYPE: &str = "omninode.intelligence.event.document_index_requested.v1";
const COMPLETED_TYPE: &str = "omninode.intelligence.event.document_index_completed.v1";
const FAILED_TYPE: &str = "omninode.intelligence.event.document_index_failed.v1";

/// The document indexer orchestrator handler (§4.7).
pub struct DocumentIndexer {
    graph: Arc<dyn GraphStore>,
    writer: Arc<ContextItemWriter>,
    embedding: Arc<dyn EmbeddingService>,
    breakers: Arc<CircuitBreakerRegistry>,
    config: IndexerConfig,
    semaphore: Arc<Semaphore>,
    source: Source,
    metrics: AtomicHandlerMetrics,
}

impl DocumentIndexer {
    /// Build an indexer bound to its collaborators and fan-out bound.
    #[must_use]
    pub fn new(
        graph: Arc<dyn GraphStore>,
        writer: Arc<ContextItemWriter>,
        embedding: Arc<dyn EmbeddingService>,
        breakers: Arc<CircuitBreakerRegistry>,
        config: IndexerConfig,
        source: Source,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_documents.max(1)));
        Self { graph, writer, embedding, breakers, config, semaphore, source, metrics: AtomicHandlerMetrics::default() }
    }

    fn failed_envelope(
        &self,
        parent: &Envelope,
        error_code: &str,
        error_message: String,
        retry_allowed: bool,
        elapsed_ms: f64,
        failed_service: Option<String>,
    ) -> OmniResult<Envelope> {
        parent.derive(
            FAILED_TYPE,
            EventPayload::DocumentIndexFailed(DocumentIndexFailed {
                error_message,
                error_code: error_code.to_string(),
                retry_allowed,
                processing_time_ms: elapsed_ms,
                failed_service,
                partial_results: None,
            }),
            self.source.clone(),
        )
    }
}

#[async_trait]
impl Handler for DocumentIndexer {
    fn name(&self) -> &str {
        "document_indexer"
    }

    fn can_handle(&self, event_type: &str) -> bool {
        event_type == EVENT_TYPE
    }

    async fn handle(&self, envelope: Envelope) -> OmniResult<Outcome> {
        self.metrics.record_invocation();
        let start = Instant::now();

        let EventPayload::DocumentIndexRequested(req) = &envelope.payload else {
            self.metrics.record_dead_letter();
            return Ok(Outcome::DeadLetter(DeadLetterReason::new(
                "MALFORMED_ENVELOPE",
                "document_index_requested payload missing",
            )));
        };

        let content = match &req.content {
            Some(content) if !req.source_path.is_empty() => content,
            _ => {
                let failure = self.failed_envelope(
                    &envelope,
                    "INVALID_INPUT",
                    "source_path must be non-empty and content must be present".to_string(),
                    false,
                    elapsed_ms(start),
                    None,
                )?;
                self.metrics.record_ack();
                return Ok(Outcome::Ack(vec![failure]));
            }
        };

        let _permit = self.semaphore.acquire().await.map_err(|_| {
            OmniError::Internal("document indexer semaphore closed unexpectedly".into())
        })?;

        let language = classify_language(&req.source_path);
        let chunks = chunk_content(content, req.indexing_options.chunk_size, req.indexing_options.chunk_overlap);
        if chunks.is_empty() {
            let failure = self.failed_envelope(
                &envelope,
                "INVALID_INPUT",
                "content yielded no chunks".to_string(),
                false,
                elapsed_ms(start),
                None,
            )?;
            self.metrics.record_ack();
            return Ok(Outcome::Ack(vec![failure]));
        }

        let mut timings: ServiceTimings = ServiceTimings::new();

        // Critical: metadata stamping + FILE node upsert (§4.7 "vector or
        // graph upsert" critical path covers this write).
        let metadata_start = Instant::now();
        let metadata_result = self
            .breakers
            .get_or_create("document_indexer:graph")
            .call(|| self.upsert_file_node(req, content, &language))
            .await;
        timings.insert("metadata_stamping".to_string(), elapsed_ms(metadata_start));
        if let Err(e) = metadata_result {
            let failure = self.failed_envelope(
                &envelope,
                "INTERNAL_ERROR",
                e.to_string(),
                e.kind().retry_allowed(),
                elapsed_ms(start),
                Some("graph_upsert".to_string()),
            )?;
            self.metrics.record_ack();
            return Ok(Outcome::Ack(vec![failure]));
        }

        // Non-critical: entity extraction (§4.7 "unsupported language").
        let entity_start = Instant::now();
        let entity_outcome = self
            .breakers
            .get_or_create("document_indexer:entity_extraction")
            .call(|| extract_entities(&language, content))
            .await;
        timings.insert("entity_extraction".to_string(), elapsed_ms(entity_start));
        let (entities, entity_failure) = match entity_outcome {
            Ok(entities) => (entities, None),
            Err(e) => (Vec::new(), Some(("entity_extraction".to_string(), e))),
        };

        let mut relationships_created = 0u64;
        if !entities.is_empty() {
            for entity in &entities {
                let node = GraphNode::Entity { name: entity.clone(), entity_type: "symbol".to_string() };
                if self.graph.upsert_node(node).await.is_ok()
                    && self
                        .graph
                        .upsert_edge(GraphEdge {
                            from: format!("file:{}", req.source_path),
                            to: format!("entity:symbol:{entity}"),
                            kind: EdgeKind::Defines,
                            import_attributes: None,
                        })
                        .await
                        .is_ok()
                {
                    relationships_created += 1;
                }
            }
        }

        // Non-critical: quality assessment.
        let quality_start = Instant::now();
        let quality_outcome = if req.indexing_options.skip_quality_assessment {
            Ok(None)
        } else {
            self.breakers
                .get_or_create("document_indexer:quality")
                .call(|| assess_quality(content))
                .await
                .map(Some)
        };
        timings.insert("quality_assessment".to_string(), elapsed_ms(quality_start));
        let (quality_score, quality_failure) = match quality_outcome {
            Ok(score) => (score, None),
            Err(e) => (None, Some(("quality_assessment".to_string(), e))),
        };

        // Critical: embedding generation, feeding the context-item writer's
        // vector upsert.
        let embedding_start = Instant::now();
        let mut embedded_chunks = Vec::with_capacity(chunks.len());
        let mut embedding_failure: Option<OmniError> = None;
        if req.indexing_options.skip_embeddings {
            for c in &chunks {
                embedded_chunks.push(build_chunk(req, c, vec![], envelope.correlation_id));
            }
        } else {
            for c in &chunks {
                match self
                    .breakers
                    .get_or_create("document_indexer:embedding")
                    .call(|| self.embedding.embed(&c.text))
                    .await
                {
                    Ok(vector) => embedded_chunks.push(build_chunk(req, c, vector, envelope.correlation_id)),
                    Err(e) => {
                        embedding_failure = Some(e);
                        break;
                    }
                }
            }
        }
        timings.insert("embedding_generation".to_string(), elapsed_ms(embedding_start));

        if let Some(e) = embedding_failure {
            let failure = self.failed_envelope(
                &envelope,
                "INTERNAL_ERROR",
                e.to_string(),
                e.kind().retry_allowed(),
                elapsed_ms(start),
                Some("embedding".to_string()),
            )?;
            self.metrics.record_ack();
            return Ok(Outcome::Ack(vec![failure]));
        }

        // Critical: context-item writer (vector + relational + graph upsert).
        let writer_start = Instant::now();
        let fingerprints: Vec<(u64, String)> = embedded_chunks
            .iter()
            .map(|c| (c.position.character_offset_start, c.content_fingerprint.clone()))
            .collect();
        let write_result = self.writer.write_batch(embedded_chunks, false, None, None).await;
        timings.insert("context_write".to_string(), elapsed_ms(writer_start));

        if write_result.items_failed > 0 && write_result.items_created == 0 && write_result.items_updated == 0 {
            let failure = self.failed_envelope(
                &envelope,
                "INTERNAL_ERROR",
                "all chunks failed to write".to_string(),
                true,
                elapsed_ms(start),
                Some("context_write".to_string()),
            )?;
            self.metrics.record_ack();
            return Ok(Outcome::Ack(vec![failure]));
        }

        let doc_hash = document_hash(fingerprints.iter().map(|(start, fp)| (*start, fp.as_str())));
        let touched_ids = write_result.touched_item_ids();

        let (failed_service, partial_results) = entity_failure
            .or(quality_failure)
            .map(|(service, err)| {
                (Some(service), Some(serde_json::json!({ "error": err.to_string() })))
            })
            .unwrap_or((None, None));

        let completed = envelope.derive(
            COMPLETED_TYPE,
            EventPayload::DocumentIndexCompleted(DocumentIndexCompleted {
                document_hash: doc_hash,
                entity_ids: touched_ids.clone(),
                vector_ids: touched_ids,
                entities_extracted: entities.len() as u64,
                relationships_created,
                chunks_indexed: write_result.total_chunks,
                processing_time_ms: elapsed_ms(start),
                service_timings: timings,
                quality_score,
                onex_compliance: None,
                cache_hit: false,
                failed_service,
                partial_results,
            }),
            self.source.clone(),
        )?;

        self.metrics.record_ack();
        Ok(Outcome::Ack(vec![completed]))
    }

    fn get_metrics(&self) -> HandlerMetrics {
        self.metrics.snapshot()
    }
}

impl DocumentIndexer {
    async fn upsert_file_node(
        &self,
        req: &DocumentIndexRequested,
        content: &str,
        language: &str,
    ) -> OmniResult<()> {
        let name = req.source_path.rsplit('/').next().unwrap_or(&req.source_path).to_string();
        let file_hash = content_fingerprint(content);
        let last_modified = OffsetDateTime::now_utc()
            .format(&time::format_description::well_known::Rfc3339)
            .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string());
        self.graph
            .upsert_node(GraphNode::File {
                path: req.source_path.clone(),
                relative_path: req.source_path.clone(),
                name,
                file_type: language.to_string(),
                size: content.len() as u64,
                entity_count: 0,
                import_count: 0,
                last_modified,
                file_hash,
                entity_id: None,
            })
            .await
    }
}

struct ChunkSpec {
    start: u64,
    end: u64,
    text: String,
}

/// Split `content` into overlapping character-offset windows (§4.7 step 2
/// feeds §4.8's positional chunking).
fn chunk_content(content: &str, chunk_size: usize, overlap: usize) -> Vec<ChunkSpec> {
    let chars: Vec<char> = content.chars().collect();
    if chars.is_empty() {
        return Vec::new();
    }
    let chunk_size = chunk_size.max(1);
    let step = chunk_size.saturating_sub(overlap).max(1);

    let mut chunks = Vec::new();
    let mut start = 0usize;
    while start < chars.len() {
        let end = (start + chunk_size).min(chars.len());
        let text: String = chars[start..end].iter().collect();
        if !text.trim().is_empty() {
            chunks.push(ChunkSpec { start: start as u64, end: end as u64, text });
        }
        if end == chars.len() {
            break;
        }
        start += step;
    }
    chunks
}

fn build_chunk(
    req: &DocumentIndexRequested,
    spec: &ChunkSpec,
    embedding: Vec<f32>,
    correlation_id: uuid::Uuid,
) -> EmbeddedChunk {
    EmbeddedChunk {
        content: spec.text.clone(),
        item_type: ItemType::CodeBlock,
        content_fingerprint: content_fingerprint(&spec.text),
        version_hash: version_hash(&[&req.source_path, req.commit_sha.as_deref().unwrap_or("")]),
        position: ChunkPosition {
            source_ref: req.source_path.clone(),
            character_offset_start: spec.start,
            character_offset_end: spec.end,
        },
        crawl_scope: "default".to_string(),
        embedding,
        correlation_id,
    }
}

/// Heuristic top-level entity extraction per language. Returns an error for
/// languages with no recognised declaration syntax, matching the spec's
/// "entity extraction for an unsupported language" non-critical failure.
async fn extract_entities(language: &str, content: &str) -> OmniResult<Vec<String>> {
    let markers: &[&str] = match language {
        "rust" => &["fn ", "struct ", "enum ", "trait "],
        "python" => &["def ", "class "],
        "typescript" | "javascript" => &["function ", "class ", "const ", "export function "],
        "go" => &["func ", "type "],
        "java" | "csharp" => &["class ", "interface "],
        _ => return Err(OmniError::Validation(format!("unsupported language for entity extraction: {language}"))),
    };

    let mut names = Vec::new();
    for line in content.lines() {
        let trimmed = line.trim_start();
        for marker in markers {
            if let Some(rest) = trimmed.strip_prefix(marker) {
                if let Some(name) = extract_identifier(rest) {
                    names.push(name);
                }
                break;
            }
        }
    }
    Ok(names)
}

fn extract_identifier(rest: &str) -> Option<String> {
    let ident: String = rest
        .chars()
        .take_while(|c| c.is_alphanumeric() || *c == '_')
        .collect();
    if ident.is_empty() {
        None
    } else {
        Some(ident)
    }
}

/// Heuristic quality score in `[0.0, 1.0]`: longer, non-trivial content
/// scores higher, capping out at 2000 characters.
async fn assess_quality(content: &str) -> OmniResult<f64> {
    let len = content.trim().len();
    Ok((len as f64 / 2000.0).min(1.0))
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}
