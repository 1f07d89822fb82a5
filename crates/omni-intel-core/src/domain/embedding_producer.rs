//! Embedding batch producer (specification §4.9).
//!
//! Unlike the other domain components this one is not wired to a single
//! envelope type: it is invoked directly by the `backfill` operation (§6)
//! to re-embed a set of files outside the normal fan-out path, with its
//! own rate limiting, skip policy, and retry behaviour.

use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::adapters::embedding_service::EmbeddingService;
use crate::config::EmbeddingConfig;
use crate::domain::classify_language;
use crate::domain::context_writer::ContextItemWriter;
use crate::error::OmniError;
use crate::fingerprint::{content_fingerprint, version_hash};
use crate::resilience::{Retryability, RetryPolicy};
use crate::types::{ChunkPosition, EmbeddedChunk, ItemType};

/// A single file queued for (re-)embedding.
#[derive(Debug, Clone)]
pub struct FileToEmbed {
    /// Canonical path within the repository.
    pub source_ref: String,
    /// Raw file bytes, checked for a valid UTF-8 decode before embedding.
    pub bytes: Vec<u8>,
    /// Crawl namespace string carried onto the resulting chunk.
    pub crawl_scope: String,
    /// Correlation id of the originating chain.
    pub correlation_id: Uuid,
}

/// Aggregate counters for one [`EmbeddingBatchProducer::run`] call (§4.9).
#[derive(Debug, Clone, Copy, Default)]
pub struct EmbeddingBatchSummary {
    /// Files successfully embedded.
    pub embedded: u64,
    /// Files skipped for exceeding `max_file_bytes`.
    pub skipped_too_large: u64,
    /// Files skipped for failing UTF-8 decode.
    pub skipped_binary: u64,
    /// Files whose embedding request failed after retries.
    pub failed_embedding: u64,
    /// Context items created by the downstream writer.
    pub items_created: u64,
    /// Context items updated by the downstream writer.
    pub items_updated: u64,
    /// Context items skipped by the downstream writer.
    pub items_skipped: u64,
    /// Context items that failed to write.
    pub items_failed: u64,
}

/// The embedding batch producer (§4.9): rate-limited, retrying, and
/// skip-aware, feeding its output to the context-item writer in batches.
pub struct EmbeddingBatchProducer {
    embedding: Arc<dyn EmbeddingService>,
    writer: Arc<ContextItemWriter>,
    config: EmbeddingConfig,
    semaphore: Arc<Semaphore>,
    retry: RetryPolicy,
}

impl EmbeddingBatchProducer {
    /// Build a producer bound to its collaborators and rate-limit bounds.
    #[must_use]
    pub fn new(embedding: Arc<dyn EmbeddingService>, writer: Arc<ContextItemWriter>, config: EmbeddingConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        let retry = RetryPolicy::new(
            config.max_retries.max(1),
            std::time::Duration::from_millis(200),
            std::time::Duration::from_secs(10),
        );
        Self { embedding, writer, config, semaphore, retry }
    }

    /// Embed and write every file in `files`, applying the skip policy,
    /// concurrency cap, and inter-request delay (§4.9).
    pub async fn run(&self, files: Vec<FileToEmbed>) -> EmbeddingBatchSummary {
        let mut summary = EmbeddingBatchSummary::default();
        let mut join_set = JoinSet::new();

        for file in files {
            if file.bytes.len() as u64 > self.config.max_file_bytes {
                summary.skipped_too_large += 1;
                continue;
            }
            let content = match String::from_utf8(file.bytes) {
                Ok(content) => content,
                Err(_) => {
                    summary.skipped_binary += 1;
                    continue;
                }
            };

            let embedding = Arc::clone(&self.embedding);
            let semaphore = Arc::clone(&self.semaphore);
            let retry = self.retry;
            let delay = self.config.inter_request_delay();
            let source_ref = file.source_ref.clone();
            let crawl_scope = file.crawl_scope.clone();
            let correlation_id = file.correlation_id;

            join_set.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                tokio::time::sleep(delay).await;
                let result = retry
                    .run(
                        |_attempt| embedding.embed(&content),
                        |e: &OmniError| {
                            if e.kind().retry_allowed() {
                                Retryability::Retryable
                            } else {
                                Retryability::Fatal
                            }
                        },
                    )
                    .await;
                (source_ref, crawl_scope, correlation_id, content, result)
            });
        }

        let mut pending = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            let Ok((source_ref, crawl_scope, correlation_id, content, result)) = joined else {
                summary.failed_embedding += 1;
                continue;
            };
            match result {
                Ok(vector) => {
                    summary.embedded += 1;
                    pending.push(build_chunk(&source_ref, &content, &crawl_scope, vector, correlation_id));
                    if pending.len() >= self.config.batch_size {
                        let batch = std::mem::take(&mut pending);
                        self.flush(&mut summary, batch).await;
                    }
                }
                Err(_) => summary.failed_embedding += 1,
            }
        }
        if !pending.is_empty() {
            self.flush(&mut summary, pending).await;
        }

        summary
    }

    async fn flush(&self, summary: &mut EmbeddingBatchSummary, batch: Vec<EmbeddedChunk>) {
        let result = self.writer.write_batch(batch, false, None, None).await;
        summary.items_created += result.items_created;
        summary.items_updated += result.items_updated;
        summary.items_skipped += result.items_skipped;
        summary.items_failed += result.items_failed;
    }
}

fn build_chunk(
    source_ref: &str,
    content: &str,
    crawl_scope: &str,
    embedding: Vec<f32>,
    correlation_id: Uuid,
) -> EmbeddedChunk {
    let item_type = if classify_language(source_ref) == "markdown" {
        ItemType::DocExcerpt
    } else {
        ItemType::CodeBlock
    };
    EmbeddedChunk {
        content: content.to_string(),
        item_type,
        content_fingerprint: content_fingerprint(content),
        version_hash: version_hash(&[source_ref]),
        position: ChunkPosition {
            source_ref: source_ref.to_string(),
            character_offset_start: 0,
            character_offset_end: content.chars().count() as u64,
        },
        crawl_scope: crawl_scope.to_string(),
        embedding,
        correlation_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::embedding_service::DeterministicEmbeddingService;
    use crate::adapters::graph_store::InMemoryGraphStore;
    use crate::adapters::relational_store::SqliteRelationalStore;
    use crate::adapters::vector_store::InMemoryVectorStore;
    use crate::config::BootstrapConfig;
    use crate::envelope::Source;
    use std::sync::Arc;

    async fn writer_with_seeded_files(paths: &[&str]) -> Arc<ContextItemWriter> {
        let graph: Arc<dyn crate::adapters::graph_store::GraphStore> = Arc::new(InMemoryGraphStore::new());
        let writer = Arc::new(ContextItemWriter::new(
            Arc::new(SqliteRelationalStore::open_in_memory().expect("open")),
            Arc::new(InMemoryVectorStore::new()),
            graph.clone(),
            &BootstrapConfig::default(),
            Source { service: "embedding-test".into(), instance_id: "1".into() },
        ));
        for path in paths {
            graph
                .upsert_node(crate::types::GraphNode::File {
                    path: (*path).to_string(),
                    relative_path: (*path).to_string(),
                    name: (*path).to_string(),
                    file_type: "python".into(),
                    size: 10,
                    entity_count: 0,
                    import_count: 0,
                    last_modified: "2026-01-01T00:00:00Z".into(),
                    file_hash: "h".into(),
                    entity_id: None,
                })
                .await
                .expect("seed file node");
        }
        writer
    }

    async fn producer(paths: &[&str]) -> EmbeddingBatchProducer {
        EmbeddingBatchProducer::new(
            Arc::new(DeterministicEmbeddingService),
            writer_with_seeded_files(paths).await,
            EmbeddingConfig { inter_request_delay_ms: 0, batch_size: 10, ..EmbeddingConfig::default() },
        )
    }

    #[tokio::test]
    async fn embeds_and_writes_small_text_files() {
        let files = vec![
            FileToEmbed { source_ref: "a.py".into(), bytes: b"x = 1".to_vec(), crawl_scope: "default".into(), correlation_id: Uuid::new_v4() },
            FileToEmbed { source_ref: "b.py".into(), bytes: b"y = 2".to_vec(), crawl_scope: "default".into(), correlation_id: Uuid::new_v4() },
        ];
        let summary = producer(&["a.py", "b.py"]).await.run(files).await;
        assert_eq!(summary.embedded, 2);
        assert_eq!(summary.items_created, 2);
        assert_eq!(summary.skipped_too_large, 0);
        assert_eq!(summary.skipped_binary, 0);
    }

    #[tokio::test]
    async fn skips_oversized_files() {
        let producer = EmbeddingBatchProducer::new(
            Arc::new(DeterministicEmbeddingService),
            writer_with_seeded_files(&["big.py"]).await,
            EmbeddingConfig { max_file_bytes: 4, inter_request_delay_ms: 0, ..EmbeddingConfig::default() },
        );
        let files = vec![FileToEmbed {
            source_ref: "big.py".into(),
            bytes: b"way too large for the cap".to_vec(),
            crawl_scope: "default".into(),
            correlation_id: Uuid::new_v4(),
        }];
        let summary = producer.run(files).await;
        assert_eq!(summary.skipped_too_large, 1);
        assert_eq!(summary.embedded, 0);
    }

    #[tokio::test]
    async fn skips_binary_files() {
        let producer = producer(&["bin.dat"]).await;
        let files = vec![FileToEmbed {
            source_ref: "bin.dat".into(),
            bytes: vec![0xFF, 0xFE, 0x00, 0xFF],
            crawl_scope: "default".into(),
            correlation_id: Uuid::new_v4(),
        }];
        let summary = producer.run(files).await;
        assert_eq!(summary.skipped_binary, 1);
        assert_eq!(summary.embedded, 0);
    }
}
