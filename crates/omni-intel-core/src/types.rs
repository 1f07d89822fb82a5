//! Shared data types for envelope payloads, the file-tree graph, embedded
//! chunks, and bootstrap tiers (specification §3).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Every concrete payload shape that can ride inside an [`crate::envelope::Envelope`].
///
/// Using an externally-tagged enum keeps the wire format self-describing
/// without needing a second `event_type` lookup at the payload layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "payload_type")]
pub enum EventPayload {
    /// §3.2 `DocumentIndexRequest`.
    DocumentIndexRequested(DocumentIndexRequested),
    /// §3.2 `DocumentIndexCompleted`.
    DocumentIndexCompleted(DocumentIndexCompleted),
    /// §3.2 `DocumentIndexFailed`.
    DocumentIndexFailed(DocumentIndexFailed),
    /// §4.6 repository scan request.
    RepositoryScanRequested(RepositoryScanRequested),
    /// §4.6 repository scan completion.
    RepositoryScanCompleted(RepositoryScanCompleted),
    /// §4.6 repository scan failure.
    RepositoryScanFailed(RepositoryScanFailed),
    /// §4.10 tree visualisation request.
    TreeVisualizationRequested(TreeVisualizationRequested),
    /// §4.10 tree visualisation completion.
    TreeVisualizationCompleted(TreeVisualizationCompleted),
    /// §4.10 tree visualisation failure.
    TreeVisualizationFailed(TreeVisualizationFailed),
    /// §4.8 post-write notification emitted by the context-item writer.
    ContextBatchIndexed(ContextBatchIndexed),
}

/// Options controlling how a document is chunked and which sub-services
/// are skipped during fan-out (§3.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexingOptions {
    /// Target chunk size, in characters.
    #[serde(default = "IndexingOptions::default_chunk_size")]
    pub chunk_size: usize,
    /// Overlap between consecutive chunks, in characters.
    #[serde(default = "IndexingOptions::default_chunk_overlap")]
    pub chunk_overlap: usize,
    /// Skip entity extraction fan-out.
    #[serde(default)]
    pub skip_entity_extraction: bool,
    /// Skip quality assessment fan-out.
    #[serde(default)]
    pub skip_quality_assessment: bool,
    /// Skip embedding generation fan-out.
    #[serde(default)]
    pub skip_embeddings: bool,
}

impl IndexingOptions {
    fn default_chunk_size() -> usize {
        1200
    }
    fn default_chunk_overlap() -> usize {
        150
    }
}

impl Default for IndexingOptions {
    fn default() -> Self {
        Self {
            chunk_size: Self::default_chunk_size(),
            chunk_overlap: Self::default_chunk_overlap(),
            skip_entity_extraction: false,
            skip_quality_assessment: false,
            skip_embeddings: false,
        }
    }
}

/// §3.2 `DocumentIndexRequest`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentIndexRequested {
    /// Canonical path within the repository.
    pub source_path: String,
    /// Raw file content. `None` for pointer-only requests.
    pub content: Option<String>,
    /// Language classification (from extension, upstream of the core).
    pub language: String,
    /// Owning project identifier, if known.
    pub project_id: Option<String>,
    /// Repository URL, if known.
    pub repository_url: Option<String>,
    /// Commit SHA this content was read at, if known.
    pub commit_sha: Option<String>,
    /// Indexing behaviour options.
    #[serde(default)]
    pub indexing_options: IndexingOptions,
    /// Originating user, if known.
    pub user_id: Option<String>,
}

/// Per-service timing breakdown recorded during fan-out (§3.2, §4.7).
pub type ServiceTimings = BTreeMap<String, f64>;

/// §3.2 `DocumentIndexCompleted`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentIndexCompleted {
    /// Stable hash of the document's ordered chunk fingerprints.
    pub document_hash: String,
    /// Relational-store item ids touched by this document.
    pub entity_ids: Vec<String>,
    /// Vector-store point ids touched by this document.
    pub vector_ids: Vec<String>,
    /// Count of entities extracted.
    pub entities_extracted: u64,
    /// Count of graph relationships created.
    pub relationships_created: u64,
    /// Count of chunks written by the context-item writer.
    pub chunks_indexed: u64,
    /// Total wall-clock processing time, in milliseconds.
    pub processing_time_ms: f64,
    /// Per-service timing breakdown.
    pub service_timings: ServiceTimings,
    /// Quality score, if the quality-assessment sub-service ran.
    pub quality_score: Option<f64>,
    /// ONEX compliance flag, if assessed.
    pub onex_compliance: Option<bool>,
    /// Whether this result was served from a cache.
    pub cache_hit: bool,
    /// Name of a non-critical sub-service that failed during fan-out, if
    /// any (graceful degradation, §4.7 step 4).
    pub failed_service: Option<String>,
    /// Partial results preserved from a degraded fan-out.
    pub partial_results: Option<serde_json::Value>,
}

/// §3.2 `DocumentIndexFailed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentIndexFailed {
    /// Human-readable error description.
    pub error_message: String,
    /// Machine-readable error code (§7 taxonomy).
    pub error_code: String,
    /// Whether the runtime host should allow a retry of the originating
    /// request.
    pub retry_allowed: bool,
    /// Wall-clock time spent before failing, in milliseconds.
    pub processing_time_ms: f64,
    /// Name of the critical sub-service whose failure aborted indexing.
    pub failed_service: Option<String>,
    /// Partial results collected before the abort, if any.
    pub partial_results: Option<serde_json::Value>,
}

/// Request to crawl a repository (§4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryScanRequested {
    /// Absolute or repo-relative path to the repository root.
    pub repository_path: String,
    /// Owning project identifier.
    pub project_id: Option<String>,
    /// Glob patterns to prune directories/files.
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
    /// Glob patterns files must match to be published.
    #[serde(default)]
    pub file_patterns: Vec<String>,
    /// Number of files to batch per publish burst.
    #[serde(default = "RepositoryScanRequested::default_batch_size")]
    pub batch_size: usize,
}

impl RepositoryScanRequested {
    fn default_batch_size() -> usize {
        50
    }
}

/// Per-file summary recorded in a completed repository scan (§4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSummary {
    /// Repo-relative path.
    pub relative_path: String,
    /// Detected language.
    pub language: String,
    /// Size in bytes.
    pub size_bytes: u64,
}

/// §4.6 `REPOSITORY_SCAN_COMPLETED`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryScanCompleted {
    /// Total files discovered by the walk.
    pub files_discovered: u64,
    /// Files actually published as `DOCUMENT_INDEX_REQUESTED`.
    pub files_published: u64,
    /// Files skipped (matched neither include nor exclude, or excluded).
    pub files_skipped: u64,
    /// Number of publish batches used.
    pub batches_created: u64,
    /// Per-file summaries, in stable lexicographic order.
    pub file_summaries: Vec<FileSummary>,
}

/// §4.6 `REPOSITORY_SCAN_FAILED`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryScanFailed {
    /// Machine-readable error code.
    pub error_code: String,
    /// Human-readable error description.
    pub error_message: String,
    /// Whether a retry of the scan is permitted.
    pub retry_allowed: bool,
}

/// §4.10 tree visualisation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeVisualizationRequested {
    /// Project name to resolve the root `PROJECT` node for.
    pub project_name: String,
    /// Maximum recursion depth.
    pub max_depth: u32,
    /// Whether to resolve outgoing `IMPORTS` edges for `FILE` children.
    #[serde(default)]
    pub include_dependencies: bool,
}

/// A single node in the rendered tree (§4.10).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeNode {
    /// Node name (directory/file/entity name).
    pub name: String,
    /// Node kind discriminator: `"project" | "dir" | "file" | "entity"`.
    pub kind: String,
    /// Children, alphabetically sorted by `name`.
    pub children: Vec<TreeNode>,
    /// Resolved outgoing import targets, populated only for `FILE` nodes
    /// when `include_dependencies` was requested.
    pub dependencies: Vec<String>,
}

/// Aggregate statistics computed for a tree visualisation response (§4.10).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TreeStatistics {
    /// Total `DIR` nodes.
    pub directories: u64,
    /// Total `FILE` nodes.
    pub files: u64,
    /// Total resolved `IMPORTS` edges.
    pub imports: u64,
    /// `directories + files + 1` (the `+1` accounts for the `PROJECT` root).
    pub total_nodes: u64,
}

/// §4.10 tree visualisation completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeVisualizationCompleted {
    /// Rooted tree structure.
    pub root: TreeNode,
    /// Aggregate statistics.
    pub statistics: TreeStatistics,
}

/// §4.10 tree visualisation failure (`PROJECT_NOT_FOUND`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeVisualizationFailed {
    /// Machine-readable error code.
    pub error_code: String,
    /// Human-readable error description.
    pub error_message: String,
}

/// §4.8 "Post-write event": published once per context-item writer batch
/// when `emit_event` is set. Emission failures are non-blocking (§4.8) so
/// this payload never itself represents an error condition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextBatchIndexed {
    /// Canonical path within the repository the batch was written for.
    pub source_ref: String,
    /// Count of items created in this batch.
    pub items_created: u64,
    /// Count of items updated in this batch.
    pub items_updated: u64,
    /// Count of items skipped in this batch.
    pub items_skipped: u64,
    /// Count of items that failed to write in this batch.
    pub items_failed: u64,
}

/// A `(source_ref, character_offset_start, character_offset_end)` triple —
/// the identity of a chunk within a source artifact (§3.3 "Position").
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChunkPosition {
    /// Canonical path within the repository.
    pub source_ref: String,
    /// Inclusive start offset, in characters.
    pub character_offset_start: u64,
    /// Exclusive end offset, in characters.
    pub character_offset_end: u64,
}

/// Categorical chunk content type (§3.3 `item_type`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemType {
    /// A documentation excerpt.
    DocExcerpt,
    /// A source code block.
    CodeBlock,
}

/// An embedded chunk of source content, ready for the context-item writer
/// (specification §3.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddedChunk {
    /// Chunk text content. Must be non-empty.
    pub content: String,
    /// Categorical content type.
    pub item_type: ItemType,
    /// Stable hash of normalised content.
    pub content_fingerprint: String,
    /// Stable hash of the source version that yielded this chunk.
    pub version_hash: String,
    /// Positional identity within the source.
    pub position: ChunkPosition,
    /// Crawl namespace string.
    pub crawl_scope: String,
    /// Fixed-length embedding vector.
    pub embedding: Vec<f32>,
    /// Correlation id propagated from the originating chain.
    pub correlation_id: uuid::Uuid,
}

impl EmbeddedChunk {
    /// Validate the structural invariants from §3.3: non-empty content,
    /// and `start < end`.
    ///
    /// # Errors
    /// Returns [`crate::error::OmniError::Validation`] if any invariant is
    /// violated.
    pub fn validate(&self) -> crate::error::OmniResult<()> {
        if self.content.is_empty() {
            return Err(crate::error::OmniError::Validation(
                "chunk content must be non-empty".into(),
            ));
        }
        if self.position.character_offset_start >= self.position.character_offset_end {
            return Err(crate::error::OmniError::Validation(format!(
                "chunk position start ({}) must be < end ({})",
                self.position.character_offset_start, self.position.character_offset_end
            )));
        }
        Ok(())
    }
}

/// File-tree graph node kinds (§3.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum GraphNode {
    /// `PROJECT(name, path)`.
    Project {
        /// Project identifier.
        name: String,
        /// Filesystem path of the project root.
        path: String,
    },
    /// `DIR(path, relative_path, name)`.
    Dir {
        /// Absolute path.
        path: String,
        /// Repo-relative path.
        relative_path: String,
        /// Directory name.
        name: String,
    },
    /// `FILE(path, relative_path, name, file_type, size, entity_count,
    /// import_count, last_modified, file_hash, entity_id)`.
    File {
        /// Absolute path.
        path: String,
        /// Repo-relative path.
        relative_path: String,
        /// File name.
        name: String,
        /// File type/language classification.
        file_type: String,
        /// Size in bytes.
        size: u64,
        /// `|{e: FILE-[:DEFINES]->e}|`, maintained by the indexer.
        entity_count: u64,
        /// `|{t: FILE-[:IMPORTS]->t}|`, maintained by the indexer.
        import_count: u64,
        /// Last-modified timestamp (RFC 3339).
        last_modified: String,
        /// Content hash.
        file_hash: String,
        /// Identifier of an associated top-level entity, if any.
        entity_id: Option<String>,
    },
    /// `ENTITY(name, type, ...)`.
    Entity {
        /// Entity name.
        name: String,
        /// Entity type (function, class, ...).
        entity_type: String,
    },
    /// A context-item writer row (§4.8), the `CONTEXT_ITEM` endpoint of a
    /// `CONTEXT_ITEM->SOURCE` edge.
    ContextItem {
        /// Relational-store item id.
        id: String,
        /// Canonical path within the repository this item was chunked from.
        source_ref: String,
    },
}

impl GraphNode {
    /// A stable identifier for this node, used as the graph-store key.
    #[must_use]
    pub fn key(&self) -> String {
        match self {
            GraphNode::Project { path, .. } => format!("project:{path}"),
            GraphNode::Dir { path, .. } => format!("dir:{path}"),
            GraphNode::File { path, .. } => format!("file:{path}"),
            GraphNode::Entity { name, entity_type } => format!("entity:{entity_type}:{name}"),
            GraphNode::ContextItem { id, .. } => format!("context_item:{id}"),
        }
    }
}

/// File-tree graph edge kinds (§3.4, §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EdgeKind {
    /// `PROJECT->DIR`, `DIR->DIR`, `DIR->FILE`.
    Contains,
    /// `FILE->FILE`, carries `import_type`/`line_number`/`confidence`.
    Imports,
    /// `FILE->ENTITY`.
    Defines,
    /// `CONTEXT_ITEM->SOURCE` (§4.8 step 2): a context item to the file it
    /// was chunked from.
    References,
}

/// Extra attributes carried on an `IMPORTS` edge (§3.4).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImportAttributes {
    /// Classification of the import (e.g. `"relative"`, `"absolute"`).
    pub import_type: String,
    /// Source line number of the import statement.
    pub line_number: u32,
    /// Confidence in `[0.0, 1.0]` that this edge was resolved correctly.
    pub confidence: f64,
}

/// Bootstrap trust tier assigned to a chunk (§3.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BootstrapTierKind {
    /// Matched a trusted glob pattern.
    Validated,
    /// Did not match any trusted pattern; default.
    Quarantine,
}

/// Bootstrap tier assignment with confidence (§3.5).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BootstrapTier {
    /// The assigned tier.
    pub tier: BootstrapTierKind,
    /// Confidence in `[0.0, 1.0]`.
    pub confidence: f64,
}

impl Default for BootstrapTier {
    fn default() -> Self {
        Self { tier: BootstrapTierKind::Quarantine, confidence: 0.0 }
    }
}

/// Outcome of writing a single chunk through the context-item writer
/// (§4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteOutcome {
    /// No existing row at this position; a new item was inserted.
    Created,
    /// An existing row's fingerprint differed; it was updated.
    Updated,
    /// An existing row's fingerprint matched; no writes were made.
    Skipped,
    /// One of the three stores raised an error for this chunk.
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_chunk() -> EmbeddedChunk {
        EmbeddedChunk {
            content: "fn main() {}".into(),
            item_type: ItemType::CodeBlock,
            content_fingerprint: "fp1".into(),
            version_hash: "vh1".into(),
            position: ChunkPosition {
                source_ref: "src/main.rs".into(),
                character_offset_start: 0,
                character_offset_end: 12,
            },
            crawl_scope: "default".into(),
            embedding: vec![0.1, 0.2],
            correlation_id: uuid::Uuid::new_v4(),
        }
    }

    #[test]
    fn valid_chunk_passes_validation() {
        assert!(valid_chunk().validate().is_ok());
    }

    #[test]
    fn empty_content_is_rejected() {
        let mut chunk = valid_chunk();
        chunk.content.clear();
        assert!(chunk.validate().is_err());
    }

    #[test]
    fn start_must_be_less_than_end() {
        let mut chunk = valid_chunk();
        chunk.position.character_offset_start = 12;
        chunk.position.character_offset_end = 12;
        assert!(chunk.validate().is_err());

        chunk.position.character_offset_start = 20;
        assert!(chunk.validate().is_err());
    }

    #[test]
    fn graph_node_keys_are_stable_and_distinct() {
        let file = GraphNode::File {
            path: "/repo/a.rs".into(),
            relative_path: "a.rs".into(),
            name: "a.rs".into(),
            file_type: "rust".into(),
            size: 10,
            entity_count: 0,
            import_count: 0,
            last_modified: "2026-01-01T00:00:00Z".into(),
            file_hash: "h".into(),
            entity_id: None,
        };
        let dir = GraphNode::Dir {
            path: "/repo/a.rs".into(),
            relative_path: "a.rs".into(),
            name: "a.rs".into(),
        };
        assert_ne!(file.key(), dir.key());
    }
}
