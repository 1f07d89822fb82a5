//! Vector store adapter (specification §6, §4.8).
//!
//! `upsert_point`, `get_collection_info`, `scroll` are the operations
//! required of any adapter. The default implementation is an in-memory,
//! `dashmap`-backed point map — structurally the same shape as the
//! teacher's `VectorIndex`, with `upsert`/`scroll` standing in for
//! `add`/`search` since this core transports points rather than serving
//! nearest-neighbour queries itself.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use crate::error::OmniResult;

/// A single stored vector point.
#[derive(Debug, Clone)]
pub struct VectorPoint {
    /// Point id (matches the relational store's `item_id` for a chunk).
    pub id: String,
    /// Embedding vector.
    pub vector: Vec<f32>,
    /// Arbitrary associated payload (source ref, crawl scope, etc.).
    pub payload: Value,
}

/// Summary information about a collection (§6 `get_collection_info`).
#[derive(Debug, Clone, Copy, Default)]
pub struct CollectionInfo {
    /// Number of points currently stored.
    pub point_count: u64,
    /// Vector dimensionality, if any points exist.
    pub dimensions: Option<usize>,
}

/// A page of points returned by [`VectorStore::scroll`].
#[derive(Debug, Clone, Default)]
pub struct ScrollPage {
    /// Points in this page.
    pub points: Vec<VectorPoint>,
    /// Opaque cursor for the next page; `None` when exhausted.
    pub next_cursor: Option<String>,
}

/// The vector store operations required by the core (§6).
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Insert or overwrite the point with the given `id` (§4.8: the
    /// `UPDATED` path reuses the same point id to overwrite in place).
    ///
    /// # Errors
    /// Returns an [`crate::error::OmniError`] on a store-level failure.
    async fn upsert_point(
        &self,
        collection: &str,
        id: &str,
        vector: Vec<f32>,
        payload: Value,
    ) -> OmniResult<()>;

    /// Summary statistics for a collection.
    ///
    /// # Errors
    /// Returns an [`crate::error::OmniError`] on a store-level failure.
    async fn get_collection_info(&self, collection: &str) -> OmniResult<CollectionInfo>;

    /// Page through a collection's points, `limit` at a time.
    ///
    /// # Errors
    /// Returns an [`crate::error::OmniError`] on a store-level failure.
    async fn scroll(
        &self,
        collection: &str,
        cursor: Option<String>,
        limit: usize,
    ) -> OmniResult<ScrollPage>;
}

/// In-memory [`VectorStore`], keyed by `(collection, id)`.
#[derive(Default)]
pub struct InMemoryVectorStore {
    collections: DashMap<String, DashMap<String, VectorPoint>>,
}

impl InMemoryVectorStore {
    /// Build an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn upsert_point(
        &self,
        collection: &str,
        id: &str,
        vector: Vec<f32>,
        payload: Value,
    ) -> OmniResult<()> {
        let points = self.collections.entry(collection.to_string()).or_default();
        points.insert(id.to_string(), VectorPoint { id: id.to_string(), vector, payload });
        Ok(())
    }

    async fn get_collection_info(&self, collection: &str) -> OmniResult<CollectionInfo> {
        let Some(points) = self.collections.get(collection) else {
            return Ok(CollectionInfo::default());
        };
        let dimensions = points.iter().next().map(|entry| entry.value().vector.len());
        Ok(CollectionInfo { point_count: points.len() as u64, dimensions })
    }

    async fn scroll(
        &self,
        collection: &str,
        cursor: Option<String>,
        limit: usize,
    ) -> OmniResult<ScrollPage> {
        let Some(points) = self.collections.get(collection) else {
            return Ok(ScrollPage::default());
        };
        let mut ids: Vec<String> = points.iter().map(|entry| entry.key().clone()).collect();
        ids.sort();

        let start = match cursor {
            Some(ref c) => ids.iter().position(|id| id == c).map_or(0, |i| i + 1),
            None => 0,
        };
        let page_ids: Vec<String> = ids.into_iter().skip(start).take(limit).collect();
        let next_cursor = if page_ids.len() == limit { page_ids.last().cloned() } else { None };
        let page_points = page_ids
            .into_iter()
            .filter_map(|id| points.get(&id).map(|entry| entry.value().clone()))
            .collect();
        Ok(ScrollPage { points: page_points, next_cursor })
    }
}
