//! Embedding service adapter (specification §6 "Embedding service").
//!
//! `POST /v1/embeddings {model, input}` returning `{data:[{embedding:
//! []float}]}`. HTTP 503/429/timeout are retryable via the shared
//! [`crate::adapters::http_client::RetryingHttpClient`]; 4xx is not.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::adapters::http_client::RetryingHttpClient;
use crate::error::OmniResult;

#[derive(Debug, Serialize)]
struct EmbeddingsRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

/// The embedding service operation required by the core (§6).
#[async_trait]
pub trait EmbeddingService: Send + Sync {
    /// Generate an embedding vector for `text`.
    ///
    /// # Errors
    /// Returns an [`crate::error::OmniError`] if the request fails after
    /// retries or the response is malformed.
    async fn embed(&self, text: &str) -> OmniResult<Vec<f32>>;
}

/// `reqwest`-backed [`EmbeddingService`] calling a real model endpoint.
pub struct HttpEmbeddingService {
    client: RetryingHttpClient,
    endpoint: String,
    model: String,
}

impl HttpEmbeddingService {
    /// Build a client targeting `endpoint` (e.g. `EMBEDDING_MODEL_URL`)
    /// with the given model identifier.
    #[must_use]
    pub fn new(client: RetryingHttpClient, endpoint: impl Into<String>, model: impl Into<String>) -> Self {
        Self { client, endpoint: endpoint.into(), model: model.into() }
    }
}

#[async_trait]
impl EmbeddingService for HttpEmbeddingService {
    async fn embed(&self, text: &str) -> OmniResult<Vec<f32>> {
        let request = EmbeddingsRequest { model: &self.model, input: text };
        let response: EmbeddingsResponse = self
            .client
            .post(&format!("{}/v1/embeddings", self.endpoint), &request)
            .await?;
        Ok(response
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .unwrap_or_default())
    }
}

/// Fixed dimensionality of vectors produced by
/// [`DeterministicEmbeddingService`].
pub const DETERMINISTIC_DIMENSIONS: usize = 32;

/// A hash-based pseudo-embedding test double, used by unit and integration
/// tests that need deterministic, network-free embeddings (§6 core scope
/// treats entity extraction/embedding as an injected collaborator — this
/// satisfies that contract without a live model endpoint).
#[derive(Debug, Default)]
pub struct DeterministicEmbeddingService;

#[async_trait]
impl EmbeddingService for DeterministicEmbeddingService {
    async fn embed(&self, text: &str) -> OmniResult<Vec<f32>> {
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        let digest = hasher.finalize();
        let vector = digest
            .iter()
            .cycle()
            .take(DETERMINISTIC_DIMENSIONS)
            .map(|b| f32::from(*b) / 255.0)
            .collect();
        Ok(vector)
    }
}
