//! Backend adapters (specification §6 "External Interfaces").
//!
//! Each adapter is a trait plus a default in-process implementation, so the
//! full pipeline is exercisable in tests without a live Kafka/Qdrant/Neo4j
//! cluster.

pub mod embedding_service;
pub mod event_bus;
pub mod graph_store;
pub mod http_client;
pub mod relational_store;
pub mod vector_store;

pub use embedding_service::{DeterministicEmbeddingService, EmbeddingService, HttpEmbeddingService};
pub use event_bus::{EventBus, InMemoryEventBus};
pub use graph_store::{GraphEdge, GraphStore, InMemoryGraphStore};
pub use http_client::RetryingHttpClient;
pub use relational_store::{NewContextItem, RelationalStore, SqliteRelationalStore};
pub use vector_store::{InMemoryVectorStore, VectorStore};
