//! In-process event bus adapter (specification §6 "Event bus", §4.3
//! ordering guarantee).
//!
//! `N` partitions, each an ordered `tokio::sync::mpsc` channel.
//! `correlation_id` is hashed to a partition so every envelope in a causal
//! chain lands on the same partition and is therefore delivered in send
//! order; no ordering is guaranteed across chains. This stands in for a
//! real partitioned broker (Kafka/NATS) for single-node deployments and
//! the integration test suite.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;
use xxhash_rust::xxh3::xxh3_64;

use crate::envelope::Envelope;
use crate::error::{OmniError, OmniResult};
use crate::topics::Topic;

/// The event bus operations required by the core (§6).
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish `envelope` to `topic`, routed to the partition owning its
    /// `correlation_id` (§4.3 ordering guarantee).
    ///
    /// # Errors
    /// Returns [`OmniError::Internal`] if the topic's receiving side has
    /// been dropped.
    async fn publish(&self, topic: &Topic, envelope: Envelope) -> OmniResult<()>;

    /// Number of partitions each topic is split into.
    fn partition_count(&self) -> usize;
}

struct PartitionedTopic {
    senders: Vec<mpsc::UnboundedSender<Envelope>>,
    receivers: Vec<Mutex<Option<mpsc::UnboundedReceiver<Envelope>>>>,
}

impl PartitionedTopic {
    fn new(partitions: usize) -> Self {
        let mut senders = Vec::with_capacity(partitions);
        let mut receivers = Vec::with_capacity(partitions);
        for _ in 0..partitions {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.push(tx);
            receivers.push(Mutex::new(Some(rx)));
        }
        Self { senders, receivers }
    }
}

/// In-memory, partitioned [`EventBus`] implementation.
pub struct InMemoryEventBus {
    partitions: usize,
    topics: DashMap<String, Arc<PartitionedTopic>>,
}

impl InMemoryEventBus {
    /// Build a bus with a fixed partition count per topic (§6 `BusConfig`
    /// `partitions`).
    #[must_use]
    pub fn new(partitions: usize) -> Self {
        Self { partitions: partitions.max(1), topics: DashMap::new() }
    }

    fn topic_handle(&self, name: &str) -> Arc<PartitionedTopic> {
        self.topics
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(PartitionedTopic::new(self.partitions)))
            .clone()
    }

    /// Take ownership of the receiver for `topic`'s partition `index`.
    /// Returns `None` if it was already taken by another consumer — each
    /// partition has exactly one consumer, mirroring a broker's consumer
    /// group semantics.
    #[must_use]
    pub fn take_receiver(&self, topic: &Topic, index: usize) -> Option<mpsc::UnboundedReceiver<Envelope>> {
        let handle = self.topic_handle(&topic.0);
        handle.receivers.get(index)?.lock().take()
    }

    /// The partition index `correlation_id` is routed to for this bus's
    /// partition count.
    #[must_use]
    pub fn partition_for(&self, correlation_id: Uuid) -> usize {
        partition_for(correlation_id, self.partitions)
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, topic: &Topic, envelope: Envelope) -> OmniResult<()> {
        let handle = self.topic_handle(&topic.0);
        let partition = partition_for(envelope.correlation_id, handle.senders.len());
        handle.senders[partition]
            .send(envelope)
            .map_err(|_| OmniError::Internal(format!("no consumer for topic {}", topic.0)))
    }

    fn partition_count(&self) -> usize {
        self.partitions
    }
}

fn partition_for(correlation_id: Uuid, partitions: usize) -> usize {
    (xxh3_64(correlation_id.as_bytes()) % partitions as u64) as usize
}
