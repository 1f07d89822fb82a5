//! Handler ABI (specification §4.2).
//!
//! Each handler declares which event types it can handle and a `handle`
//! method returning an [`Outcome`]. Handlers must be stateless between
//! envelopes: any per-chain state rides in the payload via `correlation_id`.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::envelope::Envelope;
use crate::error::OmniResult;

/// The terminal disposition of a single `handle` invocation (§4.3 step 4-7).
#[derive(Debug)]
pub enum Outcome {
    /// Processing succeeded; carries zero or more outgoing envelopes to
    /// publish before the input offset is committed.
    Ack(Vec<Envelope>),
    /// Processing failed transiently; redeliver after `delay` without
    /// committing the input offset.
    Retry(Duration),
    /// Processing cannot continue; publish a failure envelope and commit
    /// the input offset to avoid a poison-message loop.
    DeadLetter(DeadLetterReason),
}

/// Why an envelope was dead-lettered.
#[derive(Debug, Clone)]
pub struct DeadLetterReason {
    /// Machine-readable error code (§7 taxonomy).
    pub code: String,
    /// Human-readable description.
    pub message: String,
}

impl DeadLetterReason {
    /// Build a dead-letter reason from a code and message.
    #[must_use]
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self { code: code.into(), message: message.into() }
    }
}

/// A point-in-time snapshot of a handler's metrics (§4.2 `get_metrics`).
#[derive(Debug, Clone, Default)]
pub struct HandlerMetrics {
    /// Total envelopes this handler has accepted via `can_handle`.
    pub invocations: u64,
    /// Count of `Ack` outcomes.
    pub acked: u64,
    /// Count of `Retry` outcomes.
    pub retried: u64,
    /// Count of `DeadLetter` outcomes.
    pub dead_lettered: u64,
}

/// The handler trait every domain component implements (§4.2).
///
/// Handlers must not block indefinitely; the runtime host enforces a
/// per-handler timeout around `handle` (§4.3, §5).
#[async_trait]
pub trait Handler: Send + Sync {
    /// A short, stable name identifying this handler in logs, metrics, and
    /// circuit-breaker scopes.
    fn name(&self) -> &str;

    /// Whether this handler is the one registered to process `event_type`.
    fn can_handle(&self, event_type: &str) -> bool;

    /// Process a single envelope to completion. Must not hold a store
    /// transaction open across more than one suspension point (§5 Locking
    /// discipline).
    ///
    /// # Errors
    /// Returns an [`crate::error::OmniError`] only for conditions the
    /// runtime host itself must react to (e.g. a panic boundary); ordinary
    /// domain failures are represented in the returned [`Outcome`].
    async fn handle(&self, envelope: Envelope) -> OmniResult<Outcome>;

    /// A snapshot of this handler's metrics.
    fn get_metrics(&self) -> HandlerMetrics;
}

/// Lock-free counters backing a handler's [`HandlerMetrics`] snapshot.
/// Shared by every domain handler so metrics bookkeeping doesn't repeat
/// per-handler.
#[derive(Default)]
pub struct AtomicHandlerMetrics {
    invocations: AtomicU64,
    acked: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
}

impl AtomicHandlerMetrics {
    /// Record that `handle` was invoked.
    pub fn record_invocation(&self) {
        self.invocations.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an [`Outcome::Ack`].
    pub fn record_ack(&self) {
        self.acked.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an [`Outcome::Retry`].
    pub fn record_retry(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an [`Outcome::DeadLetter`].
    pub fn record_dead_letter(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    /// A point-in-time snapshot.
    #[must_use]
    pub fn snapshot(&self) -> HandlerMetrics {
        HandlerMetrics {
            invocations: self.invocations.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dead_letter_reason_carries_code_and_message() {
        let reason = DeadLetterReason::new("NO_HANDLER", "no handler registered");
        assert_eq!(reason.code, "NO_HANDLER");
        assert_eq!(reason.message, "no handler registered");
    }

    #[test]
    fn atomic_metrics_accumulate() {
        let metrics = AtomicHandlerMetrics::default();
        metrics.record_invocation();
        metrics.record_ack();
        metrics.record_invocation();
        metrics.record_retry();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.invocations, 2);
        assert_eq!(snapshot.acked, 1);
        assert_eq!(snapshot.retried, 1);
        assert_eq!(snapshot.dead_lettered, 0);
    }
}
