//! Runtime host: the consume loop and backpressure semaphore (§4.3).
//!
//! Each handler invocation runs as its own spawned task so a slow envelope
//! never blocks the partition's consume loop; the `max_in_flight`
//! semaphore is the only place concurrency is actually bounded.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::adapters::event_bus::EventBus;
use crate::config::{BusConfig, RuntimeConfig};
use crate::envelope::{Envelope, EventType};
use crate::error::{OmniError, OmniResult};
use crate::handler::{Handler, Outcome};
use crate::resilience::CircuitBreakerRegistry;
use crate::topics::{Topic, TopicRouter};

/// Counters tracked by the runtime host across every envelope it processes.
#[derive(Default)]
pub struct RuntimeMetrics {
    max_in_flight_reached: AtomicU64,
    acked: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
}

impl RuntimeMetrics {
    /// Number of times an envelope had to wait for a free `max_in_flight`
    /// permit (§4.3 step 1).
    #[must_use]
    pub fn max_in_flight_reached(&self) -> u64 {
        self.max_in_flight_reached.load(Ordering::Relaxed)
    }

    /// Envelopes that reached `Outcome::Ack`.
    #[must_use]
    pub fn acked(&self) -> u64 {
        self.acked.load(Ordering::Relaxed)
    }

    /// Envelopes that reached `Outcome::Retry`.
    #[must_use]
    pub fn retried(&self) -> u64 {
        self.retried.load(Ordering::Relaxed)
    }

    /// Envelopes that were dead-lettered, for any reason (no handler,
    /// malformed, handler timeout, handler error, or an explicit
    /// `Outcome::DeadLetter`).
    #[must_use]
    pub fn dead_lettered(&self) -> u64 {
        self.dead_lettered.load(Ordering::Relaxed)
    }
}

/// Owns the consume loop and backpressure semaphore described in §4.3.
///
/// Bound to one partition's receiver at a time via [`RuntimeHost::run`];
/// a deployment with `N` partitions runs `N` instances sharing the same
/// handler registry, circuit-breaker registry, and semaphore.
pub struct RuntimeHost {
    handlers: Vec<Arc<dyn Handler>>,
    bus: Arc<dyn EventBus>,
    bus_config: BusConfig,
    breakers: Arc<CircuitBreakerRegistry>,
    config: RuntimeConfig,
    semaphore: Arc<Semaphore>,
    metrics: RuntimeMetrics,
}

impl RuntimeHost {
    /// Build a host bound to its handler registry, event bus, and shared
    /// circuit-breaker registry.
    #[must_use]
    pub fn new(
        handlers: Vec<Arc<dyn Handler>>,
        bus: Arc<dyn EventBus>,
        bus_config: BusConfig,
        breakers: Arc<CircuitBreakerRegistry>,
        config: RuntimeConfig,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_in_flight.max(1)));
        Self { handlers, bus, bus_config, breakers, config, semaphore, metrics: RuntimeMetrics::default() }
    }

    /// A snapshot of this host's counters.
    #[must_use]
    pub fn metrics(&self) -> &RuntimeMetrics {
        &self.metrics
    }

    fn find_handler(&self, event_type: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.iter().find(|h| h.can_handle(event_type)).cloned()
    }

    fn topic_for(&self, event_type: &EventType) -> Topic {
        TopicRouter::new(&self.bus_config).topic_for(event_type)
    }

    fn dead_letter_topic(&self) -> Topic {
        TopicRouter::new(&self.bus_config).dead_letter_topic()
    }

    async fn publish_dead_letter(&self, envelope: Envelope) -> OmniResult<()> {
        self.metrics.dead_lettered.fetch_add(1, Ordering::Relaxed);
        let topic = self.dead_letter_topic();
        self.bus.publish(&topic, envelope).await
    }

    async fn publish_outgoing(&self, envelope: Envelope) -> OmniResult<()> {
        let topic = self.topic_for(&envelope.event_type);
        self.bus.publish(&topic, envelope).await
    }

    /// Process one envelope end to end (§4.3 steps 1-7): acquire a permit,
    /// resolve the handler, invoke it behind its circuit breaker and a
    /// per-handler timeout, then publish whatever the outcome demands.
    pub async fn process_one(self: &Arc<Self>, envelope: Envelope) -> OmniResult<()> {
        if self.semaphore.available_permits() == 0 {
            self.metrics.max_in_flight_reached.fetch_add(1, Ordering::Relaxed);
        }
        let _permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| OmniError::Internal("runtime host semaphore closed".to_string()))?;

        let event_type = envelope.event_type.as_str().to_string();
        let Some(handler) = self.find_handler(&event_type) else {
            tracing::warn!(event_type = %event_type, "no handler registered; dead-lettering");
            return self.publish_dead_letter(envelope).await;
        };

        let scope = format!("{}:handle", handler.name());
        let breaker = self.breakers.get_or_create(&scope);
        let handle_fut = breaker.call({
            let handler = Arc::clone(&handler);
            let envelope = envelope.clone();
            move || async move { handler.handle(envelope).await }
        });

        match tokio::time::timeout(self.config.handler_timeout(), handle_fut).await {
            Err(_elapsed) => {
                tracing::warn!(handler = handler.name(), event_type = %event_type, "handler timed out");
                self.publish_dead_letter(envelope).await
            }
            Ok(Err(err)) => {
                tracing::warn!(handler = handler.name(), error = %err, "handler invocation failed");
                self.publish_dead_letter(envelope).await
            }
            Ok(Ok(Outcome::Ack(outgoing))) => {
                self.metrics.acked.fetch_add(1, Ordering::Relaxed);
                for out in outgoing {
                    self.publish_outgoing(out).await?;
                }
                Ok(())
            }
            Ok(Ok(Outcome::Retry(delay))) => {
                self.metrics.retried.fetch_add(1, Ordering::Relaxed);
                self.reinject_after_delay(envelope, delay);
                Ok(())
            }
            Ok(Ok(Outcome::DeadLetter(reason))) => {
                tracing::info!(handler = handler.name(), code = %reason.code, message = %reason.message, "handler dead-lettered envelope");
                self.publish_dead_letter(envelope).await
            }
        }
    }

    /// Re-deliver `envelope` to its own topic after `delay` without
    /// blocking the caller (§4.3 step 6, §5 "implementation may use
    /// per-topic re-inject").
    fn reinject_after_delay(self: &Arc<Self>, envelope: Envelope, delay: Duration) {
        let host = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = host.publish_outgoing(envelope).await {
                tracing::error!(error = %e, "failed to re-inject retried envelope");
            }
        });
    }

    /// Run the consume loop for one partition's receiver until the bus
    /// closes it or `cancellation` fires, in which case envelopes are
    /// still drained for up to the configured shutdown grace window (§5
    /// "Cancellation") before the loop returns.
    pub async fn run(self: Arc<Self>, mut receiver: mpsc::UnboundedReceiver<Envelope>, cancellation: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                () = cancellation.cancelled() => {
                    tracing::info!("shutdown requested; draining in-flight partition within grace window");
                    self.drain(&mut receiver, self.config.shutdown_grace()).await;
                    break;
                }
                received = receiver.recv() => {
                    match received {
                        Some(envelope) => {
                            let host = Arc::clone(&self);
                            tokio::spawn(async move {
                                if let Err(e) = host.process_one(envelope).await {
                                    tracing::error!(error = %e, "envelope processing failed at the host boundary");
                                }
                            });
                        }
                        None => break,
                    }
                }
            }
        }
    }

    async fn drain(self: &Arc<Self>, receiver: &mut mpsc::UnboundedReceiver<Envelope>, grace: Duration) {
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                tracing::warn!("shutdown grace window elapsed with envelopes still in flight");
                break;
            }
            match tokio::time::timeout(remaining, receiver.recv()).await {
                Ok(Some(envelope)) => {
                    if let Err(e) = self.process_one(envelope).await {
                        tracing::error!(error = %e, "failed to drain envelope during shutdown");
                    }
                }
                Ok(None) | Err(_) => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::event_bus::InMemoryEventBus;
    use crate::config::CircuitBreakerConfig;
    use crate::envelope::Source;
    use crate::handler::{AtomicHandlerMetrics, DeadLetterReason, HandlerMetrics};
    use crate::types::{EventPayload, RepositoryScanFailed, RepositoryScanRequested};
    use async_trait::async_trait;
    use uuid::Uuid;

    struct EchoHandler {
        metrics: AtomicHandlerMetrics,
    }

    #[async_trait]
    impl Handler for EchoHandler {
        fn name(&self) -> &str {
            "echo"
        }

        fn can_handle(&self, event_type: &str) -> bool {
            event_type == "omninode.intelligence.event.repository_scan_requested.v1"
        }

        async fn handle(&self, envelope: Envelope) -> OmniResult<Outcome> {
            self.metrics.record_invocation();
            let failed = envelope.derive(
                "omninode.intelligence.event.repository_scan_failed.v1",
                EventPayload::RepositoryScanFailed(RepositoryScanFailed {
                    error_code: "INVALID_INPUT".into(),
                    error_message: "echo".into(),
                    retry_allowed: false,
                }),
                Source { service: "echo".into(), instance_id: "1".into() },
            )?;
            self.metrics.record_ack();
            Ok(Outcome::Ack(vec![failed]))
        }

        fn get_metrics(&self) -> HandlerMetrics {
            self.metrics.snapshot()
        }
    }

    struct DeadLetteringHandler;

    #[async_trait]
    impl Handler for DeadLetteringHandler {
        fn name(&self) -> &str {
            "dead_letterer"
        }

        fn can_handle(&self, event_type: &str) -> bool {
            event_type == "omninode.intelligence.event.repository_scan_requested.v1"
        }

        async fn handle(&self, _envelope: Envelope) -> OmniResult<Outcome> {
            Ok(Outcome::DeadLetter(DeadLetterReason::new("INVALID_INPUT", "nope")))
        }

        fn get_metrics(&self) -> HandlerMetrics {
            HandlerMetrics::default()
        }
    }

    fn sample_envelope() -> Envelope {
        Envelope::originate(
            "omninode.intelligence.event.repository_scan_requested.v1",
            Uuid::new_v4(),
            Source { service: "test".into(), instance_id: "1".into() },
            EventPayload::RepositoryScanRequested(RepositoryScanRequested {
                repository_path: "/tmp".into(),
                project_id: None,
                exclude_patterns: Vec::new(),
                file_patterns: Vec::new(),
                batch_size: 50,
            }),
        )
        .expect("originate")
    }

    #[tokio::test]
    async fn acked_outcome_publishes_outgoing_envelope_and_increments_metrics() {
        let bus = Arc::new(InMemoryEventBus::new(1));
        let bus_config = BusConfig::default();
        let router = TopicRouter::new(&bus_config);
        let failed_topic = router.topic_for(&EventType::parse("omninode.intelligence.event.repository_scan_failed.v1").expect("parse"));
        let mut failed_rx = bus.take_receiver(&failed_topic, 0).expect("receiver");

        let host = Arc::new(RuntimeHost::new(
            vec![Arc::new(EchoHandler { metrics: AtomicHandlerMetrics::default() })],
            bus,
            bus_config,
            Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default())),
            RuntimeConfig::default(),
        ));

        host.process_one(sample_envelope()).await.expect("process");
        assert_eq!(host.metrics().acked(), 1);
        let published = failed_rx.recv().await.expect("published failure");
        match published.payload {
            EventPayload::RepositoryScanFailed(f) => assert_eq!(f.error_code, "INVALID_INPUT"),
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_handler_dead_letters_to_dlq_topic() {
        let bus = Arc::new(InMemoryEventBus::new(1));
        let bus_config = BusConfig::default();
        let router = TopicRouter::new(&bus_config);
        let mut dlq_rx = bus.take_receiver(&router.dead_letter_topic(), 0).expect("receiver");

        let host = Arc::new(RuntimeHost::new(
            Vec::new(),
            bus,
            bus_config,
            Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default())),
            RuntimeConfig::default(),
        ));

        host.process_one(sample_envelope()).await.expect("process");
        assert_eq!(host.metrics().dead_lettered(), 1);
        dlq_rx.recv().await.expect("dead-lettered envelope");
    }

    #[tokio::test]
    async fn explicit_dead_letter_outcome_routes_to_dlq_topic() {
        let bus = Arc::new(InMemoryEventBus::new(1));
        let bus_config = BusConfig::default();
        let router = TopicRouter::new(&bus_config);
        let mut dlq_rx = bus.take_receiver(&router.dead_letter_topic(), 0).expect("receiver");

        let host = Arc::new(RuntimeHost::new(
            vec![Arc::new(DeadLetteringHandler)],
            bus,
            bus_config,
            Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default())),
            RuntimeConfig::default(),
        ));

        host.process_one(sample_envelope()).await.expect("process");
        assert_eq!(host.metrics().dead_lettered(), 1);
        dlq_rx.recv().await.expect("dead-lettered envelope");
    }
}
