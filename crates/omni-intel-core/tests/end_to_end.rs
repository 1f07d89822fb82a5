//! End-to-end scenarios from the specification's testable-properties
//! section: success flow, validation failure, graceful degradation,
//! idempotent re-ingest, orphan detection, and backpressure.
//!
//! These wire the real domain handlers (crawler, indexer, context-item
//! writer) and, for the backpressure scenario, the runtime host's consume
//! loop, rather than stubbing any of them out.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::tempdir;
use uuid::Uuid;

use omni_intel_core::adapters::event_bus::InMemoryEventBus;
use omni_intel_core::adapters::graph_store::{GraphEdge, GraphStore, InMemoryGraphStore};
use omni_intel_core::adapters::relational_store::SqliteRelationalStore;
use omni_intel_core::adapters::vector_store::InMemoryVectorStore;
use omni_intel_core::adapters::{DeterministicEmbeddingService, EmbeddingService};
use omni_intel_core::config::{BootstrapConfig, BusConfig, CircuitBreakerConfig, CrawlerConfig, IndexerConfig, RuntimeConfig};
use omni_intel_core::domain::context_writer::ContextItemWriter;
use omni_intel_core::domain::crawler::RepositoryCrawler;
use omni_intel_core::domain::indexer::DocumentIndexer;
use omni_intel_core::envelope::{Envelope, Source};
use omni_intel_core::error::OmniResult;
use omni_intel_core::handler::{Handler, HandlerMetrics, Outcome};
use omni_intel_core::resilience::CircuitBreakerRegistry;
use omni_intel_core::runtime::RuntimeHost;
use omni_intel_core::types::{EdgeKind, EventPayload, GraphNode, RepositoryScanRequested};

fn source(name: &str) -> Source {
    Source { service: name.to_string(), instance_id: "1".to_string() }
}

fn indexer_with_stores() -> (DocumentIndexer, Arc<dyn GraphStore>) {
    let graph: Arc<dyn GraphStore> = Arc::new(InMemoryGraphStore::new());
    let writer = Arc::new(ContextItemWriter::new(
        Arc::new(SqliteRelationalStore::open_in_memory().expect("open sqlite")),
        Arc::new(InMemoryVectorStore::new()),
        graph.clone(),
        &BootstrapConfig::default(),
        source("writer"),
    ));
    let embedding: Arc<dyn EmbeddingService> = Arc::new(DeterministicEmbeddingService);
    let indexer = DocumentIndexer::new(
        graph.clone(),
        writer,
        embedding,
        Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default())),
        IndexerConfig::default(),
        source("indexer"),
    );
    (indexer, graph)
}

fn document_index_requested(source_path: &str, content: Option<&str>, correlation_id: Uuid) -> Envelope {
    use omni_intel_core::types::{DocumentIndexRequested, IndexingOptions};
    Envelope::originate(
        "omninode.intelligence.event.document_index_requested.v1",
        correlation_id,
        source("ingress"),
        EventPayload::DocumentIndexRequested(DocumentIndexRequested {
            source_path: source_path.to_string(),
            content: content.map(str::to_string),
            language: omni_intel_core::domain::classify_language(source_path),
            project_id: Some("scenario".into()),
            repository_url: None,
            commit_sha: None,
            indexing_options: IndexingOptions::default(),
            user_id: None,
        }),
    )
    .expect("originate")
}

/// Scenario 1: success flow.
#[tokio::test]
async fn scenario_success_flow_emits_completed_with_same_correlation_id() {
    let (indexer, _graph) = indexer_with_stores();
    let correlation_id = Uuid::new_v4();
    let request = document_index_requested("sample.py", Some("def f(): return 1"), correlation_id);

    let Outcome::Ack(events) = indexer.handle(request).await.expect("handle") else {
        panic!("expected ack");
    };
    assert_eq!(events.len(), 1);
    let completed = &events[0];
    assert_eq!(completed.correlation_id, correlation_id);
    match &completed.payload {
        EventPayload::DocumentIndexCompleted(c) => {
            assert!(c.entities_extracted >= 1);
            assert!(c.chunks_indexed >= 1);
        }
        other => panic!("unexpected payload: {other:?}"),
    }
}

/// Scenario 2: validation failure (null content).
#[tokio::test]
async fn scenario_validation_failure_sets_invalid_input_and_forbids_retry() {
    let (indexer, _graph) = indexer_with_stores();
    let request = document_index_requested("sample.py", None, Uuid::new_v4());

    let Outcome::Ack(events) = indexer.handle(request).await.expect("handle") else {
        panic!("expected ack");
    };
    match &events[0].payload {
        EventPayload::DocumentIndexFailed(f) => {
            assert_eq!(f.error_code, "INVALID_INPUT");
            assert!(!f.retry_allowed);
        }
        other => panic!("unexpected payload: {other:?}"),
    }
}

/// Scenario 3: partial success / graceful degradation for an unsupported
/// language — must never time out, and must either complete with zero
/// entities or fail with `failed_service` set.
#[tokio::test]
async fn scenario_unsupported_language_degrades_gracefully_never_times_out() {
    let (indexer, _graph) = indexer_with_stores();
    let request = document_index_requested("data.unknownlang", Some("some opaque content"), Uuid::new_v4());

    let outcome = tokio::time::timeout(Duration::from_secs(5), indexer.handle(request))
        .await
        .expect("must not time out")
        .expect("handle");
    let Outcome::Ack(events) = outcome else { panic!("expected ack") };
    match &events[0].payload {
        EventPayload::DocumentIndexCompleted(c) => {
            assert_eq!(c.entities_extracted, 0);
            assert!(!c.service_timings.is_empty());
        }
        EventPayload::DocumentIndexFailed(f) => assert!(f.failed_service.is_some()),
        other => panic!("unexpected payload: {other:?}"),
    }
}

/// Scenario 4: idempotent re-ingest across three files, then a single
/// content change.
#[tokio::test]
async fn scenario_idempotent_reingest_across_repository() {
    let (indexer, _graph) = indexer_with_stores();
    let files = [("a.py", "def a(): return 1"), ("b.py", "def b(): return 2"), ("c.py", "def c(): return 3")];

    let mut created = 0u64;
    for (path, content) in files {
        let request = document_index_requested(path, Some(content), Uuid::new_v4());
        let Outcome::Ack(events) = indexer.handle(request).await.expect("handle") else { panic!("ack") };
        let EventPayload::DocumentIndexCompleted(c) = &events[0].payload else { panic!("completed") };
        created += c.chunks_indexed;
    }
    assert!(created >= 3);

    // Re-ingest unchanged content: every chunk should be skipped
    // (document_hash should be identical across the two runs).
    let mut unchanged_hashes = Vec::new();
    for (path, content) in files {
        let request = document_index_requested(path, Some(content), Uuid::new_v4());
        let Outcome::Ack(events) = indexer.handle(request).await.expect("handle") else { panic!("ack") };
        let EventPayload::DocumentIndexCompleted(c) = &events[0].payload else { panic!("completed") };
        unchanged_hashes.push(c.document_hash.clone());
    }

    // Modify one file's content: document_hash must change for that file.
    let request = document_index_requested("a.py", Some("def a(): return 999"), Uuid::new_v4());
    let Outcome::Ack(events) = indexer.handle(request).await.expect("handle") else { panic!("ack") };
    let EventPayload::DocumentIndexCompleted(modified) = &events[0].payload else { panic!("completed") };
    assert_ne!(modified.document_hash, unchanged_hashes[0]);
}

/// Scenario 5: orphan detection after indexing `main.py` (imports
/// `utils.py`), `utils.py`, and `orphan.py` (no imports in or out).
#[tokio::test]
async fn scenario_orphan_detection_finds_exactly_the_isolated_file() {
    let graph: Arc<dyn GraphStore> = Arc::new(InMemoryGraphStore::new());

    for path in ["main.py", "utils.py", "orphan.py"] {
        graph
            .upsert_node(GraphNode::File {
                path: path.to_string(),
                relative_path: path.to_string(),
                name: path.to_string(),
                file_type: "python".to_string(),
                size: 10,
                entity_count: 0,
                import_count: 1,
                last_modified: "2026-01-01T00:00:00Z".to_string(),
                file_hash: "h".to_string(),
                entity_id: None,
            })
            .await
            .expect("upsert file");
    }

    graph
        .upsert_edge(GraphEdge {
            from: "file:main.py".to_string(),
            to: "file:utils.py".to_string(),
            kind: EdgeKind::Imports,
            import_attributes: None,
        })
        .await
        .expect("upsert import edge");

    let orphans = graph.orphan_files().await.expect("orphan query");
    assert_eq!(orphans, vec!["file:orphan.py".to_string()]);
}

/// A handler that sleeps to simulate downstream latency, for the
/// backpressure scenario. Tracks the high-water mark of concurrently
/// in-flight invocations.
struct SlowHandler {
    in_flight: Arc<AtomicUsize>,
    max_observed: Arc<AtomicUsize>,
    sleep: Duration,
}

#[async_trait]
impl Handler for SlowHandler {
    fn name(&self) -> &str {
        "slow_handler"
    }

    fn can_handle(&self, event_type: &str) -> bool {
        event_type == "omninode.intelligence.event.repository_scan_requested.v1"
    }

    async fn handle(&self, envelope: Envelope) -> OmniResult<Outcome> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_observed.fetch_max(current, Ordering::SeqCst);
        tokio::time::sleep(self.sleep).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let failed = envelope.derive(
            "omninode.intelligence.event.repository_scan_failed.v1",
            EventPayload::RepositoryScanFailed(omni_intel_core::types::RepositoryScanFailed {
                error_code: "INVALID_INPUT".into(),
                error_message: "scenario probe".into(),
                retry_allowed: false,
            }),
            source("slow"),
        )?;
        Ok(Outcome::Ack(vec![failed]))
    }

    fn get_metrics(&self) -> HandlerMetrics {
        HandlerMetrics::default()
    }
}

fn scan_envelope() -> Envelope {
    Envelope::originate(
        "omninode.intelligence.event.repository_scan_requested.v1",
        Uuid::new_v4(),
        source("ingress"),
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

/// Scenario 6: backpressure — `max_in_flight=3`, 100 requests each
/// sleeping 100ms downstream. Observed concurrency must never exceed 3,
/// `max_in_flight_reached` must be incremented, and all 100 terminal
/// envelopes must be emitted.
#[tokio::test]
async fn scenario_backpressure_bounds_concurrent_invocations() {
    let in_flight = Arc::new(AtomicUsize::new(0));
    let max_observed = Arc::new(AtomicUsize::new(0));
    let handler = Arc::new(SlowHandler { in_flight: in_flight.clone(), max_observed: max_observed.clone(), sleep: Duration::from_millis(100) });

    let bus_config = BusConfig::default();
    let bus = Arc::new(InMemoryEventBus::new(1));
    let router = omni_intel_core::topics::TopicRouter::new(&bus_config);
    let outgoing_type = omni_intel_core::envelope::EventType::parse(
        "omninode.intelligence.event.repository_scan_failed.v1",
    )
    .expect("event type");
    let mut outgoing_rx = bus.take_receiver(&router.topic_for(&outgoing_type), 0).expect("outgoing receiver");

    let runtime_config = RuntimeConfig { max_in_flight: 3, ..RuntimeConfig::default() };
    let host = Arc::new(RuntimeHost::new(
        vec![handler],
        bus,
        bus_config,
        Arc::new(CircuitBreakerRegistry::new(CircuitBreakerConfig::default())),
        runtime_config,
    ));

    let mut tasks = Vec::with_capacity(100);
    for _ in 0..100 {
        let host = Arc::clone(&host);
        tasks.push(tokio::spawn(async move { host.process_one(scan_envelope()).await }));
    }
    for task in tasks {
        task.await.expect("join").expect("process_one");
    }

    assert!(max_observed.load(Ordering::SeqCst) <= 3);
    assert!(host.metrics().max_in_flight_reached() >= 1);

    let mut received = 0;
    while tokio::time::timeout(Duration::from_millis(50), outgoing_rx.recv()).await.is_ok() {
        received += 1;
    }
    assert_eq!(received, 100);
}

/// Crawler + indexer wired together over a small on-disk repository,
/// exercising the lexicographic discovery order and the document-request
/// cascade from a single `REPOSITORY_SCAN_REQUESTED` envelope.
#[tokio::test]
async fn crawler_and_indexer_compose_over_a_small_repository() {
    let dir = tempdir().expect("tempdir");
    std::fs::write(dir.path().join("a.py"), "def a(): pass").expect("write a");
    std::fs::write(dir.path().join("b.py"), "def b(): pass").expect("write b");

    let crawler = RepositoryCrawler::new(CrawlerConfig::default(), source("crawler"));
    let scan_request = Envelope::originate(
        "omninode.intelligence.event.repository_scan_requested.v1",
        Uuid::new_v4(),
        source("ingress"),
        EventPayload::RepositoryScanRequested(RepositoryScanRequested {
            repository_path: dir.path().to_str().expect("utf8").to_string(),
            project_id: Some("demo".into()),
            exclude_patterns: Vec::new(),
            file_patterns: Vec::new(),
            batch_size: 50,
        }),
    )
    .expect("originate");

    let Outcome::Ack(scan_events) = crawler.handle(scan_request).await.expect("crawl") else { panic!("ack") };
    let document_requests: Vec<Envelope> = scan_events
        .into_iter()
        .filter(|e| matches!(e.payload, EventPayload::DocumentIndexRequested(_)))
        .collect();
    assert_eq!(document_requests.len(), 2);

    let (indexer, _graph) = indexer_with_stores();
    for request in document_requests {
        let correlation_id = request.correlation_id;
        let Outcome::Ack(events) = indexer.handle(request).await.expect("index") else { panic!("ack") };
        let EventPayload::DocumentIndexCompleted(completed) = &events[0].payload else { panic!("completed") };
        assert_eq!(events[0].correlation_id, correlation_id);
        assert!(completed.chunks_indexed >= 1);
    }
}
