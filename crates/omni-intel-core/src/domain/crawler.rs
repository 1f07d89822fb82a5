//! Repository crawler (specification §4.6).
//!
//! On a `REPOSITORY_SCAN_REQUESTED` envelope, walks the tree once, prunes
//! excluded directories in-place, classifies surviving files, and cascades
//! a `DOCUMENT_INDEX_REQUESTED` envelope per file keyed by the parent
//! `correlation_id`, publishing in batches to smooth downstream load.

use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::Path;

use crate::config::CrawlerConfig;
use crate::domain::classify_language;
use crate::envelope::{Envelope, Source};
use crate::error::OmniResult;
use crate::handler::{AtomicHandlerMetrics, DeadLetterReason, Handler, HandlerMetrics, Outcome};
use crate::types::{
    DocumentIndexRequested, EventPayload, FileSummary, IndexingOptions, RepositoryScanCompleted,
    RepositoryScanFailed, RepositoryScanRequested,
};

const EVENT_TYPE: &str = "omninode.intelligence.event.repository_scan_requested.v1";
const COMPLETED_TYPE: &str = "omninode.intelligence.event.repository_scan_completed.v1";
const FAILED_TYPE: &str = "omninode.intelligence.event.repository_scan_failed.v1";
const REQUEST_TYPE: &str = "omninode.intelligence.event.document_index_requested.v1";

/// The repository crawler handler (§4.6).
pub struct RepositoryCrawler {
    config: CrawlerConfig,
    source: Source,
    metrics: AtomicHandlerMetrics,
}

impl RepositoryCrawler {
    /// Build a crawler bound to its configuration and emission identity.
    #[must_use]
    pub fn new(config: CrawlerConfig, source: Source) -> Self {
        Self { config, source, metrics: AtomicHandlerMetrics::default() }
    }

    fn failure_envelope(&self, parent: &Envelope, code: &str, message: String, retry_allowed: bool) -> OmniResult<Envelope> {
        parent.derive(
            FAILED_TYPE,
            EventPayload::RepositoryScanFailed(RepositoryScanFailed {
                error_code: code.to_string(),
                error_message: message,
                retry_allowed,
            }),
            self.source.clone(),
        )
    }

    fn scan(&self, req: &RepositoryScanRequested) -> OmniResult<Vec<DiscoveredFile>> {
        let root = Path::new(&req.repository_path);
        let mut exclude_patterns = self.config.default_exclude_patterns.clone();
        exclude_patterns.extend(req.exclude_patterns.iter().cloned());
        let exclude_set = build_glob_set(&exclude_patterns)?;
        let include_set = if req.file_patterns.is_empty() {
            None
        } else {
            Some(build_glob_set(&req.file_patterns)?)
        };

        let mut discovered = Vec::new();
        let mut walker = walkdir::WalkDir::new(root).into_iter();
        while let Some(entry) = walker.next() {
            let entry = entry.map_err(|e| crate::error::OmniError::Internal(format!("walk error: {e}")))?;
            let relative = entry
                .path()
                .strip_prefix(root)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .replace('\\', "/");
            if relative.is_empty() {
                continue;
            }
            if entry.file_type().is_dir() {
                if exclude_set.is_match(&relative) {
                    walker.skip_current_dir();
                }
                continue;
            }
            if !entry.file_type().is_file() {
                continue;
            }
            discovered.push(DiscoveredFile { relative_path: relative, absolute_path: entry.path().to_path_buf() });
        }
        discovered.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));

        let mut survivors = Vec::with_capacity(discovered.len());
        for file in discovered {
            let excluded = exclude_set.is_match(&file.relative_path);
            let included = match &include_set {
                Some(set) => set.is_match(&file.relative_path),
                None => true,
            };
            if excluded || !included {
                continue;
            }
            survivors.push(file);
        }
        Ok(survivors)
    }
}

struct DiscoveredFile {
    relative_path: String,
    absolute_path: std::path::PathBuf,
}

fn build_glob_set(patterns: &[String]) -> OmniResult<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| crate::error::OmniError::Validation(format!("invalid glob '{pattern}': {e}")))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| crate::error::OmniError::Validation(format!("invalid glob set: {e}")))
}

#[async_trait]
impl Handler for RepositoryCrawler {
    fn name(&self) -> &str {
        "repository_crawler"
    }

    fn can_handle(&self, event_type: &str) -> bool {
        event_type == EVENT_TYPE
    }

    async fn handle(&self, envelope: Envelope) -> OmniResult<Outcome> {
        self.metrics.record_invocation();

        let EventPayload::RepositoryScanRequested(req) = &envelope.payload else {
            self.metrics.record_dead_letter();
            return Ok(Outcome::DeadLetter(DeadLetterReason::new(
                "MALFORMED_ENVELOPE",
                "repository_scan_requested payload missing",
            )));
        };

        let root = Path::new(&req.repository_path);
        if !root.is_dir() {
            let failure = self.failure_envelope(
                &envelope,
                "INVALID_INPUT",
                format!("repository_path '{}' does not exist or is not a directory", req.repository_path),
                false,
            )?;
            self.metrics.record_ack();
            return Ok(Outcome::Ack(vec![failure]));
        }

        let files = match self.scan(req) {
            Ok(files) => files,
            Err(e) => {
                let failure = self.failure_envelope(&envelope, "INTERNAL_ERROR", e.to_string(), true)?;
                self.metrics.record_ack();
                return Ok(Outcome::Ack(vec![failure]));
            }
        };

        let batch_size = if req.batch_size == 0 { self.config.batch_size } else { req.batch_size };
        let mut outgoing = Vec::with_capacity(files.len() + 1);
        let mut summaries = Vec::with_capacity(files.len());
        let mut published = 0u64;
        let mut skipped = 0u64;

        for (index, file) in files.iter().enumerate() {
            let bytes = match std::fs::read(&file.absolute_path) {
                Ok(bytes) => bytes,
                Err(_) => {
                    skipped += 1;
                    continue;
                }
            };
            let content = String::from_utf8_lossy(&bytes).into_owned();
            let language = classify_language(&file.relative_path);

            let request_envelope = envelope.derive(
                REQUEST_TYPE,
                EventPayload::DocumentIndexRequested(DocumentIndexRequested {
                    source_path: file.relative_path.clone(),
                    content: Some(content),
                    language: language.clone(),
                    project_id: req.project_id.clone(),
                    repository_url: None,
                    commit_sha: None,
                    indexing_options: IndexingOptions::default(),
                    user_id: None,
                }),
                self.source.clone(),
            )?;
            outgoing.push(request_envelope);
            summaries.push(FileSummary {
                relative_path: file.relative_path.clone(),
                language,
                size_bytes: bytes.len() as u64,
            });
            published += 1;

            if (index + 1) % batch_size == 0 {
                tokio::task::yield_now().await;
            }
        }

        let batches_created = published.div_ceil(batch_size.max(1) as u64);

        let completed = envelope.derive(
            COMPLETED_TYPE,
            EventPayload::RepositoryScanCompleted(RepositoryScanCompleted {
                files_discovered: files.len() as u64,
                files_published: published,
                files_skipped: skipped,
                batches_created,
                file_summaries: summaries,
            }),
            self.source.clone(),
        )?;
        outgoing.push(completed);

        self.metrics.record_ack();
        Ok(Outcome::Ack(outgoing))
    }

    fn get_metrics(&self) -> HandlerMetrics {
        self.metrics.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;
    use uuid::Uuid;

    fn source() -> Source {
        Source { service: "crawler-test".into(), instance_id: "1".into() }
    }

    fn scan_envelope(path: &str) -> Envelope {
        Envelope::originate(
            EVENT_TYPE,
            Uuid::new_v4(),
            source(),
            EventPayload::RepositoryScanRequested(RepositoryScanRequested {
                repository_path: path.to_string(),
                project_id: Some("proj".into()),
                exclude_patterns: Vec::new(),
                file_patterns: Vec::new(),
                batch_size: 50,
            }),
        )
        .expect("originate")
    }

    #[tokio::test]
    async fn invalid_path_yields_failed_envelope() {
        let crawler = RepositoryCrawler::new(CrawlerConfig::default(), source());
        let outcome = crawler.handle(scan_envelope("/no/such/path")).await.expect("handle");
        let Outcome::Ack(envelopes) = outcome else { panic!("expected ack") };
        assert_eq!(envelopes.len(), 1);
        let EventPayload::RepositoryScanFailed(failed) = &envelopes[0].payload else { panic!("wrong payload") };
        assert_eq!(failed.error_code, "INVALID_INPUT");
        assert!(!failed.retry_allowed);
    }

    #[tokio::test]
    async fn walks_and_publishes_document_requests_in_lexicographic_order() {
        let dir = tempdir().expect("tempdir");
        fs::write(dir.path().join("b.py"), "b = 2").expect("write b");
        fs::write(dir.path().join("a.py"), "a = 1").expect("write a");
        fs::create_dir_all(dir.path().join("sub")).expect("mkdir sub");
        fs::write(dir.path().join("sub/c.py"), "c = 3").expect("write c");

        let crawler = RepositoryCrawler::new(CrawlerConfig::default(), source());
        let input = scan_envelope(dir.path().to_str().expect("utf8 path"));
        let correlation_id = input.correlation_id;
        let outcome = crawler.handle(input).await.expect("handle");
        let Outcome::Ack(envelopes) = outcome else { panic!("expected ack") };

        let requests: Vec<&Envelope> = envelopes
            .iter()
            .filter(|e| matches!(e.payload, EventPayload::DocumentIndexRequested(_)))
            .collect();
        assert_eq!(requests.len(), 3);
        assert!(requests.iter().all(|e| e.correlation_id == correlation_id));

        let paths: Vec<&str> = requests
            .iter()
            .map(|e| match &e.payload {
                EventPayload::DocumentIndexRequested(req) => req.source_path.as_str(),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(paths, vec!["a.py", "b.py", "sub/c.py"]);

        let completed = envelopes
            .iter()
            .find(|e| matches!(e.payload, EventPayload::RepositoryScanCompleted(_)))
            .expect("completed envelope present");
        let EventPayload::RepositoryScanCompleted(payload) = &completed.payload else { unreachable!() };
        assert_eq!(payload.files_discovered, 3);
        assert_eq!(payload.files_published, 3);
    }

    #[tokio::test]
    async fn excluded_directories_are_pruned() {
        let dir = tempdir().expect("tempdir");
        fs::create_dir_all(dir.path().join("target/deep")).expect("mkdir");
        fs::write(dir.path().join("target/deep/generated.rs"), "// gen").expect("write");
        fs::write(dir.path().join("main.rs"), "fn main() {}").expect("write main");

        let crawler = RepositoryCrawler::new(CrawlerConfig::default(), source());
        let outcome = crawler.handle(scan_envelope(dir.path().to_str().expect("utf8"))).await.expect("handle");
        let Outcome::Ack(envelopes) = outcome else { panic!("expected ack") };
        let requests: Vec<&str> = envelopes
            .iter()
            .filter_map(|e| match &e.payload {
                EventPayload::DocumentIndexRequested(req) => Some(req.source_path.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(requests, vec!["main.rs"]);
    }

    #[tokio::test]
    async fn excluded_wins_over_included_on_conflict() {
        let dir = tempdir().expect("tempdir");
        fs::write(dir.path().join("keep.py"), "x = 1").expect("write");
        fs::write(dir.path().join("drop.py"), "x = 2").expect("write");

        let crawler = RepositoryCrawler::new(CrawlerConfig::default(), source());
        let mut input = scan_envelope(dir.path().to_str().expect("utf8"));
        let EventPayload::RepositoryScanRequested(ref mut req) = input.payload else { unreachable!() };
        req.file_patterns = vec!["*.py".into()];
        req.exclude_patterns = vec!["drop.py".into()];

        let outcome = crawler.handle(input).await.expect("handle");
        let Outcome::Ack(envelopes) = outcome else { panic!("expected ack") };
        let requests: Vec<&str> = envelopes
            .iter()
            .filter_map(|e| match &e.payload {
                EventPayload::DocumentIndexRequested(req) => Some(req.source_path.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(requests, vec!["keep.py"]);
    }
}
