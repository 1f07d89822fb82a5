//! Operational CLI for the OmniIntelligence core (specification §6 "CLI
//! (operational only)").
//!
//! This binary is a thin batch-orchestration shell around
//! `omni-intel-core`: it wires the in-process adapter defaults (SQLite
//! relational store, in-memory vector/graph stores, deterministic or
//! HTTP-backed embedding service) and drives the repository crawler and
//! document indexer directly, without a live event bus. A production
//! deployment instead runs `omni-intel-core::runtime::RuntimeHost` against
//! a real partitioned log; this tool exists for local backfills, smoke
//! tests, and inspecting the graph it produces.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use omni_intel_core::adapters::{
    DeterministicEmbeddingService, InMemoryGraphStore, InMemoryVectorStore, SqliteRelationalStore,
};
use omni_intel_core::config::Config;
use omni_intel_core::domain::context_writer::ContextItemWriter;
use omni_intel_core::domain::crawler::RepositoryCrawler;
use omni_intel_core::domain::indexer::DocumentIndexer;
use omni_intel_core::domain::tree_viz::TreeVisualizationService;
use omni_intel_core::envelope::{Envelope, Source};
use omni_intel_core::handler::{Handler, Outcome};
use omni_intel_core::resilience::CircuitBreakerRegistry;
use omni_intel_core::types::{
    EventPayload, GraphNode, RepositoryScanRequested, TreeVisualizationRequested,
};

/// Universal code context engine: event-driven indexing core, operated
/// from the command line for local backfills and inspection.
#[derive(Parser, Debug)]
#[command(name = "omni-intel", version, about = "OmniIntelligence indexing core CLI")]
struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,

    /// Path to a YAML configuration overlay.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging (debug level instead of the configured filter).
    #[arg(long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Crawl and index a repository root end to end.
    Index {
        /// Path to the repository root.
        path: String,

        /// Project identifier to stamp on every indexed file.
        #[arg(long, default_value = "default")]
        project_name: String,

        /// Number of files to publish per crawl batch.
        #[arg(long, default_value_t = 50)]
        batch_size: usize,

        /// Stop after discovering this many files (0 = unlimited).
        #[arg(long, default_value_t = 0)]
        max_files: usize,

        /// Walk and classify files without writing to any store.
        #[arg(long)]
        dry_run: bool,
    },

    /// Re-embed and write a set of files directly through the embedding
    /// batch producer, bypassing the crawler/indexer fan-out.
    Backfill {
        /// Path to the repository root.
        path: String,

        /// Project identifier, carried through as the crawl scope.
        #[arg(long, default_value = "default")]
        project_name: String,

        /// Batch size handed to the context-item writer.
        #[arg(long, default_value_t = 25)]
        batch_size: usize,

        /// Re-embed at most this many files (0 = unlimited).
        #[arg(long, default_value_t = 0)]
        max_files: usize,

        /// Report what would be embedded without writing anything.
        #[arg(long)]
        dry_run: bool,
    },

    /// Render the file-tree for a previously-indexed project.
    Tree {
        /// Project name to visualise.
        project_name: String,

        /// Maximum recursion depth.
        #[arg(long, default_value_t = 8)]
        max_depth: u32,

        /// Resolve outgoing IMPORTS edges for FILE children.
        #[arg(long)]
        include_dependencies: bool,
    },

    /// Show the effective configuration (defaults + YAML overlay + env).
    Config,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "failed to load configuration");
            return ExitCode::from(1);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!(error = %e, "failed to start async runtime");
            return ExitCode::from(1);
        }
    };

    let result = runtime.block_on(run(cli.command, config));
    match result {
        Ok(()) => ExitCode::from(0),
        Err(Interrupted) => ExitCode::from(130),
        Err(Fatal(e)) => {
            tracing::error!(error = %e, "command failed");
            ExitCode::from(1)
        }
    }
}

/// Terminal disposition of a CLI command, mirroring the exit-code contract
/// in §6: 0 success, 1 fatal error, 130 interrupted.
enum CliError {
    Interrupted,
    Fatal(anyhow::Error),
}
use CliError::{Fatal, Interrupted};

impl<E: Into<anyhow::Error>> From<E> for CliError {
    fn from(e: E) -> Self {
        Fatal(e.into())
    }
}

async fn run(command: Commands, config: Config) -> Result<(), CliError> {
    let cancelled = tokio::signal::ctrl_c();
    tokio::pin!(cancelled);

    let work = dispatch(command, config);
    tokio::pin!(work);

    tokio::select! {
        result = &mut work => result,
        _ = &mut cancelled => Err(Interrupted),
    }
}

async fn dispatch(command: Commands, config: Config) -> Result<(), CliError> {
    match command {
        Commands::Index { path, project_name, batch_size, max_files, dry_run } => {
            index_repository(&path, &project_name, batch_size, max_files, dry_run, &config).await
        }
        Commands::Backfill { path, project_name, batch_size, max_files, dry_run } => {
            backfill(&path, &project_name, batch_size, max_files, dry_run, &config).await
        }
        Commands::Tree { project_name, max_depth, include_dependencies } => {
            tree(&project_name, max_depth, include_dependencies).await
        }
        Commands::Config => {
            print_config(&config)
        }
    }
}

fn source(instance: &str) -> Source {
    Source { service: "omni-intel-cli".to_string(), instance_id: instance.to_string() }
}

async fn index_repository(
    path: &str,
    project_name: &str,
    batch_size: usize,
    max_files: usize,
    dry_run: bool,
    config: &Config,
) -> Result<(), CliError> {
    let graph = Arc::new(InMemoryGraphStore::new());
    graph
        .upsert_node(GraphNode::Project { name: project_name.to_string(), path: path.to_string() })
        .await?;

    let crawler = RepositoryCrawler::new(config.crawler.clone(), source("crawler"));
    let scan_request = Envelope::originate(
        "omninode.intelligence.event.repository_scan_requested.v1",
        Uuid::new_v4(),
        source("cli"),
        EventPayload::RepositoryScanRequested(RepositoryScanRequested {
            repository_path: path.to_string(),
            project_id: Some(project_name.to_string()),
            exclude_patterns: Vec::new(),
            file_patterns: Vec::new(),
            batch_size,
        }),
    )?;

    let Outcome::Ack(scan_events) = crawler.handle(scan_request).await? else {
        return Err(Fatal(anyhow::anyhow!("crawler did not ack the scan request")));
    };

    let mut document_requests: Vec<Envelope> = scan_events
        .into_iter()
        .filter(|e| matches!(e.payload, EventPayload::DocumentIndexRequested(_)))
        .collect();
    if max_files > 0 {
        document_requests.truncate(max_files);
    }

    println!("discovered {} file(s) to index under {path}", document_requests.len());
    if dry_run {
        for envelope in &document_requests {
            if let EventPayload::DocumentIndexRequested(req) = &envelope.payload {
                println!("  would index: {} ({})", req.source_path, req.language);
            }
        }
        return Ok(());
    }

    let relational = Arc::new(SqliteRelationalStore::open_in_memory()?);
    let vector = Arc::new(InMemoryVectorStore::new());
    let writer = Arc::new(ContextItemWriter::new(
        relational,
        vector,
        graph.clone(),
        &config.bootstrap,
        source("writer"),
    ));
    let embedding: Arc<dyn omni_intel_core::adapters::EmbeddingService> = Arc::new(DeterministicEmbeddingService);
    let breakers = Arc::new(CircuitBreakerRegistry::new(config.circuit_breaker));
    let indexer = DocumentIndexer::new(graph, writer, embedding, breakers, config.indexer, source("indexer"));

    let mut files_indexed = 0u64;
    let mut entities_extracted = 0u64;
    let mut chunks_indexed = 0u64;
    let mut failed = 0u64;

    for request in document_requests {
        match indexer.handle(request).await? {
            Outcome::Ack(events) => {
                for event in events {
                    match event.payload {
                        EventPayload::DocumentIndexCompleted(completed) => {
                            files_indexed += 1;
                            entities_extracted += completed.entities_extracted;
                            chunks_indexed += completed.chunks_indexed;
                        }
                        EventPayload::DocumentIndexFailed(failure) => {
                            failed += 1;
                            tracing::warn!(error_code = %failure.error_code, message = %failure.error_message, "document failed to index");
                        }
                        _ => {}
                    }
                }
            }
            other => {
                tracing::warn!(?other, "unexpected outcome from document indexer");
                failed += 1;
            }
        }
    }

    println!("indexed {files_indexed} file(s), {entities_extracted} entities, {chunks_indexed} chunks, {failed} failure(s)");
    Ok(())
}

async fn backfill(
    path: &str,
    project_name: &str,
    batch_size: usize,
    max_files: usize,
    dry_run: bool,
    config: &Config,
) -> Result<(), CliError> {
    let mut files = Vec::new();
    for entry in walkdir::WalkDir::new(path).into_iter().filter_map(Result::ok) {
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(path)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .replace('\\', "/");
        files.push(relative);
    }
    files.sort();
    if max_files > 0 {
        files.truncate(max_files);
    }

    println!("backfilling {} file(s) under {path} for project {project_name}", files.len());
    if dry_run {
        for relative in &files {
            println!("  would embed: {relative}");
        }
        return Ok(());
    }

    let graph = Arc::new(InMemoryGraphStore::new());
    let relational = Arc::new(SqliteRelationalStore::open_in_memory()?);
    let vector = Arc::new(InMemoryVectorStore::new());
    let writer = Arc::new(ContextItemWriter::new(relational, vector, graph.clone(), &config.bootstrap, source("writer")));

    let mut embedding_config = config.embedding;
    embedding_config.batch_size = batch_size;
    let producer = omni_intel_core::domain::embedding_producer::EmbeddingBatchProducer::new(
        Arc::new(DeterministicEmbeddingService),
        writer,
        embedding_config,
    );

    let root = PathBuf::from(path);
    let mut to_embed = Vec::with_capacity(files.len());
    for relative in &files {
        let absolute = root.join(relative);
        let Ok(bytes) = std::fs::read(&absolute) else { continue };
        graph
            .upsert_node(GraphNode::File {
                path: relative.clone(),
                relative_path: relative.clone(),
                name: relative.rsplit('/').next().unwrap_or(relative).to_string(),
                file_type: omni_intel_core::domain::classify_language(relative),
                size: bytes.len() as u64,
                entity_count: 0,
                import_count: 0,
                last_modified: "1970-01-01T00:00:00Z".to_string(),
                file_hash: String::new(),
                entity_id: None,
            })
            .await?;
        to_embed.push(omni_intel_core::domain::embedding_producer::FileToEmbed {
            source_ref: relative.clone(),
            bytes,
            crawl_scope: project_name.to_string(),
            correlation_id: Uuid::new_v4(),
        });
    }

    let summary = producer.run(to_embed).await;
    println!(
        "embedded {}, skipped_too_large {}, skipped_binary {}, failed_embedding {} (created {} / updated {} / skipped {} / failed {})",
        summary.embedded,
        summary.skipped_too_large,
        summary.skipped_binary,
        summary.failed_embedding,
        summary.items_created,
        summary.items_updated,
        summary.items_skipped,
        summary.items_failed,
    );
    Ok(())
}

async fn tree(project_name: &str, max_depth: u32, include_dependencies: bool) -> Result<(), CliError> {
    // A fresh empty graph: this subcommand is meant to be pointed at a
    // deployment's real graph store adapter, not the CLI's own
    // throwaway in-memory one. It still exercises the full handler so
    // `PROJECT_NOT_FOUND` and depth-limited walks behave identically to
    // the runtime-hosted path.
    let graph = Arc::new(InMemoryGraphStore::new());
    let service = TreeVisualizationService::new(graph, source("tree"));

    let request = Envelope::originate(
        "omninode.intelligence.event.tree_visualization_requested.v1",
        Uuid::new_v4(),
        source("cli"),
        EventPayload::TreeVisualizationRequested(TreeVisualizationRequested {
            project_name: project_name.to_string(),
            max_depth,
            include_dependencies,
        }),
    )?;

    let Outcome::Ack(events) = service.handle(request).await? else {
        return Err(Fatal(anyhow::anyhow!("tree visualization service did not ack")));
    };
    for event in events {
        match event.payload {
            EventPayload::TreeVisualizationCompleted(completed) => {
                let rendered = serde_json::to_string_pretty(&completed)?;
                println!("{rendered}");
            }
            EventPayload::TreeVisualizationFailed(failure) => {
                println!("{}: {}", failure.error_code, failure.error_message);
                return Err(Fatal(anyhow::anyhow!(failure.error_message)));
            }
            _ => {}
        }
    }
    Ok(())
}

fn print_config(config: &Config) -> Result<(), CliError> {
    let rendered = serde_yaml::to_string(config)?;
    println!("{rendered}");
    Ok(())
}
