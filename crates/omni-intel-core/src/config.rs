//! Configuration loading and validation (specification §6, §9).
//!
//! Configuration is resolved with the following precedence (highest wins):
//!
//! 1. CLI flags (layered on by the `omni-intel-cli` binary)
//! 2. Environment variables (`{SERVICE}_CONFIG_NAME`, e.g.
//!    `KAFKA_BOOTSTRAP_SERVERS`, `HTTP_CLIENT_MAX_CONNECTIONS`)
//! 3. A YAML overlay file
//! 4. Compiled-in defaults
//!
//! This mirrors the teacher crate's `Config::load` overlay method, with
//! `serde_yaml` standing in for `toml` per the external-interfaces section
//! of the specification.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::error::{OmniError, OmniResult};

/// Top-level configuration for the OmniIntelligence core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Event bus configuration.
    #[serde(default)]
    pub bus: BusConfig,

    /// Runtime host backpressure/handler configuration.
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Retryable HTTP adapter configuration.
    #[serde(default)]
    pub http_client: HttpClientConfig,

    /// Circuit breaker defaults.
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    /// Repository crawler configuration.
    #[serde(default)]
    pub crawler: CrawlerConfig,

    /// Document indexer orchestrator configuration.
    #[serde(default)]
    pub indexer: IndexerConfig,

    /// Embedding batch producer configuration.
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// Bootstrap-tier classification configuration.
    #[serde(default)]
    pub bootstrap: BootstrapConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Embedding service endpoint override (`EMBEDDING_MODEL_URL`). `None`
    /// selects the deterministic in-process test double.
    #[serde(default)]
    pub embedding_model_url: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bus: BusConfig::default(),
            runtime: RuntimeConfig::default(),
            http_client: HttpClientConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            crawler: CrawlerConfig::default(),
            indexer: IndexerConfig::default(),
            embedding: EmbeddingConfig::default(),
            bootstrap: BootstrapConfig::default(),
            logging: LoggingConfig::default(),
            embedding_model_url: None,
        }
    }
}

/// Event bus connection settings (§6 "Event bus").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Bootstrap servers / broker address list.
    #[serde(default = "BusConfig::default_bootstrap_servers")]
    pub bootstrap_servers: String,
    /// Deployment environment segment used in topic names (`{env}.…`).
    #[serde(default = "BusConfig::default_env")]
    pub env: String,
    /// Logical service name used in topic names and envelope `source`.
    #[serde(default = "BusConfig::default_service_name")]
    pub service_name: String,
    /// Number of in-memory partitions for the default adapter.
    #[serde(default = "BusConfig::default_partitions")]
    pub partitions: usize,
}

impl BusConfig {
    fn default_bootstrap_servers() -> String {
        "localhost:9092".to_string()
    }
    fn default_env() -> String {
        "dev".to_string()
    }
    fn default_service_name() -> String {
        "archon-intelligence".to_string()
    }
    fn default_partitions() -> usize {
        8
    }

    /// The dead-letter topic for this deployment (§6).
    #[must_use]
    pub fn dead_letter_topic(&self) -> String {
        format!("{}.{}.dlq.v1", self.env, self.service_name)
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: Self::default_bootstrap_servers(),
            env: Self::default_env(),
            service_name: Self::default_service_name(),
            partitions: Self::default_partitions(),
        }
    }
}

/// Runtime host settings (§4.3, §5 Backpressure).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Maximum number of envelopes processed concurrently by the runtime host.
    #[serde(default = "RuntimeConfig::default_max_in_flight")]
    pub max_in_flight: usize,
    /// Per-handler invocation timeout (indexing default, §5).
    #[serde(default = "RuntimeConfig::default_handler_timeout_secs")]
    pub handler_timeout_secs: u64,
    /// Grace window given to in-flight handlers during shutdown (§5 Cancellation).
    #[serde(default = "RuntimeConfig::default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl RuntimeConfig {
    fn default_max_in_flight() -> usize {
        64
    }
    fn default_handler_timeout_secs() -> u64 {
        30
    }
    fn default_shutdown_grace_secs() -> u64 {
        10
    }

    /// The handler timeout as a [`Duration`].
    #[must_use]
    pub fn handler_timeout(&self) -> Duration {
        Duration::from_secs(self.handler_timeout_secs)
    }

    /// The shutdown grace window as a [`Duration`].
    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_in_flight: Self::default_max_in_flight(),
            handler_timeout_secs: Self::default_handler_timeout_secs(),
            shutdown_grace_secs: Self::default_shutdown_grace_secs(),
        }
    }
}

/// Retryable HTTP adapter settings (§4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpClientConfig {
    /// Maximum pooled connections per downstream service.
    #[serde(default = "HttpClientConfig::default_max_connections")]
    pub max_connections: usize,
    /// Maximum idle keep-alive connections retained in the pool.
    #[serde(default = "HttpClientConfig::default_max_keepalive_connections")]
    pub max_keepalive_connections: usize,
    /// Connect timeout, in milliseconds.
    #[serde(default = "HttpClientConfig::default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Read timeout, in milliseconds.
    #[serde(default = "HttpClientConfig::default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    /// Write timeout, in milliseconds.
    #[serde(default = "HttpClientConfig::default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    /// Maximum retry attempts (§4.5).
    #[serde(default = "HttpClientConfig::default_max_attempts")]
    pub max_attempts: u32,
    /// Base back-off delay, in milliseconds (default sequence 1s, 2s, 4s).
    #[serde(default = "HttpClientConfig::default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Back-off delay cap, in milliseconds.
    #[serde(default = "HttpClientConfig::default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl HttpClientConfig {
    fn default_max_connections() -> usize {
        32
    }
    fn default_max_keepalive_connections() -> usize {
        16
    }
    fn default_connect_timeout_ms() -> u64 {
        5_000
    }
    fn default_read_timeout_ms() -> u64 {
        10_000
    }
    fn default_write_timeout_ms() -> u64 {
        10_000
    }
    fn default_max_attempts() -> u32 {
        3
    }
    fn default_base_delay_ms() -> u64 {
        1_000
    }
    fn default_max_delay_ms() -> u64 {
        10_000
    }
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            max_connections: Self::default_max_connections(),
            max_keepalive_connections: Self::default_max_keepalive_connections(),
            connect_timeout_ms: Self::default_connect_timeout_ms(),
            read_timeout_ms: Self::default_read_timeout_ms(),
            write_timeout_ms: Self::default_write_timeout_ms(),
            max_attempts: Self::default_max_attempts(),
            base_delay_ms: Self::default_base_delay_ms(),
            max_delay_ms: Self::default_max_delay_ms(),
        }
    }
}

/// Circuit breaker defaults (§4.4), applied per `{handler, downstream}` scope
/// unless a scope-specific override is registered at runtime.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before `CLOSED -> OPEN`.
    #[serde(default = "CircuitBreakerConfig::default_failure_threshold")]
    pub failure_threshold: u32,
    /// Recovery timer before `OPEN -> HALF_OPEN`, in seconds.
    #[serde(default = "CircuitBreakerConfig::default_recovery_timeout_secs")]
    pub recovery_timeout_secs: u64,
    /// Maximum concurrent probes allowed in `HALF_OPEN`.
    #[serde(default = "CircuitBreakerConfig::default_half_open_max_attempts")]
    pub half_open_max_attempts: u32,
}

impl CircuitBreakerConfig {
    fn default_failure_threshold() -> u32 {
        5
    }
    fn default_recovery_timeout_secs() -> u64 {
        60
    }
    fn default_half_open_max_attempts() -> u32 {
        1
    }

    /// Recovery timer as a [`Duration`].
    #[must_use]
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_secs)
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: Self::default_failure_threshold(),
            recovery_timeout_secs: Self::default_recovery_timeout_secs(),
            half_open_max_attempts: Self::default_half_open_max_attempts(),
        }
    }
}

/// Repository crawler settings (§4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlerConfig {
    /// Default publish batch size.
    #[serde(default = "CrawlerConfig::default_batch_size")]
    pub batch_size: usize,
    /// Default directory/file exclude globs, applied unless the request
    /// overrides them.
    #[serde(default = "CrawlerConfig::default_exclude_patterns")]
    pub default_exclude_patterns: Vec<String>,
}

impl CrawlerConfig {
    fn default_batch_size() -> usize {
        50
    }
    fn default_exclude_patterns() -> Vec<String> {
        vec![
            "**/.git/**".into(),
            "**/node_modules/**".into(),
            "**/target/**".into(),
            "**/__pycache__/**".into(),
            "**/.venv/**".into(),
            "**/dist/**".into(),
            "**/build/**".into(),
        ]
    }
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            batch_size: Self::default_batch_size(),
            default_exclude_patterns: Self::default_exclude_patterns(),
        }
    }
}

/// Document indexer orchestrator settings (§4.7).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct IndexerConfig {
    /// Semaphore capacity bounding concurrent document fan-outs.
    #[serde(default = "IndexerConfig::default_max_concurrent_documents")]
    pub max_concurrent_documents: usize,
    /// Join timeout for fan-out sub-calls, in seconds.
    #[serde(default = "IndexerConfig::default_join_timeout_secs")]
    pub join_timeout_secs: u64,
}

impl IndexerConfig {
    fn default_max_concurrent_documents() -> usize {
        16
    }
    fn default_join_timeout_secs() -> u64 {
        30
    }

    /// The join timeout as a [`Duration`].
    #[must_use]
    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_secs)
    }
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_documents: Self::default_max_concurrent_documents(),
            join_timeout_secs: Self::default_join_timeout_secs(),
        }
    }
}

/// Embedding batch producer settings (§4.9).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Maximum in-flight embedding requests.
    #[serde(default = "EmbeddingConfig::default_max_concurrent")]
    pub max_concurrent: usize,
    /// Inter-request delay, in milliseconds, capping throughput.
    #[serde(default = "EmbeddingConfig::default_inter_request_delay_ms")]
    pub inter_request_delay_ms: u64,
    /// Per-attempt timeout, in seconds.
    #[serde(default = "EmbeddingConfig::default_timeout_secs")]
    pub timeout_secs: u64,
    /// Maximum retries per embedding request.
    #[serde(default = "EmbeddingConfig::default_max_retries")]
    pub max_retries: u32,
    /// Files larger than this (in bytes) are skipped (`skipped_too_large`).
    #[serde(default = "EmbeddingConfig::default_max_file_bytes")]
    pub max_file_bytes: u64,
    /// Batch size handed to the context-item writer.
    #[serde(default = "EmbeddingConfig::default_batch_size")]
    pub batch_size: usize,
}

impl EmbeddingConfig {
    fn default_max_concurrent() -> usize {
        5
    }
    fn default_inter_request_delay_ms() -> u64 {
        20
    }
    fn default_timeout_secs() -> u64 {
        30
    }
    fn default_max_retries() -> u32 {
        3
    }
    fn default_max_file_bytes() -> u64 {
        2 * 1024 * 1024
    }
    fn default_batch_size() -> usize {
        25
    }

    /// Per-attempt timeout as a [`Duration`].
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Inter-request delay as a [`Duration`].
    #[must_use]
    pub fn inter_request_delay(&self) -> Duration {
        Duration::from_millis(self.inter_request_delay_ms)
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            max_concurrent: Self::default_max_concurrent(),
            inter_request_delay_ms: Self::default_inter_request_delay_ms(),
            timeout_secs: Self::default_timeout_secs(),
            max_retries: Self::default_max_retries(),
            max_file_bytes: Self::default_max_file_bytes(),
            batch_size: Self::default_batch_size(),
        }
    }
}

/// Bootstrap-tier classification settings (§3.5, §9 Open Question —
/// confidence values are configurable per deployment, defaulting to the
/// hard-coded table from the source's `bootstrap_config` equivalent).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapConfig {
    /// First-match-wins list of `(glob, tier, confidence)`.
    #[serde(default = "BootstrapConfig::default_tiers")]
    pub tiers: Vec<BootstrapTierRule>,
}

/// A single bootstrap-tier classification rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapTierRule {
    /// Glob matched against `source_ref`.
    pub pattern: String,
    /// Tier assigned on match (`"validated"` or `"quarantine"`).
    pub tier: String,
    /// Confidence assigned on match, in `[0.0, 1.0]`.
    pub confidence: f64,
}

impl BootstrapConfig {
    fn default_tiers() -> Vec<BootstrapTierRule> {
        vec![
            BootstrapTierRule {
                pattern: "**/tests/**".into(),
                tier: "validated".into(),
                confidence: 0.95,
            },
            BootstrapTierRule {
                pattern: "**/*_test.*".into(),
                tier: "validated".into(),
                confidence: 0.95,
            },
            BootstrapTierRule {
                pattern: "**/vendor/**".into(),
                tier: "quarantine".into(),
                confidence: 0.2,
            },
            BootstrapTierRule {
                pattern: "**/third_party/**".into(),
                tier: "quarantine".into(),
                confidence: 0.2,
            },
            BootstrapTierRule {
                pattern: "src/**".into(),
                tier: "validated".into(),
                confidence: 0.8,
            },
        ]
    }
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self { tiers: Self::default_tiers() }
    }
}

/// Logging configuration (`tracing-subscriber` env-filter + optional JSON).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive string.
    #[serde(default = "LoggingConfig::default_filter")]
    pub filter: String,
    /// Emit structured JSON instead of human-readable text.
    #[serde(default)]
    pub json: bool,
}

impl LoggingConfig {
    fn default_filter() -> String {
        "info".to_string()
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { filter: Self::default_filter(), json: false }
    }
}

impl Config {
    /// Load configuration with precedence env > YAML overlay > defaults.
    /// CLI flags are layered on top of the returned value by callers (the
    /// `omni-intel-cli` binary), since `clap` owns argument parsing there.
    ///
    /// # Errors
    /// Returns [`OmniError::Config`] if `yaml_path` is given but cannot be
    /// read or parsed, or if an environment variable holds a value of the
    /// wrong type for its field.
    pub fn load(yaml_path: Option<&Path>) -> OmniResult<Self> {
        let mut config = match yaml_path {
            Some(path) => Self::from_yaml_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        Ok(config)
    }

    fn from_yaml_file(path: &Path) -> OmniResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| OmniError::Config(format!("reading {}: {e}", path.display())))?;
        serde_yaml::from_str(&text)
            .map_err(|e| OmniError::Config(format!("parsing {}: {e}", path.display())))
    }

    /// Apply `{SERVICE}_CONFIG_NAME`-shaped environment variable overrides
    /// (§6 Configuration). Only a curated set of high-value keys is wired;
    /// unknown env vars are ignored rather than rejected.
    fn apply_env_overrides(&mut self) -> OmniResult<()> {
        if let Ok(v) = std::env::var("KAFKA_BOOTSTRAP_SERVERS") {
            self.bus.bootstrap_servers = v;
        }
        if let Ok(v) = std::env::var("OMNI_ENV") {
            self.bus.env = v;
        }
        if let Ok(v) = std::env::var("OMNI_SERVICE_NAME") {
            self.bus.service_name = v;
        }
        if let Ok(v) = std::env::var("RUNTIME_MAX_IN_FLIGHT") {
            self.runtime.max_in_flight = parse_env(&v, "RUNTIME_MAX_IN_FLIGHT")?;
        }
        if let Ok(v) = std::env::var("HTTP_CLIENT_MAX_CONNECTIONS") {
            self.http_client.max_connections = parse_env(&v, "HTTP_CLIENT_MAX_CONNECTIONS")?;
        }
        if let Ok(v) = std::env::var("HTTP_CLIENT_MAX_ATTEMPTS") {
            self.http_client.max_attempts = parse_env(&v, "HTTP_CLIENT_MAX_ATTEMPTS")?;
        }
        if let Ok(v) = std::env::var("EMBEDDING_MODEL_URL") {
            self.embedding_model_url = Some(v);
        }
        if let Ok(v) = std::env::var("EMBEDDING_MAX_CONCURRENT") {
            self.embedding.max_concurrent = parse_env(&v, "EMBEDDING_MAX_CONCURRENT")?;
        }
        if let Ok(v) = std::env::var("CIRCUIT_BREAKER_FAILURE_THRESHOLD") {
            self.circuit_breaker.failure_threshold =
                parse_env(&v, "CIRCUIT_BREAKER_FAILURE_THRESHOLD")?;
        }
        if let Ok(v) = std::env::var("LOG_LEVEL") {
            self.logging.filter = v;
        }
        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(raw: &str, key: &str) -> OmniResult<T> {
    raw.parse::<T>()
        .map_err(|_| OmniError::Config(format!("{key} must be a valid value, got {raw:?}")))
}

/// Raw env/config escape hatch for settings that don't yet have a typed
/// home (mirrors `{SERVICE}_CONFIG_NAME` generality from §6).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtraSettings(pub BTreeMap<String, String>);
