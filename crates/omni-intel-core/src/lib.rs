//! `omni-intel-core`: the event orchestration bus, repository indexing
//! pipeline, and idempotent context-item writer for OmniIntelligence.
//!
//! This crate implements the three cooperating layers described in the
//! specification:
//!
//! - **L1 Transport**: [`envelope`], [`topics`] — envelope codec and topic
//!   routing.
//! - **L2 Orchestration**: [`handler`], [`resilience`], [`runtime`] — the
//!   handler ABI, circuit breaker, retry policy, and the runtime host's
//!   consume loop.
//! - **L3 Domain**: [`domain`] — the repository crawler, document indexer
//!   orchestrator, context-item writer, embedding batch producer, and tree
//!   visualisation service.
//!
//! [`adapters`] holds the backend integrations (relational store, vector
//! store, graph store, embedding service, retryable HTTP client, and the
//! in-process event bus used for tests and single-node deployments).
//! [`config`] and [`error`] carry the ambient configuration and error
//! taxonomy shared across every layer.

pub mod adapters;
pub mod config;
pub mod domain;
pub mod envelope;
pub mod error;
pub mod fingerprint;
pub mod handler;
pub mod resilience;
pub mod runtime;
pub mod topics;
pub mod types;
