//! Envelope codec: serialization, event-type validation, and causal
//! derivation (specification §3.1, §4.1).
//!
//! Every message on the bus is wrapped in an [`Envelope`]. Envelopes are
//! immutable once emitted; [`derive`] is the only way to produce a new one
//! from a parent, and it is responsible for preserving `correlation_id` and
//! setting `causation_id`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{OmniError, OmniResult};
use crate::types::EventPayload;

/// Default cap on encoded envelope size, in bytes. Payloads larger than this
/// are rejected with `PAYLOAD_TOO_LARGE` (§4.1 edge case).
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 1024 * 1024;

/// A dotted, versioned event type name, validated against
/// `^[a-z_]+(\.[a-z_]+)+\.v\d+$` at construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EventType(String);

impl EventType {
    /// Parse and validate an event type string.
    ///
    /// # Errors
    /// Returns [`OmniError::MalformedEnvelope`] if `raw` does not match the
    /// required pattern.
    pub fn parse(raw: impl Into<String>) -> OmniResult<Self> {
        let raw = raw.into();
        if is_valid_event_type(&raw) {
            Ok(Self(raw))
        } else {
            Err(OmniError::MalformedEnvelope(format!(
                "event_type '{raw}' does not match ^[a-z_]+(\\.[a-z_]+)+\\.v\\d+$"
            )))
        }
    }

    /// Borrow the underlying string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for EventType {
    type Error = OmniError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<EventType> for String {
    fn from(value: EventType) -> Self {
        value.0
    }
}

/// Hand-rolled matcher for `^[a-z_]+(\.[a-z_]+)+\.v\d+$` avoiding a regex
/// dependency for a single fixed pattern.
fn is_valid_event_type(s: &str) -> bool {
    let segments: Vec<&str> = s.split('.').collect();
    if segments.len() < 3 {
        return false;
    }
    let (version, body) = match segments.split_last() {
        Some((last, rest)) => (*last, rest),
        None => return false,
    };
    if !version.starts_with('v') || version.len() < 2 {
        return false;
    }
    if !version[1..].bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }
    body.iter().all(|seg| {
        !seg.is_empty() && seg.bytes().all(|b| b.is_ascii_lowercase() || b == b'_')
    })
}

/// Identity of the originating service/instance (§3.1 `source`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    /// Logical service name, e.g. `"intelligence-orchestrator"`.
    pub service: String,
    /// Unique instance identifier (pod name, PID-derived id, etc.).
    pub instance_id: String,
}

/// The uniform wrapper around every message carrying routing and
/// correlation metadata (specification §3.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique identifier for this specific envelope.
    pub event_id: Uuid,
    /// Dotted, versioned event type name.
    pub event_type: EventType,
    /// Identifier shared by every envelope in a causal chain.
    pub correlation_id: Uuid,
    /// `event_id` of the triggering envelope; `None` only at ingress.
    pub causation_id: Option<Uuid>,
    /// RFC 3339 UTC timestamp.
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    /// Semver string of the envelope schema.
    pub version: String,
    /// Originating service/instance.
    pub source: Source,
    /// Event-type-specific payload.
    pub payload: EventPayload,
}

impl Envelope {
    /// Build a fresh, externally-originated envelope (no `causation_id`).
    ///
    /// # Errors
    /// Propagates [`EventType::parse`] validation failures.
    pub fn originate(
        event_type: impl Into<String>,
        correlation_id: Uuid,
        source: Source,
        payload: EventPayload,
    ) -> OmniResult<Self> {
        Ok(Self {
            event_id: Uuid::new_v4(),
            event_type: EventType::parse(event_type)?,
            correlation_id,
            causation_id: None,
            timestamp: now(),
            version: "1.0.0".to_string(),
            source,
            payload,
        })
    }

    /// Derive a new envelope from `self`, preserving `correlation_id` and
    /// chaining `causation_id` to this envelope's `event_id` (§4.1
    /// `derive`).
    ///
    /// # Errors
    /// Propagates [`EventType::parse`] validation failures.
    pub fn derive(
        &self,
        new_type: impl Into<String>,
        new_payload: EventPayload,
        source: Source,
    ) -> OmniResult<Self> {
        Ok(Self {
            event_id: Uuid::new_v4(),
            event_type: EventType::parse(new_type)?,
            correlation_id: self.correlation_id,
            causation_id: Some(self.event_id),
            timestamp: now(),
            version: self.version.clone(),
            source,
            payload: new_payload,
        })
    }

    /// Encode as canonical JSON: UTF-8 with lexicographically sorted keys,
    /// for deterministic fingerprinting (§4.1 `encode`).
    ///
    /// # Errors
    /// Returns [`OmniError::PayloadTooLarge`] if the encoded size exceeds
    /// `max_bytes`, or a serialization error.
    pub fn encode(&self, max_bytes: usize) -> OmniResult<Vec<u8>> {
        let value = serde_json::to_value(self)?;
        let canonical = canonicalize(&value);
        let bytes = serde_json::to_vec(&canonical)?;
        if bytes.len() > max_bytes {
            return Err(OmniError::PayloadTooLarge { size: bytes.len(), cap: max_bytes });
        }
        Ok(bytes)
    }

    /// Decode from bytes, rejecting anything missing a required header
    /// field or carrying an invalid `event_type` (§4.1 `decode`).
    ///
    /// # Errors
    /// Returns [`OmniError::MalformedEnvelope`] on any decode failure.
    pub fn decode(bytes: &[u8]) -> OmniResult<Self> {
        serde_json::from_slice::<Envelope>(bytes)
            .map_err(|e| OmniError::MalformedEnvelope(e.to_string()))
    }
}

/// Recursively sort JSON object keys so two structurally-equal envelopes
/// always serialize to the same byte string.
fn canonicalize(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut sorted: Vec<(&String, &serde_json::Value)> = map.iter().collect();
            sorted.sort_by(|a, b| a.0.cmp(b.0));
            let mut out = serde_json::Map::new();
            for (k, v) in sorted {
                out.insert(k.clone(), canonicalize(v));
            }
            serde_json::Value::Object(out)
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(canonicalize).collect())
        }
        other => other.clone(),
    }
}

/// Returns the current UTC time. Wrapped so tests can reason about ordering
/// without depending on wall-clock granularity assumptions elsewhere.
fn now() -> OffsetDateTime {
    static EPOCH_FALLBACK: OnceLock<OffsetDateTime> = OnceLock::new();
    OffsetDateTime::now_utc().max(*EPOCH_FALLBACK.get_or_init(OffsetDateTime::now_utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DocumentIndexRequested, IndexingOptions};

    fn sample_source() -> Source {
        Source { service: "test-service".into(), instance_id: "inst-1".into() }
    }

    fn sample_payload() -> EventPayload {
        EventPayload::DocumentIndexRequested(DocumentIndexRequested {
            source_path: "sample.py".into(),
            content: Some("def f(): return 1".into()),
            language: "python".into(),
            project_id: None,
            repository_url: None,
            commit_sha: None,
            indexing_options: IndexingOptions::default(),
            user_id: None,
        })
    }

    #[test]
    fn valid_event_types_parse() {
        assert!(EventType::parse("omninode.intelligence.event.document_index_completed.v1").is_ok());
        assert!(EventType::parse("a.b.v12").is_ok());
    }

    #[test]
    fn invalid_event_types_are_rejected() {
        assert!(EventType::parse("NoDots").is_err());
        assert!(EventType::parse("has.Capitals.v1").is_err());
        assert!(EventType::parse("missing.version").is_err());
        assert!(EventType::parse("trailing.dot.v1.").is_err());
        assert!(EventType::parse("bad.version.vX").is_err());
    }

    #[test]
    fn originate_has_no_causation_id() {
        let cid = Uuid::new_v4();
        let env = Envelope::originate(
            "omninode.intelligence.event.document_index_requested.v1",
            cid,
            sample_source(),
            sample_payload(),
        )
        .expect("originate");
        assert_eq!(env.correlation_id, cid);
        assert!(env.causation_id.is_none());
    }

    #[test]
    fn derive_preserves_correlation_and_chains_causation() {
        let cid = Uuid::new_v4();
        let parent = Envelope::originate(
            "omninode.intelligence.event.document_index_requested.v1",
            cid,
            sample_source(),
            sample_payload(),
        )
        .expect("originate");

        let child = parent
            .derive(
                "omninode.intelligence.event.document_index_completed.v1",
                sample_payload(),
                sample_source(),
            )
            .expect("derive");

        assert_eq!(child.correlation_id, cid);
        assert_eq!(child.causation_id, Some(parent.event_id));
        assert_ne!(child.event_id, parent.event_id);
    }

    #[test]
    fn encode_decode_roundtrip_preserves_identity() {
        let env = Envelope::originate(
            "omninode.intelligence.event.document_index_requested.v1",
            Uuid::new_v4(),
            sample_source(),
            sample_payload(),
        )
        .expect("originate");

        let bytes = env.encode(DEFAULT_MAX_PAYLOAD_BYTES).expect("encode");
        let decoded = Envelope::decode(&bytes).expect("decode");
        assert_eq!(decoded.event_id, env.event_id);
        assert_eq!(decoded.correlation_id, env.correlation_id);
        assert_eq!(decoded.event_type, env.event_type);
    }

    #[test]
    fn encode_rejects_oversized_payload() {
        let env = Envelope::originate(
            "omninode.intelligence.event.document_index_requested.v1",
            Uuid::new_v4(),
            sample_source(),
            sample_payload(),
        )
        .expect("originate");
        let result = env.encode(16);
        assert!(matches!(result, Err(OmniError::PayloadTooLarge { .. })));
    }

    #[test]
    fn decode_rejects_garbage_bytes() {
        let result = Envelope::decode(b"not json at all");
        assert!(matches!(result, Err(OmniError::MalformedEnvelope(_))));
    }

    #[test]
    fn encode_is_deterministic_key_order() {
        let env = Envelope::originate(
            "omninode.intelligence.event.document_index_requested.v1",
            Uuid::new_v4(),
            sample_source(),
            sample_payload(),
        )
        .expect("originate");
        let a = env.encode(DEFAULT_MAX_PAYLOAD_BYTES).expect("encode a");
        let b = env.encode(DEFAULT_MAX_PAYLOAD_BYTES).expect("encode b");
        assert_eq!(a, b);
    }
}
