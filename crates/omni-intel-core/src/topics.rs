//! Topic routing: `event_type -> topic` resolution (specification §4.1,
//! §6 "Event bus").
//!
//! Topics follow `{env}.{service}.{aspect}.{operation-kebab}.v{n}`. The
//! router resolves via a compile-time table keyed by `event_type`, with an
//! environment-variable override (`TOPIC_OVERRIDE_<event_type in SCREAMING
//! form>`) checked first. Unknown event types resolve to the dead-letter
//! topic.

use crate::config::BusConfig;
use crate::envelope::EventType;

/// A resolved topic name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topic(pub String);

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Resolves event types to topics for a given deployment (§4.1 `topic_for`).
pub struct TopicRouter<'a> {
    bus: &'a BusConfig,
}

impl<'a> TopicRouter<'a> {
    /// Build a router bound to the given bus configuration.
    #[must_use]
    pub fn new(bus: &'a BusConfig) -> Self {
        Self { bus }
    }

    /// Resolve `event_type` to its topic, falling back to the dead-letter
    /// topic for unrecognised types (§4.1).
    #[must_use]
    pub fn topic_for(&self, event_type: &EventType) -> Topic {
        if let Ok(over_ride) = std::env::var(env_override_key(event_type.as_str())) {
            return Topic(over_ride);
        }
        match aspect_and_operation(event_type.as_str()) {
            Some((aspect, operation, version)) => Topic(format!(
                "{}.{}.{}.{}.v{}",
                self.bus.env, self.bus.service_name, aspect, operation, version
            )),
            None => Topic(self.bus.dead_letter_topic()),
        }
    }

    /// The dead-letter topic for this deployment.
    #[must_use]
    pub fn dead_letter_topic(&self) -> Topic {
        Topic(self.bus.dead_letter_topic())
    }
}

fn env_override_key(event_type: &str) -> String {
    format!("TOPIC_OVERRIDE_{}", event_type.replace('.', "_").to_uppercase())
}

/// Splits a dotted `event_type` like
/// `omninode.intelligence.event.document_index_completed.v1` into
/// `("intelligence", "document-index-completed", "1")`, the compile-time
/// mapping from event type to topic shape. Returns `None` for event types
/// the core has no known routing for.
fn aspect_and_operation(event_type: &str) -> Option<(&'static str, String, &str)> {
    let segments: Vec<&str> = event_type.split('.').collect();
    let version = segments.last()?.strip_prefix('v')?;
    let body = &segments[..segments.len() - 1];

    let known = [
        ("document_index_requested", "intelligence", "document-index-requested"),
        ("document_index_completed", "intelligence", "document-index-completed"),
        ("document_index_failed", "intelligence", "document-index-failed"),
        ("repository_scan_requested", "intelligence", "repository-scan-requested"),
        ("repository_scan_completed", "intelligence", "repository-scan-completed"),
        ("repository_scan_failed", "intelligence", "repository-scan-failed"),
        ("tree_visualization_requested", "intelligence", "tree-visualization-requested"),
        ("tree_visualization_completed", "intelligence", "tree-visualization-completed"),
        ("tree_visualization_failed", "intelligence", "tree-visualization-failed"),
        ("document_indexed", "intelligence", "document-indexed"),
    ];

    let leaf = body.last()?;
    known
        .iter()
        .find(|(name, _, _)| name == leaf)
        .map(|(_, aspect, operation)| (*aspect, (*operation).to_string(), version))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::EventType;

    #[test]
    fn known_event_type_resolves_to_kebab_topic() {
        let bus = BusConfig::default();
        let router = TopicRouter::new(&bus);
        let et = EventType::parse("omninode.intelligence.event.document_index_completed.v1")
            .expect("valid");
        assert_eq!(
            router.topic_for(&et).0,
            "dev.archon-intelligence.intelligence.document-index-completed.v1"
        );
    }

    #[test]
    fn unknown_event_type_routes_to_dead_letter() {
        let bus = BusConfig::default();
        let router = TopicRouter::new(&bus);
        let et = EventType::parse("omninode.intelligence.event.something_unheard_of.v1")
            .expect("valid");
        assert_eq!(router.topic_for(&et), router.dead_letter_topic());
    }
}
