//! Shared data model types (§3): build requests/results, wire envelopes.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Build priority. Priority requests are served before normal ones (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Normal,
    High,
}

/// A pending build for one component (§3).
#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub component: String,
    pub priority: Priority,
    pub enqueued_at: Instant,
    /// Caller-supplied digest of whatever inputs determine the build's
    /// output (e.g. source file contents) -- combined with `component` to
    /// form the scheduler's content-addressed cache key (§4.6 step 2).
    pub inputs_fingerprint: Vec<u8>,
}

impl BuildRequest {
    pub fn new(component: impl Into<String>, priority: Priority, inputs_fingerprint: Vec<u8>) -> Self {
        Self {
            component: component.into(),
            priority,
            enqueued_at: Instant::now(),
            inputs_fingerprint,
        }
    }
}

/// One error location inside a failed build (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildError {
    pub file: String,
    pub line: u32,
    pub column: u32,
    pub message: String,
}

/// Outcome of one build attempt (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildResult {
    pub component: String,
    pub success: bool,
    pub errors: Vec<BuildError>,
    pub duration_ms: u64,
    pub cache_hit: bool,
    pub produced_at: DateTime<Utc>,
}

impl BuildResult {
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

/// Wire message kind (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    FullReload,
    BuildError,
    BuildSuccess,
    FileChange,
}

/// Canonical bidirectional WebSocket message (§6). `target`/`content` are
/// optional and omitted from the wire form when absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl MessageEnvelope {
    pub fn new(kind: EnvelopeKind) -> Self {
        Self {
            kind,
            target: None,
            content: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    /// Delivery priority implied by this envelope's kind, per §4.5's
    /// backpressure policy (build failures/reload signals are never
    /// silently dropped under load; routine file-change notices may be).
    pub fn priority(&self) -> Priority {
        match self.kind {
            EnvelopeKind::FullReload | EnvelopeKind::BuildError => Priority::High,
            EnvelopeKind::BuildSuccess | EnvelopeKind::FileChange => Priority::Normal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_omits_absent_optional_fields() {
        let envelope = MessageEnvelope::new(EnvelopeKind::FullReload);
        let json = serde_json::to_string(&envelope).unwrap();
        assert!(!json.contains("target"));
        assert!(!json.contains("content"));
    }

    #[test]
    fn envelope_includes_present_optional_fields() {
        let envelope = MessageEnvelope::new(EnvelopeKind::BuildError)
            .with_target("Card")
            .with_content("1 error");
        let json = serde_json::to_string(&envelope).unwrap();
        assert!(json.contains("\"target\":\"Card\""));
        assert!(json.contains("\"content\":\"1 error\""));
    }

    #[test]
    fn kind_serializes_snake_case() {
        let envelope = MessageEnvelope::new(EnvelopeKind::BuildSuccess);
        let json = serde_json::to_string(&envelope).unwrap();
        assert!(json.contains("\"type\":\"build_success\""));
    }
}
