use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::enums::VerdictKind;

/// Prefix carried by rationales of verdicts that were not derived from content.
pub const DEGRADED_PREFIX: &str = "Degraded";

/// Content digest used as the dedupe and cache key (hex SHA-256).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentFingerprint(String);

impl ContentFingerprint {
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ContentFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Text recognized in an attachment. Never mutated once produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedText {
    pub fingerprint: ContentFingerprint,
    pub text: String,
    pub extracted_at: DateTime<Utc>,
    /// 0.0-1.0 as reported by the engine.
    pub engine_confidence: f32,
}

/// Moderation decision for a piece of content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub kind: VerdictKind,
    pub rationale: String,
    /// True when OCR failed and the verdict came from the fail-open/closed policy.
    pub degraded: bool,
}

impl Verdict {
    pub fn new(kind: VerdictKind, rationale: impl Into<String>) -> Self {
        Self {
            kind,
            rationale: rationale.into(),
            degraded: false,
        }
    }

    pub fn clean() -> Self {
        Self::new(VerdictKind::Clean, "No policy rule matched")
    }

    /// Verdict used when text could not be extracted.
    pub fn degraded(kind: VerdictKind, reason: &str) -> Self {
        Self {
            kind,
            rationale: format!("{DEGRADED_PREFIX}: {reason}"),
            degraded: true,
        }
    }

    pub fn requires_dispatch(&self) -> bool {
        self.kind.requires_dispatch()
    }
}
