use std::collections::HashSet;
use std::sync::LazyLock;

use regex::{Regex, RegexBuilder};

use crate::models::{EventMetadata, Verdict, VerdictKind};

/// One ordered moderation rule.
#[derive(Debug, Clone)]
pub struct PolicyRule {
    name: String,
    regex: Regex,
    kind: VerdictKind,
    rationale: String,
    /// Only applies in these channels when set.
    channels: Option<HashSet<String>>,
}

impl PolicyRule {
    /// Patterns are compiled case-insensitive.
    pub fn new(
        name: impl Into<String>,
        pattern: &str,
        kind: VerdictKind,
        rationale: impl Into<String>,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            name: name.into(),
            regex: RegexBuilder::new(pattern).case_insensitive(true).build()?,
            kind,
            rationale: rationale.into(),
            channels: None,
        })
    }

    pub fn scoped_to<I, S>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.channels = Some(channels.into_iter().map(Into::into).collect());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> VerdictKind {
        self.kind
    }

    fn applies_to(&self, metadata: &EventMetadata) -> bool {
        match &self.channels {
            Some(channels) => channels.contains(&metadata.channel_id),
            None => true,
        }
    }
}

fn rule(name: &str, pattern: &str, kind: VerdictKind, rationale: &str) -> PolicyRule {
    PolicyRule::new(name, pattern, kind, rationale).expect("Invalid built-in policy pattern")
}

/// Built-in rule set. Escalations come first so the most severe reading wins.
static DEFAULT_RULES: LazyLock<Vec<PolicyRule>> = LazyLock::new(|| {
    vec![
        rule(
            "threat",
            r"\b(?:i(?:'m|\s+am)?\s+(?:going\s+to|gonna|will)\s+(?:kill|hurt|shoot|stab)|you(?:'re|\s+are)\s+(?:dead|going\s+to\s+die))\b",
            VerdictKind::Escalate,
            "Threat of violence",
        ),
        rule(
            "self_harm_encouragement",
            r"\b(?:kill\s+yourself|kys|go\s+die|end\s+your\s+life)\b",
            VerdictKind::Escalate,
            "Encouragement of self-harm",
        ),
        rule(
            "doxxing",
            r"\b(?:home\s+address|lives\s+at|social\s+security\s+(?:number|no)|ssn)\b.{0,40}\d",
            VerdictKind::Escalate,
            "Personal information exposure",
        ),
        rule(
            "scam",
            r"\b(?:free\s+nitro|claim\s+your\s+(?:prize|reward|gift)|steam\s*gift|crypto\s+giveaway|double\s+your\s+(?:btc|eth|crypto)|verify\s+your\s+(?:account|wallet))\b",
            VerdictKind::Flagged,
            "Scam or phishing lure",
        ),
        rule(
            "invite_spam",
            r"\b(?:discord\.gg|discord(?:app)?\.com/invite)/[a-z0-9-]+",
            VerdictKind::Flagged,
            "Unsolicited server invite",
        ),
    ]
});

/// Pure, deterministic text classifier. Rules run in order; the first match
/// decides, no match is `Clean`.
#[derive(Debug, Clone)]
pub struct PolicyEngine {
    rules: Vec<PolicyRule>,
}

impl PolicyEngine {
    pub fn new(rules: Vec<PolicyRule>) -> Self {
        Self { rules }
    }

    pub fn with_default_rules() -> Self {
        Self::new(DEFAULT_RULES.clone())
    }

    pub fn rules(&self) -> &[PolicyRule] {
        &self.rules
    }

    pub fn evaluate(&self, text: &str, metadata: &EventMetadata) -> Verdict {
        let normalized = normalize_text(text);
        self.rules
            .iter()
            .filter(|r| r.applies_to(metadata))
            .find(|r| r.regex.is_match(&normalized))
            .map(|r| Verdict::new(r.kind, format!("{} (rule: {})", r.rationale, r.name)))
            .unwrap_or_else(Verdict::clean)
    }
}

impl Default for PolicyEngine {
    fn default() -> Self {
        Self::with_default_rules()
    }
}

/// Collapse runs of whitespace (OCR emits ragged line breaks) and trim.
fn normalize_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
