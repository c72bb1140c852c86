use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::enums::{AttemptOutcome, DispatchStatus};
use super::verdict::{ContentFingerprint, Verdict};

/// Durable record of a moderation decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModerationCase {
    pub case_id: i64,
    pub fingerprint: ContentFingerprint,
    /// Event that first produced this case.
    pub event_id: String,
    pub verdict: Verdict,
    pub created_at: DateTime<Utc>,
    pub dispatched_at: Option<DateTime<Utc>>,
    pub dispatch_status: DispatchStatus,
}

/// Input to `CaseRepository::create_case_if_absent`.
#[derive(Debug, Clone)]
pub struct NewCase {
    pub event_id: String,
    pub channel_id: String,
    pub author_id: String,
    pub received_at: DateTime<Utc>,
    pub fingerprint: ContentFingerprint,
    pub verdict: Verdict,
}

/// Result of an idempotent create.
#[derive(Debug, Clone)]
pub struct CaseRecord {
    pub case: ModerationCase,
    /// False when the event or the content had already been recorded.
    pub created: bool,
}

/// One webhook delivery attempt, kept as audit history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchAttempt {
    pub case_id: i64,
    pub attempt: u32,
    pub target: String,
    pub outcome: AttemptOutcome,
    pub status_code: Option<u16>,
    pub error: Option<String>,
    pub attempted_at: DateTime<Utc>,
}
