//! Alert dispatch: webhook delivery of Flagged/Escalate cases with retry.
//!
//! Delivery is at-least-once. Every request carries a delivery token derived
//! from the case id, so receivers can drop duplicates after a crash or retry.

pub mod dispatcher;
pub mod webhook;

pub use dispatcher::*;
pub use webhook::*;

use std::time::Duration;

use thiserror::Error;

use crate::db::PersistenceError;
use crate::models::{ContentFingerprint, ModerationCase, Verdict, VerdictKind};

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Cannot reach webhook {0}")]
    Connection(String),

    #[error("Webhook request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Webhook rejected delivery ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("HTTP client error: {0}")]
    Http(String),

    #[error("Dispatcher is shutting down")]
    ShuttingDown,

    #[error("No webhook configured for {0} alerts")]
    NoTarget(VerdictKind),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),
}

impl DispatchError {
    /// Any non-2xx answer and any transport failure is retried until the
    /// attempt budget runs out.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DispatchError::Connection(_)
                | DispatchError::Timeout { .. }
                | DispatchError::Http(_)
                | DispatchError::Rejected { .. }
        )
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            DispatchError::Rejected { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// One pending webhook delivery. Lives in memory only: the case row in the
/// store is what survives a restart.
#[derive(Debug, Clone)]
pub struct DispatchTask {
    pub case_id: i64,
    pub webhook_target: String,
    pub attempt_count: u32,
    pub next_retry_at: Option<tokio::time::Instant>,
    pub fingerprint: ContentFingerprint,
    pub verdict: Verdict,
}

impl DispatchTask {
    pub fn for_case(case: &ModerationCase, webhook_target: impl Into<String>) -> Self {
        Self {
            case_id: case.case_id,
            webhook_target: webhook_target.into(),
            attempt_count: 0,
            next_retry_at: None,
            fingerprint: case.fingerprint.clone(),
            verdict: case.verdict.clone(),
        }
    }
}

/// Which webhook each verdict kind is sent to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WebhookRoutes {
    pub general: Option<String>,
    /// Escalations go here when set, else to `general`.
    pub escalation: Option<String>,
}

impl WebhookRoutes {
    pub fn target_for(&self, kind: VerdictKind) -> Option<&str> {
        match kind {
            VerdictKind::Clean => None,
            VerdictKind::Flagged => self.general.as_deref(),
            VerdictKind::Escalate => self.escalation.as_deref().or(self.general.as_deref()),
        }
    }
}

/// Retry and worker settings for the dispatcher.
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub routes: WebhookRoutes,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub request_timeout: Duration,
    pub workers: usize,
}

impl DispatchSettings {
    pub fn from_config(config: &crate::config::ModerationConfig) -> Self {
        Self {
            routes: WebhookRoutes {
                general: config.webhook_url.clone(),
                escalation: config.escalation_webhook_url.clone(),
            },
            max_attempts: config.dispatch_max_attempts.max(1),
            backoff_base: config.dispatch_backoff_base,
            backoff_max: config.dispatch_backoff_max,
            request_timeout: config.dispatch_timeout,
            workers: config.dispatch_workers.max(1),
        }
    }
}

/// Delay before attempt `attempt + 1`, after `attempt` failures:
/// base, 2×base, 4×base … capped at `max`.
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exponent).min(max)
}
