//! Ingestion coordinator: one attachment event in, one moderation case out.
//!
//! event → replay check → fingerprint → cache → store → OCR + policy
//!       → persist → cache update → alert (new Flagged/Escalate cases only)
//!
//! Concurrency is bounded by a semaphore. Identical content racing through
//! here collapses at the store's unique constraints, and every caller gets
//! the winning case back.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;

use super::dispatch::{backoff_delay, AlertDispatcher};
use super::fingerprint::compute_fingerprint;
use super::ocr::{OcrError, OcrWorkerPool};
use super::policy::PolicyEngine;
use super::with_repository;
use crate::config::{FailMode, ModerationConfig};
use crate::db::{CaseRepository, PersistenceError};
use crate::models::*;
use crate::verdict_cache::VerdictCache;

const PERSIST_BACKOFF_BASE: Duration = Duration::from_millis(50);
const PERSIST_BACKOFF_MAX: Duration = Duration::from_secs(2);

// ═══════════════════════════════════════════════════════════
// Types
// ═══════════════════════════════════════════════════════════

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Malformed event: {0}")]
    Malformed(String),

    /// OCR queue full. The event was not processed and can be resubmitted.
    #[error("OCR capacity exhausted, retry later")]
    Overloaded,

    /// Store kept reporting busy. Nothing was written; the event is replayable.
    #[error("Store unavailable after {attempts} attempts: {reason}")]
    PersistenceUnavailable { attempts: u32, reason: String },

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// How the event related to existing cases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// A new case was written.
    Created,
    /// Identical content already had a case; this event was attached to it.
    Deduplicated,
    /// This event_id was seen before; nothing changed.
    Replayed,
}

/// Where the verdict came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictSource {
    Cache,
    Store,
    Ocr,
    Degraded,
}

#[derive(Debug, Clone, Serialize)]
pub struct CaseOutcome {
    pub case: ModerationCase,
    pub disposition: Disposition,
    pub source: VerdictSource,
    /// An alert was queued for this case by this call.
    pub alert_queued: bool,
}

#[derive(Debug, Clone)]
pub struct IngestSettings {
    pub fail_mode: FailMode,
    pub concurrency: usize,
    pub persist_max_attempts: u32,
}

impl IngestSettings {
    pub fn from_config(config: &ModerationConfig) -> Self {
        Self {
            fail_mode: config.fail_mode,
            concurrency: config.ingest_concurrency.max(1),
            persist_max_attempts: config.persist_max_attempts.max(1),
        }
    }
}

// ═══════════════════════════════════════════════════════════
// Coordinator
// ═══════════════════════════════════════════════════════════

pub struct IngestionCoordinator {
    repo: Arc<dyn CaseRepository>,
    cache: Arc<VerdictCache>,
    ocr: Arc<OcrWorkerPool>,
    policy: Arc<PolicyEngine>,
    dispatcher: Arc<AlertDispatcher>,
    limiter: Semaphore,
    settings: IngestSettings,
}

impl IngestionCoordinator {
    pub fn new(
        repo: Arc<dyn CaseRepository>,
        cache: Arc<VerdictCache>,
        ocr: Arc<OcrWorkerPool>,
        policy: Arc<PolicyEngine>,
        dispatcher: Arc<AlertDispatcher>,
        settings: IngestSettings,
    ) -> Self {
        Self {
            repo,
            cache,
            ocr,
            policy,
            dispatcher,
            limiter: Semaphore::new(settings.concurrency.max(1)),
            settings,
        }
    }

    pub fn repository(&self) -> &Arc<dyn CaseRepository> {
        &self.repo
    }

    pub fn cache(&self) -> &Arc<VerdictCache> {
        &self.cache
    }

    /// Process one attachment event.
    pub async fn handle(&self, event: AttachmentEvent) -> Result<CaseOutcome, IngestError> {
        validate(&event)?;

        let _permit = self
            .limiter
            .acquire()
            .await
            .map_err(|_| IngestError::Internal("ingest limiter closed".into()))?;

        let event_id = event.event_id.clone();
        if let Some(case) = self
            .with_store_retry(move |r| r.find_case_by_event(&event_id))
            .await?
        {
            tracing::info!(event_id = %event.event_id, case_id = case.case_id, "Event already processed");
            return Ok(CaseOutcome {
                case,
                disposition: Disposition::Replayed,
                source: VerdictSource::Store,
                alert_queued: false,
            });
        }

        let bytes = event.attachment.clone();
        let fingerprint = tokio::task::spawn_blocking(move || compute_fingerprint(&bytes))
            .await
            .map_err(|e| IngestError::Internal(format!("fingerprint task failed: {e}")))?;

        let (verdict, source) = self.resolve_verdict(&event, &fingerprint).await?;

        let new_case = NewCase {
            event_id: event.event_id.clone(),
            channel_id: event.channel_id.clone(),
            author_id: event.author_id.clone(),
            received_at: event.received_at,
            fingerprint: fingerprint.clone(),
            verdict,
        };
        let record = self.persist(new_case).await?;

        // Cache what the store holds, which may be a concurrent winner's verdict.
        if !record.case.verdict.degraded {
            self.cache.insert(fingerprint, record.case.verdict.clone());
        }

        let mut alert_queued = false;
        if record.created && record.case.verdict.requires_dispatch() {
            match self.dispatcher.dispatch_case(&record.case) {
                Ok(()) => alert_queued = true,
                Err(e) => tracing::warn!(
                    case_id = record.case.case_id,
                    error = %e,
                    "Alert not queued, case left pending"
                ),
            }
        }

        let disposition = if record.created {
            Disposition::Created
        } else if record.case.event_id == event.event_id {
            Disposition::Replayed
        } else {
            Disposition::Deduplicated
        };

        tracing::info!(
            event_id = %event.event_id,
            case_id = record.case.case_id,
            verdict = %record.case.verdict.kind,
            degraded = record.case.verdict.degraded,
            disposition = ?disposition,
            source = ?source,
            "Event processed"
        );

        Ok(CaseOutcome {
            case: record.case,
            disposition,
            source,
            alert_queued,
        })
    }

    async fn resolve_verdict(
        &self,
        event: &AttachmentEvent,
        fingerprint: &ContentFingerprint,
    ) -> Result<(Verdict, VerdictSource), IngestError> {
        if let Some(verdict) = self.cache.get(fingerprint) {
            return Ok((verdict, VerdictSource::Cache));
        }

        let lookup = fingerprint.clone();
        if let Some(verdict) = self
            .with_store_retry(move |r| r.find_verdict_by_fingerprint(&lookup))
            .await?
        {
            self.cache.insert(fingerprint.clone(), verdict.clone());
            return Ok((verdict, VerdictSource::Store));
        }

        match self.ocr.extract(fingerprint.clone(), event.attachment.clone()).await {
            Ok(extracted) => Ok((
                self.policy.evaluate(&extracted.text, &event.metadata()),
                VerdictSource::Ocr,
            )),
            Err(OcrError::Overloaded) => {
                tracing::warn!(event_id = %event.event_id, "OCR pool overloaded, event rejected");
                Err(IngestError::Overloaded)
            }
            Err(e) => {
                let kind = self.settings.fail_mode.degraded_kind();
                tracing::warn!(
                    event_id = %event.event_id,
                    fingerprint = %fingerprint,
                    error = %e,
                    fail_mode = ?self.settings.fail_mode,
                    "OCR failed, using degraded verdict"
                );
                Ok((Verdict::degraded(kind, &e.to_string()), VerdictSource::Degraded))
            }
        }
    }

    /// Create the case, treating a constraint conflict as "already processed".
    async fn persist(&self, new_case: NewCase) -> Result<CaseRecord, IngestError> {
        let candidate = new_case.clone();
        match self
            .with_store_retry(move |r| r.create_case_if_absent(&candidate))
            .await
        {
            Ok(record) => Ok(record),
            Err(IngestError::Persistence(PersistenceError::Conflict(reason))) => {
                tracing::debug!(event_id = %new_case.event_id, reason = %reason, "Write conflict, reading back");
                let event_id = new_case.event_id.clone();
                let case = self
                    .with_store_retry(move |r| r.find_case_by_event(&event_id))
                    .await?
                    .ok_or_else(|| PersistenceError::Conflict(reason_for(&new_case)))?;
                Ok(CaseRecord {
                    case,
                    created: false,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Retry `Unavailable` with exponential backoff, up to the configured attempts.
    async fn with_store_retry<T, F>(&self, op: F) -> Result<T, IngestError>
    where
        F: Fn(&dyn CaseRepository) -> Result<T, PersistenceError> + Clone + Send + 'static,
        T: Send + 'static,
    {
        let max_attempts = self.settings.persist_max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let call = op.clone();
            match with_repository(&self.repo, move |r| call(r)).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let delay = backoff_delay(attempt, PERSIST_BACKOFF_BASE, PERSIST_BACKOFF_MAX);
                    tracing::warn!(
                        attempt,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %e,
                        "Store unavailable, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) if e.is_retryable() => {
                    return Err(IngestError::PersistenceUnavailable {
                        attempts: attempt,
                        reason: e.to_string(),
                    })
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn reason_for(new_case: &NewCase) -> String {
    format!("conflicting write for event {} left no readable case", new_case.event_id)
}

fn validate(event: &AttachmentEvent) -> Result<(), IngestError> {
    let reason = if event.event_id.trim().is_empty() {
        Some("empty event_id")
    } else if event.attachment.is_empty() {
        Some("empty attachment")
    } else {
        None
    };

    match reason {
        Some(reason) => {
            tracing::warn!(
                target: "audit",
                event_id = %event.event_id,
                channel_id = %event.channel_id,
                author_id = %event.author_id,
                reason,
                "Rejected malformed event"
            );
            Err(IngestError::Malformed(reason.into()))
        }
        None => Ok(()),
    }
}

// ═══════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════
