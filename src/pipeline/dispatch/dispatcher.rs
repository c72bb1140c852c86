//! Background webhook delivery.
//!
//! `workers` loops pull tasks from an unbounded queue. A failed attempt is
//! rescheduled after an exponential backoff by a timer task that pushes it
//! back onto the queue, so a waiting retry never occupies a worker.
//!
//! Every attempt is written to the audit trail. Success sets `dispatched_at`;
//! running out of attempts marks the case `failed`. Neither outcome touches
//! the verdict.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex, Notify};

use super::webhook::{WebhookClient, WebhookPayload};
use super::{backoff_delay, DispatchError, DispatchSettings, DispatchTask};
use crate::db::CaseRepository;
use crate::models::{AttemptOutcome, DispatchAttempt, ModerationCase};
use crate::pipeline::with_repository;

struct DispatchState {
    /// Tasks accepted and not yet delivered or given up on, waiting retries included.
    in_flight: AtomicUsize,
    drained: Notify,
    closed: AtomicBool,
}

impl DispatchState {
    fn finish(&self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drained.notify_waiters();
        }
    }
}

struct WorkerContext {
    repo: Arc<dyn CaseRepository>,
    client: WebhookClient,
    settings: DispatchSettings,
    requeue: mpsc::UnboundedSender<DispatchTask>,
    state: Arc<DispatchState>,
}

pub struct AlertDispatcher {
    sender: mpsc::UnboundedSender<DispatchTask>,
    state: Arc<DispatchState>,
    settings: DispatchSettings,
}

impl AlertDispatcher {
    /// Spawn the worker loops. Must be called inside a Tokio runtime.
    pub fn start(repo: Arc<dyn CaseRepository>, settings: DispatchSettings) -> Result<Self, DispatchError> {
        let client = WebhookClient::new(settings.request_timeout)?;
        let (sender, receiver) = mpsc::unbounded_channel();
        let receiver = Arc::new(Mutex::new(receiver));
        let state = Arc::new(DispatchState {
            in_flight: AtomicUsize::new(0),
            drained: Notify::new(),
            closed: AtomicBool::new(false),
        });

        let ctx = Arc::new(WorkerContext {
            repo,
            client,
            settings: settings.clone(),
            requeue: sender.clone(),
            state: state.clone(),
        });

        for worker_id in 0..settings.workers.max(1) {
            tokio::spawn(worker_loop(worker_id, receiver.clone(), ctx.clone()));
        }

        if settings.routes.general.is_none() && settings.routes.escalation.is_none() {
            tracing::warn!("No webhook configured, alerts stay pending until one is set");
        }
        tracing::info!(
            workers = settings.workers.max(1),
            max_attempts = settings.max_attempts,
            "Alert dispatcher started"
        );

        Ok(Self {
            sender,
            state,
            settings,
        })
    }

    /// Queue a delivery. Only valid for a case that is already persisted.
    pub fn enqueue(&self, task: DispatchTask) -> Result<(), DispatchError> {
        if self.state.closed.load(Ordering::SeqCst) {
            return Err(DispatchError::ShuttingDown);
        }

        self.state.in_flight.fetch_add(1, Ordering::SeqCst);
        let case_id = task.case_id;
        if self.sender.send(task).is_err() {
            self.state.finish();
            return Err(DispatchError::ShuttingDown);
        }

        tracing::debug!(case_id, "Alert queued");
        Ok(())
    }

    /// Route a case to its webhook and queue it.
    pub fn dispatch_case(&self, case: &ModerationCase) -> Result<(), DispatchError> {
        let kind = case.verdict.kind;
        let target = self
            .settings
            .routes
            .target_for(kind)
            .ok_or(DispatchError::NoTarget(kind))?;
        self.enqueue(DispatchTask::for_case(case, target))
    }

    /// Re-queue every case whose alert was never delivered (startup recovery).
    pub async fn requeue_pending(&self, repo: &Arc<dyn CaseRepository>) -> Result<usize, DispatchError> {
        let pending = with_repository(repo, |r| r.pending_dispatches()).await?;

        let mut queued = 0;
        for case in &pending {
            match self.dispatch_case(case) {
                Ok(()) => queued += 1,
                Err(DispatchError::NoTarget(kind)) => {
                    tracing::warn!(case_id = case.case_id, verdict = %kind, "No webhook for pending alert, left pending");
                }
                Err(e) => return Err(e),
            }
        }

        if queued > 0 {
            tracing::info!(queued, "Re-queued undelivered alerts");
        }
        Ok(queued)
    }

    pub fn in_flight(&self) -> usize {
        self.state.in_flight.load(Ordering::SeqCst)
    }

    /// Stop accepting tasks and wait up to `grace` for in-flight ones.
    /// Returns `true` when everything drained. Whatever is left stays
    /// pending in the store and is re-queued on the next start.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.state.closed.store(true, Ordering::SeqCst);

        let state = self.state.clone();
        let drained = tokio::time::timeout(grace, async move {
            loop {
                let notified = state.drained.notified();
                if state.in_flight.load(Ordering::SeqCst) == 0 {
                    return;
                }
                notified.await;
            }
        })
        .await
        .is_ok();

        if drained {
            tracing::info!("Alert dispatcher drained");
        } else {
            tracing::warn!(
                remaining = self.in_flight(),
                grace_secs = grace.as_secs(),
                "Alert dispatcher did not drain in time, remaining alerts stay pending"
            );
        }
        drained
    }
}

async fn worker_loop(
    worker_id: usize,
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<DispatchTask>>>,
    ctx: Arc<WorkerContext>,
) {
    loop {
        let task = {
            let mut rx = receiver.lock().await;
            rx.recv().await
        };
        let Some(task) = task else {
            tracing::debug!(worker_id, "Dispatch queue closed, worker exiting");
            break;
        };
        attempt_delivery(&ctx, task).await;
    }
}

async fn attempt_delivery(ctx: &Arc<WorkerContext>, mut task: DispatchTask) {
    task.attempt_count += 1;
    task.next_retry_at = None;

    let payload = WebhookPayload::for_task(&task);
    let result = ctx.client.deliver(&task.webhook_target, &payload).await;

    let record = DispatchAttempt {
        case_id: task.case_id,
        attempt: task.attempt_count,
        target: task.webhook_target.clone(),
        outcome: if result.is_ok() {
            AttemptOutcome::Delivered
        } else {
            AttemptOutcome::Failed
        },
        status_code: match &result {
            Ok(status) => Some(*status),
            Err(e) => e.status_code(),
        },
        error: result.as_ref().err().map(|e| e.to_string()),
        attempted_at: Utc::now(),
    };
    if let Err(e) = with_repository(&ctx.repo, move |r| r.record_dispatch_attempt(&record)).await {
        tracing::warn!(case_id = task.case_id, error = %e, "Failed to record dispatch attempt");
    }

    let case_id = task.case_id;
    match result {
        Ok(status) => {
            tracing::info!(case_id, attempt = task.attempt_count, status, "Alert delivered");
            if let Err(e) = with_repository(&ctx.repo, move |r| r.mark_dispatched(case_id)).await {
                // Stays pending and is delivered again (same token) on next start.
                tracing::error!(case_id, error = %e, "Alert delivered but not marked dispatched");
            }
            ctx.state.finish();
        }
        Err(e) if e.is_retryable() && task.attempt_count < ctx.settings.max_attempts => {
            let delay = backoff_delay(
                task.attempt_count,
                ctx.settings.backoff_base,
                ctx.settings.backoff_max,
            );
            tracing::warn!(
                case_id,
                attempt = task.attempt_count,
                retry_in_ms = delay.as_millis() as u64,
                error = %e,
                "Alert delivery failed, retrying"
            );

            let retry_at = tokio::time::Instant::now() + delay;
            task.next_retry_at = Some(retry_at);
            let ctx = ctx.clone();
            tokio::spawn(async move {
                tokio::time::sleep_until(retry_at).await;
                if ctx.requeue.send(task).is_err() {
                    ctx.state.finish();
                }
            });
        }
        Err(e) => {
            tracing::error!(
                case_id,
                attempts = task.attempt_count,
                error = %e,
                "Alert delivery failed permanently"
            );
            if let Err(e) = with_repository(&ctx.repo, move |r| r.mark_dispatch_failed(case_id)).await {
                tracing::error!(case_id, error = %e, "Failed to mark dispatch failure");
            }
            ctx.state.finish();
        }
    }
}
