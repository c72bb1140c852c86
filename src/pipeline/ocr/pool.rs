//! Fixed-size OCR worker pool with a bounded request queue.
//!
//! `size` workers pull jobs from a queue of `queue_depth` slots. A full queue
//! rejects immediately with `Overloaded`. The caller's deadline covers queue
//! wait plus engine time. Engine calls run on the blocking pool and cannot be
//! cancelled: when one overruns, the worker detaches it, discards its result
//! and goes straight back to the queue.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, Mutex};

use super::types::OcrEngine;
use super::OcrError;
use crate::models::{ContentFingerprint, ExtractedText};

struct OcrJob {
    fingerprint: ContentFingerprint,
    bytes: Arc<[u8]>,
    reply: oneshot::Sender<Result<ExtractedText, OcrError>>,
}

pub struct OcrWorkerPool {
    sender: mpsc::Sender<OcrJob>,
    size: usize,
    timeout: Duration,
    /// Engine calls abandoned by their caller but still running.
    abandoned: Arc<AtomicUsize>,
}

impl OcrWorkerPool {
    /// Spawn `size` workers. Must be called inside a Tokio runtime.
    pub fn start(
        engine: Arc<dyn OcrEngine>,
        size: usize,
        queue_depth: usize,
        timeout: Duration,
    ) -> Self {
        let size = size.max(1);
        let (sender, receiver) = mpsc::channel::<OcrJob>(queue_depth.max(1));
        let receiver = Arc::new(Mutex::new(receiver));
        let abandoned = Arc::new(AtomicUsize::new(0));

        for worker_id in 0..size {
            tokio::spawn(worker_loop(
                worker_id,
                engine.clone(),
                receiver.clone(),
                timeout,
                abandoned.clone(),
            ));
        }

        tracing::info!(
            engine = engine.name(),
            workers = size,
            queue_depth = queue_depth.max(1),
            timeout_ms = timeout.as_millis() as u64,
            "OCR worker pool started"
        );

        Self {
            sender,
            size,
            timeout,
            abandoned,
        }
    }

    /// Extract text from attachment bytes.
    pub async fn extract(
        &self,
        fingerprint: ContentFingerprint,
        bytes: Arc<[u8]>,
    ) -> Result<ExtractedText, OcrError> {
        let (reply, response) = oneshot::channel();
        let job = OcrJob {
            fingerprint,
            bytes,
            reply,
        };

        self.sender.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => OcrError::Overloaded,
            mpsc::error::TrySendError::Closed(_) => {
                OcrError::EngineFailure("OCR pool is shut down".into())
            }
        })?;

        match tokio::time::timeout(self.timeout, response).await {
            Ok(reply) => {
                reply.map_err(|_| OcrError::EngineFailure("OCR worker dropped the request".into()))?
            }
            Err(_) => Err(OcrError::Timeout {
                timeout_ms: self.timeout.as_millis() as u64,
            }),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Engine calls still draining after their caller timed out.
    pub fn abandoned_calls(&self) -> usize {
        self.abandoned.load(Ordering::SeqCst)
    }
}

async fn worker_loop(
    worker_id: usize,
    engine: Arc<dyn OcrEngine>,
    receiver: Arc<Mutex<mpsc::Receiver<OcrJob>>>,
    timeout: Duration,
    abandoned: Arc<AtomicUsize>,
) {
    loop {
        let job = {
            let mut rx = receiver.lock().await;
            rx.recv().await
        };
        let Some(job) = job else {
            tracing::debug!(worker_id, "OCR queue closed, worker exiting");
            break;
        };

        // The caller's deadline already passed while this job sat in the queue.
        if job.reply.is_closed() {
            tracing::debug!(worker_id, fingerprint = %job.fingerprint, "Skipping OCR job, caller gone");
            continue;
        }

        let call_engine = engine.clone();
        let bytes = job.bytes.clone();
        let mut call = tokio::task::spawn_blocking(move || call_engine.recognize(&bytes));

        let result = match tokio::time::timeout(timeout, &mut call).await {
            Ok(Ok(outcome)) => outcome.map(|page| ExtractedText {
                fingerprint: job.fingerprint.clone(),
                text: page.text,
                extracted_at: Utc::now(),
                engine_confidence: page.confidence,
            }),
            Ok(Err(join_err)) => Err(OcrError::EngineFailure(format!("OCR task failed: {join_err}"))),
            Err(_) => {
                tracing::warn!(
                    worker_id,
                    fingerprint = %job.fingerprint,
                    timeout_ms = timeout.as_millis() as u64,
                    "OCR call timed out, detaching it"
                );
                abandoned.fetch_add(1, Ordering::SeqCst);
                let abandoned = abandoned.clone();
                tokio::spawn(async move {
                    let _ = call.await;
                    abandoned.fetch_sub(1, Ordering::SeqCst);
                });
                Err(OcrError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        };

        // Caller may have gone away; nothing to do then.
        let _ = job.reply.send(result);
    }
}
