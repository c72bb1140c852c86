use std::time::Duration;

use serde::Serialize;
use uuid::Uuid;

use super::{DispatchError, DispatchTask};
use crate::models::VerdictKind;

/// Namespace for delivery tokens. Changing it changes every token.
const DELIVERY_NAMESPACE: Uuid = Uuid::from_u128(0x6c1e_93b4_2f0a_4d8e_9b37_51a6_c0de_7a11);

/// Header carrying the delivery token, for receivers that dedupe on headers.
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

/// Stable per-case token: every retry and every re-delivery after a restart
/// carries the same value.
pub fn delivery_token(case_id: i64) -> Uuid {
    Uuid::new_v5(&DELIVERY_NAMESPACE, format!("moderation-case:{case_id}").as_bytes())
}

/// JSON body posted to the webhook. `content` makes it render as a plain
/// message on Discord-style endpoints; the other fields are for machines.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookPayload {
    pub case_id: i64,
    pub verdict: VerdictKind,
    pub rationale: String,
    pub delivery_token: Uuid,
    pub fingerprint: String,
    pub attempt: u32,
    pub content: String,
}

impl WebhookPayload {
    /// Payload for the task's current attempt.
    pub fn for_task(task: &DispatchTask) -> Self {
        let label = match task.verdict.kind {
            VerdictKind::Escalate => "ESCALATION",
            VerdictKind::Flagged => "FLAGGED",
            VerdictKind::Clean => "CLEAN",
        };
        Self {
            case_id: task.case_id,
            verdict: task.verdict.kind,
            rationale: task.verdict.rationale.clone(),
            delivery_token: delivery_token(task.case_id),
            fingerprint: task.fingerprint.to_string(),
            attempt: task.attempt_count,
            content: format!(
                "[{label}] Moderation case #{}: {}",
                task.case_id, task.verdict.rationale
            ),
        }
    }
}

/// Async HTTP client for webhook delivery.
pub struct WebhookClient {
    client: reqwest::Client,
    timeout: Duration,
}

impl WebhookClient {
    pub fn new(timeout: Duration) -> Result<Self, DispatchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("redactado/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| DispatchError::Http(e.to_string()))?;
        Ok(Self { client, timeout })
    }

    /// POST the payload. Any 2xx is success and returns the status code.
    pub async fn deliver(&self, target: &str, payload: &WebhookPayload) -> Result<u16, DispatchError> {
        let response = self
            .client
            .post(target)
            .header(IDEMPOTENCY_HEADER, payload.delivery_token.to_string())
            .json(payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    DispatchError::Connection(target.to_string())
                } else if e.is_timeout() {
                    DispatchError::Timeout {
                        timeout_ms: self.timeout.as_millis() as u64,
                    }
                } else {
                    DispatchError::Http(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DispatchError::Rejected {
                status: status.as_u16(),
                body: body.chars().take(512).collect(),
            });
        }

        Ok(status.as_u16())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ContentFingerprint, Verdict};
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::{Json, Router};
    use std::sync::{Arc, Mutex};

    fn task(case_id: i64) -> DispatchTask {
        DispatchTask {
            case_id,
            webhook_target: String::new(),
            attempt_count: 1,
            next_retry_at: None,
            fingerprint: ContentFingerprint::from_hex("ab12"),
            verdict: Verdict::new(VerdictKind::Escalate, "Threat of violence"),
        }
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}/hook")
    }

    #[test]
    fn delivery_token_is_stable_per_case() {
        assert_eq!(delivery_token(42), delivery_token(42));
        assert_ne!(delivery_token(42), delivery_token(43));
        assert_eq!(delivery_token(42).get_version_num(), 5);
    }

    #[test]
    fn payload_carries_discord_content() {
        let payload = WebhookPayload::for_task(&task(7));
        assert_eq!(payload.content, "[ESCALATION] Moderation case #7: Threat of violence");
        assert_eq!(payload.delivery_token, delivery_token(7));

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["verdict"], "escalate");
        assert_eq!(json["case_id"], 7);
        assert_eq!(json["fingerprint"], "ab12");
        assert_eq!(json["attempt"], 1);
    }

    #[tokio::test]
    async fn delivers_json_with_idempotency_header() {
        let seen: Arc<Mutex<Vec<(String, serde_json::Value)>>> = Arc::default();
        let captured = seen.clone();
        let url = serve(Router::new().route(
            "/hook",
            post(move |headers: HeaderMap, Json(body): Json<serde_json::Value>| {
                let captured = captured.clone();
                async move {
                    let key = headers
                        .get(IDEMPOTENCY_HEADER)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_string();
                    captured.lock().unwrap().push((key, body));
                    StatusCode::NO_CONTENT
                }
            }),
        ))
        .await;

        let client = WebhookClient::new(Duration::from_secs(2)).unwrap();
        let status = client.deliver(&url, &WebhookPayload::for_task(&task(3))).await.unwrap();
        assert_eq!(status, 204);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, delivery_token(3).to_string());
        assert_eq!(seen[0].1["case_id"], 3);
    }

    #[tokio::test]
    async fn non_success_status_is_rejected() {
        let url = serve(Router::new().route(
            "/hook",
            post(|| async { (StatusCode::SERVICE_UNAVAILABLE, "try later") }),
        ))
        .await;

        let client = WebhookClient::new(Duration::from_secs(2)).unwrap();
        let err = client.deliver(&url, &WebhookPayload::for_task(&task(1))).await.unwrap_err();
        assert_eq!(err.status_code(), Some(503));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn unreachable_target_is_retryable() {
        // Bind then drop to get a port nobody listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = WebhookClient::new(Duration::from_secs(2)).unwrap();
        let err = client
            .deliver(&format!("http://{addr}/hook"), &WebhookPayload::for_task(&task(1)))
            .await
            .unwrap_err();
        assert!(err.is_retryable(), "{err:?}");
    }
}
