//! Local webhook receiver for dispatcher and end-to-end tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};

use crate::pipeline::dispatch::IDEMPOTENCY_HEADER;

#[derive(Clone, Default)]
struct ReceiverState {
    hits: Arc<AtomicUsize>,
    tokens: Arc<Mutex<Vec<String>>>,
    bodies: Arc<Mutex<Vec<serde_json::Value>>>,
    fail_first: usize,
    fail_status: u16,
    delay: Duration,
}

/// Axum server on 127.0.0.1:0 that counts deliveries and fails the first
/// `fail_first` of them with `fail_status`.
pub struct WebhookReceiver {
    pub url: String,
    state: ReceiverState,
}

impl WebhookReceiver {
    pub async fn start(fail_first: usize, fail_status: u16) -> Self {
        Self::spawn(ReceiverState {
            fail_first,
            fail_status,
            ..Default::default()
        })
        .await
    }

    /// Answers 200, but only after `delay`.
    pub async fn start_slow(delay: Duration) -> Self {
        Self::spawn(ReceiverState {
            delay,
            ..Default::default()
        })
        .await
    }

    async fn spawn(state: ReceiverState) -> Self {
        let router = Router::new()
            .route("/hook", post(receive))
            .with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self {
            url: format!("http://{addr}/hook"),
            state,
        }
    }

    pub fn hits(&self) -> usize {
        self.state.hits.load(Ordering::SeqCst)
    }

    pub fn tokens(&self) -> Vec<String> {
        self.state.tokens.lock().unwrap().clone()
    }

    pub fn bodies(&self) -> Vec<serde_json::Value> {
        self.state.bodies.lock().unwrap().clone()
    }
}

async fn receive(
    State(state): State<ReceiverState>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> StatusCode {
    if !state.delay.is_zero() {
        tokio::time::sleep(state.delay).await;
    }

    let n = state.hits.fetch_add(1, Ordering::SeqCst);
    let token = headers
        .get(IDEMPOTENCY_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    state.tokens.lock().unwrap().push(token);
    state.bodies.lock().unwrap().push(body);

    if n < state.fail_first {
        StatusCode::from_u16(state.fail_status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    } else {
        StatusCode::OK
    }
}
