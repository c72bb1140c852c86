//! Moderation API router.
//!
//! `POST /api/events` turns a gateway event into a moderation case,
//! `GET /api/cases/:id` reads one back, `GET /api/health` reports liveness.

use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::api::error::ApiError;
use crate::models::{AttachmentEvent, ModerationCase};
use crate::pipeline::dispatch::AlertDispatcher;
use crate::pipeline::{with_repository, CaseOutcome, IngestionCoordinator};

/// Maximum decoded attachment size (8 MB).
const MAX_ATTACHMENT_BYTES: usize = 8 * 1024 * 1024;
/// Request body cap: base64 inflates by 4/3, plus room for the envelope.
const MAX_BODY_BYTES: usize = MAX_ATTACHMENT_BYTES / 3 * 4 + 64 * 1024;

/// Shared state for all API routes.
#[derive(Clone)]
pub struct ApiContext {
    pub coordinator: Arc<IngestionCoordinator>,
    pub dispatcher: Arc<AlertDispatcher>,
}

impl ApiContext {
    pub fn new(coordinator: Arc<IngestionCoordinator>, dispatcher: Arc<AlertDispatcher>) -> Self {
        Self {
            coordinator,
            dispatcher,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct EventRequest {
    pub event_id: String,
    pub channel_id: String,
    pub author_id: String,
    /// Base64 payload, raw or as a data URL (`data:image/png;base64,...`).
    pub attachment: String,
    pub received_at: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub cases: u64,
    pub cached_verdicts: usize,
    pub alerts_in_flight: usize,
}

/// Build the moderation API router. Routes are mounted under `/api/`.
pub fn moderation_router(ctx: ApiContext) -> Router {
    // NOTE: Path params use `:param` syntax (matchit 0.7 / axum 0.7).
    let api = Router::new()
        .route("/health", get(health))
        .route("/events", post(submit_event))
        .route("/cases/:id", get(get_case))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .with_state(ctx);

    Router::new().nest("/api", api)
}

/// `POST /api/events`: 201 when a case was created, 200 for duplicates and replays.
async fn submit_event(
    State(ctx): State<ApiContext>,
    Json(request): Json<EventRequest>,
) -> Result<(StatusCode, Json<CaseOutcome>), ApiError> {
    let attachment = decode_data_url(&request.attachment).map_err(ApiError::BadRequest)?;
    if attachment.len() > MAX_ATTACHMENT_BYTES {
        return Err(ApiError::BadRequest(format!(
            "Attachment exceeds {MAX_ATTACHMENT_BYTES} bytes"
        )));
    }

    let mut event = AttachmentEvent::new(
        request.event_id,
        request.channel_id,
        request.author_id,
        attachment,
    );
    if let Some(received_at) = request.received_at {
        event.received_at = received_at;
    }

    let outcome = ctx.coordinator.handle(event).await?;
    let status = match outcome.disposition {
        crate::pipeline::Disposition::Created => StatusCode::CREATED,
        _ => StatusCode::OK,
    };
    Ok((status, Json(outcome)))
}

/// `GET /api/cases/:id`
async fn get_case(
    State(ctx): State<ApiContext>,
    Path(case_id): Path<i64>,
) -> Result<Json<ModerationCase>, ApiError> {
    let case = with_repository(ctx.coordinator.repository(), move |r| r.get_case(case_id)).await?;
    case.map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Moderation case {case_id}")))
}

/// `GET /api/health`
async fn health(State(ctx): State<ApiContext>) -> Result<Json<HealthResponse>, ApiError> {
    let cases = with_repository(ctx.coordinator.repository(), |r| r.count_cases()).await?;

    Ok(Json(HealthResponse {
        status: "ok",
        version: crate::config::APP_VERSION,
        cases,
        cached_verdicts: ctx.coordinator.cache().len(),
        alerts_in_flight: ctx.dispatcher.in_flight(),
    }))
}

/// Decode a base64 data URL to raw bytes.
///
/// Handles both `data:image/png;base64,...` and raw base64 strings.
fn decode_data_url(data_url: &str) -> Result<Vec<u8>, String> {
    let base64_data = match data_url.find(',') {
        Some(idx) => &data_url[idx + 1..],
        None => data_url,
    };

    base64::engine::general_purpose::STANDARD
        .decode(base64_data.trim())
        .map_err(|e| format!("Base64 decode failed: {e}"))
}
