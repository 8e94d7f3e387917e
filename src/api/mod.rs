//! HTTP surface. Translates JSON requests into engine calls and engine
//! errors into status codes.

pub mod availability;
pub mod error;
pub mod identity;
pub mod notifications;
pub mod sessions;

use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use ulid::Ulid;

use crate::engine::Engine;
use crate::limits::MAX_REQUEST_BODY_BYTES;
use crate::model::{Availability, Ms, Session, SessionLength, SessionStatus};
use crate::notify::NotifyHub;
use crate::observability;

pub use error::{ApiError, ApiErrorDetail};
pub use identity::CurrentUser;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub hub: Arc<NotifyHub>,
    pub horizon_ms: Ms,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/availabilities", post(availability::publish))
        .route("/availabilities/{id}", get(availability::get_one))
        .route("/sessions", get(sessions::upcoming).post(sessions::request))
        .route("/sessions/archive", get(sessions::archive))
        .route(
            "/sessions/{id}",
            get(sessions::get_one).patch(sessions::update_status),
        )
        .route("/notifications", get(notifications::stream))
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(axum::middleware::from_fn(observability::track_http))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "availabilities": state.engine.availability_count(),
        "sessions": state.engine.session_count(),
    }))
}

// ── Time at the boundary ─────────────────────────────────

/// RFC 3339 with an explicit offset. Naive local times are rejected.
pub fn parse_instant(field: &str, raw: &str) -> Result<Ms, ApiError> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|dt| dt.timestamp_millis())
        .map_err(|e| ApiError::validation_error(format!("{field}: {e}")))
}

pub fn format_instant(ms: Ms) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_default()
}

pub fn parse_id(raw: &str) -> Result<Ulid, ApiError> {
    Ulid::from_string(raw).map_err(|_| ApiError::validation_error(format!("invalid id: {raw}")))
}

// ── Views ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct AvailabilityView {
    pub id: Ulid,
    pub mentor: Ulid,
    pub start_time: String,
    pub end_time: String,
}

impl From<&Availability> for AvailabilityView {
    fn from(a: &Availability) -> Self {
        Self {
            id: a.id,
            mentor: a.mentor_id,
            start_time: format_instant(a.span.start),
            end_time: format_instant(a.span.end),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    pub id: Ulid,
    pub mentor: Ulid,
    pub mentee: Ulid,
    pub mentor_availability: Ulid,
    pub start_time: String,
    pub end_time: String,
    pub session_length: SessionLength,
    pub status: SessionStatus,
    pub past: bool,
}

impl SessionView {
    pub fn new(session: &Session, now: Ms) -> Self {
        Self {
            id: session.id,
            mentor: session.mentor_id,
            mentee: session.mentee_id,
            mentor_availability: session.availability_id,
            start_time: format_instant(session.start),
            end_time: format_instant(session.end()),
            session_length: session.length,
            status: session.status,
            past: session.is_past(now),
        }
    }
}
