use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use ulid::Ulid;

use crate::model::{Role, Session, SessionStatus};

use super::{parse_id, parse_instant, ApiError, AppState, CurrentUser, SessionView};

#[derive(Debug, Deserialize)]
pub struct RequestSessionRequest {
    pub mentor_availability: Ulid,
    pub start_time: String,
    /// Minutes; 30 or 60.
    pub session_length: i64,
}

#[derive(Debug, Deserialize)]
pub struct UpdateSessionRequest {
    pub status: String,
}

fn views(state: &AppState, sessions: &[Session]) -> Vec<SessionView> {
    let now = state.engine.now_ms();
    sessions.iter().map(|s| SessionView::new(s, now)).collect()
}

fn load(state: &AppState, user: &CurrentUser, raw_id: &str) -> Result<Session, ApiError> {
    let id = parse_id(raw_id)?;
    let session = state
        .engine
        .get_session(id)
        .ok_or_else(|| ApiError::not_found(format!("session {id} not found")))?;
    user.require_party(&session)?;
    Ok(session)
}

/// A mentee asks for time in a mentor's availability.
pub async fn request(
    State(state): State<AppState>,
    user: CurrentUser,
    payload: Result<Json<RequestSessionRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<SessionView>), ApiError> {
    user.require(Role::Mentee)?;
    let Json(req) = payload?;
    let start = parse_instant("start_time", &req.start_time)?;

    let session = state
        .engine
        .request_booking(user.id, req.mentor_availability, start, req.session_length)
        .await?;
    let view = SessionView::new(&session, state.engine.now_ms());
    Ok((StatusCode::CREATED, Json(view)))
}

pub async fn get_one(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<String>,
) -> Result<Json<SessionView>, ApiError> {
    let session = load(&state, &user, &id)?;
    Ok(Json(SessionView::new(&session, state.engine.now_ms())))
}

/// Confirm, cancel or reinstate a session. Either party may do any of these.
pub async fn update_status(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<String>,
    payload: Result<Json<UpdateSessionRequest>, JsonRejection>,
) -> Result<Json<SessionView>, ApiError> {
    let session = load(&state, &user, &id)?;
    let Json(req) = payload?;
    let status: SessionStatus = req
        .status
        .parse()
        .map_err(ApiError::validation_error)?;

    let updated = state
        .engine
        .update_status(session.id, status, user.id)
        .await?;
    Ok(Json(SessionView::new(&updated, state.engine.now_ms())))
}

/// The caller's sessions from the last horizon onward.
pub async fn upcoming(
    State(state): State<AppState>,
    user: CurrentUser,
) -> Json<Vec<SessionView>> {
    let buckets = state.engine.sessions_for(user.id, state.horizon_ms).await;
    Json(views(&state, &buckets.upcoming))
}

pub async fn archive(
    State(state): State<AppState>,
    user: CurrentUser,
) -> Json<Vec<SessionView>> {
    let buckets = state.engine.sessions_for(user.id, state.horizon_ms).await;
    Json(views(&state, &buckets.archived))
}
