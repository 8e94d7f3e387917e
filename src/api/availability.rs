use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;

use crate::model::Role;

use super::{parse_id, parse_instant, ApiError, AppState, AvailabilityView, CurrentUser};

#[derive(Debug, Deserialize)]
pub struct PublishAvailabilityRequest {
    pub start_time: String,
    pub end_time: String,
}

/// Publish an availability window for the calling mentor.
pub async fn publish(
    State(state): State<AppState>,
    user: CurrentUser,
    payload: Result<Json<PublishAvailabilityRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<AvailabilityView>), ApiError> {
    user.require(Role::Mentor)?;
    let Json(req) = payload?;
    let start = parse_instant("start_time", &req.start_time)?;
    let end = parse_instant("end_time", &req.end_time)?;

    let availability = state
        .engine
        .publish_availability(user.id, start, end)
        .await?;
    Ok((StatusCode::CREATED, Json(AvailabilityView::from(&availability))))
}

pub async fn get_one(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path(id): Path<String>,
) -> Result<Json<AvailabilityView>, ApiError> {
    let id = parse_id(&id)?;
    let availability = state
        .engine
        .get_availability(id)
        .ok_or_else(|| ApiError::not_found(format!("availability {id} not found")))?;
    Ok(Json(AvailabilityView::from(&availability)))
}
