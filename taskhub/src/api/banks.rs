//! Bank endpoints: registry and activity views

use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use super::{ApiError, ApiState};

pub async fn list_banks(State(state): State<ApiState>) -> Result<impl IntoResponse, ApiError> {
    let banks = state.engine.dispatcher().list_banks().await?;
    Ok(Json(json!({ "banks": banks })))
}

pub async fn get_bank(
    State(state): State<ApiState>,
    Path(bank_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .engine
        .dispatcher()
        .get_bank(bank_id.clone())
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("bank not found: {bank_id}")))
}

pub async fn get_bank_activity(
    State(state): State<ApiState>,
    Path(bank_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .engine
        .dispatcher()
        .bank_activity(bank_id.clone())
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("bank not found: {bank_id}")))
}

#[derive(Debug, Deserialize)]
pub struct CapabilitiesQuery {
    pub task_id: Option<String>,
}

pub async fn list_capabilities(
    State(state): State<ApiState>,
    Query(query): Query<CapabilitiesQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let capabilities = state
        .engine
        .dispatcher()
        .capabilities(query.task_id)
        .await?;
    Ok(Json(json!({ "capabilities": capabilities })))
}

/// The bank the dispatcher would pick right now
pub async fn best_bank(
    State(state): State<ApiState>,
    Path(task_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let score = state.engine.dispatcher().select_best_bank(task_id).await?;
    Ok(Json(score))
}
