//! Request endpoints: submit to the dispatcher, query the ledger, cancel

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use super::{rpc_error, ApiError, ApiState};
use crate::actors::broker::BrokerError;
use crate::actors::dispatcher::{DispatchError, DispatchRequest};
use crate::actors::event_bus;
use crate::actors::ledger::{self, RequestQuery};

/// Submit to the bank dispatcher. The outcome is observed through
/// `GET /requests/{id}` or the event log.
pub async fn submit_request(
    State(state): State<ApiState>,
    Json(request): Json<DispatchRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let pending = state.engine.dispatcher().submit(request).await?;
    let request_id = pending.request_id().to_string();
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "request_id": request_id })),
    ))
}

pub async fn list_requests(
    State(state): State<ApiState>,
    Query(query): Query<RequestQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let page = ledger::query_requests(&state.engine.ledger(), query)
        .await
        .map_err(rpc_error)?;
    Ok(Json(page))
}

pub async fn get_request(
    State(state): State<ApiState>,
    Path(request_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    match ledger::get_request(&state.engine.ledger(), request_id.clone())
        .await
        .map_err(rpc_error)?
    {
        Some(detail) => Ok(Json(detail)),
        None => Err(ApiError::not_found(format!("request not found: {request_id}"))),
    }
}

pub async fn request_stats(State(state): State<ApiState>) -> Result<impl IntoResponse, ApiError> {
    let stats = ledger::ledger_stats(&state.engine.ledger())
        .await
        .map_err(rpc_error)?;
    Ok(Json(json!({ "by_status": stats })))
}

/// Cancel through whichever strategy owns the request.
pub async fn cancel_request(
    State(state): State<ApiState>,
    Path(request_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    match state.engine.dispatcher().cancel(request_id.clone()).await {
        Ok(()) => {}
        Err(DispatchError::NotFound(_)) => {
            match state.engine.broker().cancel_request(request_id.clone()).await {
                Ok(()) => {}
                Err(BrokerError::NotFound(_)) => {
                    return Err(ApiError::not_found(format!(
                        "request not found or already resolved: {request_id}"
                    )));
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(e) => return Err(e.into()),
    }
    tracing::info!(request_id = %request_id, "Request cancelled over HTTP");
    Ok(Json(json!({ "request_id": request_id, "status": "cancelled" })))
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub topic: Option<String>,
    pub since_seq: Option<u64>,
    pub limit: Option<usize>,
}

/// Retained bus events, oldest first
pub async fn list_events(
    State(state): State<ApiState>,
    Query(query): Query<EventsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let topic = query.topic.unwrap_or_else(|| "*".to_string());
    let limit = query.limit.unwrap_or(200).clamp(1, 1000);
    let events = event_bus::recent_events(
        &state.engine.event_bus(),
        topic,
        query.since_seq.unwrap_or(0),
        limit,
    )
    .await
    .map_err(rpc_error)?;
    Ok(Json(json!({ "events": events })))
}
