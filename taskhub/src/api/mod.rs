//! HTTP API routes for TaskHub
//!
//! A thin layer over the engine's handles: every route is one actor call.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};

pub mod banks;
pub mod requests;

use crate::actors::broker::BrokerError;
use crate::actors::dispatcher::DispatchError;
use crate::engine::Engine;

#[derive(Clone)]
pub struct ApiState {
    pub engine: Engine,
}

/// Configure all API routes
pub fn router() -> Router<ApiState> {
    Router::new()
        .route("/health", get(health_check))
        .route(
            "/requests",
            get(requests::list_requests).post(requests::submit_request),
        )
        .route("/requests/stats", get(requests::request_stats))
        .route("/requests/{request_id}", get(requests::get_request))
        .route(
            "/requests/{request_id}/cancel",
            post(requests::cancel_request),
        )
        .route("/events", get(requests::list_events))
        .route("/banks", get(banks::list_banks))
        .route("/banks/{bank_id}", get(banks::get_bank))
        .route("/banks/{bank_id}/activity", get(banks::get_bank_activity))
        .route("/capabilities", get(banks::list_capabilities))
        .route("/tasks/{task_id}/best-bank", get(banks::best_bank))
}

/// Health check endpoint
pub async fn health_check(State(_state): State<ApiState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "service": "taskhub",
            "version": env!("CARGO_PKG_VERSION")
        })),
    )
}

/// Error body: `{"error": {"code", "message", "details"?}}`
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
    details: Option<Value>,
}

impl ApiError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            code: "NOT_FOUND",
            message: message.into(),
            details: None,
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            code: "ACTOR_UNAVAILABLE",
            message: message.into(),
            details: None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut error = json!({
            "code": self.code,
            "message": self.message,
        });
        if let Some(details) = self.details {
            error["details"] = details;
        }
        (self.status, Json(json!({ "error": error }))).into_response()
    }
}

impl From<DispatchError> for ApiError {
    fn from(e: DispatchError) -> Self {
        let message = e.to_string();
        match e {
            DispatchError::Validation(errors) => Self {
                status: StatusCode::BAD_REQUEST,
                code: "INVALID_REQUEST",
                message,
                details: Some(json!(errors.issues())),
            },
            DispatchError::Registry(_) | DispatchError::Manifest(_) => Self {
                status: StatusCode::BAD_REQUEST,
                code: "INVALID_REQUEST",
                message,
                details: None,
            },
            DispatchError::NoCapableBank(e) => Self {
                status: StatusCode::CONFLICT,
                code: "NO_CAPABLE_BANK",
                message,
                details: Some(json!({ "task_id": e.task_id, "saturated": e.saturated })),
            },
            DispatchError::NotFound(_) => Self::not_found(message),
            DispatchError::ActorUnavailable(_) => Self::unavailable(message),
        }
    }
}

impl From<BrokerError> for ApiError {
    fn from(e: BrokerError) -> Self {
        match e {
            BrokerError::NotFound(_) => Self::not_found(e.to_string()),
            BrokerError::ActorUnavailable(_) => Self::unavailable(e.to_string()),
        }
    }
}

/// Actor RPC failures outside the strategy handles (ledger, bus)
pub(crate) fn rpc_error<T>(e: ractor::RactorErr<T>) -> ApiError {
    tracing::error!(error = %e, "Actor RPC failed");
    ApiError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "INTERNAL_ERROR",
        message: e.to_string(),
        details: None,
    }
}
