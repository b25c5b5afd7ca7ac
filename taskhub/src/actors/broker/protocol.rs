//! ClaimBroker message protocol

use ractor::RpcReplyPort;
use serde_json::Value;
use shared_types::ErrorCategory;

use crate::actors::outcome::PendingOutcome;

/// Per-submission options
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    pub client_id: Option<String>,
    /// Claim deadline hint; falls back to `broker.default_max_time_ms`
    pub max_time_ms: Option<u64>,
    pub priority: i32,
}

/// Messages handled by ClaimBrokerActor
#[derive(Debug)]
pub enum BrokerMsg {
    /// Create a request and announce it to responders
    Submit {
        task_id: String,
        parameters: Value,
        options: SubmitOptions,
        reply: RpcReplyPort<PendingOutcome>,
    },
    /// Scheduled follow-up to `Submit` (emits `request-ready`)
    MarkReady { request_id: String },
    /// A responder volunteers for a request
    Claim {
        request_id: String,
        responder_id: String,
    },
    Complete { request_id: String, result: Value },
    Fail {
        request_id: String,
        code: String,
        message: String,
        category: ErrorCategory,
    },
    Timeout { request_id: String },
    Cancel {
        request_id: String,
        reply: RpcReplyPort<Result<(), BrokerError>>,
    },
    IsAuthorized {
        request_id: String,
        responder_id: String,
        reply: RpcReplyPort<bool>,
    },
}

#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum BrokerError {
    /// Unknown request, or one that already resolved
    #[error("request not found or already resolved: {0}")]
    NotFound(String),
    #[error("broker unavailable: {0}")]
    ActorUnavailable(String),
}
