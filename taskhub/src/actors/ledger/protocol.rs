//! LedgerActor message protocol
//!
//! Mutations are fire-and-forget casts sent by the strategy actor that owns
//! a request; reads are RPC calls.

use ractor::RpcReplyPort;
use shared_types::{
    Assignment, AssignmentStatus, Request, RequestDetail, RequestError, RequestResult,
    RequestStatus,
};
use std::collections::HashMap;

use super::query::{QueryPage, RequestQuery};

/// Messages handled by LedgerActor
#[derive(Debug)]
pub enum LedgerMsg {
    /// Record a newly submitted request
    Insert { request: Request },
    /// Move a request through the status-transition function
    Transition {
        request_id: String,
        status: RequestStatus,
        reason: Option<String>,
    },
    /// Record a new assignment (becomes the request's active one)
    RecordAssignment { assignment: Assignment },
    /// Move an assignment forward
    UpdateAssignment {
        assignment_id: String,
        status: AssignmentStatus,
    },
    RecordResult { result: RequestResult },
    RecordError { error: RequestError },
    /// Flag a terminal request once its outcome was delivered
    Archive { request_id: String },
    GetRequest {
        request_id: String,
        reply: RpcReplyPort<Option<RequestDetail>>,
    },
    Query {
        query: RequestQuery,
        reply: RpcReplyPort<QueryPage>,
    },
    Stats {
        reply: RpcReplyPort<HashMap<RequestStatus, usize>>,
    },
}

/// Errors raised by the ledger's transition function
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("request not found: {0}")]
    NotFound(String),
    #[error("assignment not found: {0}")]
    AssignmentNotFound(String),
    #[error("request already exists: {0}")]
    Duplicate(String),
    #[error("invalid transition for {request_id}: {from} -> {to}")]
    InvalidTransition {
        request_id: String,
        from: RequestStatus,
        to: RequestStatus,
    },
    #[error("request {0} is not terminal")]
    NotTerminal(String),
}
