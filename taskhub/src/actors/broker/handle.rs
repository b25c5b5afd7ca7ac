use ractor::ActorRef;
use serde_json::Value;
use shared_types::ErrorCategory;

use super::protocol::{BrokerError, BrokerMsg, SubmitOptions};
use crate::actors::outcome::PendingOutcome;
use crate::handler::HandlerError;

/// Cloneable front door to a ClaimBrokerActor.
///
/// Terminal signals (`complete_request`, `fail_request`, `timeout_request`)
/// are casts and may be sent from any task or thread; the broker applies
/// them in mailbox order and ignores all but the first per request.
#[derive(Debug, Clone)]
pub struct BrokerHandle {
    actor: ActorRef<BrokerMsg>,
}

impl BrokerHandle {
    pub fn new(actor: ActorRef<BrokerMsg>) -> Self {
        Self { actor }
    }

    pub fn actor(&self) -> &ActorRef<BrokerMsg> {
        &self.actor
    }

    pub async fn submit(
        &self,
        task_id: impl Into<String>,
        parameters: Value,
        options: SubmitOptions,
    ) -> Result<PendingOutcome, BrokerError> {
        let task_id = task_id.into();
        ractor::call!(self.actor, |reply| BrokerMsg::Submit {
            task_id,
            parameters,
            options,
            reply,
        })
        .map_err(unavailable)
    }

    pub fn claim(
        &self,
        request_id: impl Into<String>,
        responder_id: impl Into<String>,
    ) -> Result<(), BrokerError> {
        self.send(BrokerMsg::Claim {
            request_id: request_id.into(),
            responder_id: responder_id.into(),
        })
    }

    pub fn complete_request(
        &self,
        request_id: impl Into<String>,
        result: Value,
    ) -> Result<(), BrokerError> {
        self.send(BrokerMsg::Complete {
            request_id: request_id.into(),
            result,
        })
    }

    /// Fail with a handler's message, as a `processing` error
    pub fn fail_request(
        &self,
        request_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Result<(), BrokerError> {
        self.send(BrokerMsg::Fail {
            request_id: request_id.into(),
            code: "PROCESSING_ERROR".to_string(),
            message: message.into(),
            category: ErrorCategory::Processing,
        })
    }

    pub fn fail_request_with(
        &self,
        request_id: impl Into<String>,
        error: &HandlerError,
    ) -> Result<(), BrokerError> {
        self.send(BrokerMsg::Fail {
            request_id: request_id.into(),
            code: format!("{}_ERROR", error.category.as_str().to_uppercase()),
            message: error.message.clone(),
            category: error.category,
        })
    }

    pub fn timeout_request(&self, request_id: impl Into<String>) -> Result<(), BrokerError> {
        self.send(BrokerMsg::Timeout {
            request_id: request_id.into(),
        })
    }

    pub async fn cancel_request(&self, request_id: impl Into<String>) -> Result<(), BrokerError> {
        let request_id = request_id.into();
        ractor::call!(self.actor, |reply| BrokerMsg::Cancel { request_id, reply })
            .map_err(unavailable)?
    }

    /// True only for the confirmed winner of a still-unresolved request
    pub async fn is_authorized_responder(
        &self,
        request_id: impl Into<String>,
        responder_id: impl Into<String>,
    ) -> Result<bool, BrokerError> {
        let request_id = request_id.into();
        let responder_id = responder_id.into();
        ractor::call!(self.actor, |reply| BrokerMsg::IsAuthorized {
            request_id,
            responder_id,
            reply,
        })
        .map_err(unavailable)
    }

    fn send(&self, message: BrokerMsg) -> Result<(), BrokerError> {
        self.actor
            .cast(message)
            .map_err(|e| BrokerError::ActorUnavailable(e.to_string()))
    }
}

fn unavailable(e: ractor::RactorErr<BrokerMsg>) -> BrokerError {
    BrokerError::ActorUnavailable(e.to_string())
}
