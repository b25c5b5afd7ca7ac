//! Caller-facing outcome of a submitted request
//!
//! Each request owns exactly one [`OutcomeSender`]; sending consumes it, so a
//! caller is resolved at most once. Dropping the sender without sending shows
//! up as [`RequestFailure::Closed`].

use serde_json::Value;
use shared_types::ErrorCategory;
use tokio::sync::oneshot;

/// Why a request did not produce an output
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum RequestFailure {
    #[error("request failed ({code}): {message}")]
    Failed {
        code: String,
        message: String,
        category: ErrorCategory,
    },
    #[error("request timed out")]
    Timeout,
    #[error("request cancelled")]
    Cancelled,
    #[error("engine stopped before the request resolved")]
    Closed,
}

pub type RequestOutcome = Result<Value, RequestFailure>;

/// Awaitable outcome returned by `submit`
#[derive(Debug)]
pub struct PendingOutcome {
    request_id: String,
    receiver: oneshot::Receiver<RequestOutcome>,
}

impl PendingOutcome {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub async fn wait(self) -> RequestOutcome {
        self.receiver
            .await
            .unwrap_or(Err(RequestFailure::Closed))
    }
}

/// Sending half, held by the strategy actor that owns the request
#[derive(Debug)]
pub struct OutcomeSender {
    request_id: String,
    sender: oneshot::Sender<RequestOutcome>,
}

impl OutcomeSender {
    pub fn resolve(self, outcome: RequestOutcome) {
        if self.sender.send(outcome).is_err() {
            tracing::debug!(
                request_id = %self.request_id,
                "Caller dropped its outcome before resolution"
            );
        }
    }
}

pub fn outcome_channel(request_id: impl Into<String>) -> (OutcomeSender, PendingOutcome) {
    let request_id = request_id.into();
    let (sender, receiver) = oneshot::channel();
    (
        OutcomeSender {
            request_id: request_id.clone(),
            sender,
        },
        PendingOutcome {
            request_id,
            receiver,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_outcome_resolves_once() {
        let (sender, pending) = outcome_channel("r1");
        assert_eq!(pending.request_id(), "r1");
        sender.resolve(Ok(json!({"result": 8})));
        assert_eq!(pending.wait().await, Ok(json!({"result": 8})));
    }

    #[tokio::test]
    async fn test_dropped_sender_closes_outcome() {
        let (sender, pending) = outcome_channel("r1");
        drop(sender);
        assert_eq!(pending.wait().await, Err(RequestFailure::Closed));
    }
}
