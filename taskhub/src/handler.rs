//! Task handlers - the caller-supplied bodies that actually perform a task
//!
//! The engine never runs task logic itself. Responders and the local
//! execution channel both delegate to a [`TaskHandler`].

use async_trait::async_trait;
use serde_json::Value;
use shared_types::ErrorCategory;
use std::sync::Arc;

/// Error returned by a handler; its category drives retry decisions.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
#[error("{category}: {message}")]
pub struct HandlerError {
    pub category: ErrorCategory,
    pub message: String,
}

impl HandlerError {
    /// A `processing` error, what a throwing handler produces
    pub fn processing(message: impl Into<String>) -> Self {
        Self {
            category: ErrorCategory::Processing,
            message: message.into(),
        }
    }

    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn perform(&self, task_id: &str, payload: Value) -> Result<Value, HandlerError>;
}

/// Adapter turning a synchronous closure into a [`TaskHandler`]
pub struct FnHandler<F> {
    f: F,
}

impl<F> FnHandler<F>
where
    F: Fn(&str, Value) -> Result<Value, HandlerError> + Send + Sync + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> TaskHandler for FnHandler<F>
where
    F: Fn(&str, Value) -> Result<Value, HandlerError> + Send + Sync + 'static,
{
    async fn perform(&self, task_id: &str, payload: Value) -> Result<Value, HandlerError> {
        (self.f)(task_id, payload)
    }
}

/// Shorthand for `Arc::new(FnHandler::new(f))`
pub fn handler_fn<F>(f: F) -> Arc<dyn TaskHandler>
where
    F: Fn(&str, Value) -> Result<Value, HandlerError> + Send + Sync + 'static,
{
    Arc::new(FnHandler::new(f))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_fn_handler_delegates() {
        let handler = handler_fn(|task_id, payload| {
            if payload.get("fail").is_some() {
                return Err(HandlerError::processing("asked to fail"));
            }
            Ok(json!({ "task": task_id }))
        });

        let ok = handler.perform("echo", json!({})).await.unwrap();
        assert_eq!(ok, json!({ "task": "echo" }));

        let err = handler
            .perform("echo", json!({ "fail": true }))
            .await
            .unwrap_err();
        assert_eq!(err.category, ErrorCategory::Processing);
        assert_eq!(err.to_string(), "processing: asked to fail");
    }
}
