use serde_json::json;
use shared_types::{
    ErrorCategory, RequestStatus, EVENT_TOPIC_REQUEST_CANCELLED, EVENT_TOPIC_REQUEST_COMPLETED,
    EVENT_TOPIC_REQUEST_FAILED, EVENT_TOPIC_REQUEST_TIMEOUT,
};
use std::time::Duration;

use crate::actors::broker::{BrokerError, SubmitOptions};
use crate::actors::ledger::get_request;
use crate::actors::outcome::RequestFailure;
use crate::config::BrokerConfig;
use crate::handler::HandlerError;

use super::support::setup_test_broker;

#[tokio::test]
async fn test_complete_twice_resolves_once() {
    let hub = setup_test_broker(BrokerConfig::default()).await;
    let pending = hub
        .broker
        .submit("add-numbers", json!({"a": 5, "b": 3}), SubmitOptions::default())
        .await
        .unwrap();
    let request_id = pending.request_id().to_string();

    hub.broker.claim(&request_id, "solo").unwrap();
    hub.broker
        .complete_request(&request_id, json!({"result": 8}))
        .unwrap();
    hub.broker
        .complete_request(&request_id, json!({"result": 9}))
        .unwrap();

    assert_eq!(pending.wait().await, Ok(json!({"result": 8})));
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(
        hub.events(EVENT_TOPIC_REQUEST_COMPLETED, &request_id)
            .await
            .len(),
        1
    );

    let detail = get_request(&hub.ledger, &request_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(detail.request.status, RequestStatus::Completed);
    assert!(detail.request.archived);
    assert_eq!(detail.result.unwrap().output, json!({"result": 8}));
    let statuses: Vec<RequestStatus> = detail.history.iter().map(|c| c.status).collect();
    assert_eq!(
        statuses,
        vec![
            RequestStatus::Pending,
            RequestStatus::Assigned,
            RequestStatus::Completed
        ]
    );

    hub.stop();
}

#[tokio::test]
async fn test_timeout_without_claim() {
    let hub = setup_test_broker(BrokerConfig::default()).await;
    let pending = hub
        .broker
        .submit("unsupported-task", json!({}), SubmitOptions::default())
        .await
        .unwrap();
    let request_id = pending.request_id().to_string();

    hub.broker.timeout_request(&request_id).unwrap();
    assert_eq!(pending.wait().await, Err(RequestFailure::Timeout));

    hub.wait_for(EVENT_TOPIC_REQUEST_TIMEOUT, &request_id).await;
    assert!(hub
        .events(EVENT_TOPIC_REQUEST_COMPLETED, &request_id)
        .await
        .is_empty());

    let detail = get_request(&hub.ledger, &request_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(detail.request.status, RequestStatus::Timeout);
    assert_eq!(detail.errors[0].category, ErrorCategory::Timeout);

    hub.stop();
}

#[tokio::test]
async fn test_fail_rejects_outcome_with_message() {
    let hub = setup_test_broker(BrokerConfig::default()).await;
    let pending = hub
        .broker
        .submit("add-numbers", json!({}), SubmitOptions::default())
        .await
        .unwrap();
    let request_id = pending.request_id().to_string();

    hub.broker.claim(&request_id, "solo").unwrap();
    hub.broker
        .fail_request(&request_id, "division by zero")
        .unwrap();

    match pending.wait().await {
        Err(RequestFailure::Failed {
            code,
            message,
            category,
        }) => {
            assert_eq!(code, "PROCESSING_ERROR");
            assert_eq!(message, "division by zero");
            assert_eq!(category, ErrorCategory::Processing);
        }
        other => panic!("expected failure, got {other:?}"),
    }
    hub.wait_for(EVENT_TOPIC_REQUEST_FAILED, &request_id).await;

    hub.stop();
}

#[tokio::test]
async fn test_fail_with_handler_error_keeps_category() {
    let hub = setup_test_broker(BrokerConfig::default()).await;
    let pending = hub
        .broker
        .submit("add-numbers", json!({}), SubmitOptions::default())
        .await
        .unwrap();
    let request_id = pending.request_id().to_string();

    let error = HandlerError::new(ErrorCategory::Validation, "a must be a number");
    hub.broker.fail_request_with(&request_id, &error).unwrap();

    match pending.wait().await {
        Err(RequestFailure::Failed { code, category, .. }) => {
            assert_eq!(code, "VALIDATION_ERROR");
            assert_eq!(category, ErrorCategory::Validation);
        }
        other => panic!("expected failure, got {other:?}"),
    }

    hub.stop();
}

#[tokio::test]
async fn test_cancel_resolves_and_is_not_repeatable() {
    let hub = setup_test_broker(BrokerConfig::default()).await;
    let pending = hub
        .broker
        .submit(
            "add-numbers",
            json!({}),
            SubmitOptions {
                client_id: Some("client-7".to_string()),
                max_time_ms: None,
                priority: 3,
            },
        )
        .await
        .unwrap();
    let request_id = pending.request_id().to_string();

    hub.broker.cancel_request(&request_id).await.unwrap();
    assert_eq!(pending.wait().await, Err(RequestFailure::Cancelled));
    assert_eq!(
        hub.broker.cancel_request(&request_id).await,
        Err(BrokerError::NotFound(request_id.clone()))
    );
    hub.wait_for(EVENT_TOPIC_REQUEST_CANCELLED, &request_id)
        .await;

    let detail = get_request(&hub.ledger, &request_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(detail.request.status, RequestStatus::Cancelled);
    assert_eq!(detail.request.client_id.as_deref(), Some("client-7"));
    assert_eq!(detail.request.priority, 3);
    assert_eq!(detail.request.max_time_ms, Some(30_000));

    hub.stop();
}
