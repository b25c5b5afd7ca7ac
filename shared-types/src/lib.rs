//! Shared types for the TaskHub engine
//!
//! These types are used by:
//! - the engine actors (broker, dispatcher, ledger, event bus)
//! - execution channels that run task bodies outside the engine
//! - observers reading events or ledger records over HTTP
//!
//! Serializable with serde for JSON over HTTP and for record stores.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Request Lifecycle
// ============================================================================

/// Lifecycle status of a request
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Assigned,
    Processing,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl RequestStatus {
    pub const ALL: [RequestStatus; 7] = [
        RequestStatus::Pending,
        RequestStatus::Assigned,
        RequestStatus::Processing,
        RequestStatus::Completed,
        RequestStatus::Failed,
        RequestStatus::Cancelled,
        RequestStatus::Timeout,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Assigned => "assigned",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Timeout => "timeout",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Timeout
        )
    }

    /// Whether the status-transition function accepts `self -> next`.
    ///
    /// Terminal states accept nothing. `assigned`/`processing` may fall back
    /// to `pending` when the request is scheduled for a retry.
    pub fn can_transition_to(&self, next: RequestStatus) -> bool {
        match self {
            Self::Pending => !matches!(next, Self::Pending),
            Self::Assigned => !matches!(next, Self::Assigned),
            Self::Processing => !matches!(next, Self::Processing | Self::Assigned),
            Self::Completed | Self::Failed | Self::Cancelled | Self::Timeout => false,
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RequestStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown request status: {s}"))
    }
}

/// A unit of work submitted to the engine
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Request {
    /// Unique request identifier (ULID)
    pub id: String,
    pub task_id: String,
    /// Manifest action used to build the channel message (dispatcher path only)
    pub action_id: Option<String>,
    pub parameters: serde_json::Value,
    pub status: RequestStatus,
    /// Higher is more urgent
    pub priority: i32,
    pub client_id: Option<String>,
    /// Claim deadline hint for hosts driving timeouts (broker path only)
    pub max_time_ms: Option<u64>,
    /// Number of assignments made so far
    pub attempts: u32,
    /// Set once terminal and the caller's outcome has been delivered
    pub archived: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Request {
    pub fn new(task_id: impl Into<String>, parameters: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: ulid::Ulid::new().to_string(),
            task_id: task_id.into(),
            action_id: None,
            parameters,
            status: RequestStatus::Pending,
            priority: 0,
            client_id: None,
            max_time_ms: None,
            attempts: 0,
            archived: false,
            created_at: now,
            updated_at: now,
        }
    }
}

/// One entry of a request's status history
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusChange {
    pub status: RequestStatus,
    pub at: DateTime<Utc>,
    pub reason: Option<String>,
}

/// Assignment status mirrors (and lags) the request status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    Queued,
    Assigned,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl AssignmentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Links a request to the bank (and optionally worker) executing it
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Assignment {
    pub assignment_id: String,
    pub request_id: String,
    pub bank_id: String,
    pub worker_id: Option<String>,
    /// 1-indexed attempt number
    pub attempt: u32,
    pub status: AssignmentStatus,
    pub queued_at: DateTime<Utc>,
    pub assigned_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Successful output of a request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestResult {
    pub request_id: String,
    pub assignment_id: Option<String>,
    pub output: serde_json::Value,
    pub processing_time_ms: u64,
    pub completed_at: DateTime<Utc>,
}

/// Error taxonomy used for retry decisions
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    Validation,
    Processing,
    Timeout,
    System,
    Network,
    #[default]
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Processing => "processing",
            Self::Timeout => "timeout",
            Self::System => "system",
            Self::Network => "network",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution error captured against a request (and the failing assignment)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestError {
    pub error_id: String,
    pub request_id: String,
    pub assignment_id: Option<String>,
    pub category: ErrorCategory,
    pub code: String,
    pub message: String,
    pub retryable: bool,
    pub attempt: u32,
    pub occurred_at: DateTime<Utc>,
}

/// Everything the ledger knows about one request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestDetail {
    pub request: Request,
    pub assignments: Vec<Assignment>,
    pub result: Option<RequestResult>,
    pub errors: Vec<RequestError>,
    pub history: Vec<StatusChange>,
}

// ============================================================================
// Banks and Capabilities
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BankStatus {
    #[default]
    Active,
    Inactive,
    Maintenance,
    Error,
}

/// Rolling bank metrics (EMA-smoothed)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BankMetrics {
    pub total_processed: u64,
    pub avg_processing_time_ms: f64,
    pub success_rate: f64,
    pub current_load: u32,
}

impl Default for BankMetrics {
    fn default() -> Self {
        Self {
            total_processed: 0,
            avg_processing_time_ms: 0.0,
            success_rate: 1.0,
            current_load: 0,
        }
    }
}

/// A named pool of workers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Bank {
    pub bank_id: String,
    pub worker_count: usize,
    pub status: BankStatus,
    pub metrics: BankMetrics,
    pub registered_at: DateTime<Utc>,
}

/// A (bank, task) pair's recorded performance and concurrency limit
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Capability {
    pub bank_id: String,
    pub task_id: String,
    /// In [0, 1]
    pub proficiency: f64,
    pub avg_processing_time_ms: f64,
    pub success_rate: f64,
    pub current_load: u32,
    pub max_concurrent: u32,
}

impl Capability {
    /// Fresh capability: no load, perfect success rate, no timing history
    pub fn new(
        bank_id: impl Into<String>,
        task_id: impl Into<String>,
        proficiency: f64,
        max_concurrent: u32,
    ) -> Self {
        Self {
            bank_id: bank_id.into(),
            task_id: task_id.into(),
            proficiency,
            avg_processing_time_ms: 0.0,
            success_rate: 1.0,
            current_load: 0,
            max_concurrent,
        }
    }
}

// ============================================================================
// Activity
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ActivityStatus {
    #[default]
    Idle,
    Busy,
    Error,
    Offline,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct WorkerActivity {
    pub worker_id: String,
    pub bank_id: String,
    pub messages_sent: u64,
    pub messages_completed: u64,
    pub errors: u64,
    pub current_load: u32,
    pub average_response_time_ms: f64,
    pub response_samples: u64,
    pub status: ActivityStatus,
    pub last_active_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct BankActivity {
    pub bank_id: String,
    pub messages_sent: u64,
    pub messages_completed: u64,
    pub errors: u64,
    pub current_load: u32,
    pub average_response_time_ms: f64,
    pub response_samples: u64,
    pub status: ActivityStatus,
    pub workers: Vec<WorkerActivity>,
}

impl BankActivity {
    /// Workers that can still receive messages
    pub fn active_workers(&self) -> usize {
        self.workers
            .iter()
            .filter(|w| w.status != ActivityStatus::Offline)
            .count()
    }
}

// ============================================================================
// Execution Channel Contract
// ============================================================================

/// Message sent to an execution channel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelMessage {
    pub action_id: String,
    pub task_id: String,
    pub request_id: String,
    pub assignment_id: String,
    pub worker_id: Option<String>,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelFailure {
    pub category: ErrorCategory,
    pub message: String,
}

/// Result delivered back by an execution channel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChannelResult {
    pub action_id: String,
    pub task_id: String,
    pub request_id: String,
    pub assignment_id: String,
    pub payload: serde_json::Value,
    pub success: bool,
    pub error: Option<ChannelFailure>,
    pub worker_id: Option<String>,
    pub bank_id: String,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
}

// ============================================================================
// Event System
// ============================================================================

pub const EVENT_TOPIC_REQUEST_SUBMITTED: &str = "request.submitted";
pub const EVENT_TOPIC_REQUEST_READY: &str = "request.ready";
pub const EVENT_TOPIC_REQUEST_CLAIMED: &str = "request.claimed";
pub const EVENT_TOPIC_REQUEST_CLAIM_CONFIRMED: &str = "request.claim_confirmed";
pub const EVENT_TOPIC_REQUEST_ASSIGNED: &str = "request.assigned";
pub const EVENT_TOPIC_REQUEST_PROCESSING: &str = "request.processing";
pub const EVENT_TOPIC_REQUEST_COMPLETED: &str = "request.completed";
pub const EVENT_TOPIC_REQUEST_FAILED: &str = "request.failed";
pub const EVENT_TOPIC_REQUEST_TIMEOUT: &str = "request.timeout";
pub const EVENT_TOPIC_REQUEST_CANCELLED: &str = "request.cancelled";
pub const EVENT_TOPIC_TASK_RETRIED: &str = "task.retried";
pub const EVENT_TOPIC_TASK_FAILED: &str = "task.failed";

/// Typed event payloads, one variant per event name
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum EventKind {
    RequestSubmitted {
        request_id: String,
        task_id: String,
        client_id: Option<String>,
        priority: i32,
        parameters: serde_json::Value,
    },
    RequestReady {
        request_id: String,
        task_id: String,
        parameters: serde_json::Value,
    },
    RequestClaimed {
        request_id: String,
        responder_id: String,
    },
    RequestClaimConfirmed {
        request_id: String,
        responder_id: String,
    },
    RequestAssigned {
        request_id: String,
        assignment_id: String,
        bank_id: String,
        worker_id: Option<String>,
    },
    RequestProcessing {
        request_id: String,
        worker_id: Option<String>,
    },
    RequestCompleted {
        request_id: String,
        result: serde_json::Value,
        processing_time_ms: u64,
    },
    RequestFailed {
        request_id: String,
        error_code: String,
        error_message: String,
        retryable: bool,
    },
    RequestTimeout {
        request_id: String,
    },
    RequestCancelled {
        request_id: String,
    },
    TaskRetried {
        request_id: String,
        attempt: u32,
        delay_ms: u64,
    },
    TaskFailed {
        request_id: String,
        error_code: String,
        error_message: String,
        attempts: u32,
    },
}

impl EventKind {
    pub fn request_id(&self) -> &str {
        match self {
            Self::RequestSubmitted { request_id, .. }
            | Self::RequestReady { request_id, .. }
            | Self::RequestClaimed { request_id, .. }
            | Self::RequestClaimConfirmed { request_id, .. }
            | Self::RequestAssigned { request_id, .. }
            | Self::RequestProcessing { request_id, .. }
            | Self::RequestCompleted { request_id, .. }
            | Self::RequestFailed { request_id, .. }
            | Self::RequestTimeout { request_id }
            | Self::RequestCancelled { request_id }
            | Self::TaskRetried { request_id, .. }
            | Self::TaskFailed { request_id, .. } => request_id,
        }
    }

    /// Routing topic for this event
    pub fn topic(&self) -> &'static str {
        match self {
            Self::RequestSubmitted { .. } => EVENT_TOPIC_REQUEST_SUBMITTED,
            Self::RequestReady { .. } => EVENT_TOPIC_REQUEST_READY,
            Self::RequestClaimed { .. } => EVENT_TOPIC_REQUEST_CLAIMED,
            Self::RequestClaimConfirmed { .. } => EVENT_TOPIC_REQUEST_CLAIM_CONFIRMED,
            Self::RequestAssigned { .. } => EVENT_TOPIC_REQUEST_ASSIGNED,
            Self::RequestProcessing { .. } => EVENT_TOPIC_REQUEST_PROCESSING,
            Self::RequestCompleted { .. } => EVENT_TOPIC_REQUEST_COMPLETED,
            Self::RequestFailed { .. } => EVENT_TOPIC_REQUEST_FAILED,
            Self::RequestTimeout { .. } => EVENT_TOPIC_REQUEST_TIMEOUT,
            Self::RequestCancelled { .. } => EVENT_TOPIC_REQUEST_CANCELLED,
            Self::TaskRetried { .. } => EVENT_TOPIC_TASK_RETRIED,
            Self::TaskFailed { .. } => EVENT_TOPIC_TASK_FAILED,
        }
    }

    /// External event name (`request-claim-confirmed`, ...)
    pub fn name(&self) -> &'static str {
        match self {
            Self::RequestSubmitted { .. } => "request-submitted",
            Self::RequestReady { .. } => "request-ready",
            Self::RequestClaimed { .. } => "request-claimed",
            Self::RequestClaimConfirmed { .. } => "request-claim-confirmed",
            Self::RequestAssigned { .. } => "request-assigned",
            Self::RequestProcessing { .. } => "request-processing",
            Self::RequestCompleted { .. } => "request-completed",
            Self::RequestFailed { .. } => "request-failed",
            Self::RequestTimeout { .. } => "request-timeout",
            Self::RequestCancelled { .. } => "request-cancelled",
            Self::TaskRetried { .. } => "task-retried",
            Self::TaskFailed { .. } => "task-failed",
        }
    }
}

/// Event envelope as distributed by the event bus
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Unique event identifier (ULID)
    pub id: String,

    /// Bus sequence number (strictly increasing per bus, assigned at publish)
    pub seq: u64,

    /// Topic for routing (hierarchical, e.g. "request.completed")
    pub topic: String,

    pub timestamp: DateTime<Utc>,

    /// Component that emitted the event
    pub source: String,

    pub kind: EventKind,
}

impl Event {
    /// Envelope `kind`; `seq` stays 0 until the bus publishes it
    pub fn new(kind: EventKind, source: impl Into<String>) -> Self {
        Self {
            id: ulid::Ulid::new().to_string(),
            seq: 0,
            topic: kind.topic().to_string(),
            timestamp: Utc::now(),
            source: source.into(),
            kind,
        }
    }

    pub fn request_id(&self) -> &str {
        self.kind.request_id()
    }

    /// Whether `pattern` selects this event
    ///
    /// `*` matches everything; `request.*` matches `request.ready` and any deeper topic.
    pub fn matches_topic(&self, pattern: &str) -> bool {
        if pattern == "*" {
            return true;
        }

        if let Some(prefix) = pattern.strip_suffix(".*") {
            self.topic.starts_with(prefix)
                && (self.topic.len() == prefix.len()
                    || self.topic[prefix.len()..].starts_with('.'))
        } else {
            self.topic == pattern
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses_reject_transitions() {
        for status in RequestStatus::ALL {
            if status.is_terminal() {
                for next in RequestStatus::ALL {
                    assert!(!status.can_transition_to(next), "{status} -> {next}");
                }
            }
        }
    }

    #[test]
    fn test_retry_falls_back_to_pending() {
        assert!(RequestStatus::Assigned.can_transition_to(RequestStatus::Pending));
        assert!(RequestStatus::Processing.can_transition_to(RequestStatus::Pending));
        assert!(!RequestStatus::Processing.can_transition_to(RequestStatus::Assigned));
        assert!(!RequestStatus::Pending.can_transition_to(RequestStatus::Pending));
    }

    #[test]
    fn test_status_round_trips_through_str() {
        assert_eq!("timeout".parse::<RequestStatus>(), Ok(RequestStatus::Timeout));
        assert!("archived".parse::<RequestStatus>().is_err());
    }

    #[test]
    fn test_event_kind_serializes_with_kebab_tag() {
        let kind = EventKind::RequestClaimConfirmed {
            request_id: "r1".to_string(),
            responder_id: "alpha".to_string(),
        };
        let json = serde_json::to_value(&kind).unwrap();
        assert_eq!(json["type"], "request-claim-confirmed");
        assert_eq!(json["responder_id"], "alpha");
        assert_eq!(kind.name(), "request-claim-confirmed");
    }

    #[test]
    fn test_event_new_derives_topic() {
        let event = Event::new(
            EventKind::TaskRetried {
                request_id: "r1".to_string(),
                attempt: 2,
                delay_ms: 2000,
            },
            "dispatcher",
        );
        assert_eq!(event.topic, EVENT_TOPIC_TASK_RETRIED);
        assert_eq!(event.request_id(), "r1");
        assert!(!event.id.is_empty());
    }

    #[test]
    fn test_event_matches_topic_wildcard() {
        let event = Event::new(
            EventKind::RequestTimeout {
                request_id: "r1".to_string(),
            },
            "broker",
        );
        assert!(event.matches_topic("request.timeout"));
        assert!(event.matches_topic("request.*"));
        assert!(event.matches_topic("*"));
        assert!(!event.matches_topic("task.*"));
        assert!(!event.matches_topic("request.time"));
    }
}
