//! ClaimBrokerActor - decentralized assignment through a claim race
//!
//! Every broker operation is a message on this actor's mailbox, so the
//! mailbox is the single ordered stream for broker-managed requests. A claim
//! is resolved inside the handler that publishes `request-claimed`: the
//! first claim to arrive for an unresolved request wins, later ones are
//! dropped without an error.

use async_trait::async_trait;
use chrono::Utc;
use ractor::{Actor, ActorProcessingErr, ActorRef};
use serde_json::Value;
use shared_types::{
    ErrorCategory, EventKind, Request, RequestError, RequestResult, RequestStatus,
};
use std::collections::HashMap;
use std::time::{Duration, Instant};

use super::protocol::{BrokerError, BrokerMsg, SubmitOptions};
use crate::actors::event_bus::{emit, EventBusMsg};
use crate::actors::ledger::LedgerMsg;
use crate::actors::outcome::{outcome_channel, OutcomeSender, PendingOutcome, RequestFailure};
use crate::config::BrokerConfig;

const SOURCE: &str = "claim-broker";

#[derive(Debug, Default)]
pub struct ClaimBrokerActor;

/// Arguments for spawning ClaimBrokerActor
#[derive(Debug, Clone)]
pub struct BrokerArguments {
    pub event_bus: ActorRef<EventBusMsg>,
    pub ledger: ActorRef<LedgerMsg>,
    pub config: BrokerConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ClaimPhase {
    Submitted,
    Ready,
    Confirmed { responder_id: String },
}

/// An unresolved request. Removed on the first terminal signal.
struct BrokerEntry {
    task_id: String,
    parameters: Value,
    phase: ClaimPhase,
    outcome: OutcomeSender,
    confirmed_at: Option<Instant>,
}

pub struct BrokerState {
    entries: HashMap<String, BrokerEntry>,
    event_bus: ActorRef<EventBusMsg>,
    ledger: ActorRef<LedgerMsg>,
    config: BrokerConfig,
}

/// Terminal resolution applied to a request
enum Resolution {
    Completed(Value),
    Failed {
        code: String,
        message: String,
        category: ErrorCategory,
    },
    Timeout,
    Cancelled,
}

#[async_trait]
impl Actor for ClaimBrokerActor {
    type Msg = BrokerMsg;
    type State = BrokerState;
    type Arguments = BrokerArguments;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!(actor_id = %myself.get_id(), "ClaimBrokerActor starting");
        Ok(BrokerState {
            entries: HashMap::new(),
            event_bus: args.event_bus,
            ledger: args.ledger,
            config: args.config,
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            BrokerMsg::Submit {
                task_id,
                parameters,
                options,
                reply,
            } => {
                let pending = self.handle_submit(myself, state, task_id, parameters, options);
                let _ = reply.send(pending);
            }
            BrokerMsg::MarkReady { request_id } => self.handle_mark_ready(state, &request_id),
            BrokerMsg::Claim {
                request_id,
                responder_id,
            } => self.handle_claim(state, request_id, responder_id),
            BrokerMsg::Complete { request_id, result } => {
                self.resolve(state, &request_id, Resolution::Completed(result));
            }
            BrokerMsg::Fail {
                request_id,
                code,
                message,
                category,
            } => {
                self.resolve(
                    state,
                    &request_id,
                    Resolution::Failed {
                        code,
                        message,
                        category,
                    },
                );
            }
            BrokerMsg::Timeout { request_id } => {
                self.resolve(state, &request_id, Resolution::Timeout);
            }
            BrokerMsg::Cancel { request_id, reply } => {
                let result = if state.entries.contains_key(&request_id) {
                    self.resolve(state, &request_id, Resolution::Cancelled);
                    Ok(())
                } else {
                    Err(BrokerError::NotFound(request_id))
                };
                let _ = reply.send(result);
            }
            BrokerMsg::IsAuthorized {
                request_id,
                responder_id,
                reply,
            } => {
                let authorized =
                    state
                        .entries
                        .get(&request_id)
                        .is_some_and(|entry| match &entry.phase {
                            ClaimPhase::Confirmed { responder_id: winner } => {
                                *winner == responder_id
                            }
                            _ => false,
                        });
                let _ = reply.send(authorized);
            }
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        // Unresolved callers observe `Closed` once their senders drop.
        tracing::info!(
            actor_id = %myself.get_id(),
            unresolved = state.entries.len(),
            "ClaimBrokerActor stopped"
        );
        state.entries.clear();
        Ok(())
    }
}

impl ClaimBrokerActor {
    fn handle_submit(
        &self,
        myself: ActorRef<BrokerMsg>,
        state: &mut BrokerState,
        task_id: String,
        parameters: Value,
        options: SubmitOptions,
    ) -> PendingOutcome {
        let mut request = Request::new(task_id, parameters);
        request.client_id = options.client_id;
        request.priority = options.priority;
        request.max_time_ms = options.max_time_ms.or(state.config.default_max_time_ms);

        let request_id = request.id.clone();
        tracing::info!(
            request_id = %request_id,
            task_id = %request.task_id,
            priority = request.priority,
            "Request submitted to broker"
        );

        let submitted = EventKind::RequestSubmitted {
            request_id: request_id.clone(),
            task_id: request.task_id.clone(),
            client_id: request.client_id.clone(),
            priority: request.priority,
            parameters: request.parameters.clone(),
        };
        let (sender, pending) = outcome_channel(request_id.clone());
        state.entries.insert(
            request_id.clone(),
            BrokerEntry {
                task_id: request.task_id.clone(),
                parameters: request.parameters.clone(),
                phase: ClaimPhase::Submitted,
                outcome: sender,
                confirmed_at: None,
            },
        );

        self.record(state, LedgerMsg::Insert { request });
        emit(&state.event_bus, submitted, SOURCE);

        let delay = Duration::from_millis(state.config.ready_delay_ms);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Broker may already be gone; nothing to announce then.
            let _ = myself.cast(BrokerMsg::MarkReady { request_id });
        });

        pending
    }

    fn handle_mark_ready(&self, state: &mut BrokerState, request_id: &str) {
        let Some(entry) = state.entries.get_mut(request_id) else {
            return;
        };
        if entry.phase != ClaimPhase::Submitted {
            return;
        }
        entry.phase = ClaimPhase::Ready;

        emit(
            &state.event_bus,
            EventKind::RequestReady {
                request_id: request_id.to_string(),
                task_id: entry.task_id.clone(),
                parameters: entry.parameters.clone(),
            },
            SOURCE,
        );
    }

    fn handle_claim(
        &self,
        state: &mut BrokerState,
        request_id: String,
        responder_id: String,
    ) {
        let Some(entry) = state.entries.get_mut(&request_id) else {
            tracing::debug!(
                request_id = %request_id,
                responder_id = %responder_id,
                "Claim for unknown or resolved request ignored"
            );
            return;
        };

        emit(
            &state.event_bus,
            EventKind::RequestClaimed {
                request_id: request_id.clone(),
                responder_id: responder_id.clone(),
            },
            SOURCE,
        );

        if let ClaimPhase::Confirmed { responder_id: winner } = &entry.phase {
            tracing::debug!(
                request_id = %request_id,
                responder_id = %responder_id,
                winner = %winner,
                "Late claim ignored"
            );
            return;
        }

        entry.phase = ClaimPhase::Confirmed {
            responder_id: responder_id.clone(),
        };
        entry.confirmed_at = Some(Instant::now());

        tracing::info!(
            request_id = %request_id,
            responder_id = %responder_id,
            "Claim confirmed"
        );
        self.record(
            state,
            LedgerMsg::Transition {
                request_id: request_id.clone(),
                status: RequestStatus::Assigned,
                reason: Some(format!("claimed by {responder_id}")),
            },
        );
        emit(
            &state.event_bus,
            EventKind::RequestClaimConfirmed {
                request_id,
                responder_id,
            },
            SOURCE,
        );
    }

    /// Apply a terminal signal. Only the first one for a request has any effect.
    fn resolve(
        &self,
        state: &mut BrokerState,
        request_id: &str,
        resolution: Resolution,
    ) {
        let Some(entry) = state.entries.remove(request_id) else {
            tracing::debug!(
                request_id = %request_id,
                "Terminal signal for unknown or resolved request ignored"
            );
            return;
        };

        let attempt = u32::from(entry.confirmed_at.is_some());
        let processing_time_ms = entry
            .confirmed_at
            .map(|at| at.elapsed().as_millis() as u64)
            .unwrap_or(0);

        let (status, event, outcome) = match resolution {
            Resolution::Completed(output) => {
                self.record(
                    state,
                    LedgerMsg::RecordResult {
                        result: RequestResult {
                            request_id: request_id.to_string(),
                            assignment_id: None,
                            output: output.clone(),
                            processing_time_ms,
                            completed_at: Utc::now(),
                        },
                    },
                );
                (
                    RequestStatus::Completed,
                    EventKind::RequestCompleted {
                        request_id: request_id.to_string(),
                        result: output.clone(),
                        processing_time_ms,
                    },
                    Ok(output),
                )
            }
            Resolution::Failed {
                code,
                message,
                category,
            } => {
                self.record_error(state, request_id, category, &code, &message, attempt);
                (
                    RequestStatus::Failed,
                    EventKind::RequestFailed {
                        request_id: request_id.to_string(),
                        error_code: code.clone(),
                        error_message: message.clone(),
                        retryable: false,
                    },
                    Err(RequestFailure::Failed {
                        code,
                        message,
                        category,
                    }),
                )
            }
            Resolution::Timeout => {
                self.record_error(
                    state,
                    request_id,
                    ErrorCategory::Timeout,
                    "TIMEOUT",
                    "no responder finished before the deadline",
                    attempt,
                );
                (
                    RequestStatus::Timeout,
                    EventKind::RequestTimeout {
                        request_id: request_id.to_string(),
                    },
                    Err(RequestFailure::Timeout),
                )
            }
            Resolution::Cancelled => (
                RequestStatus::Cancelled,
                EventKind::RequestCancelled {
                    request_id: request_id.to_string(),
                },
                Err(RequestFailure::Cancelled),
            ),
        };

        tracing::info!(request_id = %request_id, status = %status, "Request resolved");

        self.record(
            state,
            LedgerMsg::Transition {
                request_id: request_id.to_string(),
                status,
                reason: None,
            },
        );
        emit(&state.event_bus, event, SOURCE);
        entry.outcome.resolve(outcome);
        self.record(
            state,
            LedgerMsg::Archive {
                request_id: request_id.to_string(),
            },
        );
    }

    fn record_error(
        &self,
        state: &BrokerState,
        request_id: &str,
        category: ErrorCategory,
        code: &str,
        message: &str,
        attempt: u32,
    ) {
        self.record(
            state,
            LedgerMsg::RecordError {
                error: RequestError {
                    error_id: ulid::Ulid::new().to_string(),
                    request_id: request_id.to_string(),
                    assignment_id: None,
                    category,
                    code: code.to_string(),
                    message: message.to_string(),
                    retryable: false,
                    attempt,
                    occurred_at: Utc::now(),
                },
            },
        );
    }

    fn record(&self, state: &BrokerState, message: LedgerMsg) {
        if let Err(e) = state.ledger.cast(message) {
            tracing::warn!(error = %e, "Failed to forward mutation to ledger");
        }
    }
}
