//! BankDispatcherActor - centralized assignment to scored worker banks
//!
//! Owns the CapabilityRegistry, ActivityTracer, ManifestRegistry and the
//! execution channels. Channel results, retry re-entries and caller commands
//! all arrive on the same mailbox, so load counters and request state are
//! only ever mutated here.

use async_trait::async_trait;
use chrono::Utc;
use ractor::{Actor, ActorProcessingErr, ActorRef};
use serde_json::Value;
use shared_types::{
    Assignment, AssignmentStatus, ChannelMessage, ChannelResult, ErrorCategory, EventKind,
    Request, RequestError, RequestResult, RequestStatus,
};
use std::collections::HashMap;
use std::sync::Arc;

use super::protocol::{DispatchError, DispatchRequest, DispatcherMsg};
use super::registry::{BankScore, CapabilityRegistry, NoCapableBank, RegistryError};
use super::retry::RetryPolicy;
use super::tracer::ActivityTracer;
use crate::actors::event_bus::{emit, EventBusMsg};
use crate::actors::ledger::LedgerMsg;
use crate::actors::outcome::{outcome_channel, OutcomeSender, PendingOutcome, RequestFailure};
use crate::channel::{ExecutionChannel, ResultSink};
use crate::config::{DispatcherConfig, TracerConfig};
use crate::manifest::{ManifestRegistry, TaskManifest};

const SOURCE: &str = "bank-dispatcher";

#[derive(Debug, Default)]
pub struct BankDispatcherActor;

/// Arguments for spawning BankDispatcherActor
#[derive(Debug, Clone)]
pub struct DispatcherArguments {
    pub event_bus: ActorRef<EventBusMsg>,
    pub ledger: ActorRef<LedgerMsg>,
    pub retry: RetryPolicy,
    pub config: DispatcherConfig,
    pub tracer: TracerConfig,
}

/// An unresolved request. Removed on cancel, completion or terminal failure.
struct DispatchEntry {
    task_id: String,
    action_id: String,
    payload: Value,
    outcome: OutcomeSender,
    /// Assignments made so far
    attempts: u32,
    /// Retries scheduled so far
    retries: u32,
    /// Assignment currently holding bank load
    active: Option<String>,
}

pub struct DispatcherState {
    registry: CapabilityRegistry,
    tracer: ActivityTracer,
    manifests: ManifestRegistry,
    channels: HashMap<String, Arc<dyn ExecutionChannel>>,
    entries: HashMap<String, DispatchEntry>,
    retry: RetryPolicy,
    event_bus: ActorRef<EventBusMsg>,
    ledger: ActorRef<LedgerMsg>,
}

/// One failed attempt, before the retry decision
struct AttemptFailure {
    category: ErrorCategory,
    code: String,
    message: String,
}

impl AttemptFailure {
    fn new(category: ErrorCategory, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
        }
    }

    /// Handler failures carry only a category; the code is derived from it.
    fn from_category(category: ErrorCategory, message: impl Into<String>) -> Self {
        let code = format!("{}_ERROR", category.as_str().to_uppercase());
        Self::new(category, code, message)
    }
}

#[async_trait]
impl Actor for BankDispatcherActor {
    type Msg = DispatcherMsg;
    type State = DispatcherState;
    type Arguments = DispatcherArguments;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!(
            actor_id = %myself.get_id(),
            max_retries = args.retry.max_retries,
            "BankDispatcherActor starting"
        );
        Ok(DispatcherState {
            registry: CapabilityRegistry::new(args.config.metrics_smoothing),
            tracer: ActivityTracer::new(args.tracer.response_time_smoothing),
            manifests: ManifestRegistry::new(),
            channels: HashMap::new(),
            entries: HashMap::new(),
            retry: args.retry,
            event_bus: args.event_bus,
            ledger: args.ledger,
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            DispatcherMsg::RegisterBank {
                bank_id,
                worker_ids,
                channel,
                reply,
            } => {
                let result = match state.registry.register_bank(&bank_id, worker_ids.len()) {
                    Ok(bank) => {
                        let bank = bank.clone();
                        state.tracer.initialize_bank(&bank_id, &worker_ids);
                        channel.on_result(ResultSink::new(myself.clone()));
                        state.channels.insert(bank_id.clone(), channel);
                        tracing::info!(
                            bank_id = %bank_id,
                            workers = worker_ids.len(),
                            "Bank registered"
                        );
                        Ok(bank)
                    }
                    Err(e) => Err(DispatchError::from(e)),
                };
                let _ = reply.send(result);
            }
            DispatcherMsg::RegisterTask { manifest, reply } => {
                let _ = reply.send(self.handle_register_task(state, manifest));
            }
            DispatcherMsg::RegisterCapability { capability, reply } => {
                let result = state
                    .registry
                    .register_capability(capability)
                    .map_err(DispatchError::from);
                let _ = reply.send(result);
            }
            DispatcherMsg::SetBankStatus {
                bank_id,
                status,
                reply,
            } => {
                let result = state
                    .registry
                    .set_bank_status(&bank_id, status)
                    .map_err(DispatchError::from);
                let _ = reply.send(result);
            }
            DispatcherMsg::SetWorkerStatus {
                bank_id,
                worker_id,
                status,
                reply,
            } => {
                let _ = reply.send(state.tracer.set_worker_status(&bank_id, &worker_id, status));
            }
            DispatcherMsg::Submit { request, reply } => {
                match self.handle_submit(state, request) {
                    Ok((request_id, pending)) => {
                        let _ = reply.send(Ok(pending));
                        self.send_to_bank(&myself, state, &request_id).await;
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
            DispatcherMsg::Cancel { request_id, reply } => {
                let _ = reply.send(self.handle_cancel(state, request_id));
            }
            DispatcherMsg::ChannelResult { result } => {
                self.handle_channel_result(&myself, state, result);
            }
            DispatcherMsg::Retry { request_id } => {
                if state.entries.contains_key(&request_id) {
                    tracing::debug!(request_id = %request_id, "Retry re-entry");
                    self.send_to_bank(&myself, state, &request_id).await;
                }
            }
            DispatcherMsg::GetBank { bank_id, reply } => {
                let _ = reply.send(state.registry.get_bank(&bank_id).cloned());
            }
            DispatcherMsg::ListBanks { reply } => {
                let _ = reply.send(state.registry.banks().to_vec());
            }
            DispatcherMsg::BankActivity { bank_id, reply } => {
                let _ = reply.send(state.tracer.bank_activity(&bank_id).cloned());
            }
            DispatcherMsg::Capabilities { task_id, reply } => {
                let _ = reply.send(state.registry.capabilities(task_id.as_deref()));
            }
            DispatcherMsg::SelectBestBank { task_id, reply } => {
                let _ = reply.send(select_bank(state, &task_id));
            }
            DispatcherMsg::ResetActivity => state.tracer.reset(),
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        for (bank_id, channel) in state.channels.drain() {
            tracing::debug!(bank_id = %bank_id, "Terminating execution channel");
            channel.terminate().await;
        }
        tracing::info!(
            actor_id = %myself.get_id(),
            unresolved = state.entries.len(),
            "BankDispatcherActor stopped"
        );
        state.entries.clear();
        Ok(())
    }
}

/// Best bank for `task_id` among those with a worker still online
fn select_bank(state: &DispatcherState, task_id: &str) -> Result<BankScore, NoCapableBank> {
    let tracer = &state.tracer;
    state
        .registry
        .select_best_bank_where(task_id, |bank_id| tracer.has_active_worker(bank_id))
}

impl BankDispatcherActor {
    fn handle_register_task(
        &self,
        state: &mut DispatcherState,
        manifest: TaskManifest,
    ) -> Result<(), DispatchError> {
        let task_id = manifest.task_id.clone();
        if state.registry.has_task(&task_id) {
            return Err(RegistryError::DuplicateTask(task_id).into());
        }
        state.manifests.register(manifest)?;
        state.registry.register_task(&task_id)?;
        tracing::info!(task_id = %task_id, "Task registered");
        Ok(())
    }

    fn handle_submit(
        &self,
        state: &mut DispatcherState,
        submission: DispatchRequest,
    ) -> Result<(String, PendingOutcome), DispatchError> {
        let message = state.manifests.create_message(
            &submission.task_id,
            submission.action_id.as_deref(),
            &submission.parameters,
        )?;

        let mut request = Request::new(submission.task_id, submission.parameters);
        request.action_id = Some(message.action_id.clone());
        request.client_id = submission.client_id;
        request.priority = submission.priority;
        let request_id = request.id.clone();

        tracing::info!(
            request_id = %request_id,
            task_id = %request.task_id,
            action_id = %message.action_id,
            priority = request.priority,
            "Request submitted to dispatcher"
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
            DispatchEntry {
                task_id: message.task_id,
                action_id: message.action_id,
                payload: message.payload,
                outcome: sender,
                attempts: 0,
                retries: 0,
                active: None,
            },
        );

        self.record(state, LedgerMsg::Insert { request });
        emit(&state.event_bus, submitted, SOURCE);
        Ok((request_id, pending))
    }

    /// Make one assignment attempt for an unresolved request.
    async fn send_to_bank(
        &self,
        myself: &ActorRef<DispatcherMsg>,
        state: &mut DispatcherState,
        request_id: &str,
    ) {
        let Some(entry) = state.entries.get(request_id) else {
            return;
        };
        let task_id = entry.task_id.clone();

        let score = match select_bank(state, &task_id) {
            Ok(score) => score,
            Err(e) => {
                let category = if e.saturated {
                    ErrorCategory::System
                } else {
                    ErrorCategory::Unknown
                };
                tracing::warn!(
                    request_id = %request_id,
                    task_id = %task_id,
                    saturated = e.saturated,
                    "No capable bank"
                );
                let failure = AttemptFailure::new(category, "NO_CAPABLE_BANK", e.to_string());
                self.fail_attempt(myself, state, request_id, failure, false);
                return;
            }
        };
        let bank_id = score.bank_id;
        let worker_id = state
            .tracer
            .next_worker(Some(&bank_id))
            .map(|selection| selection.worker_id);

        let Some(entry) = state.entries.get_mut(request_id) else {
            return;
        };
        entry.attempts += 1;
        let assignment = Assignment {
            assignment_id: ulid::Ulid::new().to_string(),
            request_id: request_id.to_string(),
            bank_id: bank_id.clone(),
            worker_id: worker_id.clone(),
            attempt: entry.attempts,
            status: AssignmentStatus::Queued,
            queued_at: Utc::now(),
            assigned_at: None,
            started_at: None,
            completed_at: None,
        };
        let assignment_id = assignment.assignment_id.clone();
        entry.active = Some(assignment_id.clone());
        let message = ChannelMessage {
            action_id: entry.action_id.clone(),
            task_id: task_id.clone(),
            request_id: request_id.to_string(),
            assignment_id: assignment_id.clone(),
            worker_id: worker_id.clone(),
            payload: entry.payload.clone(),
            timestamp: Utc::now(),
        };

        state.registry.acquire(&bank_id, &task_id);
        state
            .tracer
            .record_message_sent(&bank_id, worker_id.as_deref());

        tracing::info!(
            request_id = %request_id,
            assignment_id = %assignment_id,
            bank_id = %bank_id,
            worker_id = ?worker_id,
            score = score.score,
            "Request assigned"
        );
        self.record(state, LedgerMsg::RecordAssignment { assignment });
        self.record(
            state,
            LedgerMsg::Transition {
                request_id: request_id.to_string(),
                status: RequestStatus::Assigned,
                reason: Some(format!("assigned to {bank_id}")),
            },
        );
        emit(
            &state.event_bus,
            EventKind::RequestAssigned {
                request_id: request_id.to_string(),
                assignment_id: assignment_id.clone(),
                bank_id: bank_id.clone(),
                worker_id: worker_id.clone(),
            },
            SOURCE,
        );

        let sent = match state.channels.get(&bank_id).cloned() {
            Some(channel) => channel.send(message).await.map_err(|e| e.to_string()),
            None => Err(format!("no execution channel for bank {bank_id}")),
        };

        match sent {
            Ok(()) => {
                self.record(
                    state,
                    LedgerMsg::Transition {
                        request_id: request_id.to_string(),
                        status: RequestStatus::Processing,
                        reason: None,
                    },
                );
                emit(
                    &state.event_bus,
                    EventKind::RequestProcessing {
                        request_id: request_id.to_string(),
                        worker_id,
                    },
                    SOURCE,
                );
            }
            Err(reason) => {
                tracing::warn!(
                    request_id = %request_id,
                    bank_id = %bank_id,
                    error = %reason,
                    "Channel send failed"
                );
                state.registry.record_outcome(&bank_id, &task_id, false, 0);
                state.tracer.record_error(&bank_id, worker_id.as_deref());
                let failure = AttemptFailure::new(ErrorCategory::Network, "SEND_FAILED", reason);
                self.fail_attempt(myself, state, request_id, failure, true);
            }
        }
    }

    fn handle_channel_result(
        &self,
        myself: &ActorRef<DispatcherMsg>,
        state: &mut DispatcherState,
        result: ChannelResult,
    ) {
        let current = state
            .entries
            .get(&result.request_id)
            .and_then(|entry| entry.active.as_ref())
            .is_some_and(|active| *active == result.assignment_id);

        if !current {
            // Cancelled, already resolved, or superseded: only the load goes.
            tracing::debug!(
                request_id = %result.request_id,
                assignment_id = %result.assignment_id,
                "Result for inactive assignment released"
            );
            state.registry.release(&result.bank_id, &result.task_id);
            if result.success {
                state.tracer.record_message_completed(
                    &result.bank_id,
                    result.worker_id.as_deref(),
                    result.duration_ms,
                );
            } else {
                state
                    .tracer
                    .record_error(&result.bank_id, result.worker_id.as_deref());
            }
            return;
        }

        state.registry.record_outcome(
            &result.bank_id,
            &result.task_id,
            result.success,
            result.duration_ms,
        );

        if result.success {
            state.tracer.record_message_completed(
                &result.bank_id,
                result.worker_id.as_deref(),
                result.duration_ms,
            );
            self.complete(state, result);
        } else {
            state
                .tracer
                .record_error(&result.bank_id, result.worker_id.as_deref());
            let failure = match result.error {
                Some(error) => AttemptFailure::from_category(error.category, error.message),
                None => AttemptFailure::from_category(
                    ErrorCategory::Unknown,
                    "channel reported failure without an error",
                ),
            };
            self.fail_attempt(myself, state, &result.request_id, failure, true);
        }
    }

    fn complete(&self, state: &mut DispatcherState, result: ChannelResult) {
        let Some(entry) = state.entries.remove(&result.request_id) else {
            return;
        };
        let request_id = result.request_id;

        tracing::info!(
            request_id = %request_id,
            bank_id = %result.bank_id,
            duration_ms = result.duration_ms,
            "Request completed"
        );
        self.record(
            state,
            LedgerMsg::RecordResult {
                result: RequestResult {
                    request_id: request_id.clone(),
                    assignment_id: Some(result.assignment_id),
                    output: result.payload.clone(),
                    processing_time_ms: result.duration_ms,
                    completed_at: Utc::now(),
                },
            },
        );
        self.record(
            state,
            LedgerMsg::Transition {
                request_id: request_id.clone(),
                status: RequestStatus::Completed,
                reason: None,
            },
        );
        emit(
            &state.event_bus,
            EventKind::RequestCompleted {
                request_id: request_id.clone(),
                result: result.payload.clone(),
                processing_time_ms: result.duration_ms,
            },
            SOURCE,
        );
        entry.outcome.resolve(Ok(result.payload));
        self.record(state, LedgerMsg::Archive { request_id });
    }

    /// Record a failed attempt and either schedule a retry or fail the request.
    ///
    /// `assigned` tells whether the request had moved past pending, which is
    /// when a retry has to move it back.
    fn fail_attempt(
        &self,
        myself: &ActorRef<DispatcherMsg>,
        state: &mut DispatcherState,
        request_id: &str,
        failure: AttemptFailure,
        assigned: bool,
    ) {
        let retry = state.retry.clone();
        let Some(entry) = state.entries.get_mut(request_id) else {
            return;
        };
        let assignment_id = entry.active.take();
        let retryable = retry.is_retryable(failure.category);
        let will_retry = retry.should_retry(failure.category, entry.retries);
        let attempts = entry.attempts;

        let error = RequestError {
            error_id: ulid::Ulid::new().to_string(),
            request_id: request_id.to_string(),
            assignment_id,
            category: failure.category,
            code: failure.code.clone(),
            message: failure.message.clone(),
            retryable,
            attempt: attempts,
            occurred_at: Utc::now(),
        };

        if will_retry {
            entry.retries += 1;
            let attempt = entry.retries;
            let delay = retry.delay_for_attempt(attempt);
            let delay_ms = delay.as_millis() as u64;

            tracing::info!(
                request_id = %request_id,
                code = %failure.code,
                attempt,
                delay_ms,
                "Attempt failed, retrying"
            );
            self.record(state, LedgerMsg::RecordError { error });
            self.emit_failed(state, request_id, &failure, retryable);
            if assigned {
                self.record(
                    state,
                    LedgerMsg::Transition {
                        request_id: request_id.to_string(),
                        status: RequestStatus::Pending,
                        reason: Some(format!("retry {attempt}")),
                    },
                );
            }
            emit(
                &state.event_bus,
                EventKind::TaskRetried {
                    request_id: request_id.to_string(),
                    attempt,
                    delay_ms,
                },
                SOURCE,
            );

            let myself = myself.clone();
            let request_id = request_id.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                // Dispatcher may have stopped; the caller then sees `Closed`.
                let _ = myself.cast(DispatcherMsg::Retry { request_id });
            });
            return;
        }

        let Some(entry) = state.entries.remove(request_id) else {
            return;
        };
        tracing::warn!(
            request_id = %request_id,
            code = %failure.code,
            category = %failure.category,
            attempts,
            "Request failed"
        );
        self.record(state, LedgerMsg::RecordError { error });
        self.emit_failed(state, request_id, &failure, retryable);
        self.record(
            state,
            LedgerMsg::Transition {
                request_id: request_id.to_string(),
                status: RequestStatus::Failed,
                reason: Some(failure.code.clone()),
            },
        );
        emit(
            &state.event_bus,
            EventKind::TaskFailed {
                request_id: request_id.to_string(),
                error_code: failure.code.clone(),
                error_message: failure.message.clone(),
                attempts,
            },
            SOURCE,
        );
        entry.outcome.resolve(Err(RequestFailure::Failed {
            code: failure.code,
            message: failure.message,
            category: failure.category,
        }));
        self.record(
            state,
            LedgerMsg::Archive {
                request_id: request_id.to_string(),
            },
        );
    }

    fn emit_failed(
        &self,
        state: &DispatcherState,
        request_id: &str,
        failure: &AttemptFailure,
        retryable: bool,
    ) {
        emit(
            &state.event_bus,
            EventKind::RequestFailed {
                request_id: request_id.to_string(),
                error_code: failure.code.clone(),
                error_message: failure.message.clone(),
                retryable,
            },
            SOURCE,
        );
    }

    fn handle_cancel(
        &self,
        state: &mut DispatcherState,
        request_id: String,
    ) -> Result<(), DispatchError> {
        let Some(entry) = state.entries.remove(&request_id) else {
            return Err(DispatchError::NotFound(request_id));
        };
        tracing::info!(
            request_id = %request_id,
            in_flight = entry.active.is_some(),
            "Request cancelled"
        );
        self.record(
            state,
            LedgerMsg::Transition {
                request_id: request_id.clone(),
                status: RequestStatus::Cancelled,
                reason: None,
            },
        );
        emit(
            &state.event_bus,
            EventKind::RequestCancelled {
                request_id: request_id.clone(),
            },
            SOURCE,
        );
        entry.outcome.resolve(Err(RequestFailure::Cancelled));
        self.record(state, LedgerMsg::Archive { request_id });
        Ok(())
    }

    fn record(&self, state: &DispatcherState, message: LedgerMsg) {
        if let Err(e) = state.ledger.cast(message) {
            tracing::warn!(error = %e, "Failed to forward mutation to ledger");
        }
    }
}
