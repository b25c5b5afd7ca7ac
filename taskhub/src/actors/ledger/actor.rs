//! LedgerActor - serializes every ledger mutation through one mailbox

use async_trait::async_trait;
use ractor::{Actor, ActorProcessingErr, ActorRef};
use shared_types::{RequestDetail, RequestStatus};
use std::collections::HashMap;

use super::protocol::{LedgerError, LedgerMsg};
use super::query::{QueryPage, RequestQuery};
use super::state::RequestLedger;
use super::store::{MemoryRecordStore, RecordStore};
use crate::config::LedgerConfig;

#[derive(Debug, Default)]
pub struct LedgerActor;

/// Arguments for spawning LedgerActor
pub struct LedgerArguments {
    pub store: Box<dyn RecordStore>,
    pub config: LedgerConfig,
}

impl Default for LedgerArguments {
    fn default() -> Self {
        Self {
            store: Box::new(MemoryRecordStore::new()),
            config: LedgerConfig::default(),
        }
    }
}

#[async_trait]
impl Actor for LedgerActor {
    type Msg = LedgerMsg;
    type State = RequestLedger;
    type Arguments = LedgerArguments;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!(
            actor_id = %myself.get_id(),
            archive_limit = args.config.archive_limit,
            "LedgerActor starting"
        );
        Ok(RequestLedger::with_store(args.store).with_archive_limit(args.config.archive_limit))
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            LedgerMsg::Insert { request } => {
                let request_id = request.id.clone();
                log_rejected("insert", &request_id, state.insert_request(request));
            }
            LedgerMsg::Transition {
                request_id,
                status,
                reason,
            } => {
                let outcome = state.transition(&request_id, status, reason).map(|_| ());
                log_rejected("transition", &request_id, outcome);
            }
            LedgerMsg::RecordAssignment { assignment } => {
                let request_id = assignment.request_id.clone();
                log_rejected(
                    "record_assignment",
                    &request_id,
                    state.record_assignment(assignment),
                );
            }
            LedgerMsg::UpdateAssignment {
                assignment_id,
                status,
            } => {
                let outcome = state.update_assignment(&assignment_id, status).map(|_| ());
                log_rejected("update_assignment", &assignment_id, outcome);
            }
            LedgerMsg::RecordResult { result } => {
                let request_id = result.request_id.clone();
                log_rejected("record_result", &request_id, state.record_result(result));
            }
            LedgerMsg::RecordError { error } => {
                let request_id = error.request_id.clone();
                log_rejected("record_error", &request_id, state.record_error(error));
            }
            LedgerMsg::Archive { request_id } => {
                let outcome = state.archive(&request_id);
                log_rejected("archive", &request_id, outcome);
            }
            LedgerMsg::GetRequest { request_id, reply } => {
                let _ = reply.send(state.detail(&request_id));
            }
            LedgerMsg::Query { query, reply } => {
                let _ = reply.send(state.query(&query));
            }
            LedgerMsg::Stats { reply } => {
                let _ = reply.send(state.stats());
            }
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        myself: ActorRef<Self::Msg>,
        _state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        tracing::info!(actor_id = %myself.get_id(), "LedgerActor stopped");
        Ok(())
    }
}

/// Ledger mutations are casts; a rejected one is logged, never fatal to the actor.
fn log_rejected(operation: &str, id: &str, outcome: Result<(), LedgerError>) {
    if let Err(e) = outcome {
        tracing::warn!(operation, id, error = %e, "Ledger rejected mutation");
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

pub async fn get_request(
    ledger: &ActorRef<LedgerMsg>,
    request_id: impl Into<String>,
) -> Result<Option<RequestDetail>, ractor::RactorErr<LedgerMsg>> {
    let request_id = request_id.into();
    ractor::call!(ledger, |reply| LedgerMsg::GetRequest { request_id, reply })
}

pub async fn query_requests(
    ledger: &ActorRef<LedgerMsg>,
    query: RequestQuery,
) -> Result<QueryPage, ractor::RactorErr<LedgerMsg>> {
    ractor::call!(ledger, |reply| LedgerMsg::Query { query, reply })
}

pub async fn ledger_stats(
    ledger: &ActorRef<LedgerMsg>,
) -> Result<HashMap<RequestStatus, usize>, ractor::RactorErr<LedgerMsg>> {
    ractor::call!(ledger, |reply| LedgerMsg::Stats { reply })
}
