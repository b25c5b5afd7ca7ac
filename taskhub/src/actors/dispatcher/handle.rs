use ractor::ActorRef;
use shared_types::{ActivityStatus, Bank, BankActivity, BankStatus, Capability};
use std::sync::Arc;

use super::protocol::{DispatchError, DispatchRequest, DispatcherMsg};
use super::registry::BankScore;
use crate::actors::outcome::PendingOutcome;
use crate::channel::ExecutionChannel;
use crate::manifest::TaskManifest;

/// Cloneable front door to a BankDispatcherActor
#[derive(Debug, Clone)]
pub struct DispatcherHandle {
    actor: ActorRef<DispatcherMsg>,
}

impl DispatcherHandle {
    pub fn new(actor: ActorRef<DispatcherMsg>) -> Self {
        Self { actor }
    }

    pub fn actor(&self) -> &ActorRef<DispatcherMsg> {
        &self.actor
    }

    /// Register a bank and hand its channel a result sink
    pub async fn register_bank(
        &self,
        bank_id: impl Into<String>,
        worker_ids: Vec<String>,
        channel: Arc<dyn ExecutionChannel>,
    ) -> Result<Bank, DispatchError> {
        let bank_id = bank_id.into();
        ractor::call!(self.actor, |reply| DispatcherMsg::RegisterBank {
            bank_id,
            worker_ids,
            channel,
            reply,
        })
        .map_err(unavailable)?
    }

    pub async fn register_task(&self, manifest: TaskManifest) -> Result<(), DispatchError> {
        ractor::call!(self.actor, |reply| DispatcherMsg::RegisterTask {
            manifest,
            reply
        })
        .map_err(unavailable)?
    }

    pub async fn register_capability(&self, capability: Capability) -> Result<(), DispatchError> {
        ractor::call!(self.actor, |reply| DispatcherMsg::RegisterCapability {
            capability,
            reply
        })
        .map_err(unavailable)?
    }

    pub async fn set_bank_status(
        &self,
        bank_id: impl Into<String>,
        status: BankStatus,
    ) -> Result<(), DispatchError> {
        let bank_id = bank_id.into();
        ractor::call!(self.actor, |reply| DispatcherMsg::SetBankStatus {
            bank_id,
            status,
            reply,
        })
        .map_err(unavailable)?
    }

    /// Returns false when the bank or worker is unknown
    pub async fn set_worker_status(
        &self,
        bank_id: impl Into<String>,
        worker_id: impl Into<String>,
        status: ActivityStatus,
    ) -> Result<bool, DispatchError> {
        let bank_id = bank_id.into();
        let worker_id = worker_id.into();
        ractor::call!(self.actor, |reply| DispatcherMsg::SetWorkerStatus {
            bank_id,
            worker_id,
            status,
            reply,
        })
        .map_err(unavailable)
    }

    /// Validate and submit. Validation failures come back here and never
    /// create a request; everything later resolves the returned outcome.
    pub async fn submit(&self, request: DispatchRequest) -> Result<PendingOutcome, DispatchError> {
        ractor::call!(self.actor, |reply| DispatcherMsg::Submit { request, reply })
            .map_err(unavailable)?
    }

    pub async fn cancel(&self, request_id: impl Into<String>) -> Result<(), DispatchError> {
        let request_id = request_id.into();
        ractor::call!(self.actor, |reply| DispatcherMsg::Cancel { request_id, reply })
            .map_err(unavailable)?
    }

    pub async fn get_bank(&self, bank_id: impl Into<String>) -> Result<Option<Bank>, DispatchError> {
        let bank_id = bank_id.into();
        ractor::call!(self.actor, |reply| DispatcherMsg::GetBank { bank_id, reply })
            .map_err(unavailable)
    }

    pub async fn list_banks(&self) -> Result<Vec<Bank>, DispatchError> {
        ractor::call!(self.actor, |reply| DispatcherMsg::ListBanks { reply }).map_err(unavailable)
    }

    pub async fn bank_activity(
        &self,
        bank_id: impl Into<String>,
    ) -> Result<Option<BankActivity>, DispatchError> {
        let bank_id = bank_id.into();
        ractor::call!(self.actor, |reply| DispatcherMsg::BankActivity {
            bank_id,
            reply
        })
        .map_err(unavailable)
    }

    pub async fn capabilities(
        &self,
        task_id: Option<String>,
    ) -> Result<Vec<Capability>, DispatchError> {
        ractor::call!(self.actor, |reply| DispatcherMsg::Capabilities {
            task_id,
            reply
        })
        .map_err(unavailable)
    }

    pub async fn select_best_bank(
        &self,
        task_id: impl Into<String>,
    ) -> Result<BankScore, DispatchError> {
        let task_id = task_id.into();
        let selected = ractor::call!(self.actor, |reply| DispatcherMsg::SelectBestBank {
            task_id,
            reply
        })
        .map_err(unavailable)?;
        Ok(selected?)
    }

    pub fn reset_activity(&self) -> Result<(), DispatchError> {
        self.actor
            .cast(DispatcherMsg::ResetActivity)
            .map_err(|e| DispatchError::ActorUnavailable(e.to_string()))
    }
}

fn unavailable(e: ractor::RactorErr<DispatcherMsg>) -> DispatchError {
    DispatchError::ActorUnavailable(e.to_string())
}
