//! BankDispatcher message protocol

use ractor::RpcReplyPort;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shared_types::{ActivityStatus, Bank, BankActivity, BankStatus, Capability, ChannelResult};
use std::fmt;
use std::sync::Arc;

use super::registry::{BankScore, NoCapableBank, RegistryError};
use crate::actors::outcome::PendingOutcome;
use crate::channel::ExecutionChannel;
use crate::manifest::{ManifestError, TaskManifest, ValidationErrors};

/// A request for the centralized (bank-scored) strategy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatchRequest {
    pub task_id: String,
    /// Manifest action; the task's default action when absent
    #[serde(default)]
    pub action_id: Option<String>,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub priority: i32,
}

impl DispatchRequest {
    pub fn new(task_id: impl Into<String>, parameters: Value) -> Self {
        Self {
            task_id: task_id.into(),
            action_id: None,
            parameters,
            client_id: None,
            priority: 0,
        }
    }
}

/// Messages handled by BankDispatcherActor
pub enum DispatcherMsg {
    RegisterBank {
        bank_id: String,
        worker_ids: Vec<String>,
        channel: Arc<dyn ExecutionChannel>,
        reply: RpcReplyPort<Result<Bank, DispatchError>>,
    },
    /// Register a task and the manifest its messages are validated against
    RegisterTask {
        manifest: TaskManifest,
        reply: RpcReplyPort<Result<(), DispatchError>>,
    },
    RegisterCapability {
        capability: Capability,
        reply: RpcReplyPort<Result<(), DispatchError>>,
    },
    SetBankStatus {
        bank_id: String,
        status: BankStatus,
        reply: RpcReplyPort<Result<(), DispatchError>>,
    },
    SetWorkerStatus {
        bank_id: String,
        worker_id: String,
        status: ActivityStatus,
        reply: RpcReplyPort<bool>,
    },
    Submit {
        request: DispatchRequest,
        reply: RpcReplyPort<Result<PendingOutcome, DispatchError>>,
    },
    Cancel {
        request_id: String,
        reply: RpcReplyPort<Result<(), DispatchError>>,
    },
    /// Result delivered by an execution channel through its ResultSink
    ChannelResult { result: ChannelResult },
    /// Backoff elapsed; try another assignment
    Retry { request_id: String },
    GetBank {
        bank_id: String,
        reply: RpcReplyPort<Option<Bank>>,
    },
    ListBanks { reply: RpcReplyPort<Vec<Bank>> },
    BankActivity {
        bank_id: String,
        reply: RpcReplyPort<Option<BankActivity>>,
    },
    Capabilities {
        task_id: Option<String>,
        reply: RpcReplyPort<Vec<Capability>>,
    },
    SelectBestBank {
        task_id: String,
        reply: RpcReplyPort<Result<BankScore, NoCapableBank>>,
    },
    ResetActivity,
}

impl fmt::Debug for DispatcherMsg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RegisterBank {
                bank_id,
                worker_ids,
                ..
            } => f
                .debug_struct("RegisterBank")
                .field("bank_id", bank_id)
                .field("worker_ids", worker_ids)
                .finish_non_exhaustive(),
            Self::RegisterTask { manifest, .. } => f
                .debug_struct("RegisterTask")
                .field("task_id", &manifest.task_id)
                .finish_non_exhaustive(),
            Self::RegisterCapability { capability, .. } => f
                .debug_struct("RegisterCapability")
                .field("capability", capability)
                .finish_non_exhaustive(),
            Self::SetBankStatus {
                bank_id, status, ..
            } => f
                .debug_struct("SetBankStatus")
                .field("bank_id", bank_id)
                .field("status", status)
                .finish_non_exhaustive(),
            Self::SetWorkerStatus {
                bank_id,
                worker_id,
                status,
                ..
            } => f
                .debug_struct("SetWorkerStatus")
                .field("bank_id", bank_id)
                .field("worker_id", worker_id)
                .field("status", status)
                .finish_non_exhaustive(),
            Self::Submit { request, .. } => f
                .debug_struct("Submit")
                .field("request", request)
                .finish_non_exhaustive(),
            Self::Cancel { request_id, .. } => f
                .debug_struct("Cancel")
                .field("request_id", request_id)
                .finish_non_exhaustive(),
            Self::ChannelResult { result } => f
                .debug_struct("ChannelResult")
                .field("result", result)
                .finish(),
            Self::Retry { request_id } => f
                .debug_struct("Retry")
                .field("request_id", request_id)
                .finish(),
            Self::GetBank { bank_id, .. } => f
                .debug_struct("GetBank")
                .field("bank_id", bank_id)
                .finish_non_exhaustive(),
            Self::ListBanks { .. } => f.write_str("ListBanks"),
            Self::BankActivity { bank_id, .. } => f
                .debug_struct("BankActivity")
                .field("bank_id", bank_id)
                .finish_non_exhaustive(),
            Self::Capabilities { task_id, .. } => f
                .debug_struct("Capabilities")
                .field("task_id", task_id)
                .finish_non_exhaustive(),
            Self::SelectBestBank { task_id, .. } => f
                .debug_struct("SelectBestBank")
                .field("task_id", task_id)
                .finish_non_exhaustive(),
            Self::ResetActivity => f.write_str("ResetActivity"),
        }
    }
}

#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum DispatchError {
    #[error(transparent)]
    Validation(#[from] ValidationErrors),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error(transparent)]
    NoCapableBank(#[from] NoCapableBank),
    #[error("request not found or already resolved: {0}")]
    NotFound(String),
    #[error("dispatcher unavailable: {0}")]
    ActorUnavailable(String),
}
