//! CapabilityRegistry - which banks can run which tasks, and how well
//!
//! Banks and capabilities are kept in registration order; selection ties
//! go to the bank registered first.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use shared_types::{Bank, BankMetrics, BankStatus, Capability};

const LOAD_WEIGHT: f64 = 0.4;
const PROFICIENCY_WEIGHT: f64 = 0.3;
const SUCCESS_WEIGHT: f64 = 0.3;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("bank already registered: {0}")]
    DuplicateBank(String),
    #[error("task already registered: {0}")]
    DuplicateTask(String),
    #[error("capability already registered: {bank_id}/{task_id}")]
    DuplicateCapability { bank_id: String, task_id: String },
    #[error("unknown bank: {0}")]
    UnknownBank(String),
    #[error("unknown task: {0}")]
    UnknownTask(String),
    #[error("invalid capability: {0}")]
    InvalidCapability(String),
}

/// No bank could take a request for `task_id`
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
#[error("no capable bank for task {task_id}")]
pub struct NoCapableBank {
    pub task_id: String,
    /// Capable active banks exist but all are at their concurrency ceiling
    pub saturated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BankScore {
    pub bank_id: String,
    pub score: f64,
}

pub struct CapabilityRegistry {
    banks: Vec<Bank>,
    tasks: Vec<String>,
    capabilities: Vec<Capability>,
    /// α for the metrics EMA
    smoothing: f64,
}

impl CapabilityRegistry {
    pub fn new(smoothing: f64) -> Self {
        Self {
            banks: Vec::new(),
            tasks: Vec::new(),
            capabilities: Vec::new(),
            smoothing,
        }
    }

    pub fn register_bank(
        &mut self,
        bank_id: impl Into<String>,
        worker_count: usize,
    ) -> Result<&Bank, RegistryError> {
        let bank_id = bank_id.into();
        if self.bank_index(&bank_id).is_some() {
            return Err(RegistryError::DuplicateBank(bank_id));
        }
        self.banks.push(Bank {
            bank_id,
            worker_count,
            status: BankStatus::Active,
            metrics: BankMetrics::default(),
            registered_at: Utc::now(),
        });
        Ok(&self.banks[self.banks.len() - 1])
    }

    pub fn register_task(&mut self, task_id: impl Into<String>) -> Result<(), RegistryError> {
        let task_id = task_id.into();
        if self.has_task(&task_id) {
            return Err(RegistryError::DuplicateTask(task_id));
        }
        self.tasks.push(task_id);
        Ok(())
    }

    pub fn register_capability(&mut self, capability: Capability) -> Result<(), RegistryError> {
        if self.bank_index(&capability.bank_id).is_none() {
            return Err(RegistryError::UnknownBank(capability.bank_id));
        }
        if !self.has_task(&capability.task_id) {
            return Err(RegistryError::UnknownTask(capability.task_id));
        }
        if self
            .capability_index(&capability.bank_id, &capability.task_id)
            .is_some()
        {
            return Err(RegistryError::DuplicateCapability {
                bank_id: capability.bank_id,
                task_id: capability.task_id,
            });
        }
        if capability.max_concurrent == 0 {
            return Err(RegistryError::InvalidCapability(
                "max_concurrent must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&capability.proficiency) {
            return Err(RegistryError::InvalidCapability(format!(
                "proficiency {} outside [0, 1]",
                capability.proficiency
            )));
        }
        if !(0.0..=1.0).contains(&capability.success_rate) {
            return Err(RegistryError::InvalidCapability(format!(
                "success_rate {} outside [0, 1]",
                capability.success_rate
            )));
        }
        if capability.current_load > capability.max_concurrent {
            return Err(RegistryError::InvalidCapability(format!(
                "current_load {} exceeds max_concurrent {}",
                capability.current_load, capability.max_concurrent
            )));
        }

        self.capabilities.push(capability);
        Ok(())
    }

    pub fn set_bank_status(
        &mut self,
        bank_id: &str,
        status: BankStatus,
    ) -> Result<(), RegistryError> {
        let bank = self
            .bank_mut(bank_id)
            .ok_or_else(|| RegistryError::UnknownBank(bank_id.to_string()))?;
        bank.status = status;
        Ok(())
    }

    /// Highest-scoring active, unsaturated bank for `task_id`.
    ///
    /// `score = 0.4 * (1 - load / max) + 0.3 * proficiency + 0.3 * success_rate`
    pub fn select_best_bank(&self, task_id: &str) -> Result<BankScore, NoCapableBank> {
        self.select_best_bank_where(task_id, |_| true)
    }

    /// [`select_best_bank`](Self::select_best_bank) restricted to banks
    /// `eligible` accepts, such as banks with a worker still online.
    pub fn select_best_bank_where(
        &self,
        task_id: &str,
        eligible: impl Fn(&str) -> bool,
    ) -> Result<BankScore, NoCapableBank> {
        let mut best: Option<BankScore> = None;
        let mut saturated = false;

        for bank in self
            .banks
            .iter()
            .filter(|b| b.status == BankStatus::Active && eligible(&b.bank_id))
        {
            let Some(capability) = self.capability(&bank.bank_id, task_id) else {
                continue;
            };
            if capability.current_load >= capability.max_concurrent {
                saturated = true;
                continue;
            }

            let score = score(capability);
            if best.as_ref().map_or(true, |b| score > b.score) {
                best = Some(BankScore {
                    bank_id: bank.bank_id.clone(),
                    score,
                });
            }
        }

        best.ok_or_else(|| NoCapableBank {
            task_id: task_id.to_string(),
            saturated,
        })
    }

    /// A request was assigned to `bank_id`
    pub fn acquire(&mut self, bank_id: &str, task_id: &str) {
        if let Some(bank) = self.bank_mut(bank_id) {
            bank.metrics.current_load += 1;
        }
        if let Some(capability) = self.capability_mut(bank_id, task_id) {
            capability.current_load += 1;
        }
    }

    /// Drop load without touching metrics (cancelled or superseded work)
    pub fn release(&mut self, bank_id: &str, task_id: &str) {
        if let Some(bank) = self.bank_mut(bank_id) {
            bank.metrics.current_load = bank.metrics.current_load.saturating_sub(1);
        }
        if let Some(capability) = self.capability_mut(bank_id, task_id) {
            capability.current_load = capability.current_load.saturating_sub(1);
        }
    }

    /// Fold one finished attempt into the EMAs and release its load.
    ///
    /// Processing time is only sampled from successful attempts.
    pub fn record_outcome(
        &mut self,
        bank_id: &str,
        task_id: &str,
        success: bool,
        processing_time_ms: u64,
    ) {
        let alpha = self.smoothing;
        let success_sample = if success { 1.0 } else { 0.0 };
        let time_sample = processing_time_ms as f64;

        if let Some(bank) = self.bank_mut(bank_id) {
            let metrics = &mut bank.metrics;
            metrics.total_processed += 1;
            metrics.success_rate = ema(metrics.success_rate, success_sample, alpha);
            if success {
                metrics.avg_processing_time_ms =
                    ema(metrics.avg_processing_time_ms, time_sample, alpha);
            }
            metrics.current_load = metrics.current_load.saturating_sub(1);
        }
        if let Some(capability) = self.capability_mut(bank_id, task_id) {
            capability.success_rate = ema(capability.success_rate, success_sample, alpha);
            if success {
                capability.avg_processing_time_ms =
                    ema(capability.avg_processing_time_ms, time_sample, alpha);
            }
            capability.current_load = capability.current_load.saturating_sub(1);
        }
    }

    pub fn get_bank(&self, bank_id: &str) -> Option<&Bank> {
        self.banks.iter().find(|b| b.bank_id == bank_id)
    }

    pub fn banks(&self) -> &[Bank] {
        &self.banks
    }

    pub fn has_task(&self, task_id: &str) -> bool {
        self.tasks.iter().any(|t| t == task_id)
    }

    pub fn capability(&self, bank_id: &str, task_id: &str) -> Option<&Capability> {
        self.capabilities
            .iter()
            .find(|c| c.bank_id == bank_id && c.task_id == task_id)
    }

    /// Capabilities in registration order, optionally for one task
    pub fn capabilities(&self, task_id: Option<&str>) -> Vec<Capability> {
        self.capabilities
            .iter()
            .filter(|c| task_id.map_or(true, |t| c.task_id == t))
            .cloned()
            .collect()
    }

    fn bank_index(&self, bank_id: &str) -> Option<usize> {
        self.banks.iter().position(|b| b.bank_id == bank_id)
    }

    fn bank_mut(&mut self, bank_id: &str) -> Option<&mut Bank> {
        self.banks.iter_mut().find(|b| b.bank_id == bank_id)
    }

    fn capability_index(&self, bank_id: &str, task_id: &str) -> Option<usize> {
        self.capabilities
            .iter()
            .position(|c| c.bank_id == bank_id && c.task_id == task_id)
    }

    fn capability_mut(&mut self, bank_id: &str, task_id: &str) -> Option<&mut Capability> {
        self.capabilities
            .iter_mut()
            .find(|c| c.bank_id == bank_id && c.task_id == task_id)
    }
}

fn score(capability: &Capability) -> f64 {
    let load_ratio = capability.current_load as f64 / capability.max_concurrent as f64;
    LOAD_WEIGHT * (1.0 - load_ratio)
        + PROFICIENCY_WEIGHT * capability.proficiency
        + SUCCESS_WEIGHT * capability.success_rate
}

fn ema(old: f64, sample: f64, alpha: f64) -> f64 {
    (1.0 - alpha) * old + alpha * sample
}
