//! ActivityTracer - per-worker and per-bank load bookkeeping
//!
//! Driven only by "message sent", "message completed" and "error" records.
//! It knows nothing about requests; the dispatcher asks it which worker
//! inside a bank should take the next message.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use shared_types::{ActivityStatus, BankActivity, WorkerActivity};

/// Worker picked by [`ActivityTracer::next_worker`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkerSelection {
    pub bank_id: String,
    pub worker_id: String,
}

pub struct ActivityTracer {
    banks: Vec<BankActivity>,
    /// Weight of a new sample in the response-time EMA
    smoothing: f64,
}

impl ActivityTracer {
    pub fn new(smoothing: f64) -> Self {
        Self {
            banks: Vec::new(),
            smoothing,
        }
    }

    /// Seed (or re-seed) a bank with idle workers
    pub fn initialize_bank(&mut self, bank_id: &str, worker_ids: &[String]) {
        let activity = BankActivity {
            bank_id: bank_id.to_string(),
            workers: worker_ids
                .iter()
                .map(|worker_id| WorkerActivity {
                    worker_id: worker_id.clone(),
                    bank_id: bank_id.to_string(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        match self.banks.iter_mut().find(|b| b.bank_id == bank_id) {
            Some(existing) => *existing = activity,
            None => self.banks.push(activity),
        }
        tracing::debug!(bank_id, workers = worker_ids.len(), "Tracer bank initialized");
    }

    pub fn record_message_sent(&mut self, bank_id: &str, worker_id: Option<&str>) {
        let Some(bank) = self.bank_mut(bank_id) else {
            return;
        };
        let now = Utc::now();

        bank.messages_sent += 1;
        bank.current_load += 1;
        if let Some(worker) = worker_mut(bank, worker_id) {
            worker.messages_sent += 1;
            worker.current_load += 1;
            worker.last_active_at = Some(now);
            set_status(worker, ActivityStatus::Busy);
        }
        refresh_bank_status(bank);
    }

    pub fn record_message_completed(
        &mut self,
        bank_id: &str,
        worker_id: Option<&str>,
        response_time_ms: u64,
    ) {
        let smoothing = self.smoothing;
        let Some(bank) = self.bank_mut(bank_id) else {
            return;
        };
        let sample = response_time_ms as f64;

        bank.messages_completed += 1;
        bank.current_load = bank.current_load.saturating_sub(1);
        bank.average_response_time_ms = smooth(
            bank.average_response_time_ms,
            bank.response_samples,
            sample,
            smoothing,
        );
        bank.response_samples += 1;

        if let Some(worker) = worker_mut(bank, worker_id) {
            worker.messages_completed += 1;
            worker.current_load = worker.current_load.saturating_sub(1);
            worker.average_response_time_ms = smooth(
                worker.average_response_time_ms,
                worker.response_samples,
                sample,
                smoothing,
            );
            worker.response_samples += 1;
            worker.last_active_at = Some(Utc::now());
            let next = if worker.current_load == 0 {
                ActivityStatus::Idle
            } else {
                ActivityStatus::Busy
            };
            set_status(worker, next);
        }
        refresh_bank_status(bank);
    }

    /// Failed message: release its load and flag the worker
    pub fn record_error(&mut self, bank_id: &str, worker_id: Option<&str>) {
        let Some(bank) = self.bank_mut(bank_id) else {
            return;
        };

        bank.errors += 1;
        bank.current_load = bank.current_load.saturating_sub(1);
        if let Some(worker) = worker_mut(bank, worker_id) {
            worker.errors += 1;
            worker.current_load = worker.current_load.saturating_sub(1);
            worker.last_active_at = Some(Utc::now());
            set_status(worker, ActivityStatus::Error);
        }
        refresh_bank_status(bank);
    }

    /// Returns false when the worker is unknown
    pub fn set_worker_status(
        &mut self,
        bank_id: &str,
        worker_id: &str,
        status: ActivityStatus,
    ) -> bool {
        let Some(bank) = self.bank_mut(bank_id) else {
            return false;
        };
        let Some(worker) = bank.workers.iter_mut().find(|w| w.worker_id == worker_id) else {
            return false;
        };
        worker.status = status;
        refresh_bank_status(bank);
        true
    }

    /// Least-loaded worker of the least-loaded bank.
    ///
    /// Banks are ranked by `current_load / active_workers`; within the bank
    /// workers by `current_load`, then by average response time. Offline
    /// workers are never picked.
    pub fn next_worker(&self, bank_id: Option<&str>) -> Option<WorkerSelection> {
        let mut best_bank: Option<(&BankActivity, f64)> = None;
        for bank in &self.banks {
            if bank_id.is_some_and(|id| id != bank.bank_id) {
                continue;
            }
            let active = bank.active_workers();
            if active == 0 {
                continue;
            }
            let ratio = bank.current_load as f64 / active as f64;
            if best_bank.map_or(true, |(_, best)| ratio < best) {
                best_bank = Some((bank, ratio));
            }
        }

        let (bank, _) = best_bank?;
        let worker = bank
            .workers
            .iter()
            .filter(|w| w.status != ActivityStatus::Offline)
            .min_by(|a, b| {
                a.current_load.cmp(&b.current_load).then_with(|| {
                    a.average_response_time_ms
                        .total_cmp(&b.average_response_time_ms)
                })
            })?;

        Some(WorkerSelection {
            bank_id: bank.bank_id.clone(),
            worker_id: worker.worker_id.clone(),
        })
    }

    /// Whether `bank_id` has a worker `next_worker` could pick
    pub fn has_active_worker(&self, bank_id: &str) -> bool {
        self.bank_activity(bank_id)
            .is_some_and(|bank| bank.active_workers() > 0)
    }

    pub fn bank_activity(&self, bank_id: &str) -> Option<&BankActivity> {
        self.banks.iter().find(|b| b.bank_id == bank_id)
    }

    pub fn banks(&self) -> &[BankActivity] {
        &self.banks
    }

    /// Zero every counter, keeping bank and worker registrations
    pub fn reset(&mut self) {
        for bank in &mut self.banks {
            let workers = std::mem::take(&mut bank.workers);
            *bank = BankActivity {
                bank_id: bank.bank_id.clone(),
                workers: workers
                    .into_iter()
                    .map(|w| WorkerActivity {
                        worker_id: w.worker_id,
                        bank_id: w.bank_id,
                        ..Default::default()
                    })
                    .collect(),
                ..Default::default()
            };
        }
    }

    fn bank_mut(&mut self, bank_id: &str) -> Option<&mut BankActivity> {
        let bank = self.banks.iter_mut().find(|b| b.bank_id == bank_id);
        if bank.is_none() {
            tracing::debug!(bank_id, "Activity for unknown bank ignored");
        }
        bank
    }
}

fn worker_mut<'a>(
    bank: &'a mut BankActivity,
    worker_id: Option<&str>,
) -> Option<&'a mut WorkerActivity> {
    let worker_id = worker_id?;
    bank.workers.iter_mut().find(|w| w.worker_id == worker_id)
}

/// Offline is sticky until changed through `set_worker_status`.
fn set_status(worker: &mut WorkerActivity, status: ActivityStatus) {
    if worker.status != ActivityStatus::Offline {
        worker.status = status;
    }
}

fn refresh_bank_status(bank: &mut BankActivity) {
    bank.status = if !bank.workers.is_empty() && bank.active_workers() == 0 {
        ActivityStatus::Offline
    } else if bank.current_load > 0 {
        ActivityStatus::Busy
    } else {
        ActivityStatus::Idle
    };
}

fn smooth(current: f64, samples: u64, sample: f64, weight: f64) -> f64 {
    if samples == 0 {
        sample
    } else {
        (1.0 - weight) * current + weight * sample
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workers(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn tracer() -> ActivityTracer {
        let mut tracer = ActivityTracer::new(0.2);
        tracer.initialize_bank("bank-a", &workers(&["a1", "a2"]));
        tracer.initialize_bank("bank-b", &workers(&["b1"]));
        tracer
    }

    #[test]
    fn test_initialized_workers_are_idle() {
        let tracer = tracer();
        let bank = tracer.bank_activity("bank-a").unwrap();
        assert_eq!(bank.workers.len(), 2);
        assert!(bank
            .workers
            .iter()
            .all(|w| w.status == ActivityStatus::Idle && w.current_load == 0));
    }

    #[test]
    fn test_sent_and_completed_track_load_and_status() {
        let mut tracer = tracer();
        tracer.record_message_sent("bank-a", Some("a1"));
        tracer.record_message_sent("bank-a", Some("a1"));

        let a1 = &tracer.bank_activity("bank-a").unwrap().workers[0];
        assert_eq!(a1.current_load, 2);
        assert_eq!(a1.status, ActivityStatus::Busy);

        tracer.record_message_completed("bank-a", Some("a1"), 100);
        let a1 = &tracer.bank_activity("bank-a").unwrap().workers[0];
        assert_eq!(a1.status, ActivityStatus::Busy);
        assert_eq!(a1.average_response_time_ms, 100.0);

        tracer.record_message_completed("bank-a", Some("a1"), 200);
        let bank = tracer.bank_activity("bank-a").unwrap();
        let a1 = &bank.workers[0];
        assert_eq!(a1.current_load, 0);
        assert_eq!(a1.status, ActivityStatus::Idle);
        assert!((a1.average_response_time_ms - 120.0).abs() < 1e-9);
        assert_eq!(bank.messages_sent, 2);
        assert_eq!(bank.messages_completed, 2);
        assert_eq!(bank.status, ActivityStatus::Idle);
    }

    #[test]
    fn test_next_worker_prefers_least_loaded_bank_then_worker() {
        let mut tracer = tracer();
        // bank-a: 1 load over 2 workers (0.5); bank-b: 0 over 1
        tracer.record_message_sent("bank-a", Some("a1"));
        assert_eq!(
            tracer.next_worker(None),
            Some(WorkerSelection {
                bank_id: "bank-b".to_string(),
                worker_id: "b1".to_string(),
            })
        );

        // Restricted to bank-a: a2 has no load
        assert_eq!(
            tracer.next_worker(Some("bank-a")).unwrap().worker_id,
            "a2"
        );
    }

    #[test]
    fn test_response_time_breaks_worker_ties() {
        let mut tracer = tracer();
        tracer.record_message_sent("bank-a", Some("a1"));
        tracer.record_message_completed("bank-a", Some("a1"), 500);
        tracer.record_message_sent("bank-a", Some("a2"));
        tracer.record_message_completed("bank-a", Some("a2"), 50);

        assert_eq!(
            tracer.next_worker(Some("bank-a")).unwrap().worker_id,
            "a2"
        );
    }

    #[test]
    fn test_offline_workers_are_never_selected() {
        let mut tracer = tracer();
        assert!(tracer.set_worker_status("bank-b", "b1", ActivityStatus::Offline));
        assert_eq!(
            tracer.bank_activity("bank-b").unwrap().status,
            ActivityStatus::Offline
        );
        assert_eq!(tracer.next_worker(Some("bank-b")), None);
        assert!(!tracer.has_active_worker("bank-b"));
        assert!(tracer.has_active_worker("bank-a"));
        assert!(!tracer.has_active_worker("bank-z"));

        tracer.set_worker_status("bank-a", "a1", ActivityStatus::Offline);
        tracer.set_worker_status("bank-a", "a2", ActivityStatus::Offline);
        assert_eq!(tracer.next_worker(None), None);
        assert!(!tracer.set_worker_status("bank-a", "ghost", ActivityStatus::Idle));
    }

    #[test]
    fn test_error_releases_load_and_keeps_worker_eligible() {
        let mut tracer = tracer();
        tracer.record_message_sent("bank-b", Some("b1"));
        tracer.record_error("bank-b", Some("b1"));

        let bank = tracer.bank_activity("bank-b").unwrap();
        assert_eq!(bank.errors, 1);
        assert_eq!(bank.current_load, 0);
        assert_eq!(bank.workers[0].status, ActivityStatus::Error);
        assert_eq!(tracer.next_worker(Some("bank-b")).unwrap().worker_id, "b1");

        // Floored at zero
        tracer.record_error("bank-b", Some("b1"));
        assert_eq!(tracer.bank_activity("bank-b").unwrap().current_load, 0);
    }

    #[test]
    fn test_reset_clears_counters_but_keeps_workers() {
        let mut tracer = tracer();
        tracer.record_message_sent("bank-a", Some("a1"));
        tracer.record_error("bank-a", Some("a2"));
        tracer.reset();

        let bank = tracer.bank_activity("bank-a").unwrap();
        assert_eq!(bank.messages_sent, 0);
        assert_eq!(bank.errors, 0);
        assert_eq!(bank.workers.len(), 2);
        assert!(bank
            .workers
            .iter()
            .all(|w| w.status == ActivityStatus::Idle && w.messages_sent == 0));
    }

    #[test]
    fn test_unknown_bank_is_ignored() {
        let mut tracer = tracer();
        tracer.record_message_sent("ghost", None);
        assert!(tracer.bank_activity("ghost").is_none());
    }
}
