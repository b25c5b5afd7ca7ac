//! RequestLedger - owner of Request/Assignment/Result/Error records
//!
//! Requests change status only through [`RequestLedger::transition`], which
//! enforces the lifecycle table and appends to the status history. Every
//! mutation is written through to the configured [`RecordStore`].
//!
//! Archived requests stay queryable until more than `archive_limit` of them
//! pile up; the oldest are then dropped from memory along with their
//! assignments, result, errors and history. The store keeps its copies.

use chrono::Utc;
use serde::Serialize;
use shared_types::{
    Assignment, AssignmentStatus, Request, RequestDetail, RequestError, RequestResult,
    RequestStatus, StatusChange,
};
use std::collections::{HashMap, VecDeque};

use super::protocol::LedgerError;
use crate::config::LedgerConfig;
use super::query::{QueryPage, RequestQuery};
use super::store::{
    MemoryRecordStore, RecordStore, StoreError, COLLECTION_ASSIGNMENTS, COLLECTION_ERRORS,
    COLLECTION_REQUESTS, COLLECTION_RESULTS,
};

pub struct RequestLedger {
    requests: HashMap<String, Request>,

    /// request_id -> assignments in creation order (last one is the active one)
    assignments: HashMap<String, Vec<Assignment>>,

    /// assignment_id -> request_id
    assignment_index: HashMap<String, String>,

    results: HashMap<String, RequestResult>,

    errors: HashMap<String, Vec<RequestError>>,

    history: HashMap<String, Vec<StatusChange>>,

    /// Archived request ids, oldest first
    archived: VecDeque<String>,

    archive_limit: usize,

    store: Box<dyn RecordStore>,
}

impl RequestLedger {
    pub fn new() -> Self {
        Self::with_store(Box::new(MemoryRecordStore::new()))
    }

    pub fn with_store(store: Box<dyn RecordStore>) -> Self {
        Self {
            requests: HashMap::new(),
            assignments: HashMap::new(),
            assignment_index: HashMap::new(),
            results: HashMap::new(),
            errors: HashMap::new(),
            history: HashMap::new(),
            archived: VecDeque::new(),
            archive_limit: LedgerConfig::default().archive_limit,
            store,
        }
    }

    pub fn with_archive_limit(mut self, archive_limit: usize) -> Self {
        self.archive_limit = archive_limit;
        self
    }

    // =========================================================================
    // Requests
    // =========================================================================

    pub fn insert_request(&mut self, request: Request) -> Result<(), LedgerError> {
        if self.requests.contains_key(&request.id) {
            return Err(LedgerError::Duplicate(request.id));
        }

        self.history.insert(
            request.id.clone(),
            vec![StatusChange {
                status: request.status,
                at: request.created_at,
                reason: Some("submitted".to_string()),
            }],
        );
        self.persist(COLLECTION_REQUESTS, &request.id, &request);
        self.requests.insert(request.id.clone(), request);
        Ok(())
    }

    pub fn get_request(&self, request_id: &str) -> Option<&Request> {
        self.requests.get(request_id)
    }

    /// The status-transition function.
    ///
    /// Also mirrors the change onto the active assignment, if any.
    pub fn transition(
        &mut self,
        request_id: &str,
        status: RequestStatus,
        reason: Option<String>,
    ) -> Result<&Request, LedgerError> {
        let request = self
            .requests
            .get_mut(request_id)
            .ok_or_else(|| LedgerError::NotFound(request_id.to_string()))?;

        if !request.status.can_transition_to(status) {
            return Err(LedgerError::InvalidTransition {
                request_id: request_id.to_string(),
                from: request.status,
                to: status,
            });
        }

        let now = Utc::now();
        request.status = status;
        request.updated_at = now;

        self.history
            .entry(request_id.to_string())
            .or_default()
            .push(StatusChange {
                status,
                at: now,
                reason,
            });

        let mirrored = match status {
            RequestStatus::Assigned => Some(AssignmentStatus::Assigned),
            RequestStatus::Processing => Some(AssignmentStatus::Processing),
            RequestStatus::Completed => Some(AssignmentStatus::Completed),
            RequestStatus::Cancelled => Some(AssignmentStatus::Cancelled),
            RequestStatus::Failed | RequestStatus::Timeout | RequestStatus::Pending => {
                Some(AssignmentStatus::Failed)
            }
        };
        if let Some(assignment_status) = mirrored {
            let active_id = self
                .active_assignment(request_id)
                .map(|a| a.assignment_id.clone());
            if let Some(assignment_id) = active_id {
                self.update_assignment(&assignment_id, assignment_status)?;
            }
        }

        let request = self
            .requests
            .get(request_id)
            .ok_or_else(|| LedgerError::NotFound(request_id.to_string()))?
            .clone();
        self.persist(COLLECTION_REQUESTS, request_id, &request);

        self.requests
            .get(request_id)
            .ok_or_else(|| LedgerError::NotFound(request_id.to_string()))
    }

    /// Flag a terminal request as archived
    pub fn archive(&mut self, request_id: &str) -> Result<(), LedgerError> {
        let request = self
            .requests
            .get_mut(request_id)
            .ok_or_else(|| LedgerError::NotFound(request_id.to_string()))?;

        if !request.status.is_terminal() {
            return Err(LedgerError::NotTerminal(request_id.to_string()));
        }
        if request.archived {
            return Ok(());
        }
        request.archived = true;

        let snapshot = request.clone();
        self.persist(COLLECTION_REQUESTS, request_id, &snapshot);
        self.archived.push_back(request_id.to_string());

        while self.archived.len() > self.archive_limit {
            let Some(oldest) = self.archived.pop_front() else {
                break;
            };
            self.evict(&oldest);
        }
        Ok(())
    }

    /// Drop every in-memory record of `request_id`
    fn evict(&mut self, request_id: &str) {
        self.requests.remove(request_id);
        self.history.remove(request_id);
        self.results.remove(request_id);
        self.errors.remove(request_id);
        for assignment in self.assignments.remove(request_id).unwrap_or_default() {
            self.assignment_index.remove(&assignment.assignment_id);
        }
        tracing::debug!(request_id, "Evicted archived request");
    }

    pub fn status_history(&self, request_id: &str) -> &[StatusChange] {
        self.history
            .get(request_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    // =========================================================================
    // Assignments
    // =========================================================================

    pub fn record_assignment(&mut self, assignment: Assignment) -> Result<(), LedgerError> {
        let request = self
            .requests
            .get_mut(&assignment.request_id)
            .ok_or_else(|| LedgerError::NotFound(assignment.request_id.clone()))?;

        request.attempts += 1;
        request.updated_at = Utc::now();
        let snapshot = request.clone();

        self.persist(COLLECTION_REQUESTS, &snapshot.id, &snapshot);
        self.persist(
            COLLECTION_ASSIGNMENTS,
            &assignment.assignment_id,
            &assignment,
        );
        self.assignment_index.insert(
            assignment.assignment_id.clone(),
            assignment.request_id.clone(),
        );
        self.assignments
            .entry(assignment.request_id.clone())
            .or_default()
            .push(assignment);
        Ok(())
    }

    pub fn update_assignment(
        &mut self,
        assignment_id: &str,
        status: AssignmentStatus,
    ) -> Result<&Assignment, LedgerError> {
        let request_id = self
            .assignment_index
            .get(assignment_id)
            .ok_or_else(|| LedgerError::AssignmentNotFound(assignment_id.to_string()))?;

        let assignment = self
            .assignments
            .get_mut(request_id)
            .and_then(|list| list.iter_mut().find(|a| a.assignment_id == assignment_id))
            .ok_or_else(|| LedgerError::AssignmentNotFound(assignment_id.to_string()))?;

        let now = Utc::now();
        match status {
            AssignmentStatus::Queued => {}
            AssignmentStatus::Assigned => assignment.assigned_at = Some(now),
            AssignmentStatus::Processing => assignment.started_at = Some(now),
            AssignmentStatus::Completed
            | AssignmentStatus::Failed
            | AssignmentStatus::Cancelled => assignment.completed_at = Some(now),
        }
        assignment.status = status;

        let snapshot = assignment.clone();
        self.persist(COLLECTION_ASSIGNMENTS, assignment_id, &snapshot);

        self.assignments
            .get(&snapshot.request_id)
            .and_then(|list| list.iter().find(|a| a.assignment_id == assignment_id))
            .ok_or_else(|| LedgerError::AssignmentNotFound(assignment_id.to_string()))
    }

    pub fn assignments(&self, request_id: &str) -> &[Assignment] {
        self.assignments
            .get(request_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// The latest assignment, while it has not reached a terminal status
    pub fn active_assignment(&self, request_id: &str) -> Option<&Assignment> {
        self.assignments
            .get(request_id)
            .and_then(|list| list.last())
            .filter(|a| !a.status.is_terminal())
    }

    // =========================================================================
    // Results and Errors
    // =========================================================================

    pub fn record_result(&mut self, result: RequestResult) -> Result<(), LedgerError> {
        if !self.requests.contains_key(&result.request_id) {
            return Err(LedgerError::NotFound(result.request_id));
        }
        self.persist(COLLECTION_RESULTS, &result.request_id, &result);
        self.results.insert(result.request_id.clone(), result);
        Ok(())
    }

    pub fn result(&self, request_id: &str) -> Option<&RequestResult> {
        self.results.get(request_id)
    }

    pub fn record_error(&mut self, error: RequestError) -> Result<(), LedgerError> {
        if !self.requests.contains_key(&error.request_id) {
            return Err(LedgerError::NotFound(error.request_id));
        }
        self.persist(COLLECTION_ERRORS, &error.error_id, &error);
        self.errors
            .entry(error.request_id.clone())
            .or_default()
            .push(error);
        Ok(())
    }

    pub fn errors(&self, request_id: &str) -> &[RequestError] {
        self.errors
            .get(request_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn detail(&self, request_id: &str) -> Option<RequestDetail> {
        let request = self.requests.get(request_id)?.clone();
        Some(RequestDetail {
            request,
            assignments: self.assignments(request_id).to_vec(),
            result: self.result(request_id).cloned(),
            errors: self.errors(request_id).to_vec(),
            history: self.status_history(request_id).to_vec(),
        })
    }

    pub fn query(&self, query: &RequestQuery) -> QueryPage {
        let matched = self
            .requests
            .values()
            .filter(|r| query.matches(r, self.assignments(&r.id)))
            .cloned()
            .collect();
        query.paginate(matched)
    }

    /// Request count per status (every status present, possibly zero)
    pub fn stats(&self) -> HashMap<RequestStatus, usize> {
        let mut counts: HashMap<RequestStatus, usize> =
            RequestStatus::ALL.iter().map(|s| (*s, 0)).collect();
        for request in self.requests.values() {
            *counts.entry(request.status).or_insert(0) += 1;
        }
        counts
    }

    pub fn store(&self) -> &dyn RecordStore {
        self.store.as_ref()
    }

    fn persist<T: Serialize>(&mut self, collection: &str, key: &str, record: &T) {
        let written = serde_json::to_value(record)
            .map_err(StoreError::from)
            .and_then(|value| self.store.set(collection, key, value));
        if let Err(e) = written {
            tracing::warn!(collection, key, error = %e, "Failed to persist ledger record");
        }
    }
}

impl Default for RequestLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actors::ledger::query::{SortDirection, SortKey};
    use chrono::Duration;
    use serde_json::json;
    use shared_types::ErrorCategory;

    fn request(task_id: &str, priority: i32) -> Request {
        let mut request = Request::new(task_id, json!({}));
        request.priority = priority;
        request
    }

    fn assignment(request_id: &str, bank_id: &str, attempt: u32) -> Assignment {
        Assignment {
            assignment_id: ulid::Ulid::new().to_string(),
            request_id: request_id.to_string(),
            bank_id: bank_id.to_string(),
            worker_id: Some("w1".to_string()),
            attempt,
            status: AssignmentStatus::Queued,
            queued_at: Utc::now(),
            assigned_at: None,
            started_at: None,
            completed_at: None,
        }
    }

    #[test]
    fn test_request_lifecycle() {
        let mut ledger = RequestLedger::new();
        let req = request("add-numbers", 0);
        let id = req.id.clone();
        ledger.insert_request(req).unwrap();

        ledger.record_assignment(assignment(&id, "bank-a", 1)).unwrap();
        ledger
            .transition(&id, RequestStatus::Assigned, None)
            .unwrap();
        ledger
            .transition(&id, RequestStatus::Processing, None)
            .unwrap();
        assert_eq!(
            ledger.active_assignment(&id).unwrap().status,
            AssignmentStatus::Processing
        );

        ledger
            .record_result(RequestResult {
                request_id: id.clone(),
                assignment_id: None,
                output: json!({"result": 8}),
                processing_time_ms: 12,
                completed_at: Utc::now(),
            })
            .unwrap();
        let done = ledger
            .transition(&id, RequestStatus::Completed, None)
            .unwrap();
        assert_eq!(done.status, RequestStatus::Completed);
        assert_eq!(done.attempts, 1);

        // Completed assignment is no longer active
        assert!(ledger.active_assignment(&id).is_none());
        assert_eq!(
            ledger.assignments(&id)[0].status,
            AssignmentStatus::Completed
        );

        let statuses: Vec<RequestStatus> =
            ledger.status_history(&id).iter().map(|c| c.status).collect();
        assert_eq!(
            statuses,
            vec![
                RequestStatus::Pending,
                RequestStatus::Assigned,
                RequestStatus::Processing,
                RequestStatus::Completed
            ]
        );
    }

    #[test]
    fn test_duplicate_request_rejected() {
        let mut ledger = RequestLedger::new();
        let req = request("t", 0);
        ledger.insert_request(req.clone()).unwrap();
        assert_eq!(
            ledger.insert_request(req.clone()),
            Err(LedgerError::Duplicate(req.id))
        );
    }

    #[test]
    fn test_terminal_requests_reject_transitions() {
        let mut ledger = RequestLedger::new();
        let req = request("t", 0);
        let id = req.id.clone();
        ledger.insert_request(req).unwrap();
        ledger
            .transition(&id, RequestStatus::Cancelled, Some("caller".to_string()))
            .unwrap();

        let err = ledger
            .transition(&id, RequestStatus::Completed, None)
            .unwrap_err();
        assert_eq!(
            err,
            LedgerError::InvalidTransition {
                request_id: id.clone(),
                from: RequestStatus::Cancelled,
                to: RequestStatus::Completed,
            }
        );
        assert_eq!(
            ledger.get_request(&id).unwrap().status,
            RequestStatus::Cancelled
        );
    }

    #[test]
    fn test_retry_fails_active_assignment_and_returns_to_pending() {
        let mut ledger = RequestLedger::new();
        let req = request("t", 0);
        let id = req.id.clone();
        ledger.insert_request(req).unwrap();

        ledger.record_assignment(assignment(&id, "bank-a", 1)).unwrap();
        ledger.transition(&id, RequestStatus::Assigned, None).unwrap();
        ledger
            .record_error(RequestError {
                error_id: "e1".to_string(),
                request_id: id.clone(),
                assignment_id: Some(ledger.assignments(&id)[0].assignment_id.clone()),
                category: ErrorCategory::Network,
                code: "SEND_FAILED".to_string(),
                message: "connection reset".to_string(),
                retryable: true,
                attempt: 1,
                occurred_at: Utc::now(),
            })
            .unwrap();
        ledger
            .transition(&id, RequestStatus::Pending, Some("retry".to_string()))
            .unwrap();

        assert!(ledger.active_assignment(&id).is_none());
        assert_eq!(ledger.assignments(&id)[0].status, AssignmentStatus::Failed);

        ledger.record_assignment(assignment(&id, "bank-b", 2)).unwrap();
        assert_eq!(ledger.active_assignment(&id).unwrap().bank_id, "bank-b");
        assert_eq!(ledger.get_request(&id).unwrap().attempts, 2);
        assert_eq!(ledger.errors(&id).len(), 1);
    }

    #[test]
    fn test_archive_requires_terminal_status() {
        let mut ledger = RequestLedger::new();
        let req = request("t", 0);
        let id = req.id.clone();
        ledger.insert_request(req).unwrap();

        assert_eq!(ledger.archive(&id), Err(LedgerError::NotTerminal(id.clone())));
        ledger.transition(&id, RequestStatus::Timeout, None).unwrap();
        ledger.archive(&id).unwrap();
        assert!(ledger.get_request(&id).unwrap().archived);
    }

    #[test]
    fn test_archive_limit_evicts_oldest_archived() {
        let mut ledger = RequestLedger::new().with_archive_limit(2);
        let mut ids = Vec::new();
        for _ in 0..3 {
            let req = request("t", 0);
            let id = req.id.clone();
            ledger.insert_request(req).unwrap();
            ledger.record_assignment(assignment(&id, "bank-a", 1)).unwrap();
            ledger.transition(&id, RequestStatus::Failed, None).unwrap();
            ids.push(id);
        }
        let live = request("t", 0);
        let live_id = live.id.clone();
        ledger.insert_request(live).unwrap();

        let first_assignment = ledger.assignments(&ids[0])[0].assignment_id.clone();
        for id in &ids {
            ledger.archive(id).unwrap();
        }
        // Archiving twice does not count twice.
        ledger.archive(&ids[2]).unwrap();

        assert!(ledger.detail(&ids[0]).is_none());
        assert!(ledger.status_history(&ids[0]).is_empty());
        assert!(matches!(
            ledger.update_assignment(&first_assignment, AssignmentStatus::Failed),
            Err(LedgerError::AssignmentNotFound(_))
        ));
        assert!(ledger.detail(&ids[1]).is_some());
        assert!(ledger.detail(&ids[2]).is_some());
        assert!(ledger.detail(&live_id).is_some());
        assert_eq!(ledger.stats()[&RequestStatus::Failed], 2);

        // Evicted from memory, still in the store.
        assert!(ledger
            .store()
            .get(COLLECTION_REQUESTS, &ids[0])
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_query_filters() {
        let mut ledger = RequestLedger::new();

        let mut a = request("add-numbers", 1);
        a.client_id = Some("client-1".to_string());
        let b = request("add-numbers", 5);
        let mut c = request("resize-image", 9);
        c.created_at = Utc::now() - Duration::hours(2);
        let (a_id, b_id, c_id) = (a.id.clone(), b.id.clone(), c.id.clone());

        ledger.insert_request(a).unwrap();
        ledger.insert_request(b).unwrap();
        ledger.insert_request(c).unwrap();
        ledger.record_assignment(assignment(&b_id, "bank-z", 1)).unwrap();
        ledger.transition(&c_id, RequestStatus::Failed, None).unwrap();

        let by_task = ledger.query(&RequestQuery::default().with_task("add-numbers"));
        assert_eq!(by_task.total, 2);

        let by_status = ledger.query(&RequestQuery::default().with_status(RequestStatus::Failed));
        assert_eq!(by_status.items[0].id, c_id);

        let by_client = ledger.query(&RequestQuery {
            client_id: Some("client-1".to_string()),
            ..Default::default()
        });
        assert_eq!(by_client.items.len(), 1);
        assert_eq!(by_client.items[0].id, a_id);

        let by_bank = ledger.query(&RequestQuery {
            bank_id: Some("bank-z".to_string()),
            ..Default::default()
        });
        assert_eq!(by_bank.items[0].id, b_id);

        let by_priority = ledger.query(&RequestQuery {
            min_priority: Some(2),
            max_priority: Some(8),
            ..Default::default()
        });
        assert_eq!(by_priority.total, 1);
        assert_eq!(by_priority.items[0].id, b_id);

        let recent = ledger.query(&RequestQuery {
            created_after: Some(Utc::now() - Duration::hours(1)),
            ..Default::default()
        });
        assert_eq!(recent.total, 2);
    }

    #[test]
    fn test_query_sorts_and_paginates() {
        let mut ledger = RequestLedger::new();
        for priority in [3, 1, 4, 1, 5] {
            ledger.insert_request(request("t", priority)).unwrap();
        }

        let page = ledger.query(
            &RequestQuery::default()
                .sorted_by(SortKey::Priority, SortDirection::Desc)
                .page(1, 2),
        );
        assert_eq!(page.total, 5);
        let priorities: Vec<i32> = page.items.iter().map(|r| r.priority).collect();
        assert_eq!(priorities, vec![4, 3]);
    }

    #[test]
    fn test_stats_counts_every_status() {
        let mut ledger = RequestLedger::new();
        let req = request("t", 0);
        let id = req.id.clone();
        ledger.insert_request(req).unwrap();
        ledger.insert_request(request("t", 0)).unwrap();
        ledger.transition(&id, RequestStatus::Completed, None).unwrap();

        let stats = ledger.stats();
        assert_eq!(stats[&RequestStatus::Pending], 1);
        assert_eq!(stats[&RequestStatus::Completed], 1);
        assert_eq!(stats[&RequestStatus::Timeout], 0);
    }

    #[test]
    fn test_mutations_write_through_to_store() {
        let mut ledger = RequestLedger::new();
        let req = request("t", 0);
        let id = req.id.clone();
        ledger.insert_request(req).unwrap();
        ledger.transition(&id, RequestStatus::Failed, None).unwrap();

        let stored = ledger
            .store()
            .get(COLLECTION_REQUESTS, &id)
            .unwrap()
            .expect("request persisted");
        assert_eq!(stored["status"], "failed");
    }
}
