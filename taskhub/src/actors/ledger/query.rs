//! Request query model: filters, pagination and ordering.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared_types::{Assignment, Request, RequestStatus};
use std::cmp::Ordering;

pub const DEFAULT_QUERY_LIMIT: usize = 100;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    #[default]
    CreatedAt,
    UpdatedAt,
    Priority,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

/// Filter over ledger requests. Every set field must match.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RequestQuery {
    pub status: Option<RequestStatus>,
    pub task_id: Option<String>,
    /// Matches requests with any assignment to this bank
    pub bank_id: Option<String>,
    pub client_id: Option<String>,
    pub min_priority: Option<i32>,
    pub max_priority: Option<i32>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub offset: Option<usize>,
    pub limit: Option<usize>,
    pub sort: Option<SortKey>,
    pub direction: Option<SortDirection>,
}

/// One page of query results
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryPage {
    pub items: Vec<Request>,
    /// Matches before pagination
    pub total: usize,
}

impl RequestQuery {
    pub fn with_status(mut self, status: RequestStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn page(mut self, offset: usize, limit: usize) -> Self {
        self.offset = Some(offset);
        self.limit = Some(limit);
        self
    }

    pub fn sorted_by(mut self, key: SortKey, direction: SortDirection) -> Self {
        self.sort = Some(key);
        self.direction = Some(direction);
        self
    }

    pub fn matches(&self, request: &Request, assignments: &[Assignment]) -> bool {
        if self.status.is_some_and(|s| s != request.status) {
            return false;
        }
        if self.task_id.as_ref().is_some_and(|t| *t != request.task_id) {
            return false;
        }
        if let Some(client_id) = &self.client_id {
            if request.client_id.as_deref() != Some(client_id.as_str()) {
                return false;
            }
        }
        if let Some(bank_id) = &self.bank_id {
            if !assignments.iter().any(|a| a.bank_id == *bank_id) {
                return false;
            }
        }
        if self.min_priority.is_some_and(|p| request.priority < p) {
            return false;
        }
        if self.max_priority.is_some_and(|p| request.priority > p) {
            return false;
        }
        if self.created_after.is_some_and(|t| request.created_at < t) {
            return false;
        }
        if self.created_before.is_some_and(|t| request.created_at > t) {
            return false;
        }
        true
    }

    /// Sort, then cut the page out of `matched`.
    pub fn paginate(&self, mut matched: Vec<Request>) -> QueryPage {
        let key = self.sort.unwrap_or_default();
        let direction = self.direction.unwrap_or_default();

        matched.sort_by(|a, b| {
            let ordering = compare(a, b, key).then_with(|| a.id.cmp(&b.id));
            match direction {
                SortDirection::Asc => ordering,
                SortDirection::Desc => ordering.reverse(),
            }
        });

        let total = matched.len();
        let items = matched
            .into_iter()
            .skip(self.offset.unwrap_or(0))
            .take(self.limit.unwrap_or(DEFAULT_QUERY_LIMIT))
            .collect();

        QueryPage { items, total }
    }
}

fn compare(a: &Request, b: &Request, key: SortKey) -> Ordering {
    match key {
        SortKey::CreatedAt => a.created_at.cmp(&b.created_at),
        SortKey::UpdatedAt => a.updated_at.cmp(&b.updated_at),
        SortKey::Priority => a.priority.cmp(&b.priority),
    }
}
