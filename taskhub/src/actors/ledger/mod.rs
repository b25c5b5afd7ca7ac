//! RequestLedger - the record of every request, assignment, result and error
//!
//! The ledger is the only place a request's status changes. Strategy actors
//! (broker, dispatcher) drive transitions by casting [`LedgerMsg`]s; readers
//! use the RPC helpers.
//!
//! ## Request lifecycle
//!
//! ```text
//! pending → assigned → processing → completed
//!    ↑         |            |      → failed
//!    └─────────┴────────────┘      → cancelled
//!          (retry)                 → timeout
//! ```
//!
//! Terminal states accept no further transitions.

pub mod actor;
pub mod protocol;
pub mod query;
pub mod state;
pub mod store;

pub use actor::{get_request, ledger_stats, query_requests, LedgerActor, LedgerArguments};
pub use protocol::{LedgerError, LedgerMsg};
pub use query::{QueryPage, RequestQuery, SortDirection, SortKey, DEFAULT_QUERY_LIMIT};
pub use state::RequestLedger;
pub use store::{MemoryRecordStore, RecordStore, StoreError};
