//! ClaimBroker - decentralized assignment for autonomous responders
//!
//! ## Per-request state machine
//!
//! ```text
//! submitted → ready → claimed (race) → confirmed → completed
//!                                          |     → failed
//!                                          |     → timeout
//!          (cancel at any point)           └───→ cancelled
//! ```
//!
//! The broker never runs its own clock: hosts decide when a request has
//! waited too long and call `timeout_request`.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let pending = broker.submit("add-numbers", json!({"a": 5, "b": 3}), Default::default()).await?;
//! let output = pending.wait().await?;
//! ```

pub mod actor;
pub mod handle;
pub mod protocol;

#[cfg(test)]
mod tests;

pub use actor::{BrokerArguments, BrokerState, ClaimBrokerActor};
pub use handle::BrokerHandle;
pub use protocol::{BrokerError, BrokerMsg, SubmitOptions};
