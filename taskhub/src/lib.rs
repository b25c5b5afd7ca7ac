//! TaskHub - task distribution and assignment engine
//!
//! Two assignment strategies share one request lifecycle and one event
//! taxonomy: the [`ClaimBroker`](actors::broker) runs a first-claim-wins race
//! between autonomous responders, and the
//! [`BankDispatcher`](actors::dispatcher) scores worker banks and retries
//! failed work with backoff. Every stateful component is a ractor actor.

pub mod actors;
pub mod api;
pub mod builtin;
pub mod channel;
pub mod config;
pub mod engine;
pub mod handler;
pub mod manifest;

pub use engine::{Engine, EngineError};
