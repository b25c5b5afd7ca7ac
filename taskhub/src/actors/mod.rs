//! Actors that make up one engine instance

pub mod broker;
pub mod dispatcher;
pub mod event_bus;
pub mod ledger;
pub mod outcome;
pub mod responder;

pub use broker::{BrokerHandle, ClaimBrokerActor};
pub use dispatcher::{BankDispatcherActor, DispatcherHandle};
pub use event_bus::EventBusActor;
pub use ledger::LedgerActor;
pub use outcome::{PendingOutcome, RequestFailure, RequestOutcome};
pub use responder::{AttachedResponder, Responder};
