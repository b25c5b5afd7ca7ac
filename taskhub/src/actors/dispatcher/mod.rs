//! BankDispatcher - centralized assignment to scored worker banks
//!
//! ## Per-request flow
//!
//! ```text
//! submit ─validate─→ pending ─select bank─→ assigned ─send─→ processing ─→ completed
//!    │                  ↑                                        │
//!    └─ ValidationErrors └──── task-retried (backoff) ←── failed ┴─→ failed (task-failed)
//! ```
//!
//! Bank choice is [`CapabilityRegistry::select_best_bank`]; the worker inside
//! the chosen bank comes from [`ActivityTracer::next_worker`]. Work leaves
//! the process through an [`crate::channel::ExecutionChannel`] and comes back
//! as `DispatcherMsg::ChannelResult`.

pub mod actor;
pub mod handle;
pub mod protocol;
pub mod registry;
pub mod retry;
pub mod tracer;

pub use actor::{BankDispatcherActor, DispatcherArguments, DispatcherState};
pub use handle::DispatcherHandle;
pub use protocol::{DispatchError, DispatchRequest, DispatcherMsg};
pub use registry::{BankScore, CapabilityRegistry, NoCapableBank, RegistryError};
pub use retry::RetryPolicy;
pub use tracer::{ActivityTracer, WorkerSelection};
