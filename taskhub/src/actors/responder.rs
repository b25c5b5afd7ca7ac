//! Responder - a passive participant in the claim race
//!
//! A responder listens to `request.*` on the engine's bus. For every
//! submitted (or ready) request whose task it has a handler for, it claims
//! once. When the broker confirms a claim, only the named winner executes;
//! everyone else drops its local record. Handler bodies run on spawned tokio
//! tasks and re-enter the broker through `complete_request` / `fail_request`.

use async_trait::async_trait;
use ractor::{Actor, ActorProcessingErr, ActorRef};
use serde_json::Value;
use shared_types::{Event, EventKind};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::actors::broker::BrokerHandle;
use crate::actors::event_bus::{self, EventBusMsg};
use crate::handler::TaskHandler;

const RESPONDER_TOPIC: &str = "request.*";

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ResponderError {
    #[error("failed to spawn responder {0}: {1}")]
    Spawn(String, String),
    #[error("failed to subscribe responder {0}: {1}")]
    Subscribe(String, String),
}

/// Builder for a responder's handler table
pub struct Responder {
    id: String,
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl Responder {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            handlers: HashMap::new(),
        }
    }

    /// Declare support for `task_id`
    pub fn handle(mut self, task_id: impl Into<String>, handler: Arc<dyn TaskHandler>) -> Self {
        self.handlers.insert(task_id.into(), handler);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn supports(&self, task_id: &str) -> bool {
        self.handlers.contains_key(task_id)
    }

    /// Spawn the responder actor and subscribe it to the bus.
    ///
    /// Returns once the subscription is live, so requests submitted after
    /// this call are guaranteed to be seen.
    pub async fn attach(
        self,
        event_bus: &ActorRef<EventBusMsg>,
        broker: BrokerHandle,
    ) -> Result<AttachedResponder, ResponderError> {
        let id = self.id.clone();
        let args = ResponderArguments {
            id: self.id,
            handlers: self.handlers,
            broker,
        };
        let (actor, _handle) = Actor::spawn(None, ResponderActor, args)
            .await
            .map_err(|e| ResponderError::Spawn(id.clone(), e.to_string()))?;

        event_bus::subscribe(event_bus, RESPONDER_TOPIC, actor.clone())
            .await
            .map_err(|e| ResponderError::Subscribe(id.clone(), e.to_string()))?;
        event_bus::subscribers(event_bus, RESPONDER_TOPIC)
            .await
            .map_err(|e| ResponderError::Subscribe(id.clone(), e.to_string()))?;

        tracing::info!(responder_id = %id, "Responder attached");
        Ok(AttachedResponder {
            id,
            actor,
            event_bus: event_bus.clone(),
        })
    }
}

/// A running responder
pub struct AttachedResponder {
    id: String,
    actor: ActorRef<Event>,
    event_bus: ActorRef<EventBusMsg>,
}

impl AttachedResponder {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Stop listening; claims already confirmed keep running to completion.
    pub async fn detach(self) {
        if let Err(e) =
            event_bus::unsubscribe(&self.event_bus, RESPONDER_TOPIC, self.actor.clone()).await
        {
            tracing::warn!(responder_id = %self.id, error = %e, "Failed to unsubscribe responder");
        }
        self.actor.stop(None);
    }
}

// ============================================================================
// ResponderActor
// ============================================================================

#[derive(Debug, Default)]
pub struct ResponderActor;

pub struct ResponderArguments {
    pub id: String,
    pub handlers: HashMap<String, Arc<dyn TaskHandler>>,
    pub broker: BrokerHandle,
}

/// A claim waiting for the broker's verdict
struct PendingClaim {
    task_id: String,
    parameters: Value,
}

pub struct ResponderState {
    id: String,
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
    broker: BrokerHandle,
    pending: HashMap<String, PendingClaim>,
    /// Requests already claimed (or lost); `request-ready` must not re-claim them
    seen: HashSet<String>,
}

#[async_trait]
impl Actor for ResponderActor {
    type Msg = Event;
    type State = ResponderState;
    type Arguments = ResponderArguments;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!(
            actor_id = %myself.get_id(),
            responder_id = %args.id,
            tasks = args.handlers.len(),
            "ResponderActor starting"
        );
        Ok(ResponderState {
            id: args.id,
            handlers: args.handlers,
            broker: args.broker,
            pending: HashMap::new(),
            seen: HashSet::new(),
        })
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message.kind {
            EventKind::RequestSubmitted {
                request_id,
                task_id,
                parameters,
                ..
            }
            | EventKind::RequestReady {
                request_id,
                task_id,
                parameters,
            } => self.consider(state, request_id, task_id, parameters),
            EventKind::RequestClaimConfirmed {
                request_id,
                responder_id,
            } => self.handle_confirmation(state, request_id, responder_id),
            EventKind::RequestCompleted { request_id, .. }
            | EventKind::RequestFailed { request_id, .. }
            | EventKind::RequestTimeout { request_id }
            | EventKind::RequestCancelled { request_id } => {
                state.pending.remove(&request_id);
                state.seen.remove(&request_id);
            }
            _ => {}
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        tracing::info!(
            actor_id = %myself.get_id(),
            responder_id = %state.id,
            "ResponderActor stopped"
        );
        Ok(())
    }
}

impl ResponderActor {
    fn consider(
        &self,
        state: &mut ResponderState,
        request_id: String,
        task_id: String,
        parameters: Value,
    ) {
        if !state.handlers.contains_key(&task_id) || state.seen.contains(&request_id) {
            return;
        }

        tracing::debug!(
            responder_id = %state.id,
            request_id = %request_id,
            task_id = %task_id,
            "Claiming request"
        );
        if let Err(e) = state.broker.claim(&request_id, &state.id) {
            tracing::warn!(responder_id = %state.id, request_id = %request_id, error = %e, "Claim not delivered");
            return;
        }
        state.seen.insert(request_id.clone());
        state.pending.insert(
            request_id,
            PendingClaim {
                task_id,
                parameters,
            },
        );
    }

    fn handle_confirmation(
        &self,
        state: &mut ResponderState,
        request_id: String,
        winner: String,
    ) {
        // Confirmations for requests we never claimed are not ours to act on.
        let Some(claim) = state.pending.remove(&request_id) else {
            if winner == state.id {
                tracing::warn!(
                    responder_id = %state.id,
                    request_id = %request_id,
                    "Ignoring confirmation for a request this responder never claimed"
                );
            }
            return;
        };
        if winner != state.id {
            tracing::debug!(
                responder_id = %state.id,
                request_id = %request_id,
                winner = %winner,
                "Lost claim race"
            );
            return;
        }

        let Some(handler) = state.handlers.get(&claim.task_id).cloned() else {
            return;
        };
        let broker = state.broker.clone();
        let responder_id = state.id.clone();

        tracing::info!(
            responder_id = %responder_id,
            request_id = %request_id,
            task_id = %claim.task_id,
            "Executing confirmed claim"
        );
        tokio::spawn(async move {
            let delivered = match handler.perform(&claim.task_id, claim.parameters).await {
                Ok(output) => broker.complete_request(&request_id, output),
                Err(error) => {
                    tracing::warn!(
                        responder_id = %responder_id,
                        request_id = %request_id,
                        error = %error,
                        "Handler failed"
                    );
                    broker.fail_request_with(&request_id, &error)
                }
            };
            if let Err(e) = delivered {
                tracing::warn!(
                    responder_id = %responder_id,
                    request_id = %request_id,
                    error = %e,
                    "Failed to report outcome to broker"
                );
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;
    use serde_json::json;

    #[test]
    fn test_builder_declares_tasks() {
        let responder = Responder::new("r1")
            .handle("add-numbers", handler_fn(|_, _| Ok(json!(null))))
            .handle("echo", handler_fn(|_, payload| Ok(payload)));

        assert_eq!(responder.id(), "r1");
        assert!(responder.supports("add-numbers"));
        assert!(responder.supports("echo"));
        assert!(!responder.supports("resize-image"));
    }
}
