//! EventBusActor - the ordered lifecycle event stream of one engine
//!
//! One bus per engine instance. All lifecycle events of the broker and the
//! dispatcher flow through it, so every observer sees one ordered stream.
//!
//! # Architecture
//!
//! - Uses scoped `ractor::pg` groups for topic-based pub/sub; the scope is
//!   unique per bus, so two engines in one process never see each other's
//!   events
//! - Stamps a strictly increasing `seq` on every published event
//! - Supports wildcard topic patterns (e.g., "request.*", "*")
//! - Keeps a bounded in-memory history for `QueryEvents`
//!
//! # Example
//!
//! ```rust,ignore
//! subscribe(&bus, "request.*", my_actor_ref.clone()).await?;
//!
//! let event = Event::new(EventKind::RequestTimeout { request_id }, "host");
//! publish_event(&bus, event).await?;
//! ```

use async_trait::async_trait;
use ractor::{cast, Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use shared_types::{Event, EventKind};
use std::collections::{HashMap, VecDeque};

// ============================================================================
// EventBusActor
// ============================================================================

/// Bus commands. Publish and (un)subscribe are casts, queries are calls.
#[derive(Debug)]
pub enum EventBusMsg {
    /// Publish an event to its topic
    Publish { event: Event },

    /// Subscribe an actor to a topic or wildcard pattern
    Subscribe {
        topic: String,
        subscriber: ActorRef<Event>,
    },

    /// Leave a topic group
    Unsubscribe {
        topic: String,
        subscriber: ActorRef<Event>,
    },

    /// Members of one topic group
    GetSubscribers {
        topic: String,
        reply: RpcReplyPort<Vec<ractor::ActorId>>,
    },

    /// Query retained events matching a topic pattern
    QueryEvents {
        topic: String,
        since_seq: u64,
        limit: usize,
        reply: RpcReplyPort<Vec<Event>>,
    },
}

#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// Maximum number of events retained for queries
    pub history_limit: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            history_limit: 10_000,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EventBusArguments {
    /// Process-group scope; generated when absent
    pub scope: Option<String>,

    pub config: EventBusConfig,
}

pub struct EventBusState {
    scope: String,

    next_seq: u64,

    history: VecDeque<Event>,

    /// Live subscriptions per topic pattern
    subscriptions: HashMap<String, usize>,

    config: EventBusConfig,
}

#[derive(Debug, Default)]
pub struct EventBusActor;

#[async_trait]
impl Actor for EventBusActor {
    type Msg = EventBusMsg;
    type State = EventBusState;
    type Arguments = EventBusArguments;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let scope = args
            .scope
            .unwrap_or_else(|| format!("event-bus:{}", ulid::Ulid::new()));

        tracing::info!(
            actor_id = %myself.get_id(),
            scope = %scope,
            "EventBusActor starting"
        );

        Ok(EventBusState {
            scope,
            next_seq: 1,
            history: VecDeque::new(),
            subscriptions: HashMap::new(),
            config: args.config,
        })
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            EventBusMsg::Publish { event } => self.handle_publish(event, state),
            EventBusMsg::Subscribe { topic, subscriber } => {
                self.handle_subscribe(topic, subscriber, state)
            }
            EventBusMsg::Unsubscribe { topic, subscriber } => {
                self.handle_unsubscribe(topic, subscriber, state)
            }
            EventBusMsg::GetSubscribers { topic, reply } => {
                let ids = ractor::pg::get_scoped_members(&state.scope, &topic)
                    .iter()
                    .map(|cell| cell.get_id())
                    .collect();
                let _ = reply.send(ids);
            }
            EventBusMsg::QueryEvents {
                topic,
                since_seq,
                limit,
                reply,
            } => {
                let matching = state
                    .history
                    .iter()
                    .filter(|e| e.seq > since_seq && e.matches_topic(&topic))
                    .take(limit)
                    .cloned()
                    .collect();
                let _ = reply.send(matching);
            }
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
            published = state.next_seq - 1,
            subscribed_topics = state.subscriptions.len(),
            "EventBusActor stopped"
        );
        Ok(())
    }
}

impl EventBusActor {
    fn handle_publish(&self, mut event: Event, state: &mut EventBusState) {
        event.seq = state.next_seq;
        state.next_seq += 1;

        tracing::debug!(
            seq = event.seq,
            topic = %event.topic,
            request_id = %event.request_id(),
            source = %event.source,
            "Publishing event"
        );

        state.history.push_back(event.clone());
        while state.history.len() > state.config.history_limit {
            state.history.pop_front();
        }

        broadcast_to_topic(&state.scope, &event.topic, &event);

        // "request.*" style prefixes, then the catch-all
        let segments: Vec<&str> = event.topic.split('.').collect();
        for depth in 1..segments.len() {
            let pattern = format!("{}.*", segments[..depth].join("."));
            broadcast_to_topic(&state.scope, &pattern, &event);
        }
        broadcast_to_topic(&state.scope, "*", &event);
    }

    fn handle_subscribe(
        &self,
        topic: String,
        subscriber: ActorRef<Event>,
        state: &mut EventBusState,
    ) {
        ractor::pg::join_scoped(
            state.scope.clone(),
            topic.clone(),
            vec![subscriber.get_cell()],
        );

        *state.subscriptions.entry(topic.clone()).or_default() += 1;

        tracing::info!(
            topic = %topic,
            subscriber = %subscriber.get_id(),
            "Subscriber joined"
        );
    }

    fn handle_unsubscribe(
        &self,
        topic: String,
        subscriber: ActorRef<Event>,
        state: &mut EventBusState,
    ) {
        ractor::pg::leave_scoped(
            state.scope.clone(),
            topic.clone(),
            vec![subscriber.get_cell()],
        );

        if let Some(remaining) = state.subscriptions.get_mut(&topic) {
            *remaining = remaining.saturating_sub(1);
            if *remaining == 0 {
                state.subscriptions.remove(&topic);
            }
        }

        tracing::info!(
            topic = %topic,
            subscriber = %subscriber.get_id(),
            "Subscriber left"
        );
    }
}

fn broadcast_to_topic(scope: &str, topic: &str, event: &Event) {
    let members = ractor::pg::get_scoped_members(&scope.to_string(), &topic.to_string());

    for cell in members {
        let subscriber_id = cell.get_id();
        let subscriber: ActorRef<Event> = cell.into();
        if let Err(e) = subscriber.cast(event.clone()) {
            tracing::warn!(
                topic = %topic,
                subscriber = %subscriber_id,
                error = %e,
                "Event delivery failed"
            );
        }
    }
}

// ============================================================================
// Bus API
// ============================================================================

/// Publish a pre-built event; its `seq` is overwritten by the bus
pub async fn publish_event(
    event_bus: &ActorRef<EventBusMsg>,
    event: Event,
) -> Result<(), ractor::RactorErr<EventBusMsg>> {
    cast!(event_bus, EventBusMsg::Publish { event })
}

/// Build and publish an event, logging instead of failing when the bus is gone.
///
/// Lifecycle code must not abort a state transition because an observer
/// channel went away.
pub fn emit(event_bus: &ActorRef<EventBusMsg>, kind: EventKind, source: &str) {
    let event = Event::new(kind, source);
    let name = event.kind.name();
    if let Err(e) = event_bus.cast(EventBusMsg::Publish { event }) {
        tracing::warn!(event = name, source, error = %e, "Failed to publish event");
    }
}

pub async fn subscribe(
    event_bus: &ActorRef<EventBusMsg>,
    topic: impl Into<String>,
    subscriber: ActorRef<Event>,
) -> Result<(), ractor::RactorErr<EventBusMsg>> {
    cast!(
        event_bus,
        EventBusMsg::Subscribe {
            topic: topic.into(),
            subscriber,
        }
    )
}

pub async fn unsubscribe(
    event_bus: &ActorRef<EventBusMsg>,
    topic: impl Into<String>,
    subscriber: ActorRef<Event>,
) -> Result<(), ractor::RactorErr<EventBusMsg>> {
    cast!(
        event_bus,
        EventBusMsg::Unsubscribe {
            topic: topic.into(),
            subscriber,
        }
    )
}

/// Current members of a topic group.
///
/// Processed after every earlier cast from the same caller, so it also
/// serves as a barrier after `subscribe`.
pub async fn subscribers(
    event_bus: &ActorRef<EventBusMsg>,
    topic: impl Into<String>,
) -> Result<Vec<ractor::ActorId>, ractor::RactorErr<EventBusMsg>> {
    let topic = topic.into();
    ractor::call!(event_bus, |reply| EventBusMsg::GetSubscribers { topic, reply })
}

/// Fetch retained events matching `topic` with `seq > since_seq`
pub async fn recent_events(
    event_bus: &ActorRef<EventBusMsg>,
    topic: impl Into<String>,
    since_seq: u64,
    limit: usize,
) -> Result<Vec<Event>, ractor::RactorErr<EventBusMsg>> {
    let topic = topic.into();
    ractor::call!(event_bus, |reply| EventBusMsg::QueryEvents {
        topic,
        since_seq,
        limit,
        reply,
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::Mutex;
    use tokio::time::{sleep, Duration};

    /// Collects whatever the bus delivers
    struct Collector {
        sink: Arc<Mutex<Vec<Event>>>,
    }

    #[async_trait]
    impl Actor for Collector {
        type Msg = Event;
        type State = Arc<Mutex<Vec<Event>>>;
        type Arguments = ();

        async fn pre_start(
            &self,
            _myself: ActorRef<Self::Msg>,
            _args: (),
        ) -> Result<Self::State, ActorProcessingErr> {
            Ok(self.sink.clone())
        }

        async fn handle(
            &self,
            _myself: ActorRef<Self::Msg>,
            message: Self::Msg,
            state: &mut Self::State,
        ) -> Result<(), ActorProcessingErr> {
            state.lock().await.push(message);
            Ok(())
        }
    }

    fn timeout_event(request_id: &str) -> Event {
        Event::new(
            EventKind::RequestTimeout {
                request_id: request_id.to_string(),
            },
            "test",
        )
    }

    async fn spawn_subscriber() -> (ActorRef<Event>, Arc<Mutex<Vec<Event>>>) {
        let received = Arc::new(Mutex::new(Vec::new()));
        let (subscriber, _handle) = Actor::spawn(
            None,
            Collector {
                sink: received.clone(),
            },
            (),
        )
        .await
        .expect("spawn subscriber");
        (subscriber, received)
    }

    #[tokio::test]
    async fn test_publish_assigns_increasing_seq() {
        let (bus, _handle) = Actor::spawn(None, EventBusActor, EventBusArguments::default())
            .await
            .unwrap();

        for id in ["r1", "r2", "r3"] {
            publish_event(&bus, timeout_event(id)).await.unwrap();
        }

        let events = recent_events(&bus, "*", 0, 10).await.unwrap();
        let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);

        let tail = recent_events(&bus, "*", 2, 10).await.unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].request_id(), "r3");

        bus.stop(None);
    }

    #[tokio::test]
    async fn test_wildcard_subscriber_receives_events() {
        let (bus, _handle) = Actor::spawn(None, EventBusActor, EventBusArguments::default())
            .await
            .unwrap();
        let (subscriber, received) = spawn_subscriber().await;

        subscribe(&bus, "request.*", subscriber.clone()).await.unwrap();
        let members = subscribers(&bus, "request.*").await.unwrap();
        assert_eq!(members, vec![subscriber.get_id()]);

        publish_event(&bus, timeout_event("r1")).await.unwrap();
        publish_event(
            &bus,
            Event::new(
                EventKind::TaskRetried {
                    request_id: "r1".to_string(),
                    attempt: 1,
                    delay_ms: 1000,
                },
                "test",
            ),
        )
        .await
        .unwrap();

        sleep(Duration::from_millis(100)).await;

        let events = received.lock().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].topic, shared_types::EVENT_TOPIC_REQUEST_TIMEOUT);

        subscriber.stop(None);
        bus.stop(None);
    }

    #[tokio::test]
    async fn test_buses_do_not_share_subscribers() {
        let (bus_a, _ha) = Actor::spawn(None, EventBusActor, EventBusArguments::default())
            .await
            .unwrap();
        let (bus_b, _hb) = Actor::spawn(None, EventBusActor, EventBusArguments::default())
            .await
            .unwrap();
        let (subscriber, received) = spawn_subscriber().await;

        subscribe(&bus_a, "*", subscriber.clone()).await.unwrap();
        publish_event(&bus_b, timeout_event("other")).await.unwrap();
        publish_event(&bus_a, timeout_event("mine")).await.unwrap();

        sleep(Duration::from_millis(100)).await;

        let events = received.lock().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].request_id(), "mine");

        subscriber.stop(None);
        bus_a.stop(None);
        bus_b.stop(None);
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let args = EventBusArguments {
            scope: None,
            config: EventBusConfig { history_limit: 2 },
        };
        let (bus, _handle) = Actor::spawn(None, EventBusActor, args).await.unwrap();

        for id in ["r1", "r2", "r3"] {
            publish_event(&bus, timeout_event(id)).await.unwrap();
        }

        let events = recent_events(&bus, "*", 0, 10).await.unwrap();
        let ids: Vec<&str> = events.iter().map(|e| e.request_id()).collect();
        assert_eq!(ids, vec!["r2", "r3"]);

        bus.stop(None);
    }
}
