use ractor::{Actor, ActorRef};
use shared_types::Event;
use std::time::Duration;

use crate::actors::broker::{BrokerArguments, BrokerHandle, ClaimBrokerActor};
use crate::actors::event_bus::{recent_events, EventBusActor, EventBusArguments, EventBusMsg};
use crate::actors::ledger::{LedgerActor, LedgerArguments, LedgerMsg};
use crate::config::BrokerConfig;

pub(crate) struct TestBroker {
    pub broker: BrokerHandle,
    pub event_bus: ActorRef<EventBusMsg>,
    pub ledger: ActorRef<LedgerMsg>,
}

impl TestBroker {
    pub(crate) fn stop(&self) {
        self.broker.actor().stop(None);
        self.ledger.stop(None);
        self.event_bus.stop(None);
    }

    /// Events for `request_id` on `topic`, in publish order
    pub(crate) async fn events(&self, topic: &str, request_id: &str) -> Vec<Event> {
        recent_events(&self.event_bus, topic, 0, usize::MAX)
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.request_id() == request_id)
            .collect()
    }

    /// Poll until at least one `topic` event for `request_id` is retained
    pub(crate) async fn wait_for(&self, topic: &str, request_id: &str) -> Event {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Some(event) = self.events(topic, request_id).await.into_iter().next() {
                    return event;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("no {topic} event for {request_id}"))
    }
}

pub(crate) async fn setup_test_broker(config: BrokerConfig) -> TestBroker {
    let (event_bus, _bus_handle) =
        Actor::spawn(None, EventBusActor, EventBusArguments::default())
            .await
            .unwrap();
    let (ledger, _ledger_handle) = Actor::spawn(None, LedgerActor, LedgerArguments::default())
        .await
        .unwrap();

    let args = BrokerArguments {
        event_bus: event_bus.clone(),
        ledger: ledger.clone(),
        config,
    };
    let (broker_ref, _broker_handle) = Actor::spawn(None, ClaimBrokerActor, args).await.unwrap();

    TestBroker {
        broker: BrokerHandle::new(broker_ref),
        event_bus,
        ledger,
    }
}
