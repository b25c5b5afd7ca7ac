//! Engine - one explicitly constructed instance of the whole actor graph
//!
//! Spawns, in order, the event bus, the ledger, the claim broker and the
//! bank dispatcher, all sharing the same bus and ledger. Nothing here is
//! global: two engines in one process do not see each other's events.

use ractor::{Actor, ActorCell, ActorRef};
use std::sync::Arc;
use std::time::Duration;

use crate::actors::broker::{BrokerArguments, BrokerHandle, ClaimBrokerActor};
use crate::actors::dispatcher::{
    BankDispatcherActor, DispatchError, DispatcherArguments, DispatcherHandle,
};
use crate::actors::event_bus::{EventBusActor, EventBusArguments, EventBusMsg};
use crate::actors::ledger::{
    LedgerActor, LedgerArguments, LedgerMsg, MemoryRecordStore, RecordStore,
};
use crate::actors::responder::{AttachedResponder, Responder, ResponderError};
use crate::config::EngineConfig;
use crate::manifest::{self, ManifestError};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("failed to spawn {actor}: {message}")]
    Spawn {
        actor: &'static str,
        message: String,
    },
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: EngineConfig,
    event_bus: ActorRef<EventBusMsg>,
    ledger: ActorRef<LedgerMsg>,
    broker: BrokerHandle,
    dispatcher: DispatcherHandle,
}

impl Engine {
    /// Start with the in-memory record store
    pub async fn start(config: EngineConfig) -> Result<Self, EngineError> {
        Self::start_with_store(config, Box::new(MemoryRecordStore::new())).await
    }

    /// Spawn the actor graph and load `manifests.dir`.
    ///
    /// On failure every actor spawned so far is stopped before the error is
    /// returned.
    pub async fn start_with_store(
        config: EngineConfig,
        store: Box<dyn RecordStore>,
    ) -> Result<Self, EngineError> {
        let mut spawned = Vec::new();
        let engine = match Self::spawn_actors(config, store, &mut spawned).await {
            Ok(engine) => engine,
            Err(e) => {
                stop_all(spawned, "engine start failed").await;
                return Err(e);
            }
        };

        if let Err(e) = engine.load_manifests().await {
            tracing::error!(error = %e, "Failed to load task manifests");
            stop_all(engine.cells(), "engine start failed").await;
            return Err(e);
        }

        tracing::info!("Engine started");
        Ok(engine)
    }

    /// Spawn bus, ledger, broker and dispatcher, recording each in `spawned`
    async fn spawn_actors(
        config: EngineConfig,
        store: Box<dyn RecordStore>,
        spawned: &mut Vec<(&'static str, ActorCell)>,
    ) -> Result<Self, EngineError> {
        let (event_bus, _) = Actor::spawn(None, EventBusActor, EventBusArguments::default())
            .await
            .map_err(|e| spawn_error("event bus", e))?;
        spawned.push(("event bus", event_bus.get_cell()));

        let ledger_args = LedgerArguments {
            store,
            config: config.ledger.clone(),
        };
        let (ledger, _) = Actor::spawn(None, LedgerActor, ledger_args)
            .await
            .map_err(|e| spawn_error("ledger", e))?;
        spawned.push(("ledger", ledger.get_cell()));

        let (broker, _) = Actor::spawn(
            None,
            ClaimBrokerActor,
            BrokerArguments {
                event_bus: event_bus.clone(),
                ledger: ledger.clone(),
                config: config.broker.clone(),
            },
        )
        .await
        .map_err(|e| spawn_error("claim broker", e))?;
        spawned.push(("claim broker", broker.get_cell()));

        let (dispatcher, _) = Actor::spawn(
            None,
            BankDispatcherActor,
            DispatcherArguments {
                event_bus: event_bus.clone(),
                ledger: ledger.clone(),
                retry: config.retry.clone(),
                config: config.dispatcher.clone(),
                tracer: config.tracer.clone(),
            },
        )
        .await
        .map_err(|e| spawn_error("bank dispatcher", e))?;
        spawned.push(("bank dispatcher", dispatcher.get_cell()));

        Ok(Self {
            inner: Arc::new(EngineInner {
                event_bus,
                ledger,
                broker: BrokerHandle::new(broker),
                dispatcher: DispatcherHandle::new(dispatcher),
                config,
            }),
        })
    }

    async fn load_manifests(&self) -> Result<(), EngineError> {
        let Some(dir) = self.inner.config.manifests.dir.as_deref() else {
            return Ok(());
        };
        for loaded in manifest::load_dir(dir)? {
            let task_id = loaded.task_id.clone();
            self.inner.dispatcher.register_task(loaded).await?;
            tracing::info!(task_id = %task_id, dir = %dir.display(), "Loaded task manifest");
        }
        Ok(())
    }

    /// Actor cells in spawn order
    fn cells(&self) -> Vec<(&'static str, ActorCell)> {
        vec![
            ("event bus", self.inner.event_bus.get_cell()),
            ("ledger", self.inner.ledger.get_cell()),
            ("claim broker", self.inner.broker.actor().get_cell()),
            ("bank dispatcher", self.inner.dispatcher.actor().get_cell()),
        ]
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn event_bus(&self) -> ActorRef<EventBusMsg> {
        self.inner.event_bus.clone()
    }

    pub fn ledger(&self) -> ActorRef<LedgerMsg> {
        self.inner.ledger.clone()
    }

    pub fn broker(&self) -> BrokerHandle {
        self.inner.broker.clone()
    }

    pub fn dispatcher(&self) -> DispatcherHandle {
        self.inner.dispatcher.clone()
    }

    /// Attach a responder to this engine's bus and broker
    pub async fn attach_responder(
        &self,
        responder: Responder,
    ) -> Result<AttachedResponder, ResponderError> {
        responder
            .attach(&self.inner.event_bus, self.inner.broker.clone())
            .await
    }

    /// Stop strategies first, then the ledger and bus they write to.
    ///
    /// Unresolved callers observe `RequestFailure::Closed`.
    pub async fn shutdown(&self) {
        stop_all(self.cells(), "engine shutdown").await;
        tracing::info!("Engine stopped");
    }
}

/// Stop `cells` in reverse spawn order, waiting for each
async fn stop_all(cells: Vec<(&'static str, ActorCell)>, reason: &str) {
    for (name, cell) in cells.into_iter().rev() {
        if let Err(e) = cell
            .stop_and_wait(Some(reason.to_string()), Some(SHUTDOWN_TIMEOUT))
            .await
        {
            tracing::warn!(actor = name, error = %e, "Actor did not stop cleanly");
        }
    }
}

fn spawn_error(actor: &'static str, e: ractor::SpawnErr) -> EngineError {
    EngineError::Spawn {
        actor,
        message: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actors::dispatcher::DispatchRequest;
    use crate::builtin::{add_numbers_manifest, ADD_NUMBERS};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicBool, Ordering};

    const RESIZE_MANIFEST: &str = r#"
task_id = "resize-image"

[[actions]]
id = "resize-image"
"#;

    /// Memory store that raises a flag once the ledger drops it
    struct DropFlagStore {
        inner: MemoryRecordStore,
        dropped: Arc<AtomicBool>,
    }

    impl Drop for DropFlagStore {
        fn drop(&mut self) {
            self.dropped.store(true, Ordering::SeqCst);
        }
    }

    impl RecordStore for DropFlagStore {
        fn get(
            &self,
            collection: &str,
            key: &str,
        ) -> Result<Option<Value>, crate::actors::ledger::StoreError> {
            self.inner.get(collection, key)
        }

        fn set(
            &mut self,
            collection: &str,
            key: &str,
            value: Value,
        ) -> Result<(), crate::actors::ledger::StoreError> {
            self.inner.set(collection, key, value)
        }

        fn query(
            &self,
            collection: &str,
            filter: &dyn Fn(&Value) -> bool,
        ) -> Result<Vec<Value>, crate::actors::ledger::StoreError> {
            self.inner.query(collection, filter)
        }
    }

    async fn start_failing(manifests: &[(&str, &str)]) -> (EngineError, Arc<AtomicBool>) {
        let dir = tempfile::tempdir().unwrap();
        for (name, body) in manifests {
            std::fs::write(dir.path().join(name), body).unwrap();
        }
        let mut config = EngineConfig::default();
        config.manifests.dir = Some(dir.path().to_path_buf());

        let dropped = Arc::new(AtomicBool::new(false));
        let store = DropFlagStore {
            inner: MemoryRecordStore::new(),
            dropped: dropped.clone(),
        };
        let err = match Engine::start_with_store(config, Box::new(store)).await {
            Ok(_) => panic!("engine started with bad manifests"),
            Err(e) => e,
        };
        (err, dropped)
    }

    async fn assert_ledger_stopped(dropped: &AtomicBool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !dropped.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("ledger still running after failed start");
    }

    #[tokio::test]
    async fn test_bad_manifest_stops_spawned_actors() {
        let (err, dropped) = start_failing(&[("broken.toml", "task_id = [")]).await;
        assert!(matches!(err, EngineError::Manifest(_)));
        assert_ledger_stopped(&dropped).await;
    }

    #[tokio::test]
    async fn test_duplicate_manifest_stops_spawned_actors() {
        let (err, dropped) = start_failing(&[
            ("a.toml", RESIZE_MANIFEST),
            ("b.toml", RESIZE_MANIFEST),
        ])
        .await;
        assert!(matches!(err, EngineError::Dispatch(DispatchError::Registry(_))));
        assert_ledger_stopped(&dropped).await;
    }

    #[tokio::test]
    async fn test_engine_loads_manifest_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("resize.toml"),
            r#"
task_id = "resize-image"

[[actions]]
id = "resize-image"

[[actions.parameters]]
name = "width"
type = "number"
required = true
"#,
        )
        .unwrap();

        let mut config = EngineConfig::default();
        config.manifests.dir = Some(dir.path().to_path_buf());
        let engine = Engine::start(config).await.unwrap();

        // Registered: a second registration of the same task is a duplicate.
        let err = engine
            .dispatcher()
            .register_task(crate::manifest::TaskManifest {
                task_id: "resize-image".to_string(),
                name: None,
                description: None,
                actions: Vec::new(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Registry(_)));

        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_dispatcher() {
        let engine = Engine::start(EngineConfig::default()).await.unwrap();
        let dispatcher = engine.dispatcher();
        dispatcher.register_task(add_numbers_manifest()).await.unwrap();

        // No bank declares the task at all, which is not retryable.
        let pending = dispatcher
            .submit(DispatchRequest::new(ADD_NUMBERS, json!({ "a": 1, "b": 2 })))
            .await
            .unwrap();
        let outcome = pending.wait().await;
        assert!(outcome.is_err());

        engine.shutdown().await;
        let err = dispatcher
            .submit(DispatchRequest::new(ADD_NUMBERS, json!({ "a": 1, "b": 2 })))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::ActorUnavailable(_)));
    }
}
