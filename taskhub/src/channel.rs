//! Execution channels - where dispatched work actually runs
//!
//! The dispatcher only sees [`ExecutionChannel`]: `send` a message, receive
//! results through the [`ResultSink`] handed over in `on_result`, and
//! `terminate`. [`LocalChannel`] is the in-process implementation used by
//! the binary and the tests; anything out-of-process plugs in the same way.

use async_trait::async_trait;
use chrono::Utc;
use ractor::ActorRef;
use shared_types::{ChannelFailure, ChannelMessage, ChannelResult, ErrorCategory};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

use crate::actors::dispatcher::DispatcherMsg;
use crate::handler::{HandlerError, TaskHandler};

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("send failed: {0}")]
    Send(String),
    #[error("channel terminated")]
    Terminated,
}

/// Marshals channel results back onto the dispatcher's mailbox
#[derive(Debug, Clone)]
pub struct ResultSink {
    dispatcher: ActorRef<DispatcherMsg>,
}

impl ResultSink {
    pub fn new(dispatcher: ActorRef<DispatcherMsg>) -> Self {
        Self { dispatcher }
    }

    pub fn deliver(&self, result: ChannelResult) {
        let request_id = result.request_id.clone();
        if let Err(e) = self
            .dispatcher
            .cast(DispatcherMsg::ChannelResult { result })
        {
            tracing::warn!(request_id = %request_id, error = %e, "Dropped channel result");
        }
    }
}

#[async_trait]
pub trait ExecutionChannel: Send + Sync {
    async fn send(&self, message: ChannelMessage) -> Result<(), ChannelError>;

    /// Register where results go. Called once, at bank registration.
    fn on_result(&self, sink: ResultSink);

    async fn terminate(&self);
}

/// Runs a [`TaskHandler`] on tokio tasks inside this process
pub struct LocalChannel {
    bank_id: String,
    handler: Arc<dyn TaskHandler>,
    timeout: Option<Duration>,
    sink: OnceLock<ResultSink>,
    terminated: AtomicBool,
    running: Mutex<Vec<JoinHandle<()>>>,
}

impl LocalChannel {
    pub fn new(bank_id: impl Into<String>, handler: Arc<dyn TaskHandler>) -> Self {
        Self {
            bank_id: bank_id.into(),
            handler,
            timeout: None,
            sink: OnceLock::new(),
            terminated: AtomicBool::new(false),
            running: Mutex::new(Vec::new()),
        }
    }

    /// Fail a message with a `timeout` error when its handler runs longer
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Handles of in-flight messages. A poisoned lock is recovered so
    /// `terminate` can still abort everything sent.
    fn running(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.running.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(bank_id = %self.bank_id, "Recovering poisoned running-task list");
            PoisonError::into_inner(poisoned)
        })
    }
}

#[async_trait]
impl ExecutionChannel for LocalChannel {
    async fn send(&self, message: ChannelMessage) -> Result<(), ChannelError> {
        if self.terminated.load(Ordering::SeqCst) {
            return Err(ChannelError::Terminated);
        }
        let sink = self
            .sink
            .get()
            .cloned()
            .ok_or_else(|| ChannelError::Send("no result sink attached".to_string()))?;

        let handler = self.handler.clone();
        let bank_id = self.bank_id.clone();
        let timeout = self.timeout;

        let task = tokio::spawn(async move {
            let started = Instant::now();
            let work = handler.perform(&message.task_id, message.payload.clone());
            let outcome = match timeout {
                Some(limit) => match tokio::time::timeout(limit, work).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(HandlerError::new(
                        ErrorCategory::Timeout,
                        format!("handler exceeded {}ms", limit.as_millis()),
                    )),
                },
                None => work.await,
            };

            let (payload, error) = match outcome {
                Ok(output) => (output, None),
                Err(e) => (
                    serde_json::Value::Null,
                    Some(ChannelFailure {
                        category: e.category,
                        message: e.message,
                    }),
                ),
            };
            sink.deliver(ChannelResult {
                action_id: message.action_id,
                task_id: message.task_id,
                request_id: message.request_id,
                assignment_id: message.assignment_id,
                success: error.is_none(),
                payload,
                error,
                worker_id: message.worker_id,
                bank_id,
                timestamp: Utc::now(),
                duration_ms: started.elapsed().as_millis() as u64,
            });
        });

        let mut running = self.running();
        running.retain(|t| !t.is_finished());
        running.push(task);
        Ok(())
    }

    fn on_result(&self, sink: ResultSink) {
        if self.sink.set(sink).is_err() {
            tracing::warn!(bank_id = %self.bank_id, "Result sink already attached");
        }
    }

    async fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
        for task in self.running().drain(..) {
            task.abort();
        }
        tracing::info!(bank_id = %self.bank_id, "LocalChannel terminated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;
    use ractor::{Actor, ActorProcessingErr};
    use serde_json::{json, Value};
    use tokio::sync::mpsc;

    /// Stands in for the dispatcher and forwards channel results
    struct ResultCollector;

    #[async_trait]
    impl Actor for ResultCollector {
        type Msg = DispatcherMsg;
        type State = mpsc::UnboundedSender<ChannelResult>;
        type Arguments = mpsc::UnboundedSender<ChannelResult>;

        async fn pre_start(
            &self,
            _myself: ActorRef<Self::Msg>,
            results: Self::Arguments,
        ) -> Result<Self::State, ActorProcessingErr> {
            Ok(results)
        }

        async fn handle(
            &self,
            _myself: ActorRef<Self::Msg>,
            message: Self::Msg,
            results: &mut Self::State,
        ) -> Result<(), ActorProcessingErr> {
            if let DispatcherMsg::ChannelResult { result } = message {
                let _ = results.send(result);
            }
            Ok(())
        }
    }

    struct SleepyHandler(Duration);

    #[async_trait]
    impl TaskHandler for SleepyHandler {
        async fn perform(&self, _task_id: &str, payload: Value) -> Result<Value, HandlerError> {
            tokio::time::sleep(self.0).await;
            Ok(payload)
        }
    }

    fn message(request_id: &str) -> ChannelMessage {
        ChannelMessage {
            action_id: "echo".to_string(),
            task_id: "echo".to_string(),
            request_id: request_id.to_string(),
            assignment_id: format!("{request_id}-a1"),
            worker_id: Some("local-w0".to_string()),
            payload: json!({ "n": 1 }),
            timestamp: Utc::now(),
        }
    }

    async fn attach_collector(
        channel: &LocalChannel,
    ) -> (ActorRef<DispatcherMsg>, mpsc::UnboundedReceiver<ChannelResult>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (collector, _handle) = Actor::spawn(None, ResultCollector, tx).await.unwrap();
        channel.on_result(ResultSink::new(collector.clone()));
        (collector, rx)
    }

    #[tokio::test]
    async fn test_send_delivers_result_through_sink() {
        let channel = LocalChannel::new("local", handler_fn(|_, payload| Ok(payload)));
        let (collector, mut rx) = attach_collector(&channel).await;

        channel.send(message("r1")).await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(result.success);
        assert_eq!(result.request_id, "r1");
        assert_eq!(result.bank_id, "local");
        assert_eq!(result.payload, json!({ "n": 1 }));

        collector.stop(None);
    }

    #[tokio::test]
    async fn test_poisoned_lock_still_tracks_and_aborts_tasks() {
        let channel = LocalChannel::new(
            "local",
            Arc::new(SleepyHandler(Duration::from_millis(200))),
        );
        let (collector, mut rx) = attach_collector(&channel).await;

        std::thread::scope(|scope| {
            let poisoner = scope.spawn(|| {
                let _guard = channel.running.lock().unwrap();
                panic!("poison the running-task list");
            });
            assert!(poisoner.join().is_err());
        });
        assert!(channel.running.is_poisoned());

        channel.send(message("r1")).await.unwrap();
        assert_eq!(channel.running().len(), 1);

        channel.terminate().await;
        assert!(channel.running().is_empty());
        assert_eq!(
            channel.send(message("r2")).await,
            Err(ChannelError::Terminated)
        );

        // The aborted handler never reports back.
        let late = tokio::time::timeout(Duration::from_millis(400), rx.recv()).await;
        assert!(late.is_err());

        collector.stop(None);
    }
}
