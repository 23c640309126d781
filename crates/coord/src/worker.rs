//! Dispatch of queued tasks to named handlers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tracing::{debug, error, info, instrument, warn};

use kvsync_store::{KvStore, ListEnd};

use crate::config::{QueueConfig, WorkerConfig};
use crate::delayed::DelayedTask;
use crate::error::CoordError;
use crate::keys::ready_queue_key;
use crate::queue::ShardedQueue;

/// Code run for every task with a given name.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, args: serde_json::Value) -> Result<(), CoordError>;
}

/// Accepted task encodings: `[id, queue, name, args]` as written by
/// [`crate::DelayedQueue`], or a bare `[name, args]`.
#[derive(Deserialize)]
#[serde(untagged)]
enum Envelope {
    Scheduled(DelayedTask),
    Direct(String, serde_json::Value),
}

impl Envelope {
    fn into_parts(self) -> (String, serde_json::Value) {
        match self {
            Self::Scheduled(task) => (task.name, task.args),
            Self::Direct(name, args) => (name, args),
        }
    }
}

/// What [`Worker::process_one`] did with the next task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Nothing arrived before the timeout.
    Idle,
    Handled(String),
    /// No handler is registered under this name; the task was dropped.
    Unknown(String),
    /// The payload was not a recognised task encoding; it was dropped.
    Malformed,
}

/// Builder for [`Worker`].
pub struct WorkerBuilder {
    store: Arc<dyn KvStore>,
    queue: String,
    queue_config: QueueConfig,
    config: WorkerConfig,
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl WorkerBuilder {
    /// A worker consuming `queue:{queue}`.
    pub fn new(store: Arc<dyn KvStore>, queue: impl Into<String>) -> Self {
        Self {
            store,
            queue: queue.into(),
            queue_config: QueueConfig::default(),
            config: WorkerConfig::default(),
            handlers: HashMap::new(),
        }
    }

    #[must_use]
    pub fn queue_config(mut self, config: QueueConfig) -> Self {
        self.queue_config = config;
        self
    }

    #[must_use]
    pub fn config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// Register `handler` for tasks named `name`, replacing any earlier one.
    #[must_use]
    pub fn handler(mut self, name: impl Into<String>, handler: Arc<dyn TaskHandler>) -> Self {
        self.handlers.insert(name.into(), handler);
        self
    }

    /// Build the worker.
    ///
    /// Returns the worker and a shutdown sender.
    pub fn build(self) -> Result<(Worker, mpsc::Sender<()>), CoordError> {
        let queue = ShardedQueue::with_config(self.store, self.queue_config)?;
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let worker = Worker {
            queue,
            key: ready_queue_key(&self.queue),
            handlers: self.handlers,
            config: self.config,
            shutdown_rx,
        };
        Ok((worker, shutdown_tx))
    }
}

/// Pops tasks from one sharded queue and runs the matching handler.
pub struct Worker {
    queue: ShardedQueue,
    key: String,
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
    config: WorkerConfig,
    shutdown_rx: mpsc::Receiver<()>,
}

impl Worker {
    /// Wait up to `timeout` for one task and dispatch it.
    ///
    /// A failing handler surfaces as [`CoordError::Handler`]; the task is not
    /// requeued.
    #[instrument(name = "worker.process_one", skip(self), fields(queue = %self.key))]
    pub async fn process_one(&self, timeout: Duration) -> Result<Dispatch, CoordError> {
        let Some(raw) = self.queue.blocking_pop(&self.key, ListEnd::Head, timeout).await? else {
            return Ok(Dispatch::Idle);
        };
        let (name, args) = match serde_json::from_str::<Envelope>(&raw) {
            Ok(envelope) => envelope.into_parts(),
            Err(e) => {
                warn!(error = %e, "dropping malformed task");
                return Ok(Dispatch::Malformed);
            }
        };
        let Some(handler) = self.handlers.get(&name) else {
            warn!(task = %name, "no handler registered, dropping task");
            return Ok(Dispatch::Unknown(name));
        };

        handler
            .handle(args)
            .await
            .map_err(|e| CoordError::Handler {
                name: name.clone(),
                reason: e.to_string(),
            })?;
        debug!(task = %name, "task handled");
        Ok(Dispatch::Handled(name))
    }

    /// Process tasks until a shutdown signal arrives or every sender is
    /// dropped. Errors are logged and the loop carries on; store errors pause
    /// the loop for the configured backoff first.
    pub async fn run(&mut self) {
        info!(queue = %self.key, "worker starting");
        let pop_timeout = self.config.pop_timeout();
        let backoff = self.config.error_backoff();

        loop {
            match self.process_one(pop_timeout).await {
                Ok(_) => {}
                Err(e @ CoordError::Handler { .. }) => error!(error = %e, "task handler failed"),
                Err(e) => {
                    error!(error = %e, ?backoff, "error processing task");
                    tokio::select! {
                        _ = self.shutdown_rx.recv() => {
                            info!("worker received shutdown signal");
                            break;
                        }
                        () = tokio::time::sleep(backoff) => {}
                    }
                    continue;
                }
            }
            match self.shutdown_rx.try_recv() {
                Err(TryRecvError::Empty) => {}
                Ok(()) => {
                    info!("worker received shutdown signal");
                    break;
                }
                Err(TryRecvError::Disconnected) => break,
            }
        }

        info!(queue = %self.key, "worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use kvsync_store_memory::MemoryStore;
    use serde_json::json;
    use tracing_subscriber::layer::{Context, SubscriberExt};

    use crate::delayed::DelayedQueue;

    use super::*;

    struct Recorder(mpsc::UnboundedSender<serde_json::Value>);

    #[async_trait]
    impl TaskHandler for Recorder {
        async fn handle(&self, args: serde_json::Value) -> Result<(), CoordError> {
            self.0
                .send(args)
                .map_err(|e| CoordError::InvalidArgument(e.to_string()))
        }
    }

    struct Failing;

    #[async_trait]
    impl TaskHandler for Failing {
        async fn handle(&self, _args: serde_json::Value) -> Result<(), CoordError> {
            Err(CoordError::InvalidArgument("smtp down".into()))
        }
    }

    /// Counts `ERROR` events emitted on the current thread.
    struct ErrorCounter(Arc<AtomicUsize>);

    impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for ErrorCounter {
        fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
            if *event.metadata().level() == tracing::Level::ERROR {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn worker(store: &MemoryStore) -> (Worker, mpsc::Sender<()>, mpsc::UnboundedReceiver<serde_json::Value>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (worker, shutdown) = WorkerBuilder::new(Arc::new(store.clone()), "email")
            .config(WorkerConfig {
                pop_timeout_ms: 50,
                ..WorkerConfig::default()
            })
            .handler("send", Arc::new(Recorder(tx)))
            .handler("bounce", Arc::new(Failing))
            .build()
            .unwrap();
        (worker, shutdown, rx)
    }

    async fn enqueue(store: &MemoryStore, raw: &str) {
        ShardedQueue::new(Arc::new(store.clone()))
            .push_tail("queue:email", &[raw])
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn dispatches_by_name() {
        let store = MemoryStore::new();
        let (worker, _shutdown, mut seen) = worker(&store);
        enqueue(&store, r#"["send", {"to": "a@b"}]"#).await;

        assert_eq!(
            worker.process_one(Duration::from_millis(10)).await.unwrap(),
            Dispatch::Handled("send".into())
        );
        assert_eq!(seen.recv().await.unwrap(), json!({"to": "a@b"}));
        assert_eq!(
            worker.process_one(Duration::from_millis(10)).await.unwrap(),
            Dispatch::Idle
        );
    }

    #[tokio::test]
    async fn accepts_scheduled_tasks() {
        let store = MemoryStore::new();
        let (worker, _shutdown, mut seen) = worker(&store);
        DelayedQueue::new(Arc::new(store.clone()))
            .schedule("email", "send", json!([42]), Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(
            worker.process_one(Duration::from_millis(10)).await.unwrap(),
            Dispatch::Handled("send".into())
        );
        assert_eq!(seen.recv().await.unwrap(), json!([42]));
    }

    #[tokio::test]
    async fn unknown_and_malformed_tasks_are_skipped() {
        let store = MemoryStore::new();
        let (worker, _shutdown, _seen) = worker(&store);
        enqueue(&store, r#"["fax", null]"#).await;
        enqueue(&store, "{}").await;

        assert_eq!(
            worker.process_one(Duration::from_millis(10)).await.unwrap(),
            Dispatch::Unknown("fax".into())
        );
        assert_eq!(
            worker.process_one(Duration::from_millis(10)).await.unwrap(),
            Dispatch::Malformed
        );
    }

    #[tokio::test]
    async fn handler_failure_is_reported() {
        let store = MemoryStore::new();
        let (worker, _shutdown, _seen) = worker(&store);
        enqueue(&store, r#"["bounce", null]"#).await;

        let err = worker.process_one(Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, CoordError::Handler { ref name, .. } if name == "bounce"));
    }

    #[tokio::test(start_paused = true)]
    async fn run_drains_the_queue_until_shutdown() {
        let store = MemoryStore::new();
        let (mut worker, shutdown, mut seen) = worker(&store);
        for n in 0..3 {
            enqueue(&store, &format!(r#"["send", {n}]"#)).await;
        }
        enqueue(&store, r#"["bounce", null]"#).await;

        let handle = tokio::spawn(async move { worker.run().await });
        for n in 0..3 {
            assert_eq!(seen.recv().await.unwrap(), json!(n));
        }
        shutdown.send(()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("worker should stop")
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn store_errors_back_off_until_shutdown() {
        let errors = Arc::new(AtomicUsize::new(0));
        let _guard = tracing::subscriber::set_default(
            tracing_subscriber::registry().with(ErrorCounter(Arc::clone(&errors))),
        );
        let store = MemoryStore::new();
        store.set("queue:email:first", "not-a-number", None).await.unwrap();
        let (mut worker, shutdown, _seen) = worker(&store);

        let handle = tokio::spawn(async move { worker.run().await });
        tokio::time::sleep(Duration::from_secs(1)).await;
        shutdown.send(()).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("worker should stop")
            .unwrap();

        // One attempt per 100 ms backoff over one second.
        let attempts = errors.load(Ordering::Relaxed);
        assert!((5..=12).contains(&attempts), "unexpected attempt count {attempts}");
    }
}
