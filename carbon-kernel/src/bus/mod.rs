/**
 * EVENT BUS - Topic-addressed in-memory pub/sub
 *
 * FLOW :
 * publish -> bounded shared queue -> dispatcher -> worker[fnv1a(key) % W]
 *
 * ORDERING :
 * - Events sharing a correlation key always land on the same worker, and a
 *   worker waits for every subscriber of an event before taking the next one
 * - Different keys run in parallel across workers
 *
 * SHUTDOWN :
 * `stop()` cancels the shutdown token: new publishes are refused and
 * publishers parked on a full queue are released with `ShuttingDown`. The
 * dispatcher closes the queue, drains what was already accepted, closes the
 * worker inboxes and waits for each worker to report it is done.
 *
 * A handler that republishes (the calculator) can fill the queue while the
 * dispatcher waits on its worker; cancelling the token is what breaks that
 * cycle, so a saturated bus always stops.
 */

mod event;
mod worker;

pub use event::{fnv1a, shard, Event, Payload, Topic};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use worker::{Worker, WorkerHandle};

use crate::config::BusConf;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BusError {
    #[error("bus is shutting down")]
    ShuttingDown,
    #[error("bus already started, subscribe before start")]
    AlreadyStarted,
}

/// A bus subscriber.
///
/// Errors and panics stay local to one event/handler pair: the worker logs
/// them and moves on, nothing is retried.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn handle(&self, event: Arc<Event>) -> anyhow::Result<()>;

    /// Called once when the bus stops, after every worker drained
    async fn stop(&self) {}
}

pub(crate) type Subscribers = HashMap<Topic, Vec<Arc<dyn EventHandler>>>;

#[derive(Debug, Clone)]
pub struct BusOptions {
    pub workers: usize,
    pub buffer_size: usize,
    /// How long the dispatcher waits on an empty queue before checking the flag
    pub poll_interval: Duration,
}

impl Default for BusOptions {
    fn default() -> Self {
        Self { workers: 10, buffer_size: 8192, poll_interval: Duration::from_millis(100) }
    }
}

impl From<&BusConf> for BusOptions {
    fn from(conf: &BusConf) -> Self {
        Self {
            workers: conf.workers.max(1),
            buffer_size: conf.buffer_size.max(1),
            poll_interval: Duration::from_millis(conf.poll_interval_ms.max(1)),
        }
    }
}

#[derive(Debug, Default)]
pub struct BusStats {
    pub published: AtomicU64,
    /// Successful handler invocations
    pub delivered: AtomicU64,
    /// Handler errors and panics
    pub failed: AtomicU64,
    pub rejected: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct BusStatsSnapshot {
    pub published: u64,
    pub delivered: u64,
    pub failed: u64,
    pub rejected: u64,
}

impl BusStats {
    pub fn snapshot(&self) -> BusStatsSnapshot {
        BusStatsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

/// Cheap, cloneable publishing side of the bus
#[derive(Clone)]
pub struct Publisher {
    tx: mpsc::Sender<Arc<Event>>,
    shutdown: CancellationToken,
    stats: Arc<BusStats>,
}

impl Publisher {
    /// Waits while the queue is full; refused once shutdown began, including
    /// while already waiting
    pub async fn publish(&self, event: Event) -> Result<(), BusError> {
        if self.shutdown.is_cancelled() {
            return self.reject();
        }
        let sent = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return self.reject(),
            sent = self.tx.send(Arc::new(event)) => sent,
        };
        match sent {
            Ok(()) => {
                self.stats.published.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(_) => self.reject(),
        }
    }

    fn reject(&self) -> Result<(), BusError> {
        self.stats.rejected.fetch_add(1, Ordering::Relaxed);
        Err(BusError::ShuttingDown)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

pub struct EventBus {
    options: BusOptions,
    publisher: Publisher,
    subscribers: Mutex<Subscribers>,
    started: AtomicBool,
    queue: Mutex<Option<mpsc::Receiver<Arc<Event>>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    stopped: tokio::sync::Mutex<bool>,
}

impl EventBus {
    pub fn new(options: BusOptions) -> Self {
        let (tx, rx) = mpsc::channel(options.buffer_size.max(1));
        let publisher = Publisher {
            tx,
            shutdown: CancellationToken::new(),
            stats: Arc::new(BusStats::default()),
        };
        Self {
            options,
            publisher,
            subscribers: Mutex::new(Subscribers::new()),
            started: AtomicBool::new(false),
            queue: Mutex::new(Some(rx)),
            dispatcher: Mutex::new(None),
            stopped: tokio::sync::Mutex::new(false),
        }
    }

    /// Register a handler for a topic. Only allowed before `start`.
    pub fn subscribe(&self, topic: Topic, handler: Arc<dyn EventHandler>) -> Result<(), BusError> {
        let mut subs = self.subscribers.lock();
        // checked under the lock so start() cannot snapshot half a registration
        if self.started.load(Ordering::Acquire) {
            return Err(BusError::AlreadyStarted);
        }
        debug!(%topic, handler = handler.name(), "subscribed");
        subs.entry(topic).or_default().push(handler);
        Ok(())
    }

    /// Spawn the workers and the dispatcher. No-op when already started.
    pub fn start(&self) {
        let subscribers = {
            let subs = self.subscribers.lock();
            if self.started.swap(true, Ordering::AcqRel) {
                return;
            }
            Arc::new(subs.clone())
        };
        let Some(rx) = self.queue.lock().take() else {
            return;
        };

        let workers: Vec<WorkerHandle> = (0..self.options.workers.max(1))
            .map(|id| Worker::spawn(id, subscribers.clone(), self.publisher.stats.clone()))
            .collect();

        let handle = tokio::spawn(dispatch(
            rx,
            workers,
            self.publisher.shutdown.clone(),
            self.options.poll_interval,
        ));
        *self.dispatcher.lock() = Some(handle);
        info!(workers = self.options.workers, buffer = self.options.buffer_size, "event bus started");
    }

    pub async fn publish(&self, event: Event) -> Result<(), BusError> {
        self.publisher.publish(event).await
    }

    pub fn publisher(&self) -> Publisher {
        self.publisher.clone()
    }

    pub fn stats(&self) -> BusStatsSnapshot {
        self.publisher.stats.snapshot()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Refuse new events, deliver every accepted one, then stop the handlers.
    /// Irrevocable; later calls return once the first one finished.
    pub async fn stop(&self) {
        let mut stopped = self.stopped.lock().await;
        if *stopped {
            return;
        }
        self.publisher.shutdown.cancel();

        if let Some(mut rx) = self.queue.lock().take() {
            // never started: nobody will ever consume these
            rx.close();
            let mut dropped = 0usize;
            while rx.try_recv().is_ok() {
                dropped += 1;
            }
            if dropped > 0 {
                warn!(dropped, "bus stopped before start, queued events dropped");
            }
        }

        let dispatcher = self.dispatcher.lock().take();
        if let Some(handle) = dispatcher {
            if let Err(e) = handle.await {
                warn!(error = %e, "dispatcher ended abnormally");
            }
        }

        for handler in self.distinct_handlers() {
            handler.stop().await;
        }
        *stopped = true;
        info!(stats = ?self.stats(), "event bus stopped");
    }

    fn distinct_handlers(&self) -> Vec<Arc<dyn EventHandler>> {
        let subs = self.subscribers.lock();
        let mut seen: Vec<*const ()> = Vec::new();
        let mut out = Vec::new();
        for handler in subs.values().flatten() {
            let ptr = Arc::as_ptr(handler) as *const ();
            if !seen.contains(&ptr) {
                seen.push(ptr);
                out.push(handler.clone());
            }
        }
        out
    }
}

async fn dispatch(
    mut rx: mpsc::Receiver<Arc<Event>>,
    workers: Vec<WorkerHandle>,
    shutdown: CancellationToken,
    poll_interval: Duration,
) {
    let (inboxes, closing): (Vec<_>, Vec<_>) =
        workers.into_iter().map(|w| (w.inbox, w.closing)).unzip();

    while !shutdown.is_cancelled() {
        match timeout(poll_interval, rx.recv()).await {
            Ok(Some(event)) => forward(&inboxes, event).await,
            Ok(None) => break,
            Err(_) => continue,
        }
    }

    // accepted before shutdown: still delivered. Handler publishes fail fast
    // from here on, so workers never wait on this queue.
    rx.close();
    while let Some(event) = rx.recv().await {
        forward(&inboxes, event).await;
    }

    drop(inboxes);
    for done in closing {
        let _ = done.await;
    }
    debug!("dispatcher finished");
}

async fn forward(inboxes: &[mpsc::Sender<Arc<Event>>], event: Arc<Event>) {
    let idx = shard(event.correlation_key(), inboxes.len());
    if inboxes[idx].send(event).await.is_err() {
        warn!(worker = idx, "worker inbox closed, event lost");
    }
}
