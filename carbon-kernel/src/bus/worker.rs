use super::{BusStats, Event, EventHandler, Subscribers};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

/// Dispatcher side of a worker: its single-slot inbox and its closing signal
pub(super) struct WorkerHandle {
    pub inbox: mpsc::Sender<Arc<Event>>,
    pub closing: oneshot::Receiver<()>,
}

pub(super) struct Worker {
    id: usize,
    inbox: mpsc::Receiver<Arc<Event>>,
    closing: oneshot::Sender<()>,
    subscribers: Arc<Subscribers>,
    stats: Arc<BusStats>,
}

impl Worker {
    pub fn spawn(id: usize, subscribers: Arc<Subscribers>, stats: Arc<BusStats>) -> WorkerHandle {
        let (inbox_tx, inbox_rx) = mpsc::channel(1);
        let (closing_tx, closing_rx) = oneshot::channel();
        let worker = Worker { id, inbox: inbox_rx, closing: closing_tx, subscribers, stats };
        tokio::spawn(worker.run());
        WorkerHandle { inbox: inbox_tx, closing: closing_rx }
    }

    /// Runs until the dispatcher drops the inbox sender, then drains what is left
    async fn run(mut self) {
        while let Some(event) = self.inbox.recv().await {
            self.process(event).await;
        }
        debug!(worker = self.id, "worker drained");
        let _ = self.closing.send(());
    }

    /// Every handler of the topic runs concurrently; the next event waits for all of them
    async fn process(&self, event: Arc<Event>) {
        let topic = event.topic();
        let Some(handlers) = self.subscribers.get(&topic) else {
            debug!(worker = self.id, %topic, "no subscriber for topic");
            return;
        };

        let mut running = JoinSet::new();
        for handler in handlers {
            let handler: Arc<dyn EventHandler> = handler.clone();
            let event = event.clone();
            running.spawn(async move {
                let result = handler.handle(event).await;
                (handler.name().to_string(), result)
            });
        }

        while let Some(joined) = running.join_next().await {
            match joined {
                Ok((_, Ok(()))) => {
                    self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Ok((name, Err(e))) => {
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        worker = self.id,
                        handler = %name,
                        %topic,
                        key = event.correlation_key(),
                        error = %format!("{e:#}"),
                        "handler failed"
                    );
                }
                Err(e) => {
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                    if e.is_panic() {
                        error!(worker = self.id, %topic, key = event.correlation_key(), "handler panicked");
                    } else {
                        error!(worker = self.id, %topic, error = %e, "handler task aborted");
                    }
                }
            }
        }
    }
}
