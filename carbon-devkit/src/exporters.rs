/*!
Recording exporter

Keeps every calculated instance it receives, in arrival order.
*/

use async_trait::async_trait;
use carbon_kernel::exporter::{ExportError, Exporter};
use carbon_kernel::models::Instance;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Default)]
pub struct RecordingExporter {
    received: Mutex<Vec<Instance>>,
    stopped: AtomicBool,
}

impl RecordingExporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn received(&self) -> Vec<Instance> {
        self.received.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.received.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.received.lock().is_empty()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Polls until `count` instances arrived or `timeout` elapsed
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> Vec<Instance> {
        let deadline = Instant::now() + timeout;
        while self.len() < count && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.received()
    }
}

#[async_trait]
impl Exporter for RecordingExporter {
    fn name(&self) -> &str {
        "recording"
    }

    async fn send(&self, instance: &Instance) -> Result<(), ExportError> {
        self.received.lock().push(instance.clone());
        Ok(())
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}
