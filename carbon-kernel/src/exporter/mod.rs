/**
 * EXPORTERS - Where computed emissions go
 *
 * Each exporter is wrapped in its own `ExporterHandler` and subscribed to
 * `EmissionsCalculated`, so a slow or failing sink never hides an event from
 * the others. Send failures are logged by the bus, never retried.
 */

mod log;
mod mqtt;
mod prometheus;

pub use self::log::LogExporter;
pub use self::mqtt::MqttExporter;
pub use self::prometheus::PrometheusExporter;

use crate::bus::{BusError, Event, EventBus, EventHandler, Payload, Topic};
use crate::models::Instance;
use anyhow::Context;
use async_trait::async_trait;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("cannot serialize instance: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("metrics registry: {0}")]
    Registry(#[from] ::prometheus::Error),
}

#[async_trait]
pub trait Exporter: Send + Sync + 'static {
    fn name(&self) -> &str;

    async fn send(&self, instance: &Instance) -> Result<(), ExportError>;

    async fn stop(&self) {}
}

/// Bus adapter for one exporter
pub struct ExporterHandler {
    name: String,
    exporter: Arc<dyn Exporter>,
}

impl ExporterHandler {
    pub fn new(exporter: Arc<dyn Exporter>) -> Self {
        Self { name: format!("exporter:{}", exporter.name()), exporter }
    }
}

#[async_trait]
impl EventHandler for ExporterHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, event: Arc<Event>) -> anyhow::Result<()> {
        let Payload::EmissionsCalculated(instance) = event.payload() else {
            return Ok(());
        };
        self.exporter
            .send(instance)
            .await
            .with_context(|| format!("{} failed for {}", self.name, event.correlation_key()))
    }

    async fn stop(&self) {
        self.exporter.stop().await;
    }
}

/// Subscribe every exporter to `EmissionsCalculated`
pub fn register_exporters(bus: &EventBus, exporters: &[Arc<dyn Exporter>]) -> Result<(), BusError> {
    for exporter in exporters {
        bus.subscribe(Topic::EmissionsCalculated, Arc::new(ExporterHandler::new(exporter.clone())))?;
    }
    Ok(())
}
