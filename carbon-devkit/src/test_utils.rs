/*!
Test Harness for the carbon pipeline

Wires the real pieces together:
- `EventBus` with the calculator on `MetricsCollected`
- a `RecordingExporter` (plus any extra exporter) on `EmissionsCalculated`
- a `ScrapingManager` on demand, sharing the harness config

The interval defaults to one hour so results match the fixture constants.
*/

use crate::exporters::RecordingExporter;
use crate::fixtures;
use anyhow::Result;
use carbon_kernel::bus::{BusOptions, BusStatsSnapshot, Event, EventBus, Topic};
use carbon_kernel::calculator::CalculatorHandler;
use carbon_kernel::config::{AppConfig, ConfigStore};
use carbon_kernel::exporter::{register_exporters, Exporter};
use carbon_kernel::models::Instance;
use carbon_kernel::scheduler::ScrapingManager;
use carbon_kernel::source::Source;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_WAIT: Duration = Duration::from_secs(5);

pub struct TestHarness {
    pub bus: Arc<EventBus>,
    pub recorder: Arc<RecordingExporter>,
    pub config: ConfigStore,
}

impl TestHarness {
    /// Reference factors, one hour interval, 4 workers
    pub fn new() -> Result<Self> {
        Self::with_exporters(vec![])
    }

    /// Extra exporters are subscribed next to the recorder
    pub fn with_exporters(extra: Vec<Arc<dyn Exporter>>) -> Result<Self> {
        init_tracing();

        let mut config = AppConfig::default();
        config.providers.interval_secs = 3600;
        config.providers.fetch_timeout_secs = 5;
        let config = ConfigStore::fixed(config);

        let bus = Arc::new(EventBus::new(BusOptions {
            workers: 4,
            buffer_size: 256,
            poll_interval: Duration::from_millis(10),
        }));
        let calculator = CalculatorHandler::new(Arc::new(fixtures::factors()?), config.clone(), bus.publisher());
        bus.subscribe(Topic::MetricsCollected, Arc::new(calculator))?;

        let recorder = Arc::new(RecordingExporter::new());
        let mut exporters: Vec<Arc<dyn Exporter>> = vec![recorder.clone()];
        exporters.extend(extra);
        register_exporters(&bus, &exporters)?;
        bus.start();

        Ok(Self { bus, recorder, config })
    }

    /// Publish a raw sample as a source would
    pub async fn collect(&self, instance: Instance) -> Result<()> {
        self.bus.publish(Event::metrics_collected(instance)).await?;
        Ok(())
    }

    /// Scrapers publishing into the harness bus; not started yet
    pub fn scraping_manager(&self, sources: Vec<Arc<dyn Source>>) -> ScrapingManager {
        let mut manager = ScrapingManager::new(self.bus.publisher(), self.config.clone());
        for source in sources {
            manager.add(source);
        }
        manager
    }

    pub async fn wait_for_emissions(&self, count: usize) -> Vec<Instance> {
        self.recorder.wait_for(count, DEFAULT_WAIT).await
    }

    pub fn stats(&self) -> BusStatsSnapshot {
        self.bus.stats()
    }

    /// Drains the bus; returns the final counters
    pub async fn shutdown(&self) -> BusStatsSnapshot {
        self.bus.stop().await;
        self.bus.stats()
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
