/**
 * CARBON KERNEL - Daemon entry point
 *
 * ROLE : Wires config, emission factors, event bus, calculator, exporters,
 * plugins, sources and the HTTP API, then runs until Ctrl-C/SIGTERM.
 *
 * SHUTDOWN : HTTP stops accepting -> scrapers stop (in-flight fetch ends)
 * -> bus drains -> plugins are killed and reaped.
 */

use anyhow::Context;
use carbon_kernel::bus::{BusOptions, EventBus, Topic};
use carbon_kernel::calculator::CalculatorHandler;
use carbon_kernel::config::{config_path, load_config_from, AppConfig, ConfigStore};
use carbon_kernel::exporter::{register_exporters, Exporter, LogExporter, MqttExporter, PrometheusExporter};
use carbon_kernel::factors::EmissionFactors;
use carbon_kernel::health::HealthTracker;
use carbon_kernel::http::{build_router, AppState};
use carbon_kernel::mqtt;
use carbon_kernel::plugins::{self, PluginManager};
use carbon_kernel::scheduler::ScrapingManager;
use carbon_kernel::source::{FixtureSource, HostSource, PluginSource};
use carbon_kernel::state::new_state;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let path = config_path();
    let config: AppConfig = load_config_from(&path).await.context("loading configuration")?;
    init_tracing(&config.log_level);
    info!(config = %path.display(), "carbon kernel starting");

    let store = ConfigStore::new(config.clone(), path);
    #[cfg(unix)]
    store.spawn_reload_on_sighup();

    let factors = EmissionFactors::load(&config.factors_path)
        .await
        .with_context(|| format!("loading emission factors from {}", config.factors_path.display()))?;
    info!(providers = factors.providers().count(), "emission factors loaded");

    // bus + subscribers
    let bus = Arc::new(EventBus::new(BusOptions::from(&config.bus)));
    let calculator = CalculatorHandler::new(Arc::new(factors), store.clone(), bus.publisher());
    bus.subscribe(Topic::MetricsCollected, Arc::new(calculator))?;

    let health_tracker = HealthTracker::new();
    let mut exporters: Vec<Arc<dyn Exporter>> = Vec::new();
    if config.exporters.log {
        exporters.push(Arc::new(LogExporter));
    }
    let prometheus = if config.exporters.prometheus {
        Some(Arc::new(PrometheusExporter::new().context("building prometheus registry")?))
    } else {
        None
    };
    if let Some(prom) = &prometheus {
        exporters.push(prom.clone());
    }
    if let Some(mqtt_conf) = config.mqtt.as_ref().filter(|_| config.exporters.mqtt) {
        let (client, eventloop) = mqtt::create_mqtt_client(mqtt_conf, "carbon-kernel");
        health_tracker.mark_mqtt_connecting();
        mqtt::spawn_event_loop(eventloop, health_tracker.clone());
        exporters.push(Arc::new(MqttExporter::new(client, &mqtt_conf.emissions_topic)));
    }
    register_exporters(&bus, &exporters)?;
    bus.start();

    // plugins
    if let Err(e) = tokio::fs::create_dir_all(&config.plugins.dir).await {
        warn!(dir = %config.plugins.dir.display(), error = %e, "cannot create plugins dir");
    }
    let mut plugin_manager = PluginManager::new(&config.plugins.dir, config.mqtt.as_ref());
    match plugin_manager.discover_plugins().await {
        Ok(discovered) => {
            let started = plugin_manager.auto_start_plugins();
            info!(discovered = discovered.len(), started, "plugins loaded");
        }
        Err(e) => warn!(error = %e, "plugin discovery failed"),
    }
    let plugins = new_state(plugin_manager);
    let plugin_monitor = plugins::spawn_plugin_health_monitor(plugins.clone(), plugins::HEALTH_CHECK_INTERVAL);

    // sources
    let mut scraping = ScrapingManager::new(bus.publisher(), store.clone());
    for fixture in &config.providers.fixtures {
        scraping.add(Arc::new(FixtureSource::new(&fixture.name, fixture.provider, &fixture.path)));
    }
    if let Some(host) = config.providers.host.as_ref().filter(|h| h.enabled) {
        scraping.add(Arc::new(HostSource::new(&host.region, &host.kind)));
    }
    let has_source_plugins = plugins.lock().has_sources();
    if has_source_plugins {
        match config.mqtt.as_ref() {
            Some(mqtt_conf) => scraping.add(Arc::new(PluginSource::connect("plugins", mqtt_conf))),
            None => warn!("source plugins found but mqtt is not configured"),
        }
    }
    if scraping.is_empty() {
        warn!("no source configured, nothing will be collected");
    }
    scraping.start();

    // HTTP
    let app = build_router(AppState {
        bus: bus.clone(),
        scrapers: scraping.states(),
        health_tracker,
        prometheus,
        plugins: plugins.clone(),
    });
    let listener = TcpListener::bind(&config.api.address)
        .await
        .with_context(|| format!("binding {}", config.api.address))?;
    info!(address = %config.api.address, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server")?;

    info!("shutting down");
    scraping.stop().await;
    bus.stop().await;
    plugin_monitor.abort();
    plugins::shutdown_plugins(&plugins).await;
    info!("bye");
    Ok(())
}

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
