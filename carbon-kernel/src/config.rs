use crate::models::Provider;
use crate::state::Snapshot;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tracing::{info, warn};

pub const CONFIG_ENV: &str = "CARBON_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "carbon.yaml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct AppConfig {
    pub log_level: String,
    pub api: ApiConf,
    pub bus: BusConf,
    pub providers: ProvidersConf,
    /// YAML emission factors dataset
    pub factors_path: PathBuf,
    pub mqtt: Option<MqttConf>,
    pub plugins: PluginsConf,
    pub exporters: ExportersConf,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ApiConf {
    pub address: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct BusConf {
    pub workers: usize,
    pub buffer_size: usize,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ProvidersConf {
    /// Scrape period, also the measurement interval of every sample
    pub interval_secs: u64,
    pub fetch_timeout_secs: u64,
    pub fixtures: Vec<FixtureConf>,
    pub host: Option<HostConf>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct FixtureConf {
    pub name: String,
    pub provider: Provider,
    pub path: PathBuf,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct HostConf {
    #[serde(default = "enabled")]
    pub enabled: bool,
    pub region: String,
    pub kind: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MqttConf {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_emissions_topic")]
    pub emissions_topic: String,
    /// Where source plugins publish raw instances
    #[serde(default = "default_metrics_topic")]
    pub metrics_topic: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct PluginsConf {
    pub dir: PathBuf,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ExportersConf {
    pub log: bool,
    pub prometheus: bool,
    pub mqtt: bool,
}

fn enabled() -> bool {
    true
}

fn default_emissions_topic() -> String {
    "carbon/emissions@v1".into()
}

fn default_metrics_topic() -> String {
    "carbon/metrics@v1".into()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            api: ApiConf::default(),
            bus: BusConf::default(),
            providers: ProvidersConf::default(),
            factors_path: PathBuf::from("emissions.yaml"),
            mqtt: None,
            plugins: PluginsConf::default(),
            exporters: ExportersConf::default(),
        }
    }
}

impl Default for ApiConf {
    fn default() -> Self {
        Self { address: "0.0.0.0:8080".into() }
    }
}

impl Default for BusConf {
    fn default() -> Self {
        Self { workers: 10, buffer_size: 8192, poll_interval_ms: 100 }
    }
}

impl Default for ProvidersConf {
    fn default() -> Self {
        Self { interval_secs: 300, fetch_timeout_secs: 60, fixtures: vec![], host: None }
    }
}

impl Default for MqttConf {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 1883,
            emissions_topic: default_emissions_topic(),
            metrics_topic: default_metrics_topic(),
        }
    }
}

impl Default for PluginsConf {
    fn default() -> Self {
        Self { dir: PathBuf::from("./plugins") }
    }
}

impl Default for ExportersConf {
    fn default() -> Self {
        Self { log: true, prometheus: true, mqtt: false }
    }
}

impl AppConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.providers.interval_secs.max(1))
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.providers.fetch_timeout_secs.max(1))
    }

    pub fn bus_poll_interval(&self) -> Duration {
        Duration::from_millis(self.bus.poll_interval_ms.max(1))
    }
}

/// Path of the config file: `CARBON_CONFIG` or `carbon.yaml`
pub fn config_path() -> PathBuf {
    std::env::var(CONFIG_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
}

/// Missing or empty file gives the defaults, a broken one is an error
pub async fn load_config_from(path: &Path) -> Result<AppConfig, ConfigError> {
    if !fs::try_exists(path).await.unwrap_or(false) {
        warn!(path = %path.display(), "no config file, using defaults");
        return Ok(AppConfig::default());
    }
    let txt = fs::read_to_string(path)
        .await
        .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
    if txt.trim().is_empty() {
        return Ok(AppConfig::default());
    }
    serde_yaml::from_str(&txt).map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })
}

pub async fn load_config() -> Result<AppConfig, ConfigError> {
    load_config_from(&config_path()).await
}

/// Shared configuration handed to every component at construction.
/// Hot reload replaces the whole snapshot; readers call `current()` per use.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
    snapshot: Snapshot<AppConfig>,
}

impl ConfigStore {
    pub fn new(config: AppConfig, path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), snapshot: Snapshot::new(config) }
    }

    /// In-memory store, nothing to reload from
    pub fn fixed(config: AppConfig) -> Self {
        Self::new(config, PathBuf::new())
    }

    pub fn current(&self) -> Arc<AppConfig> {
        self.snapshot.load()
    }

    pub fn swap(&self, config: AppConfig) {
        self.snapshot.swap(config);
    }

    /// Re-read the file; on error the running config is kept
    pub async fn reload(&self) -> Result<(), ConfigError> {
        if self.path.as_os_str().is_empty() {
            return Ok(());
        }
        let config = load_config_from(&self.path).await?;
        self.swap(config);
        info!(path = %self.path.display(), "config reloaded");
        Ok(())
    }

    /// Reload on SIGHUP
    #[cfg(unix)]
    pub fn spawn_reload_on_sighup(&self) {
        use tokio::signal::unix::{signal, SignalKind};
        let store = self.clone();
        tokio::spawn(async move {
            let mut hup = match signal(SignalKind::hangup()) {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, "cannot listen for SIGHUP, hot reload disabled");
                    return;
                }
            };
            while hup.recv().await.is_some() {
                if let Err(e) = store.reload().await {
                    warn!(error = %e, "config reload failed, keeping previous config");
                }
            }
        });
    }
}
