/**
 * PLUGIN MANAGER - Out-of-process exporters and sources
 *
 * ROLE :
 * Plugins are separate binaries talking to the kernel over MQTT. Exporter
 * plugins subscribe to the emissions topic; source plugins publish raw
 * instances on the metrics topic, where `source::PluginSource` picks them
 * up. The kernel only supervises their processes.
 *
 * LIFECYCLE :
 * - Discovery: every `*.json` manifest in `plugins.dir`
 * - Start: child process with the MQTT coordinates in its environment
 * - Health: checked every 30s, crashed plugins restarted up to `max_restarts`
 * - Shutdown: kill under the lock, then an async bounded wait outside it
 *
 * MANIFEST :
 * ```json
 * {
 *   "name": "carbon-plugin-log",
 *   "version": "0.1.0",
 *   "binary": "./carbon-plugin-log",
 *   "kind": "exporter",
 *   "auto_start": true,
 *   "restart_on_failure": true,
 *   "max_restarts": 3
 * }
 * ```
 */

use crate::config::MqttConf;
use crate::state::Shared;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tokio::fs;
use tokio::task::{self, JoinHandle};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("Plugin not found: {0}")]
    NotFound(String),
    #[error("Plugin already running: {0}")]
    AlreadyRunning(String),
    #[error("Failed to start plugin: {0}")]
    StartFailed(String),
    #[error("Plugin manifest error: {0}")]
    ManifestError(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginKind {
    #[default]
    Exporter,
    Source,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginManifest {
    pub name: String,
    pub version: String,
    /// Relative paths are resolved against the plugins directory
    pub binary: PathBuf,
    pub kind: PluginKind,
    pub args: Vec<String>,
    pub description: Option<String>,
    pub auto_start: bool,
    pub restart_on_failure: bool,
    pub max_restarts: u32,
    pub shutdown_timeout_seconds: u64,
    pub env: Option<HashMap<String, String>>,
}

impl Default for PluginManifest {
    fn default() -> Self {
        Self {
            name: String::new(),
            version: "0.1.0".to_string(),
            binary: PathBuf::new(),
            kind: PluginKind::Exporter,
            args: vec![],
            description: None,
            auto_start: false,
            restart_on_failure: true,
            max_restarts: 3,
            shutdown_timeout_seconds: 10,
            env: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginStatus {
    Stopped,
    Running,
    Failed(String),
    /// Out of restarts, left alone until an operator steps in
    Exhausted,
}

#[derive(Debug)]
struct PluginInstance {
    manifest: PluginManifest,
    process: Option<Child>,
    status: PluginStatus,
    started_at: Option<OffsetDateTime>,
    restart_count: u32,
    instance_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PluginInfo {
    pub name: String,
    pub version: String,
    pub kind: PluginKind,
    pub description: Option<String>,
    pub status: PluginStatus,
    pub uptime_seconds: Option<u64>,
    pub restart_count: u32,
    pub pid: Option<u32>,
}

/// A killed plugin process, waited for without holding the manager lock
#[derive(Debug)]
pub struct Exiting {
    name: String,
    process: Child,
    timeout: Duration,
}

impl Exiting {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn wait(mut self) {
        let started = Instant::now();
        loop {
            match self.process.try_wait() {
                Ok(Some(status)) => {
                    info!(plugin = %self.name, %status, "plugin stopped");
                    return;
                }
                Ok(None) if started.elapsed() > self.timeout => {
                    warn!(plugin = %self.name, "plugin did not exit in time, giving up on it");
                    return;
                }
                Ok(None) => tokio::time::sleep(Duration::from_millis(50)).await,
                Err(e) => {
                    error!(plugin = %self.name, error = %e, "error waiting for plugin");
                    return;
                }
            }
        }
    }
}

impl PluginInstance {
    fn new(manifest: PluginManifest) -> Self {
        Self {
            manifest,
            process: None,
            status: PluginStatus::Stopped,
            started_at: None,
            restart_count: 0,
            instance_id: Uuid::new_v4().to_string(),
        }
    }

    fn start(&mut self, global_env: &BTreeMap<String, String>) -> Result<(), PluginError> {
        if self.status == PluginStatus::Running {
            return Err(PluginError::AlreadyRunning(self.manifest.name.clone()));
        }

        let mut cmd = Command::new(&self.manifest.binary);
        cmd.args(&self.manifest.args).stdin(Stdio::null()).stdout(Stdio::inherit()).stderr(Stdio::inherit());
        cmd.envs(global_env);
        if let Some(env) = &self.manifest.env {
            cmd.envs(env);
        }
        cmd.env("CARBON_PLUGIN_NAME", &self.manifest.name);
        cmd.env("CARBON_PLUGIN_INSTANCE_ID", &self.instance_id);

        match cmd.spawn() {
            Ok(child) => {
                info!(plugin = %self.manifest.name, pid = child.id(), instance = %self.instance_id, "plugin started");
                self.process = Some(child);
                self.status = PluginStatus::Running;
                self.started_at = Some(OffsetDateTime::now_utc());
                Ok(())
            }
            Err(e) => {
                self.status = PluginStatus::Failed(format!("start failed: {e}"));
                Err(PluginError::StartFailed(format!("{}: {e}", self.manifest.name)))
            }
        }
    }

    /// Sends the kill and hands the process over for reaping
    fn kill(&mut self) -> Option<Exiting> {
        self.status = PluginStatus::Stopped;
        self.started_at = None;
        let mut process = self.process.take()?;
        if let Err(e) = process.kill() {
            debug!(plugin = %self.manifest.name, error = %e, "kill failed, process probably gone");
        }
        Some(Exiting {
            name: self.manifest.name.clone(),
            process,
            timeout: Duration::from_secs(self.manifest.shutdown_timeout_seconds),
        })
    }

    /// false once the process has exited
    fn check_health(&mut self) -> bool {
        let Some(process) = self.process.as_mut() else {
            return self.status != PluginStatus::Running;
        };
        match process.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                self.status = PluginStatus::Failed(format!("exited with {status}"));
                self.process = None;
                self.started_at = None;
                false
            }
            Err(e) => {
                self.status = PluginStatus::Failed(format!("health check error: {e}"));
                self.process = None;
                false
            }
        }
    }

    fn info(&self) -> PluginInfo {
        PluginInfo {
            name: self.manifest.name.clone(),
            version: self.manifest.version.clone(),
            kind: self.manifest.kind,
            description: self.manifest.description.clone(),
            status: self.status.clone(),
            uptime_seconds: self
                .started_at
                .map(|start| (OffsetDateTime::now_utc() - start).whole_seconds().max(0) as u64),
            restart_count: self.restart_count,
            pid: self.process.as_ref().map(|p| p.id()),
        }
    }
}

pub struct PluginManager {
    plugins: BTreeMap<String, PluginInstance>,
    plugins_dir: PathBuf,
    global_env: BTreeMap<String, String>,
}

impl PluginManager {
    pub fn new(plugins_dir: impl AsRef<Path>, mqtt: Option<&MqttConf>) -> Self {
        let mut global_env = BTreeMap::new();
        if let Some(mqtt) = mqtt {
            global_env.insert("CARBON_MQTT_HOST".to_string(), mqtt.host.clone());
            global_env.insert("CARBON_MQTT_PORT".to_string(), mqtt.port.to_string());
            global_env.insert("CARBON_EMISSIONS_TOPIC".to_string(), mqtt.emissions_topic.clone());
            global_env.insert("CARBON_METRICS_TOPIC".to_string(), mqtt.metrics_topic.clone());
        }
        Self { plugins: BTreeMap::new(), plugins_dir: plugins_dir.as_ref().to_path_buf(), global_env }
    }

    /// Loads every manifest of the plugins directory; a bad manifest is skipped
    pub async fn discover_plugins(&mut self) -> Result<Vec<String>, PluginError> {
        let mut discovered = Vec::new();
        let mut entries = fs::read_dir(&self.plugins_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            match self.load_manifest(&path).await {
                Ok(manifest) => {
                    let name = manifest.name.clone();
                    info!(plugin = %name, manifest = %path.display(), "plugin discovered");
                    self.plugins.insert(name.clone(), PluginInstance::new(manifest));
                    discovered.push(name);
                }
                Err(e) => warn!(manifest = %path.display(), error = %e, "invalid plugin manifest"),
            }
        }
        discovered.sort();
        Ok(discovered)
    }

    async fn load_manifest(&self, path: &Path) -> Result<PluginManifest, PluginError> {
        let content = fs::read_to_string(path).await?;
        let mut manifest: PluginManifest = serde_json::from_str(&content)?;

        if manifest.name.is_empty() {
            return Err(PluginError::ManifestError("name cannot be empty".to_string()));
        }
        if manifest.binary.is_relative() {
            manifest.binary = self.plugins_dir.join(&manifest.binary);
        }
        if !manifest.binary.exists() {
            return Err(PluginError::ManifestError(format!("binary not found: {}", manifest.binary.display())));
        }
        Ok(manifest)
    }

    pub fn start_plugin(&mut self, name: &str) -> Result<(), PluginError> {
        let plugin = self.plugins.get_mut(name).ok_or_else(|| PluginError::NotFound(name.to_string()))?;
        plugin.start(&self.global_env)
    }

    /// Kills the plugin; the returned handle waits for the process to exit
    pub fn stop_plugin(&mut self, name: &str) -> Result<Option<Exiting>, PluginError> {
        let plugin = self.plugins.get_mut(name).ok_or_else(|| PluginError::NotFound(name.to_string()))?;
        Ok(plugin.kill())
    }

    pub fn auto_start_plugins(&mut self) -> usize {
        let names: Vec<String> =
            self.plugins.values().filter(|p| p.manifest.auto_start).map(|p| p.manifest.name.clone()).collect();
        let mut started = 0;
        for name in names {
            match self.start_plugin(&name) {
                Ok(()) => started += 1,
                Err(e) => error!(plugin = %name, error = %e, "auto-start failed"),
            }
        }
        started
    }

    /// Restarts crashed plugins that still have restarts left
    pub fn health_check_all(&mut self) {
        for (name, plugin) in &mut self.plugins {
            if plugin.check_health() {
                continue;
            }
            if !plugin.manifest.restart_on_failure {
                warn!(plugin = %name, status = ?plugin.status, "plugin failed, restart disabled");
                continue;
            }
            if plugin.restart_count >= plugin.manifest.max_restarts {
                if plugin.status != PluginStatus::Exhausted {
                    error!(plugin = %name, restarts = plugin.restart_count, "plugin keeps failing, giving up");
                    plugin.status = PluginStatus::Exhausted;
                }
                continue;
            }
            plugin.restart_count += 1;
            warn!(plugin = %name, attempt = plugin.restart_count, "plugin failed, restarting");
            if let Err(e) = plugin.start(&self.global_env) {
                error!(plugin = %name, error = %e, "restart failed");
            }
        }
    }

    pub fn list_plugins(&self) -> Vec<PluginInfo> {
        self.plugins.values().map(PluginInstance::info).collect()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// True when a source plugin is known, running or not
    pub fn has_sources(&self) -> bool {
        self.plugins.values().any(|p| p.manifest.kind == PluginKind::Source)
    }

    /// Kills every running plugin and returns them for reaping
    pub fn kill_all(&mut self) -> Vec<Exiting> {
        self.plugins.values_mut().filter_map(PluginInstance::kill).collect()
    }
}

impl Drop for PluginManager {
    fn drop(&mut self) {
        let killed = self.kill_all();
        if !killed.is_empty() {
            warn!(killed = killed.len(), "plugin manager dropped with running plugins");
        }
    }
}

/// Kills every plugin under the lock, then waits for all of them outside it
pub async fn shutdown_plugins(plugins: &Shared<PluginManager>) {
    let exiting = plugins.lock().kill_all();
    if exiting.is_empty() {
        return;
    }
    let stopped = exiting.len();
    let mut waits = task::JoinSet::new();
    for process in exiting {
        waits.spawn(process.wait());
    }
    while waits.join_next().await.is_some() {}
    info!(stopped, "plugins shut down");
}

/// Periodic health check; the lock is only held for the check itself
pub fn spawn_plugin_health_monitor(plugins: Shared<PluginManager>, every: Duration) -> JoinHandle<()> {
    task::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.tick().await;
        loop {
            interval.tick().await;
            let running = {
                let mut manager = plugins.lock();
                manager.health_check_all();
                manager.list_plugins().iter().filter(|p| p.status == PluginStatus::Running).count()
            };
            debug!(running, "plugin health check");
        }
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    async fn manifest(dir: &Path, file: &str, json: serde_json::Value) {
        fs::write(dir.join(file), serde_json::to_vec(&json).unwrap()).await.unwrap();
    }

    #[tokio::test]
    async fn test_discovery_skips_bad_manifests() {
        let dir = tempfile::tempdir().unwrap();
        manifest(dir.path(), "ok.json", serde_json::json!({"name": "sleeper", "binary": "/bin/sleep"})).await;
        manifest(dir.path(), "nobin.json", serde_json::json!({"name": "ghost", "binary": "missing-bin"})).await;
        manifest(dir.path(), "noname.json", serde_json::json!({"binary": "/bin/sleep"})).await;
        fs::write(dir.path().join("notes.txt"), "ignored").await.unwrap();

        let mut pm = PluginManager::new(dir.path(), None);
        let found = pm.discover_plugins().await.unwrap();
        assert_eq!(found, vec!["sleeper"]);
        assert_eq!(pm.list_plugins()[0].status, PluginStatus::Stopped);
        assert!(matches!(pm.start_plugin("ghost"), Err(PluginError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let dir = tempfile::tempdir().unwrap();
        manifest(
            dir.path(),
            "sleeper.json",
            serde_json::json!({"name": "sleeper", "binary": "/bin/sleep", "args": ["30"], "auto_start": true}),
        )
        .await;
        let mqtt = MqttConf::default();
        let mut pm = PluginManager::new(dir.path(), Some(&mqtt));
        pm.discover_plugins().await.unwrap();

        assert_eq!(pm.auto_start_plugins(), 1);
        let info = &pm.list_plugins()[0];
        assert_eq!(info.status, PluginStatus::Running);
        assert!(info.pid.is_some());
        assert!(matches!(pm.start_plugin("sleeper"), Err(PluginError::AlreadyRunning(_))));

        let exiting = pm.stop_plugin("sleeper").unwrap().unwrap();
        assert_eq!(exiting.name(), "sleeper");
        assert_eq!(pm.list_plugins()[0].status, PluginStatus::Stopped);
        assert!(pm.list_plugins()[0].pid.is_none());
        tokio::time::timeout(Duration::from_secs(5), exiting.wait()).await.unwrap();
        assert!(pm.stop_plugin("sleeper").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_shutdown_reaps_every_running_plugin() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["one", "two"] {
            manifest(
                dir.path(),
                &format!("{name}.json"),
                serde_json::json!({"name": name, "binary": "/bin/sleep", "args": ["30"], "auto_start": true}),
            )
            .await;
        }
        let mut pm = PluginManager::new(dir.path(), None);
        pm.discover_plugins().await.unwrap();
        assert_eq!(pm.auto_start_plugins(), 2);
        let plugins = crate::state::new_state(pm);

        tokio::time::timeout(Duration::from_secs(5), shutdown_plugins(&plugins)).await.unwrap();
        assert!(plugins.try_lock().is_some());

        let infos = plugins.lock().list_plugins();
        assert!(infos.iter().all(|p| p.status == PluginStatus::Stopped && p.pid.is_none()));
    }

    #[tokio::test]
    async fn test_source_plugins_get_the_metrics_topic() {
        let dir = tempfile::tempdir().unwrap();
        manifest(
            dir.path(),
            "feed.json",
            serde_json::json!({"name": "feed", "binary": "/bin/sleep", "kind": "source"}),
        )
        .await;
        let mqtt = MqttConf::default();
        let mut pm = PluginManager::new(dir.path(), Some(&mqtt));
        assert!(!pm.has_sources());
        pm.discover_plugins().await.unwrap();

        assert!(pm.has_sources());
        assert_eq!(pm.list_plugins()[0].kind, PluginKind::Source);
        assert_eq!(pm.global_env["CARBON_METRICS_TOPIC"], "carbon/metrics@v1");
        assert_eq!(pm.global_env["CARBON_EMISSIONS_TOPIC"], "carbon/emissions@v1");
    }

    #[tokio::test]
    async fn test_crashed_plugin_restarts_until_budget_is_spent() {
        let dir = tempfile::tempdir().unwrap();
        manifest(
            dir.path(),
            "crash.json",
            serde_json::json!({"name": "crash", "binary": "/bin/sh", "args": ["-c", "exit 3"], "max_restarts": 2}),
        )
        .await;
        let mut pm = PluginManager::new(dir.path(), None);
        pm.discover_plugins().await.unwrap();
        pm.start_plugin("crash").unwrap();

        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(200)).await;
            pm.health_check_all();
        }
        let info = &pm.list_plugins()[0];
        assert_eq!(info.restart_count, 2);
        assert_eq!(info.status, PluginStatus::Exhausted);
    }
}
