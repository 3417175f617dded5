use crate::bus::BusStatsSnapshot;
use crate::scheduler::{ScraperState, ScraperStates};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;
use sysinfo::System;

#[derive(Debug, Serialize)]
pub struct KernelHealth {
    pub uptime_seconds: u64,
    pub memory_usage_mb: f32,
    pub mqtt_status: String,
    pub mqtt_reconnects: u32,
    pub bus: BusStatsSnapshot,
    pub scrapers: BTreeMap<String, ScraperState>,
    pub plugins: usize,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    mqtt_reconnects: Arc<AtomicU32>,
    mqtt_status: Arc<Mutex<String>>,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            mqtt_reconnects: Arc::new(AtomicU32::new(0)),
            mqtt_status: Arc::new(Mutex::new("disabled".to_string())),
        }
    }

    pub fn mark_mqtt_connecting(&self) {
        *self.mqtt_status.lock() = "connecting".to_string();
    }

    pub fn mark_mqtt_connected(&self) {
        *self.mqtt_status.lock() = "connected".to_string();
    }

    pub fn mark_mqtt_disconnected(&self) {
        *self.mqtt_status.lock() = "disconnected".to_string();
    }

    pub fn increment_reconnects(&self) {
        self.mqtt_reconnects.fetch_add(1, Ordering::Relaxed);
        *self.mqtt_status.lock() = "reconnecting".to_string();
    }

    pub fn get_health(&self, bus: BusStatsSnapshot, scrapers: &ScraperStates, plugins: usize) -> KernelHealth {
        KernelHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            memory_usage_mb: get_memory_usage_mb(),
            mqtt_status: self.mqtt_status.lock().clone(),
            mqtt_reconnects: self.mqtt_reconnects.load(Ordering::Relaxed),
            bus,
            scrapers: scrapers.lock().clone(),
            plugins,
        }
    }
}

/// Resident set size of this process, 0 when unknown
fn get_memory_usage_mb() -> f32 {
    let Ok(pid) = sysinfo::get_current_pid() else {
        return 0.0;
    };
    let mut sys = System::new();
    if !sys.refresh_process(pid) {
        return 0.0;
    }
    sys.process(pid).map_or(0.0, |p| p.memory() as f32 / (1024.0 * 1024.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::new_state;

    #[test]
    fn test_mqtt_status_transitions() {
        let tracker = HealthTracker::new();
        let scrapers = new_state(BTreeMap::from([("lab".to_string(), ScraperState::Running)]));
        let stats = BusStatsSnapshot { published: 3, delivered: 2, failed: 1, rejected: 0 };

        assert_eq!(tracker.get_health(stats, &scrapers, 0).mqtt_status, "disabled");
        tracker.mark_mqtt_connecting();
        tracker.increment_reconnects();
        tracker.increment_reconnects();
        tracker.mark_mqtt_connected();

        let health = tracker.get_health(stats, &scrapers, 2);
        assert_eq!(health.mqtt_status, "connected");
        assert_eq!(health.mqtt_reconnects, 2);
        assert_eq!(health.bus.failed, 1);
        assert_eq!(health.scrapers["lab"], ScraperState::Running);

        let json = serde_json::to_value(&health).unwrap();
        assert_eq!(json["scrapers"]["lab"], "running");
        assert_eq!(json["plugins"], 2);
    }

    #[test]
    fn test_memory_usage_of_running_process() {
        let mb = get_memory_usage_mb();
        assert!(mb > 0.0);
        // a test binary is nowhere near this
        assert!(mb < 64.0 * 1024.0);
    }
}
