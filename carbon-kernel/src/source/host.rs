use super::{InstanceMap, Source, SourceError};
use crate::models::{Instance, Metric, Provider, ResourceType, ResourceUnit};
use async_trait::async_trait;
use sysinfo::System;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Baremetal agent for the machine the kernel runs on
pub struct HostSource {
    region: String,
    kind: String,
}

impl HostSource {
    pub fn new(region: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { region: region.into(), kind: kind.into() }
    }

    fn host_id() -> String {
        System::host_name().unwrap_or_else(|| "localhost".to_string())
    }
}

#[async_trait]
impl Source for HostSource {
    fn name(&self) -> &str {
        "host"
    }

    async fn fetch(&self, cancel: &CancellationToken) -> Result<InstanceMap, SourceError> {
        let mut sys = System::new();
        sys.refresh_cpu_usage();
        sys.refresh_memory();
        // cpu usage is a delta between two refreshes
        let window = sysinfo::MINIMUM_CPU_UPDATE_INTERVAL.max(std::time::Duration::from_millis(200));
        tokio::select! {
            _ = cancel.cancelled() => return Err(SourceError::Cancelled),
            _ = tokio::time::sleep(window) => {}
        }
        sys.refresh_cpu_usage();

        let vcpus = sys.cpus().len();
        if vcpus == 0 {
            return Err(SourceError::Unavailable("no CPU reported by the OS".into()));
        }
        let cpu_usage = f64::from(sys.global_cpu_info().cpu_usage());

        let total = sys.total_memory() as f64;
        let used = sys.used_memory() as f64;
        let memory_usage = if total > 0.0 { used / total * 100.0 } else { 0.0 };

        let mut instance = Instance::new(Self::host_id(), Provider::Baremetal, &self.region, &self.kind)
            .with_service("host")
            .with_metric(Metric::cpu(cpu_usage, vcpus as f64))
            .with_metric(
                Metric::new(ResourceType::Memory.as_str(), ResourceType::Memory, ResourceUnit::Gb)
                    .with_usage(memory_usage)
                    .with_unit_amount(used / BYTES_PER_GB),
            );
        if let Some(os) = System::long_os_version() {
            instance = instance.with_label("os", os);
        }
        debug!(host = %instance.id, cpu = cpu_usage, memory = memory_usage, "host sampled");

        Ok(InstanceMap::from([(instance.id.clone(), instance)]))
    }
}
