/**
 * MODELS - Polled compute resources and their emission figures
 *
 * ROLE :
 * Data carried on the bus: an `Instance` (one compute resource as seen by a
 * Source during one poll cycle) and its per-resource `Metric` samples.
 *
 * LIFECYCLE :
 * - Sources build a fresh `Instance` every cycle and publish it by value
 * - The calculator fills `energy_kwh` / `emissions` on each metric and the
 *   instance embodied emissions, then republishes the snapshot
 * - Exporters read it and drop it; nothing here outlives a cycle
 */

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use time::OffsetDateTime;

/// Provider a resource was discovered on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Aws,
    Gcp,
    Azure,
    Baremetal,
    #[default]
    Custom,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Aws => "aws",
            Provider::Gcp => "gcp",
            Provider::Azure => "azure",
            Provider::Baremetal => "baremetal",
            Provider::Custom => "custom",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of hardware resource a metric samples
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Cpu,
    Memory,
    Storage,
    Network,
}

impl ResourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Cpu => "cpu",
            ResourceType::Memory => "memory",
            ResourceType::Storage => "storage",
            ResourceType::Network => "network",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unit of `Metric::unit_amount`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceUnit {
    #[serde(rename = "vCPU")]
    VCpu,
    #[serde(rename = "KB")]
    Kb,
    #[serde(rename = "MB")]
    Mb,
    #[serde(rename = "GB")]
    Gb,
    #[serde(rename = "TB")]
    Tb,
    /// Bandwidth, megabits per second
    #[serde(rename = "Mbps")]
    Mbps,
    #[serde(rename = "Gbps")]
    Gbps,
}

/// Unit of an emission figure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum EmissionUnit {
    #[default]
    #[serde(rename = "kgCO2e")]
    KgCO2e,
    #[serde(rename = "gCO2e")]
    GCO2e,
}

impl fmt::Display for EmissionUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmissionUnit::KgCO2e => f.write_str("kgCO2e"),
            EmissionUnit::GCO2e => f.write_str("gCO2e"),
        }
    }
}

/// Lifecycle status reported by the source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    #[default]
    Running,
    Stopped,
    Terminated,
    Unknown,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Running => "running",
            InstanceStatus::Stopped => "stopped",
            InstanceStatus::Terminated => "terminated",
            InstanceStatus::Unknown => "unknown",
        }
    }
}

/// An emission figure. Never negative: negative inputs clamp to zero.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct ResourceEmissions {
    value: f64,
    unit: EmissionUnit,
}

impl ResourceEmissions {
    pub fn new(value: f64, unit: EmissionUnit) -> Self {
        // NaN also lands on zero
        let value = if value > 0.0 { value } else { 0.0 };
        Self { value, unit }
    }

    pub fn kg(value: f64) -> Self {
        Self::new(value, EmissionUnit::KgCO2e)
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn unit(&self) -> EmissionUnit {
        self.unit
    }
}

impl<'de> Deserialize<'de> for ResourceEmissions {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Raw {
            value: f64,
            #[serde(default)]
            unit: EmissionUnit,
        }
        let raw = Raw::deserialize(deserializer)?;
        Ok(ResourceEmissions::new(raw.value, raw.unit))
    }
}

pub type Labels = BTreeMap<String, String>;

/// One resource-type sample on an instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    /// Unique per instance (a VM with two disks has two storage metrics)
    pub name: String,
    pub resource_type: ResourceType,
    /// 0..=100, see `set_usage`
    #[serde(rename = "usage_percent", deserialize_with = "clamped_percent")]
    usage_percent: f64,
    /// vCPU count, memory size, disk size...
    #[serde(default)]
    pub unit_amount: f64,
    pub unit: ResourceUnit,
    #[serde(default)]
    pub energy_kwh: f64,
    #[serde(default)]
    pub emissions: ResourceEmissions,
    #[serde(with = "time::serde::rfc3339", default = "OffsetDateTime::now_utc")]
    pub updated_at: OffsetDateTime,
    #[serde(default)]
    pub labels: Labels,
}

impl Metric {
    pub fn new(name: impl Into<String>, resource_type: ResourceType, unit: ResourceUnit) -> Self {
        Self {
            name: name.into(),
            resource_type,
            usage_percent: 0.0,
            unit_amount: 0.0,
            unit,
            energy_kwh: 0.0,
            emissions: ResourceEmissions::default(),
            updated_at: OffsetDateTime::now_utc(),
            labels: Labels::new(),
        }
    }

    /// CPU sample for `vcpus` virtual CPUs at `usage` percent
    pub fn cpu(usage: f64, vcpus: f64) -> Self {
        Self::new(ResourceType::Cpu.as_str(), ResourceType::Cpu, ResourceUnit::VCpu)
            .with_usage(usage)
            .with_unit_amount(vcpus)
    }

    pub fn usage(&self) -> f64 {
        self.usage_percent
    }

    pub fn set_usage(&mut self, usage: f64) {
        self.usage_percent = clamp_percent(usage);
    }

    pub fn with_usage(mut self, usage: f64) -> Self {
        self.set_usage(usage);
        self
    }

    pub fn with_unit_amount(mut self, amount: f64) -> Self {
        self.unit_amount = amount;
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn touch(&mut self) {
        self.updated_at = OffsetDateTime::now_utc();
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "type:{} name:{} | amount:{} {:?} | usage:{}%",
            self.resource_type, self.name, self.unit_amount, self.unit, self.usage_percent
        )?;
        if self.emissions.value() > 0.0 {
            write!(f, " => {} {}", self.emissions.value(), self.emissions.unit())?;
        }
        Ok(())
    }
}

fn clamp_percent(value: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(0.0, 100.0)
}

fn clamped_percent<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    Ok(clamp_percent(f64::deserialize(deserializer)?))
}

/// Metrics of one instance keyed by metric name
pub type Metrics = BTreeMap<String, Metric>;

/// A polled compute resource, published by value on the bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    #[serde(default)]
    pub provider: Provider,
    /// Service family, e.g. "compute" or "ec2"
    #[serde(default)]
    pub service: String,
    pub region: String,
    #[serde(default)]
    pub zone: String,
    /// Machine kind, e.g. n2-standard-8 or m6i.2xlarge
    pub kind: String,
    #[serde(default)]
    pub status: InstanceStatus,
    #[serde(default)]
    pub metrics: Metrics,
    #[serde(default)]
    pub embodied_emissions: ResourceEmissions,
    #[serde(default)]
    pub labels: Labels,
}

impl Instance {
    pub fn new(
        id: impl Into<String>,
        provider: Provider,
        region: impl Into<String>,
        kind: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            provider,
            service: String::new(),
            region: region.into(),
            zone: String::new(),
            kind: kind.into(),
            status: InstanceStatus::Running,
            metrics: Metrics::new(),
            embodied_emissions: ResourceEmissions::default(),
            labels: Labels::new(),
        }
    }

    /// Bus routing key: events for the same resource are never handled concurrently
    pub fn correlation_key(&self) -> String {
        format!("{}/{}/{}", self.provider, self.region, self.id)
    }

    pub fn upsert_metric(&mut self, metric: Metric) -> &mut Self {
        self.metrics.insert(metric.name.clone(), metric);
        self
    }

    pub fn with_metric(mut self, metric: Metric) -> Self {
        self.upsert_metric(metric);
        self
    }

    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = service.into();
        self
    }

    pub fn with_zone(mut self, zone: impl Into<String>) -> Self {
        self.zone = zone.into();
        self
    }

    pub fn with_status(mut self, status: InstanceStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn is_terminated(&self) -> bool {
        self.status == InstanceStatus::Terminated
    }

    /// Sum of the operational emissions of every metric
    pub fn operational_emissions(&self) -> ResourceEmissions {
        ResourceEmissions::kg(self.metrics.values().map(|m| m.emissions.value()).sum())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_is_clamped() {
        let mut m = Metric::cpu(150.0, 2.0);
        assert_eq!(m.usage(), 100.0);
        m.set_usage(-3.0);
        assert_eq!(m.usage(), 0.0);
        m.set_usage(f64::NAN);
        assert_eq!(m.usage(), 0.0);
        m.set_usage(42.5);
        assert_eq!(m.usage(), 42.5);
    }

    #[test]
    fn test_emissions_never_negative() {
        assert_eq!(ResourceEmissions::kg(-1.0).value(), 0.0);
        assert_eq!(ResourceEmissions::kg(0.25).value(), 0.25);

        let parsed: ResourceEmissions =
            serde_json::from_str(r#"{"value": -4.2, "unit": "gCO2e"}"#).unwrap();
        assert_eq!(parsed.value(), 0.0);
        assert_eq!(parsed.unit(), EmissionUnit::GCO2e);
    }

    #[test]
    fn test_deserialized_usage_is_clamped() {
        let yaml = r#"
name: cpu
resource_type: cpu
usage_percent: 140
unit_amount: 4
unit: vCPU
"#;
        let metric: Metric = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(metric.usage(), 100.0);
        assert_eq!(metric.unit, ResourceUnit::VCpu);
    }

    #[test]
    fn test_instance_helpers() {
        let mut i = Instance::new("vm-1", Provider::Gcp, "europe-west4", "n2-standard-2")
            .with_metric(Metric::cpu(20.0, 2.0));
        assert_eq!(i.correlation_key(), "gcp/europe-west4/vm-1");
        assert!(!i.is_terminated());

        let mut cpu = Metric::cpu(30.0, 2.0);
        cpu.emissions = ResourceEmissions::kg(0.5);
        i.upsert_metric(cpu);
        let mut mem = Metric::new("memory", ResourceType::Memory, ResourceUnit::Gb);
        mem.emissions = ResourceEmissions::kg(0.25);
        i.upsert_metric(mem);

        assert_eq!(i.metrics.len(), 2);
        assert_eq!(i.metrics["cpu"].usage(), 30.0);
        assert_eq!(i.operational_emissions().value(), 0.75);
    }
}
