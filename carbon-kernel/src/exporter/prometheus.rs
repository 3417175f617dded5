use super::{ExportError, Exporter};
use crate::models::Instance;
use async_trait::async_trait;
use parking_lot::RwLock;
use prometheus::{Encoder, GaugeVec, Opts, Registry, TextEncoder};
use std::collections::BTreeMap;
use tracing::debug;

const INSTANCE_LABELS: [&str; 6] = ["provider", "region", "zone", "kind", "service", "instance"];
const METRIC_LABELS: [&str; 8] = ["provider", "region", "zone", "kind", "service", "instance", "resource", "type"];

/// Label values currently exported for one instance
#[derive(Debug, Default)]
struct Series {
    metrics: Vec<Vec<String>>,
    instance: Vec<String>,
}

/// Emission gauges in a private registry, served in the text format.
///
/// Each instance owns its series; a new result replaces them wholesale and a
/// terminated instance removes them.
pub struct PrometheusExporter {
    registry: Registry,
    operational: GaugeVec,
    energy: GaugeVec,
    embodied: GaugeVec,
    series: RwLock<BTreeMap<String, Series>>,
}

impl PrometheusExporter {
    pub fn new() -> Result<Self, ExportError> {
        let operational = GaugeVec::new(
            Opts::new("carbon_operational_emissions_kg", "Operational emissions over the last interval, kgCO2e"),
            &METRIC_LABELS,
        )?;
        let energy =
            GaugeVec::new(Opts::new("carbon_energy_kwh", "Energy consumed over the last interval, kWh"), &METRIC_LABELS)?;
        let embodied = GaugeVec::new(
            Opts::new("carbon_embodied_emissions_kg", "Embodied emissions attributed over the last interval, kgCO2e"),
            &INSTANCE_LABELS,
        )?;

        let registry = Registry::new();
        registry.register(Box::new(operational.clone()))?;
        registry.register(Box::new(energy.clone()))?;
        registry.register(Box::new(embodied.clone()))?;

        Ok(Self { registry, operational, energy, embodied, series: RwLock::new(BTreeMap::new()) })
    }

    fn instance_values(instance: &Instance) -> Vec<String> {
        vec![
            instance.provider.to_string(),
            instance.region.clone(),
            instance.zone.clone(),
            instance.kind.clone(),
            instance.service.clone(),
            instance.id.clone(),
        ]
    }

    fn set(&self, instance: &Instance) -> Series {
        let base = Self::instance_values(instance);
        let mut series = Series::default();
        for metric in instance.metrics.values() {
            let mut values = base.clone();
            values.push(metric.name.clone());
            values.push(metric.resource_type.to_string());
            let refs = as_refs(&values);
            self.operational.with_label_values(&refs).set(metric.emissions.value());
            self.energy.with_label_values(&refs).set(metric.energy_kwh);
            series.metrics.push(values);
        }
        self.embodied.with_label_values(&as_refs(&base)).set(instance.embodied_emissions.value());
        series.instance = base;
        series
    }

    fn clear(&self, series: &Series) {
        for values in &series.metrics {
            let refs = as_refs(values);
            let _ = self.operational.remove_label_values(&refs);
            let _ = self.energy.remove_label_values(&refs);
        }
        let _ = self.embodied.remove_label_values(&as_refs(&series.instance));
    }

    /// Number of instances currently exported
    pub fn instances(&self) -> usize {
        self.series.read().len()
    }

    pub fn render(&self) -> Result<String, ExportError> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        String::from_utf8(buf).map_err(|e| ExportError::Transport(e.to_string()))
    }
}

#[async_trait]
impl Exporter for PrometheusExporter {
    fn name(&self) -> &str {
        "prometheus"
    }

    async fn send(&self, instance: &Instance) -> Result<(), ExportError> {
        let key = instance.correlation_key();
        let mut series = self.series.write();
        if let Some(old) = series.remove(&key) {
            self.clear(&old);
            if instance.is_terminated() {
                debug!(instance = %key, "series removed");
            }
        }
        if !instance.is_terminated() {
            series.insert(key, self.set(instance));
        }
        Ok(())
    }
}

fn as_refs(values: &[String]) -> Vec<&str> {
    values.iter().map(String::as_str).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{InstanceStatus, Metric, Provider, ResourceEmissions, ResourceType, ResourceUnit};

    fn calculated(id: &str) -> Instance {
        let mut cpu = Metric::cpu(27.0, 2.0);
        cpu.energy_kwh = 0.5;
        cpu.emissions = ResourceEmissions::kg(0.25);
        let mut i = Instance::new(id, Provider::Gcp, "europe-west4", "e2-medium").with_zone("europe-west4-a");
        i.upsert_metric(cpu);
        i.embodied_emissions = ResourceEmissions::kg(0.125);
        i
    }

    #[tokio::test]
    async fn test_render_text_format() {
        let prom = PrometheusExporter::new().unwrap();
        prom.send(&calculated("vm-1")).await.unwrap();
        let text = prom.render().unwrap();

        assert!(text.contains("# TYPE carbon_operational_emissions_kg gauge"));
        assert!(text.contains("# TYPE carbon_embodied_emissions_kg gauge"));
        let operational = text
            .lines()
            .find(|l| l.starts_with("carbon_operational_emissions_kg{"))
            .unwrap();
        for label in ["instance=\"vm-1\"", "provider=\"gcp\"", "resource=\"cpu\"", "type=\"cpu\"", "zone=\"europe-west4-a\""] {
            assert!(operational.contains(label), "{label} missing from {operational}");
        }
        assert!(operational.ends_with(" 0.25"));

        let energy = text.lines().find(|l| l.starts_with("carbon_energy_kwh{")).unwrap();
        assert!(energy.ends_with(" 0.5"));
        let embodied = text.lines().find(|l| l.starts_with("carbon_embodied_emissions_kg{")).unwrap();
        assert!(!embodied.contains("resource="));
        assert!(embodied.ends_with(" 0.125"));
    }

    #[tokio::test]
    async fn test_new_result_replaces_and_terminated_removes() {
        let prom = PrometheusExporter::new().unwrap();
        prom.send(&calculated("vm-1")).await.unwrap();
        prom.send(&calculated("vm-1")).await.unwrap();
        prom.send(&calculated("vm-2")).await.unwrap();
        assert_eq!(prom.instances(), 2);
        assert_eq!(prom.render().unwrap().matches("carbon_embodied_emissions_kg{").count(), 2);

        let gone = calculated("vm-1").with_status(InstanceStatus::Terminated);
        prom.send(&gone).await.unwrap();
        assert_eq!(prom.instances(), 1);
        let text = prom.render().unwrap();
        assert!(!text.contains("instance=\"vm-1\""));
        assert!(text.contains("instance=\"vm-2\""));
    }

    #[tokio::test]
    async fn test_dropped_metric_loses_its_series() {
        let prom = PrometheusExporter::new().unwrap();
        let mut first = calculated("vm-1");
        let mut memory = Metric::new("memory", ResourceType::Memory, ResourceUnit::Gb);
        memory.emissions = ResourceEmissions::kg(0.01);
        first.upsert_metric(memory);
        prom.send(&first).await.unwrap();
        assert!(prom.render().unwrap().contains("resource=\"memory\""));

        prom.send(&calculated("vm-1")).await.unwrap();
        let text = prom.render().unwrap();
        assert!(!text.contains("resource=\"memory\""));
        assert!(text.contains("resource=\"cpu\""));
    }

    #[tokio::test]
    async fn test_label_values_are_escaped() {
        let prom = PrometheusExporter::new().unwrap();
        let odd = calculated("vm-1").with_service("a\"b");
        prom.send(&odd).await.unwrap();
        assert!(prom.render().unwrap().contains("service=\"a\\\"b\""));
    }
}
