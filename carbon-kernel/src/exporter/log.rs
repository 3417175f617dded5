use super::{ExportError, Exporter};
use crate::models::Instance;
use async_trait::async_trait;
use tracing::info;

/// One structured line per calculated instance
#[derive(Debug, Default)]
pub struct LogExporter;

#[async_trait]
impl Exporter for LogExporter {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, instance: &Instance) -> Result<(), ExportError> {
        if instance.is_terminated() {
            info!(provider = %instance.provider, region = %instance.region, instance = %instance.id, "instance terminated");
            return Ok(());
        }
        let energy: f64 = instance.metrics.values().map(|m| m.energy_kwh).sum();
        info!(
            provider = %instance.provider,
            region = %instance.region,
            instance = %instance.id,
            kind = %instance.kind,
            energy_kwh = energy,
            operational_kg = instance.operational_emissions().value(),
            embodied_kg = instance.embodied_emissions.value(),
            "emissions"
        );
        Ok(())
    }
}
