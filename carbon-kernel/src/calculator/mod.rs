/**
 * CALCULATOR - Utilization samples to emission figures
 *
 * ROLE :
 * Pure functions (power curves, operational and embodied emissions) plus the
 * bus handler that applies them to every `MetricsCollected` instance and
 * republishes the result as `EmissionsCalculated`.
 *
 * ERRORS :
 * Nothing is ever defaulted to zero. A metric that cannot be estimated is
 * logged and removed from the published instance, so consumers never see a
 * zero that was not measured. A missing provider, region, machine or
 * embodied profile aborts the whole instance.
 */

mod emissions;
mod power;

pub use emissions::{
    cpu_emissions, effective_memory_usage, measured_emissions, memory_emissions, EmbodiedProfile,
    OperationalEstimate, OperationalParams, SERVER_LIFESPAN_YEARS,
};
pub use power::{PowerCurve, PowerPoint};

use crate::bus::{Event, EventHandler, Payload, Publisher};
use crate::config::ConfigStore;
use crate::factors::EmissionFactors;
use crate::models::{Instance, Provider, ResourceEmissions, ResourceType};
use anyhow::Context;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum CalculationError {
    #[error("no power data for this machine")]
    NoPowerData,
    #[error("invalid power curve: {0}")]
    InvalidPowerCurve(String),
    #[error("vCPU count is zero or unknown")]
    MissingVcpuCount,
    #[error("invalid embodied profile: {0}")]
    InvalidEmbodiedProfile(String),
    #[error("{0} emissions are not calculated yet")]
    UnsupportedResource(ResourceType),
    #[error("no emission factors for provider {0}")]
    UnknownProvider(Provider),
    #[error("region {0} not found in emission factors")]
    UnknownRegion(String),
    #[error("machine kind {0} not found in emission factors")]
    UnknownMachine(String),
}

/// Compute every metric and the embodied share of one instance.
///
/// Terminated instances come back unchanged.
pub fn calculate(
    factors: &EmissionFactors,
    mut instance: Instance,
    interval: Duration,
) -> Result<Instance, CalculationError> {
    if instance.is_terminated() {
        return Ok(instance);
    }

    let provider = factors.provider(instance.provider)?;
    let grid_intensity = provider.grid_intensity(&instance.region)?;
    let machine = provider.machine(&instance.kind)?;
    let embodied = machine.embodied_profile().for_interval(interval)?;
    let cpu_curve = machine.cpu_power_curve();
    let mut skipped = Vec::new();

    for metric in instance.metrics.values_mut() {
        let estimate = if metric.energy_kwh > 0.0 {
            Ok(measured_emissions(metric.energy_kwh, provider.average_pue, grid_intensity))
        } else {
            match metric.resource_type {
                ResourceType::Cpu => cpu_curve.clone().and_then(|curve| {
                    let params = OperationalParams {
                        interval,
                        pue: provider.average_pue,
                        grid_intensity,
                        vcpus: machine.vcpus,
                        curve: &curve,
                    };
                    cpu_emissions(metric, &params)
                }),
                ResourceType::Memory => machine.memory_power_curve().and_then(|curve| {
                    let params = OperationalParams {
                        interval,
                        pue: provider.average_pue,
                        grid_intensity,
                        vcpus: machine.vcpus,
                        curve,
                    };
                    memory_emissions(metric, machine.memory_gb, &params)
                }),
                other => Err(CalculationError::UnsupportedResource(other)),
            }
        };

        match estimate {
            Ok(est) => {
                metric.energy_kwh = est.energy_kwh;
                metric.emissions = ResourceEmissions::kg(est.emissions_kg);
            }
            Err(e) => {
                warn!(instance = %instance.id, metric = %metric.name, error = %e, "metric skipped");
                skipped.push(metric.name.clone());
            }
        }
    }
    for name in &skipped {
        instance.metrics.remove(name);
    }

    instance.embodied_emissions = ResourceEmissions::kg(embodied);
    Ok(instance)
}

/// Bus subscriber on `MetricsCollected`
pub struct CalculatorHandler {
    factors: Arc<EmissionFactors>,
    config: ConfigStore,
    publisher: Publisher,
}

impl CalculatorHandler {
    pub fn new(factors: Arc<EmissionFactors>, config: ConfigStore, publisher: Publisher) -> Self {
        Self { factors, config, publisher }
    }
}

#[async_trait]
impl EventHandler for CalculatorHandler {
    fn name(&self) -> &str {
        "calculator"
    }

    async fn handle(&self, event: Arc<Event>) -> anyhow::Result<()> {
        let Payload::MetricsCollected(instance) = event.payload() else {
            return Ok(());
        };
        // read per event so a reload applies to the next sample
        let interval = self.config.current().interval();

        let calculated = calculate(&self.factors, instance.clone(), interval)
            .with_context(|| format!("calculating emissions for {}", event.correlation_key()))?;
        debug!(
            instance = %calculated.id,
            operational_kg = calculated.operational_emissions().value(),
            embodied_kg = calculated.embodied_emissions.value(),
            "emissions calculated"
        );

        self.publisher
            .publish(Event::new(event.correlation_key(), Payload::EmissionsCalculated(calculated)))
            .await
            .with_context(|| format!("publishing emissions for {}", event.correlation_key()))
    }
}
