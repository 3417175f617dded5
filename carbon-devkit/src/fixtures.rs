/*!
Reference fixtures

One GCP machine with a measured CPU curve, used across the pipeline tests:
at 27% CPU on 2 vCPUs for one hour it draws 0.010648234420731708 kWh, and
its embodied share for that hour is 0.014573178272450533 kgCO2e.
*/

use carbon_kernel::factors::{EmissionFactors, FactorsError};
use carbon_kernel::models::{Instance, Metric, Provider, ResourceType, ResourceUnit};

pub const REGION: &str = "europe-west4";
pub const MACHINE: &str = "e2-medium";
pub const PUE: f64 = 1.1;
/// kgCO2e per kWh in `REGION`
pub const GRID_INTENSITY: f64 = 0.5;

pub const FACTORS_YAML: &str = r#"
gcp:
  average_pue: 1.1
  grid:
    europe-west4: 0.5
  machines:
    e2-medium:
      vcpus: 2
      total_vcpus: 32
      total_embodied_kg: 12255.46
      memory_gb: 4
      min_watts: 0.71
      max_watts: 4.26
      cpu_curve:
        - {percentage: 0, wattage: 1.21}
        - {percentage: 10, wattage: 3.05}
        - {percentage: 50, wattage: 7.16}
        - {percentage: 100, wattage: 9.96}
      memory_curve:
        - {percentage: 0, wattage: 1}
        - {percentage: 100, wattage: 3}
"#;

/// Energy of the reference machine at 27% CPU for one hour
pub const CPU_27_KWH: f64 = 0.005324117210365854 * 2.0;
/// Embodied share of the reference machine for one hour
pub const EMBODIED_HOUR_KG: f64 = 0.014573178272450533;

pub fn factors() -> Result<EmissionFactors, FactorsError> {
    EmissionFactors::from_yaml(FACTORS_YAML)
}

/// Running instance of the reference machine with one CPU metric
pub fn gcp_instance(id: &str, cpu_usage: f64) -> Instance {
    Instance::new(id, Provider::Gcp, REGION, MACHINE)
        .with_service("compute")
        .with_metric(Metric::cpu(cpu_usage, 2.0))
}

/// Same machine in a region the dataset does not know
pub fn unknown_region_instance(id: &str) -> Instance {
    Instance::new(id, Provider::Gcp, "mars-north1", MACHINE).with_metric(Metric::cpu(50.0, 2.0))
}

pub fn memory_metric(usage: f64, used_gb: f64) -> Metric {
    Metric::new(ResourceType::Memory.as_str(), ResourceType::Memory, ResourceUnit::Gb)
        .with_usage(usage)
        .with_unit_amount(used_gb)
}
