use super::power::PowerCurve;
use super::CalculationError;
use crate::models::{Metric, ResourceUnit};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Assumed service life of cloud server hardware
pub const SERVER_LIFESPAN_YEARS: f64 = 6.0;

const HOURS_PER_YEAR: f64 = 24.0 * 365.0;

/// Fraction of the server lifespan that one hour represents
const LIFESPAN_HOUR_FRACTION: f64 = 1.0 / (HOURS_PER_YEAR * SERVER_LIFESPAN_YEARS);

/// Inputs shared by every metric of one instance
#[derive(Debug, Clone, Copy)]
pub struct OperationalParams<'a> {
    pub interval: Duration,
    /// Datacenter power usage effectiveness
    pub pue: f64,
    /// kgCO2e per kWh of the region grid
    pub grid_intensity: f64,
    /// vCPU count from reference data, 0 when unknown
    pub vcpus: f64,
    pub curve: &'a PowerCurve,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OperationalEstimate {
    pub energy_kwh: f64,
    pub emissions_kg: f64,
}

fn hours(interval: Duration) -> f64 {
    interval.as_secs_f64() / 60.0 / 60.0
}

/// CPU energy and emissions for one sample over the interval.
///
/// The vCPU count comes from the params, else from the sample `unit_amount`.
pub fn cpu_emissions(metric: &Metric, p: &OperationalParams<'_>) -> Result<OperationalEstimate, CalculationError> {
    let vcpus = if p.vcpus > 0.0 { p.vcpus } else { metric.unit_amount };
    if vcpus.is_nan() || vcpus <= 0.0 {
        return Err(CalculationError::MissingVcpuCount);
    }
    let vcpu_hours = vcpus * hours(p.interval);
    let energy_kwh = p.curve.kilowatts_at(metric.usage()) * vcpu_hours;
    Ok(OperationalEstimate { energy_kwh, emissions_kg: energy_kwh * p.pue * p.grid_intensity })
}

/// Memory energy from the machine memory curve, integrated over the interval.
///
/// An unreported usage falls back to used GB over `memory_gb`, then to 50%.
pub fn memory_emissions(
    metric: &Metric,
    memory_gb: f64,
    p: &OperationalParams<'_>,
) -> Result<OperationalEstimate, CalculationError> {
    let usage = effective_memory_usage(metric, memory_gb);
    let energy_kwh = p.curve.kilowatts_at(usage) * hours(p.interval);
    Ok(OperationalEstimate { energy_kwh, emissions_kg: energy_kwh * p.pue * p.grid_intensity })
}

pub fn effective_memory_usage(metric: &Metric, memory_gb: f64) -> f64 {
    if metric.usage() > 0.0 {
        return metric.usage();
    }
    if metric.unit == ResourceUnit::Gb && metric.unit_amount > 0.0 && memory_gb > 0.0 {
        return (metric.unit_amount / memory_gb * 100.0).clamp(0.0, 100.0);
    }
    50.0
}

/// Emissions of energy already measured upstream
pub fn measured_emissions(energy_kwh: f64, pue: f64, grid_intensity: f64) -> OperationalEstimate {
    OperationalEstimate { energy_kwh, emissions_kg: energy_kwh * pue * grid_intensity }
}

/// How much of a shared server's manufacturing footprint an instance carries
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EmbodiedProfile {
    pub total_embodied_kg: f64,
    pub total_vcpus: f64,
    pub instance_vcpus: f64,
}

impl EmbodiedProfile {
    /// kgCO2e per hour attributed to the instance
    pub fn hourly_share(&self) -> Result<f64, CalculationError> {
        if self.total_vcpus.is_nan() || self.total_vcpus <= 0.0 {
            return Err(CalculationError::InvalidEmbodiedProfile("total vCPUs on server is zero".into()));
        }
        if self.instance_vcpus < 0.0 || self.total_embodied_kg < 0.0 {
            return Err(CalculationError::InvalidEmbodiedProfile("negative footprint or vCPU count".into()));
        }
        Ok(self.total_embodied_kg * LIFESPAN_HOUR_FRACTION * (self.instance_vcpus / self.total_vcpus))
    }

    pub fn for_interval(&self, interval: Duration) -> Result<f64, CalculationError> {
        Ok((self.hourly_share()? * hours(interval)).max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calculator::power::PowerPoint;
    use crate::models::ResourceType;

    fn minutes(m: u64) -> Duration {
        Duration::from_secs(m * 60)
    }

    fn params(curve: &PowerCurve) -> OperationalParams<'_> {
        OperationalParams { interval: minutes(30), pue: 1.1, grid_intensity: 0.4, vcpus: 0.0, curve }
    }

    #[test]
    fn test_hourly_share_reference_values() {
        let a = EmbodiedProfile { total_embodied_kg: 12255.46, total_vcpus: 32.0, instance_vcpus: 2.0 };
        assert_eq!(a.hourly_share().unwrap(), 0.014573178272450533);
        let b = EmbodiedProfile { total_embodied_kg: 1888.46, total_vcpus: 128.0, instance_vcpus: 2.0 };
        assert_eq!(b.hourly_share().unwrap(), 0.0005614000665905632);
    }

    #[test]
    fn test_embodied_for_interval() {
        let p = EmbodiedProfile { total_embodied_kg: 1000.0, total_vcpus: 10.0, instance_vcpus: 5.0 };
        let hourly = p.hourly_share().unwrap();
        assert!((p.for_interval(minutes(30)).unwrap() - hourly / 2.0).abs() < 1e-18);
        assert_eq!(p.for_interval(Duration::ZERO).unwrap(), 0.0);
    }

    #[test]
    fn test_malformed_embodied_profile() {
        let p = EmbodiedProfile { total_embodied_kg: 1000.0, total_vcpus: 0.0, instance_vcpus: 2.0 };
        assert!(matches!(p.hourly_share(), Err(CalculationError::InvalidEmbodiedProfile(_))));
        let neg = EmbodiedProfile { total_embodied_kg: -1.0, total_vcpus: 8.0, instance_vcpus: 2.0 };
        assert!(neg.for_interval(minutes(5)).is_err());
    }

    #[test]
    fn test_cpu_linear_formula() {
        let curve = PowerCurve::linear(10.0, 20.0).unwrap();
        let metric = Metric::cpu(50.0, 4.0);
        let est = cpu_emissions(&metric, &params(&curve)).unwrap();
        // 0.015 kW * (4 vCPU * 0.5 h)
        assert!((est.energy_kwh - 0.03).abs() < 1e-15);
        assert!((est.emissions_kg - 0.03 * 1.1 * 0.4).abs() < 1e-15);
    }

    #[test]
    fn test_cpu_scales_with_inputs() {
        let curve = PowerCurve::new(vec![
            PowerPoint::new(0.0, 1.21),
            PowerPoint::new(10.0, 3.05),
            PowerPoint::new(50.0, 7.16),
            PowerPoint::new(100.0, 9.96),
        ])
        .unwrap();
        let metric = Metric::cpu(27.0, 2.0);
        let base = cpu_emissions(&metric, &params(&curve)).unwrap().emissions_kg;

        let doubled = cpu_emissions(&Metric::cpu(27.0, 4.0), &params(&curve)).unwrap().emissions_kg;
        assert!((doubled - 2.0 * base).abs() < 1e-15);

        for tweak in [
            OperationalParams { interval: minutes(60), ..params(&curve) },
            OperationalParams { pue: 1.5, ..params(&curve) },
            OperationalParams { grid_intensity: 0.8, ..params(&curve) },
        ] {
            assert!(cpu_emissions(&metric, &tweak).unwrap().emissions_kg > base);
        }
    }

    #[test]
    fn test_cpu_vcpu_resolution() {
        let curve = PowerCurve::linear(10.0, 20.0).unwrap();
        let no_amount = Metric::cpu(50.0, 0.0);
        assert!(matches!(cpu_emissions(&no_amount, &params(&curve)), Err(CalculationError::MissingVcpuCount)));

        let explicit = OperationalParams { vcpus: 2.0, ..params(&curve) };
        let from_params = cpu_emissions(&no_amount, &explicit).unwrap();
        let from_metric = cpu_emissions(&Metric::cpu(50.0, 2.0), &params(&curve)).unwrap();
        assert_eq!(from_params, from_metric);
    }

    #[test]
    fn test_memory_usage_fallbacks() {
        let reported = Metric::new("memory", ResourceType::Memory, ResourceUnit::Gb).with_usage(30.0);
        assert_eq!(effective_memory_usage(&reported, 16.0), 30.0);

        let used_gb = Metric::new("memory", ResourceType::Memory, ResourceUnit::Gb).with_unit_amount(4.0);
        assert_eq!(effective_memory_usage(&used_gb, 16.0), 25.0);

        let unknown = Metric::new("memory", ResourceType::Memory, ResourceUnit::Mb).with_unit_amount(4.0);
        assert_eq!(effective_memory_usage(&unknown, 16.0), 50.0);
    }

    #[test]
    fn test_memory_energy_over_interval() {
        let curve = PowerCurve::linear(2.0, 4.0).unwrap();
        let metric = Metric::new("memory", ResourceType::Memory, ResourceUnit::Gb).with_usage(50.0);
        let est = memory_emissions(&metric, 16.0, &params(&curve)).unwrap();
        // 3 W for half an hour
        assert!((est.energy_kwh - 0.0015).abs() < 1e-15);
    }

    #[test]
    fn test_measured_energy() {
        let est = measured_emissions(2.0, 1.2, 0.5);
        assert_eq!(est.energy_kwh, 2.0);
        assert!((est.emissions_kg - 1.2).abs() < 1e-15);
    }
}
