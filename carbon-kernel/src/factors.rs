/**
 * FACTORS - Reference data the calculator needs per provider
 *
 * FORMAT (YAML) :
 * gcp:
 *   average_pue: 1.1
 *   grid: { europe-west4: 0.39 }          # kgCO2e / kWh
 *   machines:
 *     n2-standard-2:
 *       vcpus: 2
 *       total_vcpus: 128
 *       total_embodied_kg: 1888.46
 *       memory_gb: 8
 *       min_watts: 0.71
 *       max_watts: 4.26
 *       cpu_curve: [{percentage: 0, wattage: 1.21}, ...]
 *       memory_curve: [...]
 */

use crate::calculator::{CalculationError, EmbodiedProfile, PowerCurve};
use crate::models::Provider;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;

#[derive(Debug, thiserror::Error)]
pub enum FactorsError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid emission factors: {0}")]
    Parse(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EmissionFactors {
    providers: BTreeMap<Provider, ProviderFactors>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderFactors {
    pub average_pue: f64,
    /// Region -> kgCO2e per kWh
    #[serde(default)]
    pub grid: BTreeMap<String, f64>,
    #[serde(default)]
    pub machines: BTreeMap<String, MachineProfile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineProfile {
    pub vcpus: f64,
    pub total_vcpus: f64,
    pub total_embodied_kg: f64,
    #[serde(default)]
    pub memory_gb: f64,
    #[serde(default)]
    pub min_watts: f64,
    #[serde(default)]
    pub max_watts: f64,
    #[serde(default)]
    pub cpu_curve: Option<PowerCurve>,
    #[serde(default)]
    pub memory_curve: Option<PowerCurve>,
}

impl EmissionFactors {
    pub async fn load(path: &Path) -> Result<Self, FactorsError> {
        let txt = fs::read_to_string(path)
            .await
            .map_err(|source| FactorsError::Io { path: path.to_path_buf(), source })?;
        Self::from_yaml(&txt)
    }

    pub fn from_yaml(txt: &str) -> Result<Self, FactorsError> {
        if txt.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(txt)?)
    }

    pub fn insert(&mut self, provider: Provider, factors: ProviderFactors) {
        self.providers.insert(provider, factors);
    }

    pub fn provider(&self, provider: Provider) -> Result<&ProviderFactors, CalculationError> {
        self.providers.get(&provider).ok_or(CalculationError::UnknownProvider(provider))
    }

    pub fn providers(&self) -> impl Iterator<Item = &Provider> {
        self.providers.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

impl ProviderFactors {
    pub fn grid_intensity(&self, region: &str) -> Result<f64, CalculationError> {
        self.grid.get(region).copied().ok_or_else(|| CalculationError::UnknownRegion(region.to_string()))
    }

    pub fn machine(&self, kind: &str) -> Result<&MachineProfile, CalculationError> {
        self.machines.get(kind).ok_or_else(|| CalculationError::UnknownMachine(kind.to_string()))
    }
}

impl MachineProfile {
    /// The measured curve, or min/max watts when it is missing or all zero
    pub fn cpu_power_curve(&self) -> Result<PowerCurve, CalculationError> {
        match &self.cpu_curve {
            Some(curve) if !curve.is_flat_zero() => Ok(curve.clone()),
            _ if self.min_watts == 0.0 && self.max_watts == 0.0 => Err(CalculationError::NoPowerData),
            _ => PowerCurve::linear(self.min_watts, self.max_watts),
        }
    }

    pub fn memory_power_curve(&self) -> Result<&PowerCurve, CalculationError> {
        self.memory_curve.as_ref().ok_or(CalculationError::NoPowerData)
    }

    pub fn embodied_profile(&self) -> EmbodiedProfile {
        EmbodiedProfile {
            total_embodied_kg: self.total_embodied_kg,
            total_vcpus: self.total_vcpus,
            instance_vcpus: self.vcpus,
        }
    }
}
