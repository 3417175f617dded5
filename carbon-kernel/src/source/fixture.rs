use super::{InstanceMap, Source, SourceError};
use crate::cache::{CacheEntry, ResourceCache};
use crate::models::{Instance, Provider, ResourceType};
use async_trait::async_trait;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Reads a YAML list of instances on every fetch.
///
/// Used for static inventories and for drop folders filled by third-party
/// collectors. Keeps a resource cache in step with the file: live instances
/// are upserted, terminated or vanished ones are deleted.
pub struct FixtureSource {
    name: String,
    provider: Provider,
    path: PathBuf,
    cache: Arc<ResourceCache>,
}

impl FixtureSource {
    pub fn new(name: impl Into<String>, provider: Provider, path: impl Into<PathBuf>) -> Self {
        Self { name: name.into(), provider, path: path.into(), cache: Arc::new(ResourceCache::new()) }
    }

    pub fn cache(&self) -> Arc<ResourceCache> {
        self.cache.clone()
    }

    async fn read(&self) -> Result<Vec<Instance>, SourceError> {
        let txt = fs::read_to_string(&self.path)
            .await
            .map_err(|source| SourceError::Io { path: self.path.clone(), source })?;
        if txt.trim().is_empty() {
            return Ok(vec![]);
        }
        serde_yaml::from_str(&txt).map_err(|source| SourceError::Parse { path: self.path.clone(), source })
    }

    fn sync_cache(&self, instances: &InstanceMap) {
        let mut seen = HashSet::new();
        for instance in instances.values() {
            if instance.is_terminated() {
                if self.cache.delete(&instance.region, &instance.service, &instance.id).is_some() {
                    info!(source = %self.name, instance = %instance.id, "instance terminated, evicted");
                }
                continue;
            }
            seen.insert((instance.region.clone(), instance.service.clone(), instance.id.clone()));
            self.cache.add(cache_entry(instance));
        }

        for entry in self.cache.entries() {
            if !seen.contains(&(entry.region.clone(), entry.service.clone(), entry.id.clone())) {
                self.cache.delete(&entry.region, &entry.service, &entry.id);
                info!(source = %self.name, instance = %entry.id, "instance gone, evicted");
            }
        }
    }
}

fn cache_entry(instance: &Instance) -> CacheEntry {
    let cores = instance
        .metrics
        .values()
        .find(|m| m.resource_type == ResourceType::Cpu)
        .map(|m| m.unit_amount.max(0.0) as u32)
        .unwrap_or(0);
    let mut entry = CacheEntry::new(&instance.region, &instance.service, &instance.id, &instance.kind);
    entry.lifecycle = instance.status.as_str().to_string();
    entry.core_count = cores;
    entry
}

#[async_trait]
impl Source for FixtureSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, cancel: &CancellationToken) -> Result<InstanceMap, SourceError> {
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SourceError::Cancelled),
            read = self.read() => read?,
        };
        let mut out = InstanceMap::new();
        for mut instance in read {
            instance.provider = self.provider;
            for metric in instance.metrics.values_mut() {
                metric.touch();
            }
            out.insert(instance.id.clone(), instance);
        }
        self.sync_cache(&out);
        debug!(source = %self.name, instances = out.len(), cached = self.cache.len(), "fixture read");
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_VMS: &str = r#"
- id: vm-1
  region: europe-west4
  service: compute
  kind: e2-medium
  metrics:
    cpu:
      name: cpu
      resource_type: cpu
      usage_percent: 27
      unit_amount: 2
      unit: vCPU
- id: vm-2
  region: europe-west4
  service: compute
  kind: e2-medium
"#;

    fn write(file: &tempfile::NamedTempFile, content: &str) {
        std::fs::write(file.path(), content).unwrap();
    }

    #[tokio::test]
    async fn test_fetch_reads_instances_and_fills_cache() {
        let file = tempfile::NamedTempFile::new().unwrap();
        write(&file, TWO_VMS);

        let source = FixtureSource::new("lab", Provider::Gcp, file.path());
        let got = source.fetch(&CancellationToken::new()).await.unwrap();

        assert_eq!(got.len(), 2);
        assert_eq!(got["vm-1"].provider, Provider::Gcp);
        assert_eq!(got["vm-1"].metrics["cpu"].usage(), 27.0);
        let cached = source.cache().get("europe-west4", "compute", "vm-1").unwrap();
        assert_eq!(cached.core_count, 2);
        assert_eq!(cached.lifecycle, "running");
    }

    #[tokio::test]
    async fn test_terminated_and_vanished_are_evicted() {
        let file = tempfile::NamedTempFile::new().unwrap();
        write(&file, TWO_VMS);
        let source = FixtureSource::new("lab", Provider::Gcp, file.path());
        source.fetch(&CancellationToken::new()).await.unwrap();
        assert_eq!(source.cache().len(), 2);

        write(
            &file,
            "- id: vm-1\n  region: europe-west4\n  service: compute\n  kind: e2-medium\n  status: terminated\n",
        );
        let got = source.fetch(&CancellationToken::new()).await.unwrap();

        // still reported so exporters can drop the series
        assert!(got["vm-1"].is_terminated());
        assert!(source.cache().is_empty());
        assert!(!source.cache().contains_region("europe-west4"));
    }

    #[tokio::test]
    async fn test_missing_or_broken_file_is_an_error() {
        let source = FixtureSource::new("lab", Provider::Aws, "/no/such/fixture.yaml");
        assert!(matches!(source.fetch(&CancellationToken::new()).await, Err(SourceError::Io { .. })));

        let file = tempfile::NamedTempFile::new().unwrap();
        write(&file, "- id: [broken");
        let source = FixtureSource::new("lab", Provider::Aws, file.path());
        assert!(matches!(source.fetch(&CancellationToken::new()).await, Err(SourceError::Parse { .. })));
    }

    #[tokio::test]
    async fn test_cancelled_fetch_leaves_cache_alone() {
        let file = tempfile::NamedTempFile::new().unwrap();
        write(&file, TWO_VMS);
        let source = FixtureSource::new("lab", Provider::Gcp, file.path());

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(source.fetch(&cancel).await, Err(SourceError::Cancelled)));
        assert!(source.cache().is_empty());
    }
}
