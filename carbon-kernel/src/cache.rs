use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use time::OffsetDateTime;

/// A compute resource a source already discovered
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub id: String,
    pub region: String,
    pub service: String,
    pub kind: String,
    /// Provider lifecycle string, e.g. "running" or "spot"
    pub lifecycle: String,
    pub core_count: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub last_updated: OffsetDateTime,
}

impl CacheEntry {
    pub fn new(
        region: impl Into<String>,
        service: impl Into<String>,
        id: impl Into<String>,
        kind: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            region: region.into(),
            service: service.into(),
            kind: kind.into(),
            lifecycle: String::new(),
            core_count: 0,
            last_updated: OffsetDateTime::now_utc(),
        }
    }
}

type ById = HashMap<String, CacheEntry>;
type ByService = HashMap<String, ById>;

/// region -> service -> id, one per source.
///
/// A single coarse lock: refreshes are rare next to the time it is held.
/// Entries never expire, the owning source deletes them when the resource is gone.
#[derive(Debug, Default)]
pub struct ResourceCache {
    regions: RwLock<HashMap<String, ByService>>,
}

impl ResourceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert, replacing any previous entry wholesale
    pub fn add(&self, entry: CacheEntry) {
        let mut regions = self.regions.write();
        regions
            .entry(entry.region.clone())
            .or_default()
            .entry(entry.service.clone())
            .or_default()
            .insert(entry.id.clone(), entry);
    }

    /// Remove one entry and prune the maps it leaves empty
    pub fn delete(&self, region: &str, service: &str, id: &str) -> Option<CacheEntry> {
        let mut regions = self.regions.write();
        let services = regions.get_mut(region)?;
        let ids = services.get_mut(service)?;
        let removed = ids.remove(id);
        if ids.is_empty() {
            services.remove(service);
        }
        if services.is_empty() {
            regions.remove(region);
        }
        removed
    }

    pub fn get(&self, region: &str, service: &str, id: &str) -> Option<CacheEntry> {
        self.regions.read().get(region)?.get(service)?.get(id).cloned()
    }

    pub fn exists(&self, region: &str, service: &str, id: &str) -> bool {
        self.get(region, service, id).is_some()
    }

    pub fn contains_region(&self, region: &str) -> bool {
        self.regions.read().contains_key(region)
    }

    pub fn contains_service(&self, region: &str, service: &str) -> bool {
        self.regions.read().get(region).is_some_and(|s| s.contains_key(service))
    }

    /// Snapshot of every entry, unordered
    pub fn entries(&self) -> Vec<CacheEntry> {
        self.regions
            .read()
            .values()
            .flat_map(|services| services.values())
            .flat_map(|ids| ids.values())
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.regions.read().values().flat_map(|s| s.values()).map(|ids| ids.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_add_get_exists() {
        let cache = ResourceCache::new();
        let mut e = CacheEntry::new("europe-west4", "compute", "vm-1", "n2-standard-2");
        e.core_count = 2;
        cache.add(e.clone());

        assert!(cache.exists("europe-west4", "compute", "vm-1"));
        assert_eq!(cache.get("europe-west4", "compute", "vm-1"), Some(e));
        assert!(!cache.exists("europe-west4", "compute", "vm-2"));
        assert!(!cache.exists("europe-west4", "gke", "vm-1"));
        assert!(cache.get("us-east1", "compute", "vm-1").is_none());
    }

    #[test]
    fn test_add_replaces_wholesale() {
        let cache = ResourceCache::new();
        cache.add(CacheEntry::new("r", "s", "id", "small"));
        cache.add(CacheEntry::new("r", "s", "id", "large"));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("r", "s", "id").map(|e| e.kind), Some("large".to_string()));
    }

    #[test]
    fn test_delete_prunes_empty_levels() {
        let cache = ResourceCache::new();
        cache.add(CacheEntry::new("r1", "compute", "a", "k"));
        cache.add(CacheEntry::new("r1", "compute", "b", "k"));
        cache.add(CacheEntry::new("r1", "sql", "c", "k"));

        assert!(cache.delete("r1", "compute", "a").is_some());
        assert!(!cache.exists("r1", "compute", "a"));
        assert!(cache.contains_service("r1", "compute"));

        cache.delete("r1", "compute", "b");
        assert!(!cache.contains_service("r1", "compute"));
        assert!(cache.contains_region("r1"));

        cache.delete("r1", "sql", "c");
        assert!(!cache.contains_region("r1"));
        assert!(cache.is_empty());

        // misses at any level are harmless
        assert!(cache.delete("r1", "sql", "c").is_none());
        assert!(cache.delete("nowhere", "x", "y").is_none());
    }

    #[test]
    fn test_concurrent_writers_and_readers() {
        let cache = Arc::new(ResourceCache::new());
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        let id = format!("{t}-{i}");
                        cache.add(CacheEntry::new("r", "s", id.clone(), "k"));
                        assert!(cache.exists("r", "s", &id));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(cache.len(), 400);
        assert_eq!(cache.entries().len(), 400);
    }
}
