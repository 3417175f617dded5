use crate::models::Instance;
use std::fmt;

/// The two well-known topics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    MetricsCollected,
    EmissionsCalculated,
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::MetricsCollected => f.write_str("metrics_collected"),
            Topic::EmissionsCalculated => f.write_str("emissions_calculated"),
        }
    }
}

/// What travels on the bus; the variant decides the topic
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    MetricsCollected(Instance),
    EmissionsCalculated(Instance),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    correlation_key: String,
    payload: Payload,
}

impl Event {
    pub fn new(correlation_key: impl Into<String>, payload: Payload) -> Self {
        Self { correlation_key: correlation_key.into(), payload }
    }

    pub fn metrics_collected(instance: Instance) -> Self {
        Self::new(instance.correlation_key(), Payload::MetricsCollected(instance))
    }

    pub fn emissions_calculated(instance: Instance) -> Self {
        Self::new(instance.correlation_key(), Payload::EmissionsCalculated(instance))
    }

    pub fn topic(&self) -> Topic {
        match self.payload {
            Payload::MetricsCollected(_) => Topic::MetricsCollected,
            Payload::EmissionsCalculated(_) => Topic::EmissionsCalculated,
        }
    }

    /// Events sharing this key go to the same worker
    pub fn correlation_key(&self) -> &str {
        &self.correlation_key
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn instance(&self) -> &Instance {
        match &self.payload {
            Payload::MetricsCollected(i) | Payload::EmissionsCalculated(i) => i,
        }
    }

    pub fn into_payload(self) -> Payload {
        self.payload
    }
}

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// 64-bit FNV-1a
pub fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, b| (hash ^ u64::from(*b)).wrapping_mul(FNV_PRIME))
}

/// Worker index for a correlation key
pub fn shard(key: &str, workers: usize) -> usize {
    (fnv1a(key.as_bytes()) % workers.max(1) as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Provider;

    #[test]
    fn test_fnv1a_reference_values() {
        assert_eq!(fnv1a(b""), 0xcbf29ce484222325);
        assert_eq!(fnv1a(b"a"), 0xaf63dc4c8601ec8c);
        assert_eq!(fnv1a(b"foobar"), 0x85944171f73967e8);
    }

    #[test]
    fn test_shard_is_stable_and_in_range() {
        for key in ["vm-1", "vm-2", "gcp/europe-west4/vm-3", ""] {
            let s = shard(key, 7);
            assert!(s < 7);
            assert_eq!(s, shard(key, 7));
        }
        assert_eq!(shard("anything", 1), 0);
        assert_eq!(shard("anything", 0), 0);
    }

    #[test]
    fn test_event_topic_follows_payload() {
        let i = Instance::new("vm-1", Provider::Aws, "eu-west-1", "m6i.large");
        let collected = Event::metrics_collected(i.clone());
        assert_eq!(collected.topic(), Topic::MetricsCollected);
        assert_eq!(collected.correlation_key(), "aws/eu-west-1/vm-1");

        let calculated = Event::emissions_calculated(i.clone());
        assert_eq!(calculated.topic(), Topic::EmissionsCalculated);
        assert_eq!(calculated.instance(), &i);
    }
}
