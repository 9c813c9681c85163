//! Slot keys: the hash of the invocation-invariant portion of a function's
//! configuration. Two invocations with equal slot keys may share a warm
//! container sequentially.

use std::collections::BTreeMap;

use sha2::{Digest, Sha256};

use crate::models::Format;

/// Opaque key identifying a class of interchangeable container slots.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct SlotKey(String);

impl SlotKey {
    /// Compute the key over everything that affects container startup:
    /// image, resource limits, format, and the startup config map.
    pub fn compute(
        image: &str,
        memory_mb: u64,
        cpus_milli: u64,
        timeout_secs: u64,
        idle_timeout_secs: u64,
        format: Format,
        config: &BTreeMap<String, String>,
    ) -> Self {
        let mut h = Sha256::new();
        h.update(image.as_bytes());
        h.update(memory_mb.to_be_bytes());
        h.update(cpus_milli.to_be_bytes());
        h.update(timeout_secs.to_be_bytes());
        h.update(idle_timeout_secs.to_be_bytes());
        h.update(format.as_str().as_bytes());
        for (k, v) in config {
            h.update([0]);
            h.update(k.as_bytes());
            h.update([1]);
            h.update(v.as_bytes());
        }
        SlotKey(hex::encode(&h.finalize()[..16]))
    }

    /// Reconstruct a key received over the wire (pure-runner header frame).
    pub fn from_raw(raw: impl Into<String>) -> Self {
        SlotKey(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SlotKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(image: &str, memory: u64, config: &[(&str, &str)]) -> SlotKey {
        let config = config
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        SlotKey::compute(image, memory, 0, 30, 30, Format::Default, &config)
    }

    #[test]
    fn identical_configuration_yields_identical_keys() {
        assert_eq!(key("img:v1", 128, &[("A", "1")]), key("img:v1", 128, &[("A", "1")]));
    }

    #[test]
    fn any_startup_field_changes_the_key() {
        let base = key("img:v1", 128, &[]);
        assert_ne!(base, key("img:v2", 128, &[]));
        assert_ne!(base, key("img:v1", 256, &[]));
        assert_ne!(base, key("img:v1", 128, &[("A", "1")]));
    }

    #[test]
    fn config_ordering_does_not_matter() {
        // BTreeMap input; insertion order is irrelevant by construction.
        assert_eq!(
            key("img", 128, &[("A", "1"), ("B", "2")]),
            key("img", 128, &[("B", "2"), ("A", "1")]),
        );
    }
}
