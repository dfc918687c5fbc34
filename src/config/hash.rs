//! Configuration hashing for change detection.

use sha2::{Digest, Sha256};

use super::spec::{ResourceConfig, StackConfig};

/// Deterministic SHA-256 hashes of configuration.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConfigHasher;

impl ConfigHasher {
    /// Creates a hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Hashes the whole configuration. Provider and state settings are
    /// excluded since they do not change what is deployed.
    #[must_use]
    pub fn hash_config(&self, config: &StackConfig) -> String {
        let mut hasher = Sha256::new();
        hasher.update(config.project.name.as_bytes());
        hasher.update([0]);
        hasher.update(config.project.environment.as_bytes());
        for resource in &config.resources {
            hasher.update(self.hash_resource(resource).as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    /// Hashes one resource: name, type and desired attributes.
    ///
    /// Attributes live in an ordered map, so key order in the file does not
    /// matter. Timeouts are excluded.
    #[must_use]
    pub fn hash_resource(&self, resource: &ResourceConfig) -> String {
        let mut hasher = Sha256::new();
        hasher.update(resource.name.as_bytes());
        hasher.update([0]);
        hasher.update(resource.resource_type.as_bytes());
        hasher.update([0]);
        hasher.update(serde_json::Value::Object(resource.attributes.to_json()).to_string());
        hex::encode(hasher.finalize())
    }

    /// Short form for display.
    #[must_use]
    pub fn short_hash(hash: &str) -> &str {
        hash.get(..12).unwrap_or(hash)
    }
}
