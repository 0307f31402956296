//! Query cache configuration.

use serde::{Deserialize, Serialize};

use crate::error::CacheError;

/// Configuration for a [`QueryCache`](crate::QueryCache).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Name used to label this cache in traces.
    pub name: String,
    /// Prefix for ids minted for entries requested without a key.
    pub anonymous_key_prefix: String,
    /// Whether rejected outcomes are included when serializing for hydration.
    ///
    /// Disable this to let the client retry operations that failed on the
    /// server instead of replaying the failure.
    pub hydrate_rejections: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            name: "query-cache".to_string(),
            anonymous_key_prefix: "$anonymous:".to_string(),
            hydrate_rejections: true,
        }
    }
}

impl CacheConfig {
    /// Create a new configuration with the given cache name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Parse a configuration from TOML. Missing fields take their defaults.
    pub fn from_toml(source: &str) -> Result<Self, CacheError> {
        Ok(toml::from_str(source)?)
    }

    /// Set the anonymous key prefix.
    pub fn with_anonymous_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.anonymous_key_prefix = prefix.into();
        self
    }

    /// Include or omit rejected outcomes when serializing.
    pub fn with_hydrate_rejections(mut self, enabled: bool) -> Self {
        self.hydrate_rejections = enabled;
        self
    }
}
