//! Configuration
//!
//! Every component has a plain config struct with sensible defaults.
//! [`LarderConfig`] gathers them so a deployment can load one YAML file:
//!
//! ```yaml
//! cache:
//!   namespace: larder
//!   default_ttl_ms: 300000
//! memo:
//!   max_size: 100
//! location:
//!   timeout_ms: 5000
//!   refresh_throttle_ms: 30000
//!   default_coordinate:
//!     latitude: 40.7128
//!     longitude: -74.006
//! ```
//!
//! All durations are written in milliseconds.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::cache::CacheConfig;
use crate::error::{Error, Result};
use crate::location::LocationConfig;
use crate::memo::MemoConfig;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LarderConfig {
    /// Tiered cache settings
    pub cache: CacheConfig,
    /// Memoizer settings
    pub memo: MemoConfig,
    /// Location service settings
    pub location: LocationConfig,
}

impl LarderConfig {
    /// Parse a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self =
            serde_yaml::from_str(yaml).map_err(|e| Error::Config(format!("invalid YAML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and parse a YAML file
    pub async fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::Config(format!("cannot read config {}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&text)
    }

    /// Check every section
    pub fn validate(&self) -> Result<()> {
        self.cache.validate()?;
        self.memo.validate()?;
        self.location.validate()
    }
}

/// Serde helper storing a `Duration` as integer milliseconds
pub mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(crate::clock::duration_millis(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
