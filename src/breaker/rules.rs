//! Circuit breaker configuration document.
//!
//! The document has a global section and a per-bucket section, each with an
//! `enabled` flag and a map from action spec to threshold:
//!
//! ```json
//! {
//!   "global": { "enabled": true, "actions": { "Read:count": 500, "Write:bytes": 1073741824 } },
//!   "buckets": {
//!     "photos": { "enabled": true, "actions": { "Write": 10 } }
//!   }
//! }
//! ```
//!
//! Thresholds may be written as JSON numbers or as decimal strings, the
//! latter being how protobuf JSON encodes 64-bit integers.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

use super::key::ActionSpec;
use crate::error::{GateError, Result};

/// The complete breaker document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Limits applied across all buckets
    #[serde(default)]
    pub global: Option<ActionLimits>,

    /// Limits applied to individual buckets
    #[serde(default)]
    pub buckets: BTreeMap<String, ActionLimits>,
}

/// An enabled flag plus per-action thresholds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionLimits {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default, deserialize_with = "deserialize_thresholds")]
    pub actions: BTreeMap<String, u64>,
}

impl ActionLimits {
    /// Parse every action key, failing on the first malformed one.
    pub fn parsed_actions(&self) -> Result<Vec<(ActionSpec, u64)>> {
        self.actions
            .iter()
            .map(|(spec, limit)| Ok((spec.parse::<ActionSpec>()?, *limit)))
            .collect()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ThresholdValue {
    Number(u64),
    Text(String),
}

fn deserialize_thresholds<'de, D>(deserializer: D) -> std::result::Result<BTreeMap<String, u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = BTreeMap::<String, ThresholdValue>::deserialize(deserializer)?;
    raw.into_iter()
        .map(|(action, value)| {
            let limit = match value {
                ThresholdValue::Number(n) => n,
                ThresholdValue::Text(s) => s.trim().parse::<u64>().map_err(|_| {
                    serde::de::Error::custom(format!(
                        "threshold for '{}' is not a non-negative integer: {:?}",
                        action, s
                    ))
                })?,
            };
            Ok((action, limit))
        })
        .collect()
}

impl BreakerConfig {
    /// Create an empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode raw bytes from the config store.
    ///
    /// JSON is the canonical format; YAML is accepted as a fallback.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let config = match serde_json::from_slice::<Self>(bytes) {
            Ok(config) => config,
            Err(json_err) => serde_yaml::from_slice::<Self>(bytes).map_err(|yaml_err| {
                GateError::Decode(format!("json: {}; yaml: {}", json_err, yaml_err))
            })?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Decode a JSON document.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| GateError::Decode(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Decode a YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self =
            serde_yaml::from_str(yaml).map_err(|e| GateError::Decode(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a document from disk.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading circuit breaker configuration");

        let bytes = std::fs::read(path)?;
        Self::from_bytes(&bytes)
    }

    /// Check that every action key is well formed.
    pub fn validate(&self) -> Result<()> {
        if let Some(global) = &self.global {
            global.parsed_actions()?;
        }
        for limits in self.buckets.values() {
            limits.parsed_actions()?;
        }
        Ok(())
    }

    /// Encode as pretty JSON, the format the store expects.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| GateError::Decode(e.to_string()))
    }
}
