//! Process configuration for the s3gate binary.
//!
//! This is distinct from the circuit breaker document itself, which lives in
//! the config store and is decoded by [`crate::breaker::BreakerConfig`].

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{GateError, Result};

/// Well-known location of the circuit breaker document.
pub const DEFAULT_BREAKER_CONFIG_PATH: &str = "/etc/s3/circuit_breaker.json";

/// Environment variable prefix used to override file settings.
pub const ENV_PREFIX: &str = "S3GATE";

/// Main configuration for the s3gate process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Circuit breaker loading
    #[serde(default)]
    pub breaker: BreakerSettings,

    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where the breaker document comes from and how often it is re-read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerSettings {
    /// Path of the breaker document in the file-backed store
    #[serde(default = "default_breaker_config_path")]
    pub config_path: String,

    /// Reload interval in seconds; 0 disables periodic reloads
    #[serde(default = "default_reload_interval")]
    pub reload_interval_secs: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            config_path: default_breaker_config_path(),
            reload_interval_secs: default_reload_interval(),
        }
    }
}

impl BreakerSettings {
    /// The reload interval, or `None` when periodic reloads are off.
    pub fn reload_interval(&self) -> Option<Duration> {
        match self.reload_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

fn default_breaker_config_path() -> String {
    DEFAULT_BREAKER_CONFIG_PATH.to_string()
}

fn default_reload_interval() -> u64 {
    0
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl GatewayConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| GateError::Config(e.to_string()))
    }

    /// Load configuration from an optional YAML file, then apply
    /// `S3GATE_<SECTION>__<KEY>` environment overrides, for example
    /// `S3GATE_BREAKER__RELOAD_INTERVAL_SECS=30`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            let path = path
                .to_str()
                .ok_or_else(|| GateError::Config(format!("non UTF-8 path: {}", path.display())))?;
            builder = builder.add_source(
                config::File::new(path, config::FileFormat::Yaml).required(true),
            );
        }

        builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize::<Self>())
            .map_err(|e| GateError::Config(e.to_string()))
    }
}
