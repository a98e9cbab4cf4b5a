//! Configuration types for the Ostiary pipeline

use crate::budget::BudgetConfig;
use crate::error::{OstiaryError, Result};
use crate::llm::CircuitBreakerConfig;
use crate::policy::PolicyConfig;
use crate::replay::ReplayConfig;
use crate::sandbox::SandboxConfig;
use crate::store::{FileStore, MemoryStore, SharedStore};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OstiaryConfig {
    /// Recursion, chain and filesystem limits
    pub sandbox: SandboxConfig,

    /// Per-tenant cost limits
    pub budget: BudgetConfig,

    /// Provider circuit breakers
    pub breaker: CircuitBreakerConfig,

    /// Replay cache for pure tools
    pub replay: ReplayConfig,

    /// Role capabilities, tenant deny lists and anomaly heuristics
    pub policy: PolicyConfig,

    /// Handler execution
    pub runtime: RuntimeConfig,

    /// Durable state backend
    pub store: StoreConfig,
}

/// Handler execution settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Timeout for tools that do not declare their own
    #[serde(with = "humantime_serde")]
    pub default_timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
        }
    }
}

/// Durable state backend
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StoreConfig {
    /// State lives only as long as the process
    #[default]
    Memory,

    /// One JSON file per key under `root`
    File {
        /// Directory holding the state files
        root: PathBuf,
    },
}

impl StoreConfig {
    /// Open the configured backend
    pub fn open(&self) -> Result<SharedStore> {
        Ok(match self {
            StoreConfig::Memory => Arc::new(MemoryStore::new()),
            StoreConfig::File { root } => Arc::new(FileStore::open(root.clone())?),
        })
    }
}

impl OstiaryConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Loads in this order:
    /// 1. Default configuration
    /// 2. `ostiary.toml` in the working directory
    /// 3. The file named by `OSTIARY_CONFIG_PATH`
    /// 4. `OSTIARY_` environment variables, `__` separating nested keys
    ///    (`OSTIARY_BREAKER__FAILURE_THRESHOLD=3`)
    ///
    /// # Errors
    ///
    /// Returns an error if a configuration source is invalid or the merged
    /// configuration fails validation.
    pub fn load() -> Result<Self> {
        use figment::{
            Figment,
            providers::{Env, Format, Serialized, Toml},
        };

        let mut figment = Figment::from(Serialized::defaults(OstiaryConfig::default()))
            .merge(Toml::file("ostiary.toml"));

        if let Ok(path) = std::env::var("OSTIARY_CONFIG_PATH") {
            figment = figment.merge(Toml::file(path));
        }

        let config: OstiaryConfig = figment
            .merge(Env::prefixed("OSTIARY_").split("__"))
            .extract()
            .map_err(|e| {
                OstiaryError::Configuration(format!("Failed to load configuration: {}", e))
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or fails
    /// validation.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        use figment::{
            Figment,
            providers::{Format, Serialized, Toml},
        };

        let config: OstiaryConfig = Figment::from(Serialized::defaults(OstiaryConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .extract()
            .map_err(|e| {
                OstiaryError::Configuration(format!(
                    "Failed to load configuration file {}: {}",
                    path.as_ref().display(),
                    e
                ))
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make every invocation fail.
    ///
    /// # Errors
    ///
    /// Returns a configuration error naming the first offending key.
    pub fn validate(&self) -> Result<()> {
        fn nonzero(key: &str, value: u64) -> Result<()> {
            if value == 0 {
                return Err(OstiaryError::Configuration(format!(
                    "{} must be greater than zero",
                    key
                )));
            }
            Ok(())
        }

        nonzero("sandbox.max_depth", self.sandbox.max_depth.into())?;
        nonzero("sandbox.max_chain_length", self.sandbox.max_chain_length.into())?;
        nonzero("sandbox.max_file_bytes", self.sandbox.max_file_bytes)?;
        nonzero("budget.default_limit", self.budget.default_limit)?;
        nonzero("breaker.failure_threshold", self.breaker.failure_threshold.into())?;
        if self.replay.enabled {
            nonzero("replay.max_entries", self.replay.max_entries as u64)?;
        }
        if self.runtime.default_timeout.is_zero() {
            return Err(OstiaryError::Configuration(
                "runtime.default_timeout must be greater than zero".to_string(),
            ));
        }
        if let Some(window) = self.budget.window
            && window.is_zero()
        {
            return Err(OstiaryError::Configuration(
                "budget.window must be greater than zero".to_string(),
            ));
        }

        let anomaly = &self.policy.anomaly;
        if anomaly.enabled && (anomaly.spike_sigma <= 0.0 || anomaly.ratio <= 1.0) {
            return Err(OstiaryError::Configuration(
                "policy.anomaly requires spike_sigma > 0 and ratio > 1".to_string(),
            ));
        }
        Ok(())
    }
}
