//! Engine configuration.
//!
//! Configuration is read from an optional file (any format the `config` crate
//! recognises by extension) overlaid with environment variables:
//!
//! ```toml
//! [scheduler]
//! rollover_interval_ms = 60000
//!
//! [pool]
//! max_open = 8
//! reserve_timeout_ms = 5000
//! max_idle_ms = 300000
//! eviction_interval_ms = 30000
//! ```
//!
//! Environment variables use the `CALLFRAME` prefix and `__` between
//! sections, e.g. `CALLFRAME__POOL__MAX_OPEN=16`.

use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::error::ConfigError;

/// Prefix of environment variables read by [`EngineConfig::load`].
pub const ENV_PREFIX: &str = "CALLFRAME";

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Background maintenance settings.
    pub scheduler: SchedulerConfig,
    /// Connection pool settings.
    pub pool: PoolConfig,
}

/// Settings for the background maintenance tasks.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// How often usage statistics are rolled forward.
    pub rollover_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            rollover_interval_ms: 60_000,
        }
    }
}

impl SchedulerConfig {
    /// Rollover period as a duration.
    pub fn rollover_interval(&self) -> Duration {
        Duration::from_millis(self.rollover_interval_ms)
    }
}

/// Settings for the channel pool and its eviction pass.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum number of open channels per connection.
    pub max_open: usize,
    /// How long a reservation waits for a free channel.
    pub reserve_timeout_ms: u64,
    /// Idle time after which a channel is closed.
    pub max_idle_ms: u64,
    /// How often idle channels are evicted.
    pub eviction_interval_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_open: 8,
            reserve_timeout_ms: 5_000,
            max_idle_ms: 300_000,
            eviction_interval_ms: 30_000,
        }
    }
}

impl PoolConfig {
    /// Reservation timeout as a duration.
    pub fn reserve_timeout(&self) -> Duration {
        Duration::from_millis(self.reserve_timeout_ms)
    }

    /// Eviction period as a duration.
    pub fn eviction_interval(&self) -> Duration {
        Duration::from_millis(self.eviction_interval_ms)
    }
}

impl EngineConfig {
    /// Load configuration from an optional file and the process environment.
    ///
    /// Missing keys keep their defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_from(path, Environment::with_prefix(ENV_PREFIX))
    }

    fn load_from(path: Option<&Path>, env: Environment) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }
        let config = builder
            .add_source(env.separator("__").try_parsing(true))
            .build()?;
        Ok(config.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn env(vars: &[(&str, &str)]) -> Environment {
        let map: config::Map<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Environment::with_prefix(ENV_PREFIX).source(Some(map))
    }

    #[test]
    fn defaults_without_sources() {
        let config = EngineConfig::load_from(None, env(&[])).unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.pool.max_open, 8);
        assert_eq!(config.scheduler.rollover_interval(), Duration::from_secs(60));
    }

    #[test]
    fn file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[pool]\nmax_open = 2\nmax_idle_ms = 1000").unwrap();

        let config = EngineConfig::load_from(Some(file.path()), env(&[])).unwrap();
        assert_eq!(config.pool.max_open, 2);
        assert_eq!(config.pool.max_idle_ms, 1000);
        assert_eq!(config.pool.reserve_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn environment_overrides_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[pool]\nmax_open = 2").unwrap();

        let config = EngineConfig::load_from(
            Some(file.path()),
            env(&[("CALLFRAME__POOL__MAX_OPEN", "32")]),
        )
        .unwrap();
        assert_eq!(config.pool.max_open, 32);
    }

    #[test]
    fn invalid_value_is_an_error() {
        let result =
            EngineConfig::load_from(None, env(&[("CALLFRAME__POOL__MAX_OPEN", "many")]));
        assert!(result.is_err());
    }
}
