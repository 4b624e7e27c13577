//! Configuration management for Gatekeeper.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{GatekeeperError, Result};

/// Prefix for environment variable overrides, e.g. `GATEKEEPER_LIMITER__LIMIT=5`.
const ENV_PREFIX: &str = "GATEKEEPER";

/// Main configuration for the Gatekeeper service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GatekeeperConfig {
    /// Admission policy
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Admission policy: at most `limit` requests per client in any `window_secs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Requests admitted per client within one window
    #[serde(default = "default_limit")]
    pub limit: u64,

    /// Sliding window length in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// How often idle clients are swept from memory, in seconds
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            window_secs: default_window_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}

impl LimiterConfig {
    /// The sliding window as a [`Duration`].
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// The sweep interval as a [`Duration`].
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    /// Reject values the limiter cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.limit == 0 {
            return Err(GatekeeperError::Config(
                "limiter.limit must be at least 1".to_string(),
            ));
        }
        if self.window_secs == 0 {
            return Err(GatekeeperError::Config(
                "limiter.window_secs must be at least 1".to_string(),
            ));
        }
        if self.cleanup_interval_secs == 0 {
            return Err(GatekeeperError::Config(
                "limiter.cleanup_interval_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_limit() -> u64 {
    100
}

fn default_window_secs() -> u64 {
    60
}

fn default_cleanup_interval_secs() -> u64 {
    60
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl GatekeeperConfig {
    /// Load configuration from a YAML file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: GatekeeperConfig = serde_yaml::from_str(yaml)
            .map_err(|e| GatekeeperError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from defaults, an optional file, and
    /// `GATEKEEPER_`-prefixed environment variables, in that order of precedence.
    ///
    /// The result is not validated, so later overrides such as command-line
    /// flags can still correct it; call [`validate`](Self::validate) once they
    /// are applied.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    /// Check every section for values the service cannot run with.
    pub fn validate(&self) -> Result<()> {
        self.limiter.validate()
    }
}
