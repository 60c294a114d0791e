//! Agent configuration.
//!
//! One flat YAML document loaded once at startup; a load failure is the
//! only fatal error in the process. Key names are the agent's external
//! configuration surface (camelCase), not Rust convention, so existing
//! deployments keep their config files. JSON documents in the same shape
//! also parse, YAML being a superset.

use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::device::DEFAULT_QUERY_TIMEOUT;
use crate::uploader::DEFAULT_UPLOAD_TIMEOUT;

/// Default spool directory.
pub const DEFAULT_SPOOL_DIR: &str = "./stats";

/// Default interval between defensive full sweeps of the spool.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

fn default_spool_dir() -> String {
    DEFAULT_SPOOL_DIR.to_string()
}

fn default_query_timeout() -> Duration {
    DEFAULT_QUERY_TIMEOUT
}

fn default_upload_timeout() -> Duration {
    DEFAULT_UPLOAD_TIMEOUT
}

fn default_sweep_interval() -> Duration {
    DEFAULT_SWEEP_INTERVAL
}

/// Configuration error types.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse the configuration document.
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// Configuration validation failed.
    #[error("config validation error: {0}")]
    Validation(String),
}

/// Agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    /// Seconds between device polls.
    pub interval: u64,

    /// Collector host.
    pub server_host: String,

    /// Collector port.
    pub server_port: u16,

    /// Miner device host.
    pub miner_host: String,

    /// Miner device port.
    pub miner_port: u16,

    /// Local identifier stamped on every reading; becomes the first half
    /// of every spool file name.
    pub device_name: String,

    /// Shared secret sent as the `Server-Password` header. Supports
    /// `${VAR}` and `${VAR:-default}` environment expansion so the secret
    /// can stay out of the file.
    pub server_password: String,

    /// Spool directory (default: "./stats").
    #[serde(default = "default_spool_dir")]
    pub spool_dir: String,

    /// Whole-query deadline for one device poll (default: 10s).
    #[serde(default = "default_query_timeout", with = "humantime_serde")]
    pub query_timeout: Duration,

    /// Bound on one collector upload request (default: 30s).
    #[serde(default = "default_upload_timeout", with = "humantime_serde")]
    pub upload_timeout: Duration,

    /// Interval between defensive full sweeps (default: 30s). Sweeps also
    /// run on every spooled reading, so this only governs retry latency
    /// while polling is idle.
    #[serde(default = "default_sweep_interval", with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl AgentConfig {
    /// Load configuration from a YAML file, expand the shared secret, and
    /// validate.
    ///
    /// # Errors
    /// Returns `ConfigError` if the file cannot be read, parsed, or
    /// validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let mut config: Self = serde_yaml::from_str(&content)?;
        config.server_password = expand_env_vars(&config.server_password);
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    ///
    /// # Errors
    /// Returns `ConfigError::Validation` if any field is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval == 0 {
            return Err(ConfigError::Validation(
                "interval must be at least 1 second".to_string(),
            ));
        }
        if self.server_host.is_empty() {
            return Err(ConfigError::Validation(
                "serverHost must not be empty".to_string(),
            ));
        }
        if self.server_port == 0 {
            return Err(ConfigError::Validation(
                "serverPort must be non-zero".to_string(),
            ));
        }
        if self.miner_host.is_empty() {
            return Err(ConfigError::Validation(
                "minerHost must not be empty".to_string(),
            ));
        }
        if self.miner_port == 0 {
            return Err(ConfigError::Validation(
                "minerPort must be non-zero".to_string(),
            ));
        }
        if self.device_name.is_empty() {
            return Err(ConfigError::Validation(
                "deviceName must not be empty".to_string(),
            ));
        }
        // The device name is a path component of every spool entry.
        if self.device_name.contains(['/', '\\']) {
            return Err(ConfigError::Validation(
                "deviceName must not contain path separators".to_string(),
            ));
        }
        Ok(())
    }

    /// Poll interval as a `Duration`.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.interval)
    }
}

/// Expand environment variables in a string.
/// Supports ${VAR} and ${VAR:-default} syntax.
pub fn expand_env_vars(input: &str) -> String {
    static ENV_VAR_REGEX: OnceLock<regex::Regex> = OnceLock::new();

    let regex = ENV_VAR_REGEX.get_or_init(|| {
        regex::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
            .expect("failed to compile env var regex")
    });

    regex
        .replace_all(input, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default_value = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            std::env::var(var_name).unwrap_or_else(|_| default_value.to_string())
        })
        .into_owned()
}
