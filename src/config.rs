//! Configuration management for the connector vault.
//!
//! Configuration can be set via environment variables:
//! - `VAULT_CONFIG` - Optional. Path to a YAML file; when set, the environment is ignored.
//! - `VAULT_KEY_ROTATION_DAYS` - Optional. Days between key rotations. Defaults to `90`.
//! - `VAULT_KEY_RETAIN_VERSIONS` - Optional. Inactive key versions kept. Defaults to `5`.
//! - `VAULT_AUTOMATIC_ROTATION` - Optional. Rotate on a timer. Defaults to `false`.
//! - `VAULT_KDF_ITERATIONS` - Optional. PBKDF2 rounds per record key. Defaults to `100000`.
//! - `VAULT_AUTO_REFRESH` - Optional. Refresh tokens close to expiry. Defaults to `true`.
//! - `VAULT_REFRESH_THRESHOLD_MINUTES` - Optional. Refresh window. Defaults to `5`.
//! - `VAULT_MAX_REFRESH_ATTEMPTS` - Optional. Refresh callback attempts. Defaults to `3`.
//! - `VAULT_HEALTH_CHECK_INTERVAL_SECS` - Optional. Health timer period. Defaults to `60`.
//! - `VAULT_AUTO_RESTART` - Optional. Restart degraded connectors. Defaults to `true`.
//! - `VAULT_MAX_AUTO_RESTARTS` - Optional. Auto-restarts per connector. Defaults to `5`.
//! - `VAULT_GRACEFUL_SHUTDOWN_SECS` - Optional. Deadline for stopping connectors. Defaults to `30`.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::security::crypto::KdfDigest;
use crate::util::{env_var_bool, env_var_parse};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),

    #[error("Failed to read config file {0}: {1}")]
    Io(String, std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Key generation and rotation policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationPolicy {
    /// Symmetric algorithm label recorded on every key.
    pub algorithm: String,
    /// Age at which the active key is due for rotation.
    pub rotation_interval_days: u32,
    /// Inactive key versions retained after rotation (newest first).
    pub retain_old_versions: usize,
    /// Whether a background timer rotates keys automatically.
    pub automatic_rotation: bool,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            algorithm: "aes-256-gcm".to_string(),
            rotation_interval_days: 90,
            retain_old_versions: 5,
            automatic_rotation: false,
        }
    }
}

impl RotationPolicy {
    pub const MAX_RETAINED_VERSIONS: usize = 100;

    /// Reject policies that would leave the key manager unable to rotate.
    pub fn validate(&self) -> Result<(), String> {
        if self.rotation_interval_days == 0 {
            return Err("rotation_interval_days must be at least 1".to_string());
        }
        if self.retain_old_versions > Self::MAX_RETAINED_VERSIONS {
            return Err(format!(
                "retain_old_versions must not exceed {}",
                Self::MAX_RETAINED_VERSIONS
            ));
        }
        if self.algorithm.to_lowercase() != "aes-256-gcm" {
            return Err(format!("unsupported algorithm: {}", self.algorithm));
        }
        Ok(())
    }
}

/// Encryption-at-rest settings for the credential store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialStoreConfig {
    /// PBKDF2 rounds used to derive each per-record key.
    pub kdf_iterations: u32,
    pub kdf_digest: KdfDigest,
}

impl Default for CredentialStoreConfig {
    fn default() -> Self {
        Self {
            kdf_iterations: 100_000,
            kdf_digest: KdfDigest::Sha256,
        }
    }
}

/// Auditing and refresh settings for the secure accessor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessorConfig {
    pub auto_refresh: bool,
    /// Refresh when the credential expires within this many minutes.
    pub refresh_threshold_minutes: i64,
    pub max_refresh_attempts: u32,
    /// Base of the `base * 2^attempt` refresh backoff.
    pub refresh_backoff_base_ms: u64,
    /// Access timestamps retained per credential.
    pub access_log_capacity: usize,
}

impl Default for AccessorConfig {
    fn default() -> Self {
        Self {
            auto_refresh: true,
            refresh_threshold_minutes: 5,
            max_refresh_attempts: 3,
            refresh_backoff_base_ms: 1_000,
            access_log_capacity: 100,
        }
    }
}

impl AccessorConfig {
    pub fn refresh_backoff_base(&self) -> Duration {
        Duration::from_millis(self.refresh_backoff_base_ms)
    }
}

/// Connector registry settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Start a per-connector health timer on registration.
    pub health_monitoring: bool,
    /// Used when a connector does not declare its own interval.
    pub default_health_check_interval_ms: u64,
    /// Pause between the stop and start halves of a restart.
    pub restart_pause_ms: u64,
    /// Restart a running connector whose health probe reports unhealthy.
    pub auto_restart_unhealthy: bool,
    /// Health samples retained per connector.
    pub health_history_capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            health_monitoring: true,
            default_health_check_interval_ms: 60_000,
            restart_pause_ms: 1_000,
            auto_restart_unhealthy: true,
            health_history_capacity: 1_440,
        }
    }
}

impl RegistryConfig {
    pub fn restart_pause(&self) -> Duration {
        Duration::from_millis(self.restart_pause_ms)
    }
}

/// Orchestrator policy settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Period of the orchestrator's health sweep.
    pub health_check_interval_ms: u64,
    pub auto_restart: bool,
    /// Auto-restarts allowed per connector before the orchestrator gives up.
    pub max_auto_restarts: u32,
    pub graceful_shutdown_timeout_ms: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            health_check_interval_ms: 60_000,
            auto_restart: true,
            max_auto_restarts: 5,
            graceful_shutdown_timeout_ms: 30_000,
        }
    }
}

impl LifecycleConfig {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn graceful_shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.graceful_shutdown_timeout_ms)
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub keys: RotationPolicy,
    pub store: CredentialStoreConfig,
    pub accessor: AccessorConfig,
    pub registry: RegistryConfig,
    pub lifecycle: LifecycleConfig,
}

impl Config {
    /// Load from the YAML file named by `VAULT_CONFIG`, or from the environment.
    pub fn load() -> Result<Self, ConfigError> {
        match std::env::var("VAULT_CONFIG") {
            Ok(path) if !path.trim().is_empty() => Self::from_yaml_file(Path::new(path.trim())),
            _ => Self::from_env(),
        }
    }

    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if a variable is set but malformed,
    /// or if the resulting configuration fails validation.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(days) = parse_env::<u32>("VAULT_KEY_ROTATION_DAYS")? {
            config.keys.rotation_interval_days = days;
        }
        if let Some(retain) = parse_env::<usize>("VAULT_KEY_RETAIN_VERSIONS")? {
            config.keys.retain_old_versions = retain;
        }
        config.keys.automatic_rotation = env_var_bool("VAULT_AUTOMATIC_ROTATION", false);

        if let Some(iterations) = parse_env::<u32>("VAULT_KDF_ITERATIONS")? {
            config.store.kdf_iterations = iterations;
        }

        config.accessor.auto_refresh = env_var_bool("VAULT_AUTO_REFRESH", true);
        if let Some(minutes) = parse_env::<i64>("VAULT_REFRESH_THRESHOLD_MINUTES")? {
            config.accessor.refresh_threshold_minutes = minutes;
        }
        if let Some(attempts) = parse_env::<u32>("VAULT_MAX_REFRESH_ATTEMPTS")? {
            config.accessor.max_refresh_attempts = attempts;
        }

        if let Some(secs) = parse_env::<u64>("VAULT_HEALTH_CHECK_INTERVAL_SECS")? {
            config.registry.default_health_check_interval_ms = secs * 1_000;
            config.lifecycle.health_check_interval_ms = secs * 1_000;
        }
        config.lifecycle.auto_restart = env_var_bool("VAULT_AUTO_RESTART", true);
        if let Some(max) = parse_env::<u32>("VAULT_MAX_AUTO_RESTARTS")? {
            config.lifecycle.max_auto_restarts = max;
        }
        if let Some(secs) = parse_env::<u64>("VAULT_GRACEFUL_SHUTDOWN_SECS")? {
            config.lifecycle.graceful_shutdown_timeout_ms = secs * 1_000;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file. Missing sections use defaults.
    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.display().to_string(), e))?;
        let config: Self = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints before any component is built.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.keys
            .validate()
            .map_err(|e| ConfigError::InvalidValue("keys".to_string(), e))?;
        if self.store.kdf_iterations == 0 {
            return Err(ConfigError::InvalidValue(
                "store.kdf_iterations".to_string(),
                "must be at least 1".to_string(),
            ));
        }
        if self.registry.default_health_check_interval_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "registry.default_health_check_interval_ms".to_string(),
                "must be greater than zero".to_string(),
            ));
        }
        if self.lifecycle.health_check_interval_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "lifecycle.health_check_interval_ms".to_string(),
                "must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_env<T>(name: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    env_var_parse(name).map_err(|e| ConfigError::InvalidValue(name.to_string(), e))
}
