use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::logging::LogFormat;
use crate::registry::SyncPolicy;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),
    #[error("Invalid environment variable {0}: {1}")]
    InvalidEnvVar(String, String),
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // Registry
    pub registry_url: String,
    pub registry_sync_interval_secs: u64,

    // Receipts
    pub receipts_fetch_interval_secs: u64,
    pub feed_timeout_ms: u64,
    pub receipts_cutoff_tolerance_secs: u64,
    pub max_concurrent_requests: usize,
    pub max_feed_bytes: usize,

    // Hardware
    pub hardware_specs_url: Option<String>,
    pub hardware_fetch_interval_secs: u64,

    // Validator sessions
    pub channel_stale_after_secs: u64,

    // Monitoring and logging
    pub log_level: String,
    pub log_format: String,
    pub metrics_enabled: bool,
    pub health_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            registry_url: String::new(),
            registry_sync_interval_secs: 300,

            receipts_fetch_interval_secs: 600,
            feed_timeout_ms: 5000,
            receipts_cutoff_tolerance_secs: 1800,
            max_concurrent_requests: 16,
            max_feed_bytes: 16 * 1024 * 1024,

            hardware_specs_url: None,
            hardware_fetch_interval_secs: 3600,

            channel_stale_after_secs: 600,

            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            metrics_enabled: true,
            health_port: 9090,
        }
    }
}

fn parse_var<T: FromStr>(name: &str, val: String) -> Result<T, ConfigError> {
    val.trim()
        .parse()
        .map_err(|_| ConfigError::InvalidEnvVar(name.to_string(), val))
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build the config from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Config::default();

        config.registry_url =
            lookup("REGISTRY_URL").ok_or_else(|| ConfigError::MissingEnvVar("REGISTRY_URL".to_string()))?;

        if let Some(val) = lookup("REGISTRY_SYNC_INTERVAL_SECS") {
            config.registry_sync_interval_secs = parse_var("REGISTRY_SYNC_INTERVAL_SECS", val)?;
        }

        if let Some(val) = lookup("RECEIPTS_FETCH_INTERVAL_SECS") {
            config.receipts_fetch_interval_secs = parse_var("RECEIPTS_FETCH_INTERVAL_SECS", val)?;
        }

        if let Some(val) = lookup("FEED_TIMEOUT_MS") {
            config.feed_timeout_ms = parse_var("FEED_TIMEOUT_MS", val)?;
        }

        if let Some(val) = lookup("RECEIPTS_CUTOFF_TOLERANCE_SECS") {
            config.receipts_cutoff_tolerance_secs = parse_var("RECEIPTS_CUTOFF_TOLERANCE_SECS", val)?;
        }

        if let Some(val) = lookup("MAX_CONCURRENT_REQUESTS") {
            config.max_concurrent_requests = parse_var("MAX_CONCURRENT_REQUESTS", val)?;
        }

        if let Some(val) = lookup("MAX_FEED_BYTES") {
            config.max_feed_bytes = parse_var("MAX_FEED_BYTES", val)?;
        }

        config.hardware_specs_url = lookup("HARDWARE_SPECS_URL").filter(|val| !val.trim().is_empty());

        if let Some(val) = lookup("HARDWARE_FETCH_INTERVAL_SECS") {
            config.hardware_fetch_interval_secs = parse_var("HARDWARE_FETCH_INTERVAL_SECS", val)?;
        }

        if let Some(val) = lookup("CHANNEL_STALE_AFTER_SECS") {
            config.channel_stale_after_secs = parse_var("CHANNEL_STALE_AFTER_SECS", val)?;
        }

        if let Some(val) = lookup("LOG_LEVEL") {
            config.log_level = val;
        }

        if let Some(val) = lookup("LOG_FORMAT") {
            config.log_format = val;
        }

        if let Some(val) = lookup("METRICS_ENABLED") {
            config.metrics_enabled = val == "1";
        }

        if let Some(val) = lookup("HEALTH_PORT") {
            config.health_port = parse_var("HEALTH_PORT", val)?;
        }

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.registry_url.starts_with("http") {
            return Err(ConfigError::ValidationError("REGISTRY_URL must be a valid HTTP URL".to_string()));
        }

        if self.registry_sync_interval_secs == 0 || self.receipts_fetch_interval_secs == 0 {
            return Err(ConfigError::ValidationError("sync intervals must be greater than 0".to_string()));
        }

        if self.feed_timeout_ms == 0 {
            return Err(ConfigError::ValidationError("FEED_TIMEOUT_MS must be greater than 0".to_string()));
        }

        if self.max_feed_bytes == 0 {
            return Err(ConfigError::ValidationError("MAX_FEED_BYTES must be greater than 0".to_string()));
        }

        if self.hardware_specs_url.as_deref().is_some_and(|url| !url.starts_with("http")) {
            return Err(ConfigError::ValidationError("HARDWARE_SPECS_URL must be a valid HTTP URL".to_string()));
        }

        if self.hardware_fetch_interval_secs == 0 {
            return Err(ConfigError::ValidationError("HARDWARE_FETCH_INTERVAL_SECS must be greater than 0".to_string()));
        }

        if self.max_concurrent_requests == 0 {
            return Err(ConfigError::ValidationError("MAX_CONCURRENT_REQUESTS must be greater than 0".to_string()));
        }

        if LogFormat::parse(&self.log_format).is_none() {
            return Err(ConfigError::ValidationError(format!("unknown LOG_FORMAT {:?}", self.log_format)));
        }

        Ok(())
    }

    pub fn log_format(&self) -> LogFormat {
        LogFormat::parse(&self.log_format).unwrap_or(LogFormat::Pretty)
    }

    pub fn get_registry_sync_interval(&self) -> Duration {
        Duration::from_secs(self.registry_sync_interval_secs)
    }

    pub fn get_receipts_fetch_interval(&self) -> Duration {
        Duration::from_secs(self.receipts_fetch_interval_secs)
    }

    pub fn get_feed_timeout(&self) -> Duration {
        Duration::from_millis(self.feed_timeout_ms)
    }

    pub fn get_hardware_fetch_interval(&self) -> Duration {
        Duration::from_secs(self.hardware_fetch_interval_secs)
    }

    pub fn get_receipts_cutoff_tolerance(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.receipts_cutoff_tolerance_secs as i64)
    }

    pub fn get_channel_stale_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.channel_stale_after_secs as i64)
    }
}

impl SyncPolicy {
    /// Read the selection settings. Called once per sync cycle so that
    /// changes take effect without a restart.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let validators_limit = match lookup("VALIDATORS_LIMIT") {
            Some(val) if !val.trim().is_empty() => {
                Some(parse_var::<usize>("VALIDATORS_LIMIT", val)?).filter(|&limit| limit > 0)
            }
            _ => None,
        };
        let our_validator = lookup("OUR_VALIDATOR_SS58_ADDRESS")
            .map(|val| val.trim().to_string())
            .filter(|val| !val.is_empty());
        Ok(Self { validators_limit, our_validator })
    }
}
