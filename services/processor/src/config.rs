//! Configuration management for the stream processor.
//!
//! This module handles loading and validating configuration from environment
//! variables and configuration files.

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the stream processor.
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessorConfig {
    /// Event source configuration
    #[serde(default)]
    pub source: SourceConfig,

    /// Face detection client configuration
    pub enrichment: EnrichmentConfig,

    /// Rolling result buffer configuration
    #[serde(default)]
    pub results: ResultsConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Periodic statistics reporting
    #[serde(default)]
    pub reporting: ReportingConfig,
}

/// Event source configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    /// Filter criterion for the initial session
    #[serde(default = "default_filter")]
    pub filter: String,

    /// Posts buffered per subscription before slow consumers lag
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

/// Face detection client configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct EnrichmentConfig {
    /// Face detection service root (e.g. "https://region.api.example.com/face/v1.0")
    pub endpoint: String,

    /// Subscription key sent with each request
    #[serde(default)]
    pub api_key: Option<String>,

    /// Request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Maximum concurrent detection requests
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// Maximum detections admitted but not finished; photos beyond it are shed
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
}

/// Rolling result buffer configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ResultsConfig {
    /// Number of most recent results kept for display
    #[serde(default = "default_result_capacity")]
    pub capacity: usize,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Whether to include source code location
    #[serde(default)]
    pub include_location: bool,
}

/// Periodic statistics reporting configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ReportingConfig {
    /// Interval between statistics log lines in seconds
    #[serde(default = "default_report_interval")]
    pub interval_secs: u64,
}

// Default value functions
fn default_filter() -> String {
    "#FashionFace".to_string()
}
fn default_channel_capacity() -> usize {
    1024
}
fn default_request_timeout() -> u64 {
    30
}
fn default_max_in_flight() -> usize {
    16
}
fn default_max_pending() -> usize {
    256
}
fn default_result_capacity() -> usize {
    crate::result_store::DEFAULT_RESULT_CAPACITY
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "json".to_string()
}
fn default_report_interval() -> u64 {
    30
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            filter: default_filter(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl Default for ResultsConfig {
    fn default() -> Self {
        Self {
            capacity: default_result_capacity(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            include_location: false,
        }
    }
}

impl Default for ReportingConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_report_interval(),
        }
    }
}

impl ProcessorConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default config file (config/default.toml)
    /// 2. Environment-specific config (config/{env}.toml)
    /// 3. Environment variables (prefixed with FACESTREAM_)
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let config = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // e.g. FACESTREAM_ENRICHMENT__ENDPOINT
            .add_source(
                Environment::with_prefix("FACESTREAM")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Create configuration from environment variables only.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(
                Environment::with_prefix("FACESTREAM")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.enrichment.endpoint.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "enrichment.endpoint".to_string(),
            ));
        }
        if !self.enrichment.endpoint.starts_with("http://")
            && !self.enrichment.endpoint.starts_with("https://")
        {
            return Err(ConfigValidationError::InvalidValue {
                field: "enrichment.endpoint".to_string(),
                message: "URL must start with http:// or https://".to_string(),
            });
        }

        if self.enrichment.max_in_flight == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "enrichment.max_in_flight".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        if self.enrichment.max_pending < self.enrichment.max_in_flight {
            return Err(ConfigValidationError::InvalidValue {
                field: "enrichment.max_pending".to_string(),
                message: "Must be at least enrichment.max_in_flight".to_string(),
            });
        }

        if self.results.capacity == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "results.capacity".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        if self.source.channel_capacity == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "source.channel_capacity".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        if self.reporting.interval_secs == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "reporting.interval_secs".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        Ok(())
    }
}

impl EnrichmentConfig {
    /// Get request timeout as Duration.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl ReportingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}
