//! Configuration module for the CloudWatch shipper.
//!
//! This module provides environment-based configuration for the agent:
//! credentials, the target log group and stream, the upload cadence, and the
//! buffer and retry limits.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::buffer::{OverflowPolicy, DEFAULT_BUFFER_CAPACITY};
use crate::sigv4::Credentials;
use crate::uploader::DEFAULT_MAX_CONFLICT_RETRIES;

/// Default interval between upload ticks in milliseconds
const DEFAULT_UPLOAD_INTERVAL_MS: u64 = 2_000;

/// Minimum upload interval to prevent overwhelming the API
const MIN_UPLOAD_INTERVAL_MS: u64 = 100;

/// Maximum upload interval to ensure reasonable data freshness
const MAX_UPLOAD_INTERVAL_MS: u64 = 300_000;

/// Maximum allowed buffer capacity to prevent memory issues
const MAX_BUFFER_CAPACITY: usize = 1_000_000;

const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

const DEFAULT_MAX_RETRIES: u32 = 3;

/// Configuration for the CloudWatch shipper.
///
/// Settings can be configured via environment variables:
/// - `AWS_REGION`, `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY` (required)
/// - `AWS_SESSION_TOKEN` (optional)
/// - `CLOUDWATCH_LOG_GROUP`, `CLOUDWATCH_LOG_STREAM` (required)
/// - `CLOUDWATCH_UPLOAD_INTERVAL_MS`: Milliseconds between uploads (default: 2000)
/// - `CLOUDWATCH_ENDPOINT`: Endpoint override (default: regional endpoint)
/// - `CLOUDWATCH_REQUEST_TIMEOUT_SECS`: HTTP request timeout (default: 30)
/// - `CLOUDWATCH_MAX_RETRIES`: Transport retry attempts (default: 3)
/// - `CLOUDWATCH_MAX_CONFLICT_RETRIES`: Sequence-token conflict retries (default: 5)
/// - `CLOUDWATCH_BUFFER_CAPACITY`: Maximum queued events (default: 10000)
/// - `CLOUDWATCH_OVERFLOW_POLICY`: `drop-oldest` or `reject` (default: drop-oldest)
/// - `CLOUDWATCH_TOKEN_STORE`: Path of the sequence token file
#[derive(Debug, Clone)]
pub struct Config {
    pub region: String,

    pub credentials: Credentials,

    pub log_group: String,

    pub log_stream: String,

    /// Interval between upload ticks
    pub upload_interval: Duration,

    /// Base URL of the CloudWatch Logs API
    pub endpoint: String,

    /// HTTP request timeout duration
    pub request_timeout: Duration,

    /// Maximum number of retry attempts for transient transport failures
    pub max_retries: u32,

    /// Maximum number of resends after sequence-token conflicts in one upload
    pub max_conflict_retries: u32,

    /// Maximum number of events held in memory
    pub buffer_capacity: usize,

    pub overflow_policy: OverflowPolicy,

    /// File holding persisted sequence tokens
    pub token_store_path: PathBuf,
}

/// Error type for configuration loading failures
#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub env_var: Option<String>,
}

impl ConfigError {
    fn for_var(env_var: &str, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            env_var: Some(env_var.to_string()),
        }
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.env_var {
            Some(var) => write!(f, "Configuration error for {}: {}", var, self.message),
            None => write!(f, "Configuration error: {}", self.message),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Regional CloudWatch Logs endpoint.
pub fn default_endpoint(region: &str) -> String {
    format!("https://logs.{}.amazonaws.com", region)
}

/// Default location of the sequence token file.
pub fn default_token_store_path() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("cloudwatch-shipper").join("sequence-tokens.json"))
        .unwrap_or_else(|| PathBuf::from(".cloudwatch-shipper-tokens.json"))
}

impl Config {
    /// Build a configuration for the given target with default settings.
    pub fn new(
        region: impl Into<String>,
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
        log_group: impl Into<String>,
        log_stream: impl Into<String>,
    ) -> Self {
        let region = region.into();
        Self {
            endpoint: default_endpoint(&region),
            region,
            credentials: Credentials::new(access_key_id, secret_access_key),
            log_group: log_group.into(),
            log_stream: log_stream.into(),
            upload_interval: Duration::from_millis(DEFAULT_UPLOAD_INTERVAL_MS),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            max_retries: DEFAULT_MAX_RETRIES,
            max_conflict_retries: DEFAULT_MAX_CONFLICT_RETRIES,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            overflow_policy: OverflowPolicy::default(),
            token_store_path: default_token_store_path(),
        }
    }

    /// Set the upload interval.
    pub fn with_upload_interval(mut self, interval: Duration) -> Self {
        self.upload_interval = interval;
        self
    }

    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - a required variable is missing or empty
    /// - `CLOUDWATCH_UPLOAD_INTERVAL_MS` or `CLOUDWATCH_BUFFER_CAPACITY` is not
    ///   a valid number or is out of range
    /// - `CLOUDWATCH_OVERFLOW_POLICY` names an unknown policy
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use cloudwatch_shipper::config::Config;
    ///
    /// let config = Config::from_env().expect("Failed to load config");
    /// println!("Shipping to {}/{}", config.log_group, config.log_stream);
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        let region = Self::required("AWS_REGION")?;
        let access_key_id = Self::required("AWS_ACCESS_KEY_ID")?;
        let secret_access_key = Self::required("AWS_SECRET_ACCESS_KEY")?;
        let log_group = Self::required("CLOUDWATCH_LOG_GROUP")?;
        let log_stream = Self::required("CLOUDWATCH_LOG_STREAM")?;

        let mut config = Self::new(region, access_key_id, secret_access_key, log_group, log_stream);

        if let Some(token) = Self::optional("AWS_SESSION_TOKEN") {
            config.credentials = config.credentials.with_session_token(token);
        }

        if let Some(endpoint) = Self::optional("CLOUDWATCH_ENDPOINT") {
            config.endpoint = endpoint.trim_end_matches('/').to_string();
        }

        config.upload_interval = Duration::from_millis(Self::parse_bounded(
            "CLOUDWATCH_UPLOAD_INTERVAL_MS",
            DEFAULT_UPLOAD_INTERVAL_MS,
            MIN_UPLOAD_INTERVAL_MS,
            MAX_UPLOAD_INTERVAL_MS,
        )?);

        config.buffer_capacity = Self::parse_bounded(
            "CLOUDWATCH_BUFFER_CAPACITY",
            DEFAULT_BUFFER_CAPACITY as u64,
            1,
            MAX_BUFFER_CAPACITY as u64,
        )? as usize;

        if let Some(policy) = Self::optional("CLOUDWATCH_OVERFLOW_POLICY") {
            config.overflow_policy = policy
                .parse()
                .map_err(|e: String| ConfigError::for_var("CLOUDWATCH_OVERFLOW_POLICY", e))?;
        }

        // Lenient settings: fall back to defaults on unparseable values
        config.request_timeout = Duration::from_secs(
            env::var("CLOUDWATCH_REQUEST_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
        );
        config.max_retries = env::var("CLOUDWATCH_MAX_RETRIES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_MAX_RETRIES);
        config.max_conflict_retries = env::var("CLOUDWATCH_MAX_CONFLICT_RETRIES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_MAX_CONFLICT_RETRIES);

        if let Some(path) = Self::optional("CLOUDWATCH_TOKEN_STORE") {
            config.token_store_path = PathBuf::from(path);
        }

        Ok(config)
    }

    fn required(env_var: &str) -> Result<String, ConfigError> {
        Self::optional(env_var).ok_or_else(|| ConfigError::for_var(env_var, "is required"))
    }

    fn optional(env_var: &str) -> Option<String> {
        env::var(env_var)
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    /// Parse a number from an environment variable with range validation.
    fn parse_bounded(env_var: &str, default: u64, min: u64, max: u64) -> Result<u64, ConfigError> {
        match env::var(env_var) {
            Ok(value) => {
                let parsed: u64 = value.trim().parse().map_err(|_| {
                    ConfigError::for_var(env_var, format!("'{}' is not a valid number", value))
                })?;

                if parsed < min {
                    return Err(ConfigError::for_var(
                        env_var,
                        format!("{} is below minimum ({})", parsed, min),
                    ));
                }

                if parsed > max {
                    return Err(ConfigError::for_var(
                        env_var,
                        format!("{} exceeds maximum ({})", parsed, max),
                    ));
                }

                Ok(parsed)
            }
            Err(_) => Ok(default),
        }
    }
}
