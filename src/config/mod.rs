//! Configuration module for Tsubame Mailr
//!
//! Handles loading and parsing of YAML configuration files with support for
//! environment variable expansion and validation. Every section is optional;
//! missing values take the defaults below.

use crate::auth::DEFAULT_TOKEN_ENV;
use crate::upload::{RetryPolicy, UploadSettings, ALIGNMENT_UNIT};
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

// ============================================================================
// Environment Variable Expansion
// ============================================================================

lazy_static! {
    static ref ENV_VAR: regex_lite::Regex =
        regex_lite::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]+))?\}")
            .expect("environment variable pattern is valid");
}

/// Expand environment variables in a string.
///
/// Supports two syntaxes:
/// - `${VAR_NAME}` - Simple expansion, keeps placeholder if var not found
/// - `${VAR_NAME:-default}` - Expansion with default value
///
/// Variable names must start with a letter or underscore and contain only
/// uppercase letters, digits, and underscores.
pub(crate) fn expand_env_vars(s: &str) -> String {
    let mut last_match = 0;
    let mut result = String::with_capacity(s.len());

    for cap in ENV_VAR.captures_iter(s) {
        let (Some(full_match), Some(var_name)) = (cap.get(0), cap.get(1)) else {
            continue;
        };

        result.push_str(&s[last_match..full_match.start()]);

        let value = match std::env::var(var_name.as_str()) {
            Ok(val) => val,
            Err(_) => match cap.get(2) {
                Some(default) => default.as_str().to_string(),
                // No env var and no default. Keep the original placeholder.
                None => full_match.as_str().to_string(),
            },
        };
        result.push_str(&value);

        last_match = full_match.end();
    }

    result.push_str(&s[last_match..]);
    result
}

/// Deserialize an optional string, expanding environment variables
fn deserialize_optional_with_env<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::de::Deserializer<'de>,
{
    let s = Option::<String>::deserialize(deserializer)?;
    Ok(s.map(|s| expand_env_vars(&s)))
}

// ============================================================================
// Validation Helpers
// ============================================================================

/// Validate that a URL starts with http:// or https://
fn is_valid_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub graph: GraphConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        ConfigLoader::load(path)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_valid_http_url(&self.graph.base_url) {
            return Err(ConfigError::ValidationError(
                "Invalid graph.base_url: must start with http:// or https://".into(),
            ));
        }

        if self.graph.timeout_seconds == 0 {
            return Err(ConfigError::ValidationError(
                "graph.timeout_seconds must be at least 1".into(),
            ));
        }

        if self.auth.token_env.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "auth.token_env must not be empty".into(),
            ));
        }

        self.upload.validate()?;

        match self.logging.format.as_str() {
            "pretty" | "json" => {}
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid logging.format '{}': must be 'pretty' or 'json'",
                    other
                )))
            }
        }

        Ok(())
    }
}

/// Microsoft Graph endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Per-request timeout for mail operations
    #[serde(default = "default_graph_timeout")]
    pub timeout_seconds: u64,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_seconds: default_graph_timeout(),
        }
    }
}

fn default_base_url() -> String {
    "https://graph.microsoft.com/v1.0".to_string()
}

fn default_graph_timeout() -> u64 {
    30
}

/// Access token configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Explicit bearer token. Supports `${VAR}` expansion.
    #[serde(
        default,
        skip_serializing,
        deserialize_with = "deserialize_optional_with_env"
    )]
    pub access_token: Option<String>,

    /// Environment variable read when no explicit token is set
    #[serde(default = "default_token_env")]
    pub token_env: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            access_token: None,
            token_env: default_token_env(),
        }
    }
}

fn default_token_env() -> String {
    DEFAULT_TOKEN_ENV.to_string()
}

/// Resumable upload configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Must be a positive multiple of 327680 (320 KiB)
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: u32,

    /// Attempts per chunk, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_millis")]
    pub base_delay_millis: u64,

    #[serde(default = "default_max_delay_millis")]
    pub max_delay_millis: u64,

    /// Per-request timeout for chunk uploads
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: default_max_chunk_size(),
            max_attempts: default_max_attempts(),
            base_delay_millis: default_base_delay_millis(),
            max_delay_millis: default_max_delay_millis(),
            request_timeout_seconds: default_request_timeout(),
        }
    }
}

impl UploadConfig {
    /// Engine settings described by this section
    pub fn to_settings(&self) -> UploadSettings {
        UploadSettings {
            max_chunk_size: self.max_chunk_size,
            retry: RetryPolicy {
                max_attempts: self.max_attempts,
                base_delay: Duration::from_millis(self.base_delay_millis),
                max_delay: Duration::from_millis(self.max_delay_millis),
            },
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_chunk_size == 0 || self.max_chunk_size % ALIGNMENT_UNIT != 0 {
            return Err(ConfigError::ValidationError(format!(
                "upload.max_chunk_size must be a positive multiple of {}, got {}",
                ALIGNMENT_UNIT, self.max_chunk_size
            )));
        }

        if self.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "upload.max_attempts must be at least 1".into(),
            ));
        }

        if self.base_delay_millis > self.max_delay_millis {
            return Err(ConfigError::ValidationError(format!(
                "upload.base_delay_millis ({}) exceeds upload.max_delay_millis ({})",
                self.base_delay_millis, self.max_delay_millis
            )));
        }

        if self.request_timeout_seconds == 0 {
            return Err(ConfigError::ValidationError(
                "upload.request_timeout_seconds must be at least 1".into(),
            ));
        }

        Ok(())
    }
}

fn default_max_chunk_size() -> u32 {
    ALIGNMENT_UNIT
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_millis() -> u64 {
    500
}

fn default_max_delay_millis() -> u64 {
    30_000
}

fn default_request_timeout() -> u64 {
    60
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,

    /// `pretty` or `json`
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}
