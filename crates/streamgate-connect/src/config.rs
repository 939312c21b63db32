//! Configuration types for streamgate-connect
//!
//! Architecture:
//!   Sources (workspace topics, datagen) → run loop → local sink

use crate::connectors::datagen::DatagenConfig;
use crate::connectors::stdout::OutputFormat;
use crate::connectors::workspace::WorkspaceSourceConfig;
use crate::rate_limiter::RateLimitConfig;
use crate::throughput::WindowPolicy;
use crate::traits::retry::RetryConfig;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;
use validator::Validate;

/// Pre-compiled regex for environment variable expansion
/// Pattern: ${VAR} or ${VAR:-default}
static ENV_VAR_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*)(?::-([^}]*))?\}")
        .expect("env var regex pattern is invalid - this is a bug")
});

/// Root configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectConfig {
    /// Configuration version
    #[serde(default = "default_version")]
    pub version: String,

    /// Source connectors, keyed by instance name
    #[serde(default)]
    pub sources: BTreeMap<String, SourceConfig>,

    /// Global settings
    #[serde(default)]
    pub settings: GlobalSettings,
}

fn default_version() -> String {
    "1.0".to_string()
}

/// Source connector configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceConfig {
    /// Connector type ("workspace", "datagen")
    pub connector: String,

    /// Local topic records are delivered to
    pub topic: String,

    /// Whether this source is enabled
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Connector-specific configuration
    #[serde(default)]
    pub config: serde_yaml::Value,

    /// Where forwarded records go
    #[serde(default)]
    pub sink: SinkConfig,

    /// Pacing of produce calls
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

/// Built-in sink kinds
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SinkType {
    #[default]
    Stdout,
    Null,
}

/// Sink attached to a source
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct SinkConfig {
    #[serde(rename = "type", default)]
    pub sink_type: SinkType,

    /// Output format (stdout only)
    #[serde(default)]
    pub format: OutputFormat,
}

/// Global settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GlobalSettings {
    /// Backoff for transient connector errors
    #[serde(default)]
    pub retry: RetrySettings,

    /// Throughput accounting
    #[serde(default)]
    pub throughput: ThroughputSettings,

    /// Hard bound on shutdown after cancellation, in milliseconds
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,

    /// Log level used when RUST_LOG is not set
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            retry: RetrySettings::default(),
            throughput: ThroughputSettings::default(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            log_level: default_log_level(),
        }
    }
}

impl GlobalSettings {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

fn default_shutdown_timeout_ms() -> u64 {
    10_000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

/// Retry configuration for transient errors
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetrySettings {
    /// Consecutive failed calls per record (first call included) before giving up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial backoff in milliseconds
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Maximum backoff in milliseconds
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,

    /// Backoff multiplier
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetrySettings {
    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig::new()
            .with_max_attempts(self.max_attempts)
            .with_initial_delay(Duration::from_millis(self.initial_backoff_ms))
            .with_max_delay(Duration::from_millis(self.max_backoff_ms))
            .with_backoff_multiplier(self.backoff_multiplier)
    }
}

fn default_max_attempts() -> u32 {
    5
}
fn default_initial_backoff() -> u64 {
    100
}
fn default_max_backoff() -> u64 {
    30_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

/// Throughput window configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ThroughputSettings {
    /// Time window length in milliseconds
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    /// Count-based windows; takes precedence over `window_ms` when set
    #[serde(default)]
    pub window_records: Option<u64>,

    /// How often sealed windows are logged, in milliseconds
    #[serde(default = "default_report_interval_ms")]
    pub report_interval_ms: u64,
}

impl Default for ThroughputSettings {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
            window_records: None,
            report_interval_ms: default_report_interval_ms(),
        }
    }
}

impl ThroughputSettings {
    pub fn window_policy(&self) -> WindowPolicy {
        match self.window_records {
            Some(n) => WindowPolicy::Records(n),
            None => WindowPolicy::Duration(Duration::from_millis(self.window_ms)),
        }
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_interval_ms)
    }
}

fn default_window_ms() -> u64 {
    1_000
}
fn default_report_interval_ms() -> u64 {
    5_000
}

impl ConnectConfig {
    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_yaml(&content)
    }

    /// Parse (after env expansion) and validate YAML text
    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        let expanded = Self::expand_env_vars(content);
        let config: Self =
            serde_yaml::from_str(&expanded).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// Expand environment variables in the format ${VAR} or ${VAR:-default}
    fn expand_env_vars(content: &str) -> String {
        ENV_VAR_REGEX
            .replace_all(content, |caps: &regex::Captures| {
                let var_name = &caps[1];
                let default = caps.get(2).map(|m| m.as_str());

                std::env::var(var_name).unwrap_or_else(|_| default.unwrap_or("").to_string())
            })
            .to_string()
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        for (name, source) in &self.sources {
            if source.topic.is_empty() {
                anyhow::bail!("Source '{}' must have a 'topic' specified", name);
            }
        }

        let retry = &self.settings.retry;
        if retry.max_attempts == 0 {
            anyhow::bail!("settings.retry.max_attempts must be at least 1");
        }
        if retry.backoff_multiplier < 1.0 {
            anyhow::bail!("settings.retry.backoff_multiplier must be >= 1.0");
        }

        self.settings
            .throughput
            .window_policy()
            .validate()
            .context("settings.throughput")?;
        if self.settings.throughput.report_interval_ms == 0 {
            anyhow::bail!("settings.throughput.report_interval_ms must be positive");
        }

        self.validate_connector_configs()
    }

    /// Validate connector-specific configurations
    fn validate_connector_configs(&self) -> anyhow::Result<()> {
        for (name, source) in &self.sources {
            match source.connector.as_str() {
                "workspace" => {
                    let config: WorkspaceSourceConfig =
                        serde_yaml::from_value(source.config.clone()).map_err(|e| {
                            anyhow::anyhow!("Source '{}': invalid workspace config: {}", name, e)
                        })?;
                    config.check().map_err(|e| {
                        anyhow::anyhow!("Source '{}': config validation failed: {}", name, e)
                    })?;
                }
                "datagen" => {
                    let config: DatagenConfig = if source.config.is_null() {
                        DatagenConfig::default()
                    } else {
                        serde_yaml::from_value(source.config.clone()).map_err(|e| {
                            anyhow::anyhow!("Source '{}': invalid datagen config: {}", name, e)
                        })?
                    };
                    config.validate().map_err(|e| {
                        anyhow::anyhow!("Source '{}': config validation failed: {}", name, e)
                    })?;
                }
                unknown => {
                    anyhow::bail!("Source '{}': unknown connector type '{}'", name, unknown);
                }
            }
        }
        Ok(())
    }

    /// Get enabled sources
    pub fn enabled_sources(&self) -> impl Iterator<Item = (&String, &SourceConfig)> {
        self.sources.iter().filter(|(_, s)| s.enabled)
    }
}
