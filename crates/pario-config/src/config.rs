//! Engine and logging configuration
//!
//! Sources are applied in the order they were added to a [`ConfigLoader`].
//! A TOML file or string replaces the whole configuration; environment
//! variables override single fields on top of whatever came before.

use crate::validate::Validator;
use crate::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration source type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// Load from a file
    File(PathBuf),
    /// Load from environment variables
    Env,
    /// Use default values
    Default,
    /// Load from in-memory string (for testing)
    Memory(String),
}

/// Log level configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[derive(Default)]
pub enum LogLevel {
    /// Trace level
    Trace,
    /// Debug level
    Debug,
    /// Info level
    #[default]
    Info,
    /// Warn level
    Warn,
    /// Error level
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        })
    }
}

impl std::str::FromStr for LogLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            _ => Err(ConfigError::InvalidValue {
                field: "log_level".to_string(),
                message: format!("Invalid log level: {s}"),
            }),
        }
    }
}

/// Log format configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[derive(Default)]
pub enum LogFormat {
    /// JSON format
    Json,
    /// Pretty format
    Pretty,
    /// Compact format
    #[default]
    Compact,
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            _ => Err(ConfigError::InvalidValue {
                field: "log_format".to_string(),
                message: format!("Invalid log format: {s}"),
            }),
        }
    }
}

/// Log output configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[derive(Default)]
pub enum LogOutput {
    /// Output to stdout
    Stdout,
    /// Output to stderr
    #[default]
    Stderr,
    /// Output to file
    File,
}

impl std::str::FromStr for LogOutput {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "stdout" => Ok(Self::Stdout),
            "stderr" => Ok(Self::Stderr),
            "file" => Ok(Self::File),
            _ => Err(ConfigError::InvalidValue {
                field: "log_output".to_string(),
                message: format!("Invalid log output: {s}"),
            }),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level
    pub level: LogLevel,
    /// Log format
    pub format: LogFormat,
    /// Log output
    pub output: LogOutput,
    /// File path for file output
    pub file_path: Option<PathBuf>,
    /// Include the module path of each event
    pub include_target: bool,
    /// Include source file and line of each event
    pub include_file_line: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Compact,
            output: LogOutput::Stderr,
            file_path: None,
            include_target: true,
            include_file_line: false,
        }
    }
}

/// Engine tuning for one logical I/O call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IoConfig {
    /// Segments per walker batch
    pub max_segments: usize,
    /// Bytes per walker batch
    pub max_bytes: u64,
    /// Deadline for each request, acknowledgment and completion message
    pub message_timeout_ms: u64,
    /// Deadline for each bulk transfer
    pub transfer_timeout_ms: u64,
    /// Sleep between polls that completed nothing
    pub poll_interval_ms: u64,
    /// Upper bound on targets a new file is striped over; wider existing
    /// layouts are refused rather than re-striped
    pub max_targets: u32,
    /// Distribution for new files: `simple_stripe[:size]`, `varstrip:<strips>` or `basic`
    pub distribution: String,
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            max_segments: 64,
            max_bytes: 4 * 1024 * 1024,
            message_timeout_ms: 30_000,
            transfer_timeout_ms: 300_000,
            poll_interval_ms: 5,
            max_targets: 1024,
            distribution: "simple_stripe".to_string(),
        }
    }
}

impl IoConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the walker batch budget
    pub fn with_batch(mut self, max_segments: usize, max_bytes: u64) -> Self {
        self.max_segments = max_segments;
        self.max_bytes = max_bytes;
        self
    }

    pub fn with_message_timeout(mut self, timeout: Duration) -> Self {
        self.message_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_transfer_timeout(mut self, timeout: Duration) -> Self {
        self.transfer_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_max_targets(mut self, max_targets: u32) -> Self {
        self.max_targets = max_targets;
        self
    }

    pub fn with_distribution(mut self, distribution: impl Into<String>) -> Self {
        self.distribution = distribution.into();
        self
    }

    pub fn message_timeout(&self) -> Duration {
        Duration::from_millis(self.message_timeout_ms)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.max_segments == 0 {
            return Err(ConfigError::InvalidValue {
                field: "io.max_segments".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }
        if self.max_bytes == 0 {
            return Err(ConfigError::InvalidValue {
                field: "io.max_bytes".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }
        if self.message_timeout_ms == 0 || self.transfer_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "io.timeout".to_string(),
                message: "timeouts must be greater than 0".to_string(),
            });
        }
        if self.max_targets == 0 {
            return Err(ConfigError::InvalidValue {
                field: "io.max_targets".to_string(),
                message: "must be greater than 0".to_string(),
            });
        }
        pario_dist::DistributionSpec::parse(&self.distribution).map_err(|e| {
            ConfigError::InvalidValue {
                field: "io.distribution".to_string(),
                message: e.to_string(),
            }
        })?;
        Ok(())
    }
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct ParioConfig {
    /// Engine configuration
    pub io: IoConfig,
    /// Logging configuration
    pub log: LogConfig,
}

/// Configuration loader
pub struct ConfigLoader {
    sources: Vec<ConfigSource>,
    env_prefix: Option<String>,
}

impl ConfigLoader {
    /// Create a new configuration loader
    #[must_use]
    pub fn new() -> Self {
        Self {
            sources: vec![ConfigSource::Default],
            env_prefix: None,
        }
    }

    /// Add a file source
    pub fn with_file(mut self, path: impl AsRef<Path>) -> Self {
        self.sources
            .push(ConfigSource::File(path.as_ref().to_path_buf()));
        self
    }

    /// Add an in-memory TOML source
    pub fn with_str(mut self, content: impl Into<String>) -> Self {
        self.sources.push(ConfigSource::Memory(content.into()));
        self
    }

    /// Add environment variable source with prefix
    #[must_use]
    pub fn with_env_prefix(mut self, prefix: &str) -> Self {
        self.env_prefix = Some(prefix.to_string());
        self.sources.push(ConfigSource::Env);
        self
    }

    /// Load configuration from all sources
    pub fn load(&self) -> Result<ParioConfig> {
        let mut config = ParioConfig::default();

        for source in &self.sources {
            match source {
                ConfigSource::Default => {}
                ConfigSource::File(path) => {
                    let content = std::fs::read_to_string(path)?;
                    config =
                        toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
                }
                ConfigSource::Env => {
                    if let Some(prefix) = &self.env_prefix {
                        config = Self::apply_env_overrides(config, prefix)?;
                    }
                }
                ConfigSource::Memory(content) => {
                    config =
                        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
                }
            }
        }

        Self::expand_paths(&mut config);
        Ok(config)
    }

    /// Load, then reject anything [`Validator`] reports as an error.
    /// Warnings are logged.
    pub fn load_validated(&self) -> Result<ParioConfig> {
        let config = self.load()?;
        for warning in Validator::new().validate(&config).into_result()? {
            tracing::warn!(%warning, "configuration warning");
        }
        Ok(config)
    }

    /// Load configuration from a TOML string
    pub fn load_from_str(toml: &str) -> Result<ParioConfig> {
        let mut config: ParioConfig =
            toml::from_str(toml).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Self::expand_paths(&mut config);
        Ok(config)
    }

    fn expand_paths(config: &mut ParioConfig) {
        if let Some(ref path) = config.log.file_path {
            config.log.file_path = Some(Self::expand_path(path));
        }
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(mut config: ParioConfig, prefix: &str) -> Result<ParioConfig> {
        if let Ok(val) = std::env::var(format!("{prefix}_IO_MAX_SEGMENTS")) {
            config.io.max_segments = val
                .parse()
                .map_err(|_| ConfigError::EnvVar(format!("Invalid max_segments value: {val}")))?;
        }
        if let Ok(val) = std::env::var(format!("{prefix}_IO_MAX_BYTES")) {
            config.io.max_bytes = val
                .parse()
                .map_err(|_| ConfigError::EnvVar(format!("Invalid max_bytes value: {val}")))?;
        }
        if let Ok(val) = std::env::var(format!("{prefix}_IO_MESSAGE_TIMEOUT_MS")) {
            config.io.message_timeout_ms = val.parse().map_err(|_| {
                ConfigError::EnvVar(format!("Invalid message_timeout_ms value: {val}"))
            })?;
        }
        if let Ok(val) = std::env::var(format!("{prefix}_IO_TRANSFER_TIMEOUT_MS")) {
            config.io.transfer_timeout_ms = val.parse().map_err(|_| {
                ConfigError::EnvVar(format!("Invalid transfer_timeout_ms value: {val}"))
            })?;
        }
        if let Ok(val) = std::env::var(format!("{prefix}_IO_POLL_INTERVAL_MS")) {
            config.io.poll_interval_ms = val.parse().map_err(|_| {
                ConfigError::EnvVar(format!("Invalid poll_interval_ms value: {val}"))
            })?;
        }
        if let Ok(val) = std::env::var(format!("{prefix}_IO_MAX_TARGETS")) {
            config.io.max_targets = val
                .parse()
                .map_err(|_| ConfigError::EnvVar(format!("Invalid max_targets value: {val}")))?;
        }
        if let Ok(val) = std::env::var(format!("{prefix}_IO_DISTRIBUTION")) {
            config.io.distribution = val;
        }

        if let Ok(val) = std::env::var(format!("{prefix}_LOG_LEVEL")) {
            config.log.level = val.parse()?;
        }
        if let Ok(val) = std::env::var(format!("{prefix}_LOG_FORMAT")) {
            config.log.format = val.parse()?;
        }
        if let Ok(val) = std::env::var(format!("{prefix}_LOG_OUTPUT")) {
            config.log.output = val.parse()?;
        }
        if let Ok(val) = std::env::var(format!("{prefix}_LOG_FILE_PATH")) {
            config.log.file_path = Some(PathBuf::from(val));
        }

        Ok(config)
    }

    /// Expand path with tilde
    fn expand_path(path: &Path) -> PathBuf {
        if let Some(rest) = path.to_str().and_then(|s| s.strip_prefix("~/")) {
            if let Some(home) = dirs::home_dir() {
                return home.join(rest);
            }
        }
        path.to_path_buf()
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
