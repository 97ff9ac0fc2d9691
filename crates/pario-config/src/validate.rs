//! Configuration validation

use crate::config::{IoConfig, LogConfig, LogOutput, ParioConfig};
use crate::{ConfigError, Result};
use pario_dist::DistributionSpec;
use std::fmt;

/// Result of configuration validation
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// Problems that prevent the configuration from being used
    pub errors: Vec<ValidationError>,
    /// Non-blocking remarks about the configuration
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationResult {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Returns true if there are no validation errors
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    #[must_use]
    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }

    pub fn add_error(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: ValidationWarning) {
        self.warnings.push(warning);
    }

    /// Merges another validation result into this one
    pub fn merge(&mut self, other: Self) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    /// Fold errors into one [`ConfigError::Validation`], passing warnings through
    pub fn into_result(self) -> Result<Vec<ValidationWarning>> {
        if self.errors.is_empty() {
            return Ok(self.warnings);
        }
        let joined = self
            .errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        Err(ConfigError::Validation(joined))
    }
}

/// Validation error details
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// The configuration field that failed validation
    pub field: String,
    /// Human-readable error message
    pub message: String,
    /// Error classification code
    pub code: ErrorCode,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>, code: ErrorCode) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            code,
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {}: {}", self.code, self.field, self.message)
    }
}

/// Validation warning details
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationWarning {
    pub field: String,
    pub message: String,
    /// Optional suggestion for resolving the warning
    pub suggestion: Option<String>,
}

impl ValidationWarning {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            suggestion: None,
        }
    }

    pub fn with_suggestion(
        field: impl Into<String>,
        message: impl Into<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            suggestion: Some(suggestion.into()),
        }
    }
}

impl fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[WARNING] {}: {}", self.field, self.message)?;
        if let Some(ref s) = self.suggestion {
            write!(f, " (Suggestion: {s})")?;
        }
        Ok(())
    }
}

/// Error code classifications
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// A required field is missing or empty
    Required,
    /// A value is outside the acceptable range
    OutOfRange,
    /// A value has an invalid format
    InvalidFormat,
    /// Configuration values are in conflict with each other
    Conflict,
}

/// Main configuration validator
#[derive(Debug, Default)]
pub struct Validator {
    /// Report questionable but usable settings as warnings
    strict_mode: bool,
}

impl Validator {
    #[must_use]
    pub const fn new() -> Self {
        Self { strict_mode: false }
    }

    #[must_use]
    pub const fn with_strict_mode(mut self, enabled: bool) -> Self {
        self.strict_mode = enabled;
        self
    }

    /// Validates a complete `ParioConfig`
    #[must_use]
    pub fn validate(&self, config: &ParioConfig) -> ValidationResult {
        let mut result = ValidationResult::new();
        result.merge(self.validate_io(&config.io));
        result.merge(self.validate_log(&config.log));
        result
    }

    #[must_use]
    pub fn validate_io(&self, config: &IoConfig) -> ValidationResult {
        let mut result = ValidationResult::new();

        if config.max_segments == 0 {
            result.add_error(ValidationError::new(
                "io.max_segments",
                "Segment budget must be greater than 0",
                ErrorCode::OutOfRange,
            ));
        }
        if config.max_bytes == 0 {
            result.add_error(ValidationError::new(
                "io.max_bytes",
                "Byte budget must be greater than 0",
                ErrorCode::OutOfRange,
            ));
        }
        if config.message_timeout_ms == 0 {
            result.add_error(ValidationError::new(
                "io.message_timeout_ms",
                "Message timeout must be greater than 0",
                ErrorCode::OutOfRange,
            ));
        }
        if config.transfer_timeout_ms == 0 {
            result.add_error(ValidationError::new(
                "io.transfer_timeout_ms",
                "Transfer timeout must be greater than 0",
                ErrorCode::OutOfRange,
            ));
        }
        if config.max_targets == 0 {
            result.add_error(ValidationError::new(
                "io.max_targets",
                "At least one target is required",
                ErrorCode::OutOfRange,
            ));
        }
        if let Err(e) = DistributionSpec::parse(&config.distribution) {
            result.add_error(ValidationError::new(
                "io.distribution",
                e.to_string(),
                ErrorCode::InvalidFormat,
            ));
        }

        if config.poll_interval_ms >= config.message_timeout_ms && config.message_timeout_ms > 0 {
            result.add_error(ValidationError::new(
                "io.poll_interval_ms",
                "Poll interval must be shorter than the message timeout",
                ErrorCode::Conflict,
            ));
        }

        if self.strict_mode {
            if config.poll_interval_ms == 0 {
                result.add_warning(ValidationWarning::with_suggestion(
                    "io.poll_interval_ms",
                    "Zero poll interval busy-waits on idle polls",
                    "Use at least 1 ms",
                ));
            }
            if config.transfer_timeout_ms < config.message_timeout_ms {
                result.add_warning(ValidationWarning::new(
                    "io.transfer_timeout_ms",
                    "Transfer timeout is shorter than the message timeout",
                ));
            }
        }
        result
    }

    #[must_use]
    pub fn validate_log(&self, config: &LogConfig) -> ValidationResult {
        let mut result = ValidationResult::new();

        if config.output == LogOutput::File && config.file_path.is_none() {
            result.add_error(ValidationError::new(
                "log.file_path",
                "file_path must be set when output is 'file'",
                ErrorCode::Required,
            ));
        }

        if let Some(parent) = config.file_path.as_ref().and_then(|p| p.parent()) {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                result.add_warning(ValidationWarning::with_suggestion(
                    "log.file_path",
                    format!("Log directory does not exist: {}", parent.display()),
                    "Directory will be created when logging starts",
                ));
            }
        }
        if self.strict_mode && config.file_path.is_some() && config.output != LogOutput::File {
            result.add_warning(ValidationWarning::new(
                "log.file_path",
                "file_path is ignored unless output is 'file'",
            ));
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    #[test]
    fn test_validation_result_operations() {
        let mut result = ValidationResult::new();
        assert!(result.is_valid());
        assert!(!result.has_warnings());

        result.add_error(ValidationError::new("io", "error", ErrorCode::Required));
        assert!(!result.is_valid());

        result.add_warning(ValidationWarning::new("io", "warning"));
        assert!(result.has_warnings());
    }

    #[test]
    fn test_display() {
        let error = ValidationError::new("io.max_bytes", "too small", ErrorCode::OutOfRange);
        assert_eq!(error.to_string(), "[OutOfRange] io.max_bytes: too small");
        let warning = ValidationWarning::with_suggestion("log", "odd", "fix it");
        assert_eq!(warning.to_string(), "[WARNING] log: odd (Suggestion: fix it)");
    }

    #[test]
    fn test_into_result() {
        let mut result = ValidationResult::new();
        result.add_warning(ValidationWarning::new("log", "noisy"));
        assert_eq!(result.clone().into_result().unwrap().len(), 1);

        result.add_error(ValidationError::new("io.max_bytes", "zero", ErrorCode::OutOfRange));
        result.add_error(ValidationError::new("io.max_targets", "zero", ErrorCode::OutOfRange));
        match result.into_result() {
            Err(ConfigError::Validation(message)) => {
                assert!(message.contains("io.max_bytes"));
                assert!(message.contains("; [OutOfRange] io.max_targets"));
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        let result = Validator::new().validate(&ParioConfig::default());
        assert!(result.is_valid(), "{:?}", result.errors);
    }

    #[test]
    fn test_io_errors_accumulate() {
        let config = IoConfig {
            max_segments: 0,
            max_bytes: 0,
            max_targets: 0,
            distribution: "mirror".to_string(),
            ..IoConfig::default()
        };
        let result = Validator::new().validate_io(&config);
        assert_eq!(result.errors.len(), 4);
        assert!(
            result
                .errors
                .iter()
                .any(|e| e.field == "io.distribution" && e.code == ErrorCode::InvalidFormat)
        );
    }

    #[test]
    fn test_poll_interval_conflict() {
        let config = IoConfig {
            poll_interval_ms: 100,
            message_timeout_ms: 100,
            ..IoConfig::default()
        };
        let result = Validator::new().validate_io(&config);
        assert_eq!(result.errors[0].code, ErrorCode::Conflict);
    }

    #[test]
    fn test_strict_mode_warnings() {
        let config = IoConfig {
            poll_interval_ms: 0,
            transfer_timeout_ms: 10,
            message_timeout_ms: 1000,
            ..IoConfig::default()
        };
        assert!(!Validator::new().validate_io(&config).has_warnings());
        let strict = Validator::new().with_strict_mode(true).validate_io(&config);
        assert!(strict.is_valid());
        assert_eq!(strict.warnings.len(), 2);
    }

    #[test]
    fn test_log_file_output_requires_path() {
        let config = LogConfig {
            output: LogOutput::File,
            ..LogConfig::default()
        };
        let result = Validator::new().validate_log(&config);
        assert_eq!(result.errors[0].code, ErrorCode::Required);
    }

    #[test]
    fn test_log_directory_checks() {
        let dir = TempDir::new().unwrap();
        let present = LogConfig {
            output: LogOutput::File,
            file_path: Some(dir.path().join("pario.log")),
            ..LogConfig::default()
        };
        let result = Validator::new().validate_log(&present);
        assert!(result.is_valid());
        assert!(!result.has_warnings());

        let missing = LogConfig {
            output: LogOutput::File,
            file_path: Some(PathBuf::from("/nonexistent/pario/pario.log")),
            ..LogConfig::default()
        };
        let result = Validator::new().validate_log(&missing);
        assert!(result.is_valid());
        assert!(result.has_warnings());
    }
}
