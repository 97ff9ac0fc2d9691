#![allow(clippy::doc_markdown)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::uninlined_format_args)]
#![allow(unsafe_code)]

//! Settings for the parallel I/O engine
//!
//! # Key Components
//!
//! - **`IoConfig`**: walker batch budgets, per-phase deadlines, poll
//!   interval, target limit and the default distribution
//! - **`LogConfig`** / [`init_logging`]: tracing subscriber setup
//! - **`ConfigLoader`**: defaults, TOML files or strings, `{PREFIX}_*`
//!   environment overrides
//! - **`Validator`**: field-level errors and warnings for a loaded config

pub mod config;
pub mod logging;
pub mod validate;

pub use config::*;
pub use logging::init_logging;
pub use validate::*;

use thiserror::Error;

/// Failures while loading or applying configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML could not be parsed into a `ParioConfig`
    #[error("Parse error: {0}")]
    Parse(String),

    /// One or more [`Validator`] errors, joined
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue {
        /// Dotted field path, e.g. `io.max_segments`
        field: String,
        message: String,
    },

    /// An override variable held an unparsable value
    #[error("Environment override error: {0}")]
    EnvVar(String),

    /// A global subscriber was already installed or the log file failed
    #[error("Logging init error: {0}")]
    LogInit(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;
