#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::uninlined_format_args)]

//! Distribution Strategies for Striped Files
//!
//! A file's logical byte stream is spread across a set of storage targets
//! (datafiles). A distribution strategy answers, for one target:
//! - which logical offset is the next one it holds
//! - where a logical offset lands in the target's physical datafile
//! - how long the physically contiguous run at a physical offset is
//!
//! Strategies are pure functions of their parameters plus a
//! [`DistributionView`]; they hold no per-call state.

pub mod basic;
pub mod simple;
pub mod spec;
pub mod varstrip;

pub use basic::Basic;
pub use simple::SimpleStripe;
pub use spec::DistributionSpec;
pub use varstrip::{Strip, VarStrip};

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Distribution error types
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DistError {
    /// Strategy parameter rejected
    #[error("Invalid distribution parameter {name}: {message}")]
    InvalidParameter {
        /// Parameter name
        name: String,
        /// Error message
        message: String,
    },

    /// Layout needs more targets than are available
    #[error("Distribution needs {required} targets but only {available} available")]
    NotEnoughTargets {
        /// Targets named by the layout
        required: u32,
        /// Targets the caller can provide
        available: u32,
    },

    /// Unknown strategy name
    #[error("Unknown distribution: {0}")]
    Unknown(String),
}

/// Result type for distribution operations
pub type Result<T> = std::result::Result<T, DistError>;

/// Per-target parameters a strategy is evaluated against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributionView {
    /// Relative number of this target within the distribution
    pub target_index: u32,
    /// Total number of targets the file is striped over
    pub target_count: u32,
    /// Known physical size of this target's datafile
    pub file_size: u64,
    /// Writes may grow the datafile past `file_size`
    pub extend: bool,
}

impl DistributionView {
    /// View of target `target_index` out of `target_count`, empty and not extending
    #[must_use]
    pub const fn new(target_index: u32, target_count: u32) -> Self {
        Self {
            target_index,
            target_count,
            file_size: 0,
            extend: false,
        }
    }

    #[must_use]
    pub const fn with_file_size(mut self, file_size: u64) -> Self {
        self.file_size = file_size;
        self
    }

    #[must_use]
    pub const fn with_extend(mut self, extend: bool) -> Self {
        self.extend = extend;
        self
    }
}

/// Mapping between logical file offsets and one target's physical offsets
pub trait Distribution: fmt::Debug + Send + Sync {
    /// Short registered name, e.g. `simple_stripe`
    fn name(&self) -> &'static str;

    /// Physical offset on `view.target_index` for a logical offset.
    ///
    /// Offsets not held by the target map to the physical position of the
    /// next logical offset the target does hold.
    fn logical_to_physical(&self, view: &DistributionView, logical: u64) -> u64;

    /// Logical offset of a physical byte on `view.target_index`
    fn physical_to_logical(&self, view: &DistributionView, physical: u64) -> u64;

    /// Smallest logical offset `>= logical` held by the target.
    ///
    /// `None` means the target holds no data at all under this layout.
    fn next_mapped_offset(&self, view: &DistributionView, logical: u64) -> Option<u64>;

    /// Bytes physically contiguous on the target starting at `physical`
    /// that are also logically contiguous
    fn contiguous_length(&self, view: &DistributionView, physical: u64) -> u64;

    /// Logical file size given each target's physical datafile size
    fn logical_file_size(&self, physical_sizes: &[u64]) -> u64;

    /// Number of targets to stripe over when `available` are offered
    fn target_count(&self, available: u32) -> Result<u32>;
}

/// Parse a size with an optional binary suffix (`K`, `M`, `G`)
pub(crate) fn parse_size(name: &str, value: &str) -> Result<u64> {
    let value = value.trim();
    let (digits, multiplier) = match value.chars().last() {
        Some('k' | 'K') => (&value[..value.len() - 1], 1024),
        Some('m' | 'M') => (&value[..value.len() - 1], 1024 * 1024),
        Some('g' | 'G') => (&value[..value.len() - 1], 1024 * 1024 * 1024),
        _ => (value, 1),
    };
    let base: u64 = digits.trim().parse().map_err(|_| DistError::InvalidParameter {
        name: name.to_string(),
        message: format!("not a size: {value:?}"),
    })?;
    base.checked_mul(multiplier)
        .ok_or_else(|| DistError::InvalidParameter {
            name: name.to_string(),
            message: format!("size overflows: {value:?}"),
        })
}
