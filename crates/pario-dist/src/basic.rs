//! Everything on the first target

use crate::{DistError, Distribution, DistributionView, Result};
use serde::{Deserialize, Serialize};

/// Whole file on target 0, physical offset equal to logical offset.
///
/// Also serves as the identity mapping when a request tree describes
/// client memory rather than a file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Basic;

impl Distribution for Basic {
    fn name(&self) -> &'static str {
        "basic"
    }

    fn logical_to_physical(&self, view: &DistributionView, logical: u64) -> u64 {
        if view.target_index == 0 { logical } else { 0 }
    }

    fn physical_to_logical(&self, _view: &DistributionView, physical: u64) -> u64 {
        physical
    }

    fn next_mapped_offset(&self, view: &DistributionView, logical: u64) -> Option<u64> {
        (view.target_index == 0).then_some(logical)
    }

    fn contiguous_length(&self, _view: &DistributionView, physical: u64) -> u64 {
        u64::MAX - physical
    }

    fn logical_file_size(&self, physical_sizes: &[u64]) -> u64 {
        physical_sizes.first().copied().unwrap_or(0)
    }

    fn target_count(&self, available: u32) -> Result<u32> {
        if available == 0 {
            return Err(DistError::NotEnoughTargets {
                required: 1,
                available,
            });
        }
        Ok(1)
    }
}
