//! Round-robin striping with a fixed strip size

use crate::{DistError, Distribution, DistributionView, Result};
use serde::{Deserialize, Serialize};

/// Default strip size (64 KiB)
pub const DEFAULT_STRIP_SIZE: u64 = 64 * 1024;

/// Strip `i` of the file lives on target `i % target_count`.
///
/// With `target_count` targets and strip size `s`, one stripe covers
/// `s * target_count` logical bytes and contributes `s` physical bytes to
/// every target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimpleStripe {
    strip_size: u64,
}

impl SimpleStripe {
    pub fn new(strip_size: u64) -> Result<Self> {
        if strip_size == 0 {
            return Err(DistError::InvalidParameter {
                name: "strip_size".to_string(),
                message: "must be > 0".to_string(),
            });
        }
        Ok(Self { strip_size })
    }

    pub const fn strip_size(&self) -> u64 {
        self.strip_size
    }

    const fn stripe_size(&self, view: &DistributionView) -> u64 {
        self.strip_size * view.target_count as u64
    }

    const fn strip_start(&self, view: &DistributionView) -> u64 {
        self.strip_size * view.target_index as u64
    }
}

impl Default for SimpleStripe {
    fn default() -> Self {
        Self {
            strip_size: DEFAULT_STRIP_SIZE,
        }
    }
}

impl Distribution for SimpleStripe {
    fn name(&self) -> &'static str {
        "simple_stripe"
    }

    fn logical_to_physical(&self, view: &DistributionView, logical: u64) -> u64 {
        let stripe_size = self.stripe_size(view);
        let stripe = logical / stripe_size;
        let in_stripe = logical % stripe_size;
        let start = self.strip_start(view);
        let base = stripe * self.strip_size;
        if in_stripe < start {
            base
        } else if in_stripe >= start + self.strip_size {
            base + self.strip_size
        } else {
            base + (in_stripe - start)
        }
    }

    fn physical_to_logical(&self, view: &DistributionView, physical: u64) -> u64 {
        let strip = physical / self.strip_size;
        strip * self.stripe_size(view) + self.strip_start(view) + physical % self.strip_size
    }

    fn next_mapped_offset(&self, view: &DistributionView, logical: u64) -> Option<u64> {
        let stripe_size = self.stripe_size(view);
        let stripe = logical / stripe_size;
        let in_stripe = logical % stripe_size;
        let start = self.strip_start(view);
        if in_stripe < start {
            Some(stripe * stripe_size + start)
        } else if in_stripe < start + self.strip_size {
            Some(logical)
        } else {
            Some((stripe + 1) * stripe_size + start)
        }
    }

    fn contiguous_length(&self, _view: &DistributionView, physical: u64) -> u64 {
        self.strip_size - physical % self.strip_size
    }

    fn logical_file_size(&self, physical_sizes: &[u64]) -> u64 {
        let count = physical_sizes.len() as u32;
        physical_sizes
            .iter()
            .enumerate()
            .filter(|(_, size)| **size > 0)
            .map(|(index, size)| {
                let view = DistributionView::new(index as u32, count);
                self.physical_to_logical(&view, size - 1) + 1
            })
            .max()
            .unwrap_or(0)
    }

    fn target_count(&self, available: u32) -> Result<u32> {
        if available == 0 {
            return Err(DistError::NotEnoughTargets {
                required: 1,
                available,
            });
        }
        Ok(available)
    }
}


#[cfg(test)]
mod proptest_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn physical_offsets_map_back(
            strip_size in 1u64..512,
            count in 1u32..8,
            index in 0u32..8,
            physical in 0u64..100_000,
        ) {
            let view = DistributionView::new(index % count, count);
            let dist = SimpleStripe::new(strip_size).unwrap();
            let logical = dist.physical_to_logical(&view, physical);
            prop_assert_eq!(dist.next_mapped_offset(&view, logical), Some(logical));
            prop_assert_eq!(dist.logical_to_physical(&view, logical), physical);
        }

        #[test]
        fn each_logical_byte_has_one_owner(
            strip_size in 1u64..512,
            count in 1u32..8,
            logical in 0u64..100_000,
        ) {
            let dist = SimpleStripe::new(strip_size).unwrap();
            let owners = (0..count)
                .filter(|&index| {
                    let view = DistributionView::new(index, count);
                    dist.next_mapped_offset(&view, logical) == Some(logical)
                })
                .count();
            prop_assert_eq!(owners, 1);
        }
    }
}
