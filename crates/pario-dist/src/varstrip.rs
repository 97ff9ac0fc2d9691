//! Variable strip distribution
//!
//! The layout is an explicit list of strips making up one stripe, written
//! as `target:size` pairs separated by `;`, e.g. `0:64K;1:128K;0:32K`.
//! A target may appear more than once in a stripe; the stripe repeats
//! across the whole file.

use crate::{DistError, Distribution, DistributionView, Result, parse_size};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One strip of a stripe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Strip {
    /// Target holding this strip
    pub target: u32,
    /// Logical offset of the strip within its stripe
    pub offset: u64,
    /// Strip length in bytes
    pub size: u64,
}

/// Distribution over an explicit strip list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VarStrip {
    strips: Vec<Strip>,
    stripe_size: u64,
}

impl VarStrip {
    /// Build from `(target, size)` pairs in stripe order
    pub fn new(pairs: &[(u32, u64)]) -> Result<Self> {
        if pairs.is_empty() {
            return Err(invalid("strip list is empty"));
        }
        let mut strips = Vec::with_capacity(pairs.len());
        let mut offset = 0u64;
        for &(target, size) in pairs {
            if size == 0 {
                return Err(invalid(format!("strip for target {target} has zero size")));
            }
            strips.push(Strip {
                target,
                offset,
                size,
            });
            offset = offset
                .checked_add(size)
                .ok_or_else(|| invalid("stripe size overflows"))?;
        }
        Ok(Self {
            strips,
            stripe_size: offset,
        })
    }

    pub fn strips(&self) -> &[Strip] {
        &self.strips
    }

    pub const fn stripe_size(&self) -> u64 {
        self.stripe_size
    }

    /// Bytes `target` holds in one stripe
    fn bytes_per_stripe(&self, target: u32) -> u64 {
        self.strips
            .iter()
            .filter(|s| s.target == target)
            .map(|s| s.size)
            .sum()
    }

    /// Index of the strip containing an in-stripe offset
    fn strip_at(&self, in_stripe: u64) -> Option<usize> {
        self.strips
            .iter()
            .position(|s| in_stripe >= s.offset && in_stripe < s.offset + s.size)
    }
}

fn invalid(message: impl Into<String>) -> DistError {
    DistError::InvalidParameter {
        name: "strips".to_string(),
        message: message.into(),
    }
}

impl FromStr for VarStrip {
    type Err = DistError;

    fn from_str(s: &str) -> Result<Self> {
        let mut pairs = Vec::new();
        for entry in s.split(';').map(str::trim).filter(|e| !e.is_empty()) {
            let (target, size) = entry
                .split_once(':')
                .ok_or_else(|| invalid(format!("expected target:size, got {entry:?}")))?;
            let target: u32 = target
                .trim()
                .parse()
                .map_err(|_| invalid(format!("bad target number {target:?}")))?;
            pairs.push((target, parse_size("strips", size)?));
        }
        Self::new(&pairs)
    }
}

impl fmt::Display for VarStrip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, strip) in self.strips.iter().enumerate() {
            if i > 0 {
                f.write_str(";")?;
            }
            write!(f, "{}:{}", strip.target, strip.size)?;
        }
        Ok(())
    }
}

impl Distribution for VarStrip {
    fn name(&self) -> &'static str {
        "varstrip"
    }

    fn logical_to_physical(&self, view: &DistributionView, logical: u64) -> u64 {
        let Some(mapped) = self.next_mapped_offset(view, logical) else {
            return 0;
        };
        let stripe = mapped / self.stripe_size;
        let in_stripe = mapped % self.stripe_size;
        let mut before = 0;
        for strip in self.strips.iter().filter(|s| s.target == view.target_index) {
            if in_stripe >= strip.offset && in_stripe < strip.offset + strip.size {
                return stripe * self.bytes_per_stripe(view.target_index)
                    + before
                    + (in_stripe - strip.offset);
            }
            before += strip.size;
        }
        // next_mapped_offset only returns offsets inside an owned strip
        stripe * self.bytes_per_stripe(view.target_index) + before
    }

    fn physical_to_logical(&self, view: &DistributionView, physical: u64) -> u64 {
        let per_stripe = self.bytes_per_stripe(view.target_index);
        if per_stripe == 0 {
            return 0;
        }
        let stripe = physical / per_stripe;
        let mut remaining = physical % per_stripe;
        for strip in self.strips.iter().filter(|s| s.target == view.target_index) {
            if remaining < strip.size {
                return stripe * self.stripe_size + strip.offset + remaining;
            }
            remaining -= strip.size;
        }
        stripe * self.stripe_size
    }

    fn next_mapped_offset(&self, view: &DistributionView, logical: u64) -> Option<u64> {
        let stripe = logical / self.stripe_size;
        let in_stripe = logical % self.stripe_size;
        let current = self.strip_at(in_stripe)?;
        if self.strips[current].target == view.target_index {
            return Some(logical);
        }
        if let Some(next) = self.strips[current + 1..]
            .iter()
            .find(|s| s.target == view.target_index)
        {
            return Some(stripe * self.stripe_size + next.offset);
        }
        self.strips
            .iter()
            .find(|s| s.target == view.target_index)
            .map(|first| (stripe + 1) * self.stripe_size + first.offset)
    }

    fn contiguous_length(&self, view: &DistributionView, physical: u64) -> u64 {
        let logical = self.physical_to_logical(view, physical);
        let in_stripe = logical % self.stripe_size;
        self.strip_at(in_stripe)
            .map_or(0, |i| self.strips[i].offset + self.strips[i].size - in_stripe)
    }

    fn logical_file_size(&self, physical_sizes: &[u64]) -> u64 {
        physical_sizes.iter().sum()
    }

    fn target_count(&self, available: u32) -> Result<u32> {
        let highest = self.strips.iter().map(|s| s.target).max().unwrap_or(0);
        if let Some(missing) = (0..highest).find(|t| !self.strips.iter().any(|s| s.target == *t)) {
            return Err(invalid(format!(
                "targets 0..={highest} must all appear, {missing} is missing"
            )));
        }
        let required = highest + 1;
        if required > available {
            return Err(DistError::NotEnoughTargets {
                required,
                available,
            });
        }
        Ok(required)
    }
}
