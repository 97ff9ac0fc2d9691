//! Segment generation for one contiguous logical range
//!
//! [`distribute`] walks a logical range `[offset, offset + size)` through a
//! distribution strategy and appends the pieces that land on one target to
//! a [`SegmentSink`]. Physically adjacent pieces are merged, budgets are
//! honored and the known datafile size either stops the walk (reads) or is
//! pushed forward (writes with extend).

use crate::{RequestError, Result};
use pario_dist::{Distribution, DistributionView};
use serde::{Deserialize, Serialize};
use tracing::trace;

/// A contiguous byte range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Segment {
    pub offset: u64,
    pub len: u64,
}

impl Segment {
    pub const fn new(offset: u64, len: u64) -> Self {
        Self { offset, len }
    }

    pub const fn end(&self) -> u64 {
        self.offset + self.len
    }
}

/// Limits on one generation call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentBudget {
    /// Maximum number of output segments
    pub max_segments: usize,
    /// Maximum number of bytes covered by output segments
    pub max_bytes: u64,
}

impl SegmentBudget {
    pub const fn new(max_segments: usize, max_bytes: u64) -> Self {
        Self {
            max_segments,
            max_bytes,
        }
    }

    /// Budget that never stops generation
    pub const fn unlimited() -> Self {
        Self {
            max_segments: usize::MAX,
            max_bytes: u64::MAX,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_segments == 0 {
            return Err(RequestError::InvalidBudget(
                "max_segments must be > 0".to_string(),
            ));
        }
        if self.max_bytes == 0 {
            return Err(RequestError::InvalidBudget(
                "max_bytes must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for SegmentBudget {
    fn default() -> Self {
        Self::new(64, 4 * 1024 * 1024)
    }
}

/// How emitted segment offsets are expressed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OutputMode {
    /// Offsets into the caller's contiguous buffer
    ClientRelative,
    /// Physical offsets within the target's datafile
    TargetRelative,
    /// Count segments and bytes without recording offsets
    CountOnly,
}

/// Accumulates segments for one target under a budget
#[derive(Debug, Clone)]
pub struct SegmentSink {
    mode: OutputMode,
    budget: SegmentBudget,
    segments: Vec<Segment>,
    count: usize,
    bytes: u64,
    last_end: Option<u64>,
    client_base: u64,
}

impl SegmentSink {
    pub fn new(mode: OutputMode, budget: SegmentBudget) -> Self {
        Self {
            mode,
            budget,
            segments: Vec::new(),
            count: 0,
            bytes: 0,
            last_end: None,
            client_base: 0,
        }
    }

    pub const fn mode(&self) -> OutputMode {
        self.mode
    }

    pub const fn budget(&self) -> SegmentBudget {
        self.budget
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn into_segments(self) -> Vec<Segment> {
        self.segments
    }

    /// Segments emitted so far (merges do not count)
    pub const fn count(&self) -> usize {
        self.count
    }

    pub const fn bytes(&self) -> u64 {
        self.bytes
    }

    pub const fn is_full(&self) -> bool {
        self.count >= self.budget.max_segments || self.bytes >= self.budget.max_bytes
    }

    pub const fn remaining_bytes(&self) -> u64 {
        self.budget.max_bytes.saturating_sub(self.bytes)
    }

    /// Buffer position of the start of the range about to be distributed
    pub fn set_client_base(&mut self, base: u64) {
        self.client_base = base;
    }

    /// Drop everything emitted so far
    pub fn clear(&mut self) {
        self.segments.clear();
        self.count = 0;
        self.bytes = 0;
        self.last_end = None;
    }

    fn push(&mut self, offset: u64, len: u64) {
        if len == 0 {
            return;
        }
        if self.last_end == Some(offset) {
            trace!(offset, len, "merge segment");
            if let Some(last) = self.segments.last_mut() {
                last.len += len;
            }
        } else {
            trace!(offset, len, "add segment");
            self.count += 1;
            if self.mode != OutputMode::CountOnly {
                self.segments.push(Segment::new(offset, len));
            }
        }
        self.last_end = Some(offset + len);
        self.bytes += len;
    }
}

/// Outcome of distributing one logical range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Coverage {
    /// Logical bytes of the range now accounted for, on this target or not
    pub covered: u64,
    /// Known datafile size was reached without extend
    pub eof: bool,
}

/// Map `[offset, offset + size)` onto the target described by `view`.
///
/// Returns `None` when the strategy places no data on this target at all.
/// Zero `size` or an exhausted budget covers nothing and is not an error.
pub fn distribute(
    dist: &dyn Distribution,
    view: &mut DistributionView,
    offset: u64,
    size: u64,
    sink: &mut SegmentSink,
) -> Option<Coverage> {
    if sink.is_full() || size == 0 {
        return Some(Coverage {
            covered: 0,
            eof: false,
        });
    }

    let orig_offset = offset;
    let orig_end = offset + size;
    let mut offset = offset;
    let mut size = size;
    let mut eof = false;
    let mut loff = dist.next_mapped_offset(view, offset)?;

    while loff - offset < size {
        let diff = loff - offset;
        let poff = dist.logical_to_physical(view, loff);
        let mut sz = size - diff;

        let fraglen = dist.contiguous_length(view, poff);
        if sz > fraglen && view.target_count != 1 {
            sz = fraglen;
        }
        sz = sz.min(sink.remaining_bytes());

        if poff + sz > view.file_size {
            if view.extend {
                trace!(from = view.file_size, to = poff + sz, "extending datafile");
                view.file_size = poff + sz;
            } else {
                eof = true;
                sz = view.file_size.saturating_sub(poff);
                if sz == 0 {
                    trace!(poff, file_size = view.file_size, "end of file");
                    break;
                }
            }
        }

        let segment_offset = match sink.mode {
            OutputMode::ClientRelative => sink.client_base + (loff - orig_offset),
            OutputMode::TargetRelative | OutputMode::CountOnly => poff,
        };
        sink.push(segment_offset, sz);

        loff += sz;
        size -= loff - offset;
        offset = loff;
        loff = dist.next_mapped_offset(view, offset).unwrap_or(orig_end);

        if sink.is_full() {
            break;
        }
    }

    if dist.logical_to_physical(view, loff) >= view.file_size && !view.extend {
        eof = true;
    }
    let covered = if loff >= orig_end {
        orig_end - orig_offset
    } else {
        offset - orig_offset
    };
    Some(Coverage { covered, eof })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pario_dist::{SimpleStripe, VarStrip};

    fn stripe() -> SimpleStripe {
        SimpleStripe::new(100).unwrap()
    }

    fn sink(mode: OutputMode) -> SegmentSink {
        SegmentSink::new(mode, SegmentBudget::unlimited())
    }

    #[test]
    fn test_range_split_across_targets() {
        let dist = stripe();
        let mut view = DistributionView::new(1, 3).with_extend(true);
        let mut out = sink(OutputMode::TargetRelative);
        let cov = distribute(&dist, &mut view, 0, 600, &mut out).unwrap();
        assert_eq!(cov.covered, 600);
        // target 1 strips [100,200) and [400,500) are physically adjacent
        assert_eq!(out.segments(), &[Segment::new(0, 200)]);
        assert_eq!(out.count(), 1);
        assert_eq!(view.file_size, 200);
    }

    #[test]
    fn test_client_relative_offsets() {
        let dist = stripe();
        let mut view = DistributionView::new(1, 3).with_extend(true);
        let mut out = sink(OutputMode::ClientRelative);
        out.set_client_base(1000);
        distribute(&dist, &mut view, 50, 500, &mut out).unwrap();
        assert_eq!(
            out.segments(),
            &[Segment::new(1050, 100), Segment::new(1350, 100)]
        );
    }

    #[test]
    fn test_no_bytes_on_target_still_covers() {
        let dist = stripe();
        let mut view = DistributionView::new(2, 3).with_extend(true);
        let mut out = sink(OutputMode::TargetRelative);
        let cov = distribute(&dist, &mut view, 0, 150, &mut out).unwrap();
        assert_eq!(cov.covered, 150);
        assert!(out.segments().is_empty());
    }

    #[test]
    fn test_zero_size_and_full_budget() {
        let dist = stripe();
        let mut view = DistributionView::new(0, 3).with_extend(true);
        let mut out = sink(OutputMode::TargetRelative);
        let cov = distribute(&dist, &mut view, 0, 0, &mut out).unwrap();
        assert_eq!(cov.covered, 0);

        let mut full = SegmentSink::new(OutputMode::TargetRelative, SegmentBudget::new(1, 10));
        distribute(&dist, &mut view, 0, 10, &mut full).unwrap();
        assert!(full.is_full());
        let cov = distribute(&dist, &mut view, 300, 10, &mut full).unwrap();
        assert_eq!(cov.covered, 0);
        assert_eq!(full.count(), 1);
    }

    #[test]
    fn test_byte_budget_cuts_range() {
        let dist = stripe();
        let mut view = DistributionView::new(0, 1).with_extend(true);
        let mut out = SegmentSink::new(OutputMode::TargetRelative, SegmentBudget::new(8, 64));
        let cov = distribute(&dist, &mut view, 0, 500, &mut out).unwrap();
        assert_eq!(cov.covered, 64);
        assert_eq!(out.bytes(), 64);
    }

    #[test]
    fn test_segment_budget_cuts_range() {
        let dist = stripe();
        let mut view = DistributionView::new(0, 3).with_extend(true);
        let mut out = SegmentSink::new(OutputMode::ClientRelative, SegmentBudget::new(2, u64::MAX));
        let cov = distribute(&dist, &mut view, 0, 900, &mut out).unwrap();
        // two strips on target 0 at logical 0 and 300
        assert_eq!(out.count(), 2);
        assert_eq!(cov.covered, 400);
    }

    #[test]
    fn test_read_past_eof() {
        let dist = stripe();
        let mut view = DistributionView::new(0, 3).with_file_size(100);
        let mut out = sink(OutputMode::TargetRelative);
        let cov = distribute(&dist, &mut view, 300, 100, &mut out).unwrap();
        assert_eq!(cov.covered, 0);
        assert!(cov.eof);
        assert!(out.segments().is_empty());
    }

    #[test]
    fn test_read_short_at_eof() {
        let dist = stripe();
        let mut view = DistributionView::new(0, 1).with_file_size(40);
        let mut out = sink(OutputMode::TargetRelative);
        let cov = distribute(&dist, &mut view, 0, 100, &mut out).unwrap();
        assert!(cov.eof);
        assert_eq!(cov.covered, 40);
        assert_eq!(out.segments(), &[Segment::new(0, 40)]);
    }

    #[test]
    fn test_write_extends_file() {
        let dist = stripe();
        let mut view = DistributionView::new(0, 1).with_extend(true);
        let mut out = sink(OutputMode::TargetRelative);
        let cov = distribute(&dist, &mut view, 0, 250, &mut out).unwrap();
        assert_eq!(cov.covered, 250);
        assert!(!cov.eof);
        assert_eq!(view.file_size, 250);
    }

    #[test]
    fn test_count_only_coalesces_without_offsets() {
        let dist = stripe();
        let mut view = DistributionView::new(0, 3).with_extend(true);
        let mut out = sink(OutputMode::CountOnly);
        distribute(&dist, &mut view, 0, 700, &mut out).unwrap();
        assert!(out.segments().is_empty());
        assert_eq!(out.count(), 1);
        assert_eq!(out.bytes(), 300);
    }

    #[test]
    fn test_target_without_strips() {
        let dist: VarStrip = "0:10;1:10".parse().unwrap();
        let mut view = DistributionView::new(2, 3).with_extend(true);
        let mut out = sink(OutputMode::TargetRelative);
        assert!(distribute(&dist, &mut view, 0, 100, &mut out).is_none());
    }
}
