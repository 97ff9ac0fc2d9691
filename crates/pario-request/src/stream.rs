//! Pull-driven segment sources
//!
//! A [`SegmentStream`] hands out one target's segments a segment at a time,
//! running the walker for another bounded batch only when the previous one
//! has been consumed. Memory held is one batch regardless of how large the
//! request is. [`BufferSegments`] layers an optional memory request tree on
//! top, turning request-stream positions into positions in a non-contiguous
//! client buffer.

use crate::segment::{OutputMode, Segment, SegmentBudget};
use crate::state::{TraversalState, WalkStatus};
use crate::tree::RequestTree;
use crate::walker::RequestWalker;
use crate::{RequestError, Result};
use pario_dist::{Basic, DistributionView};
use std::collections::VecDeque;
use tracing::trace;

static IDENTITY: Basic = Basic;

/// One target's segments, produced lazily in budget-sized batches
#[derive(Debug)]
pub struct SegmentStream<'a> {
    walker: RequestWalker<'a>,
    state: TraversalState,
    view: DistributionView,
    budget: SegmentBudget,
    mode: OutputMode,
    pending: VecDeque<Segment>,
    finished: bool,
    batches: usize,
}

impl<'a> SegmentStream<'a> {
    pub fn new(
        walker: RequestWalker<'a>,
        state: TraversalState,
        view: DistributionView,
        budget: SegmentBudget,
        mode: OutputMode,
    ) -> Result<Self> {
        budget.validate()?;
        if mode == OutputMode::CountOnly {
            return Err(RequestError::InvalidRequest(
                "a count-only walk yields no segments".to_string(),
            ));
        }
        Ok(Self {
            walker,
            state,
            view,
            budget,
            mode,
            pending: VecDeque::with_capacity(budget.max_segments.min(1024)),
            finished: false,
            batches: 0,
        })
    }

    /// Buffer ranges of a memory request covering stream bytes
    /// `[0, length)`, in stream order
    pub fn memory(tree: &'a RequestTree, length: u64, budget: SegmentBudget) -> Result<Self> {
        Self::new(
            RequestWalker::new(tree, &IDENTITY),
            TraversalState::with_range(tree, 0, length),
            DistributionView::new(0, 1).with_extend(true),
            budget,
            OutputMode::TargetRelative,
        )
    }

    /// Next segment, walking another batch if none is buffered
    pub fn next_segment(&mut self) -> Result<Option<Segment>> {
        loop {
            if let Some(segment) = self.pending.pop_front() {
                return Ok(Some(segment));
            }
            if self.finished {
                return Ok(None);
            }
            let before = self.state.type_offset();
            let batch = match self
                .walker
                .process(&mut self.state, &mut self.view, self.budget, self.mode)
            {
                Ok(batch) => batch,
                Err(e) => {
                    self.finished = true;
                    return Err(e);
                }
            };
            self.batches += 1;
            trace!(
                target_index = self.view.target_index,
                batch = self.batches,
                segments = batch.segment_count,
                bytes = batch.bytes,
                "pulled batch"
            );
            if batch.status == WalkStatus::Exhausted
                || (batch.bytes == 0 && self.state.type_offset() == before)
            {
                self.finished = true;
            }
            self.pending.extend(batch.segments);
        }
    }

    /// Walker batches run so far
    pub const fn batches(&self) -> usize {
        self.batches
    }

    /// Segments walked but not yet handed out
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    /// The view as extended by the walk so far
    pub const fn view(&self) -> &DistributionView {
        &self.view
    }
}

impl Iterator for SegmentStream<'_> {
    type Item = Result<Segment>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_segment().transpose()
    }
}

/// Client buffer ranges for a target's client-relative segments
#[derive(Debug)]
pub struct BufferSegments<'a> {
    file: SegmentStream<'a>,
    memory: Option<SegmentStream<'a>>,
    /// Unmapped rest of the current file segment, in stream positions
    pending: Option<Segment>,
    /// Current memory piece and the stream position its first byte holds
    head: Option<Segment>,
    head_position: u64,
}

impl<'a> BufferSegments<'a> {
    /// `file` must be a client-relative stream. Without `memory` the
    /// buffer is contiguous and stream positions are buffer offsets.
    pub fn new(file: SegmentStream<'a>, memory: Option<SegmentStream<'a>>) -> Result<Self> {
        if file.mode != OutputMode::ClientRelative {
            return Err(RequestError::InvalidRequest(
                "buffer mapping needs client-relative segments".to_string(),
            ));
        }
        Ok(Self {
            file,
            memory,
            pending: None,
            head: None,
            head_position: 0,
        })
    }

    pub fn next_segment(&mut self) -> Result<Option<Segment>> {
        let range = match self.pending.take() {
            Some(range) => range,
            None => match self.file.next_segment()? {
                Some(range) => range,
                None => return Ok(None),
            },
        };
        let Some(memory) = self.memory.as_mut() else {
            return Ok(Some(range));
        };

        // stream positions only grow, so passed memory pieces are dropped
        let head = loop {
            match self.head {
                Some(head) if self.head_position + head.len > range.offset => break head,
                Some(head) => self.head_position += head.len,
                None => {}
            }
            self.head = memory.next_segment()?;
            if self.head.is_none() {
                return Err(RequestError::InvalidRequest(format!(
                    "memory request ends before stream position {}",
                    range.offset
                )));
            }
        };

        let skip = range.offset - self.head_position;
        let len = range.len.min(head.len - skip);
        if len < range.len {
            self.pending = Some(Segment::new(range.offset + len, range.len - len));
        }
        Ok(Some(Segment::new(head.offset + skip, len)))
    }

    /// Walker batches run so far on both sides
    pub fn batches(&self) -> usize {
        self.file.batches() + self.memory.as_ref().map_or(0, SegmentStream::batches)
    }
}

impl Iterator for BufferSegments<'_> {
    type Item = Result<Segment>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_segment().transpose()
    }
}
