//! Resumable request traversal
//!
//! The walker visits a committed [`RequestTree`] with an explicit stack kept
//! in a [`TraversalState`], turning each contiguous logical region it finds
//! into segments for one target through [`distribute`]. A call stops as soon
//! as a budget is exhausted and records enough state for the next call to
//! continue at exactly the same byte.

use crate::segment::{OutputMode, Segment, SegmentBudget, SegmentSink, distribute};
use crate::state::{TraversalFrame, TraversalState, WalkStatus};
use crate::tree::RequestTree;
use crate::{RequestError, Result};
use pario_dist::{Distribution, DistributionView};
use tracing::{debug, trace};

/// Segments produced by one walker call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalkResult {
    /// Emitted segments; empty in count-only mode
    pub segments: Vec<Segment>,
    /// Number of segments after coalescing
    pub segment_count: usize,
    /// Bytes covered by the segments
    pub bytes: u64,
    /// The target's known datafile size was reached
    pub eof: bool,
    /// Where the traversal stands after this call
    pub status: WalkStatus,
}

impl WalkResult {
    fn from_sink(sink: SegmentSink, state: &TraversalState) -> Self {
        Self {
            segment_count: sink.count(),
            bytes: sink.bytes(),
            eof: state.eof(),
            status: state.status(),
            segments: sink.into_segments(),
        }
    }
}

/// Maps one request tree onto targets of one distribution
#[derive(Debug, Clone, Copy)]
pub struct RequestWalker<'a> {
    tree: &'a RequestTree,
    dist: &'a dyn Distribution,
}

/// What to do with the region the top frame currently describes
enum Region {
    /// Contiguous bytes; `pop` when they finish the frame
    Contiguous { offset: i64, size: u64, pop: bool },
    /// Descend into the element type
    Descend(TraversalFrame),
}

impl<'a> RequestWalker<'a> {
    pub fn new(tree: &'a RequestTree, dist: &'a dyn Distribution) -> Self {
        Self { tree, dist }
    }

    pub fn tree(&self) -> &RequestTree {
        self.tree
    }

    /// Produce the next bounded batch of segments for `view`'s target.
    ///
    /// `state` is advanced past everything returned; `view` may have its
    /// file size extended when `view.extend` is set.
    pub fn process(
        &self,
        state: &mut TraversalState,
        view: &mut DistributionView,
        budget: SegmentBudget,
        mode: OutputMode,
    ) -> Result<WalkResult> {
        budget.validate()?;
        check_view(view)?;
        let mut sink = SegmentSink::new(mode, budget);
        self.run(state, view, &mut sink)?;
        Ok(WalkResult::from_sink(sink, state))
    }

    /// Count what the next batch would hold without touching the caller's
    /// state or view
    pub fn count(
        &self,
        state: &TraversalState,
        view: &DistributionView,
        budget: SegmentBudget,
    ) -> Result<WalkResult> {
        let mut state = state.clone();
        let mut view = *view;
        self.process(&mut state, &mut view, budget, OutputMode::CountOnly)
    }

    /// Run batches of at most `budget` until the target is exhausted,
    /// joining segments that line up across batch boundaries
    pub fn drain(
        &self,
        state: &mut TraversalState,
        view: &mut DistributionView,
        budget: SegmentBudget,
        mode: OutputMode,
    ) -> Result<WalkResult> {
        let mut total = WalkResult {
            segments: Vec::new(),
            segment_count: 0,
            bytes: 0,
            eof: false,
            status: state.status(),
        };
        loop {
            let before = state.type_offset();
            let batch = self.process(state, view, budget, mode)?;
            total.bytes += batch.bytes;
            total.eof = batch.eof;
            total.status = batch.status;
            if mode == OutputMode::CountOnly {
                total.segment_count += batch.segment_count;
            } else {
                for segment in batch.segments {
                    match total.segments.last_mut() {
                        Some(last) if last.end() == segment.offset => last.len += segment.len,
                        _ => total.segments.push(segment),
                    }
                }
                total.segment_count = total.segments.len();
            }
            if batch.status == WalkStatus::Exhausted {
                break;
            }
            if batch.bytes == 0 && state.type_offset() == before {
                debug!(offset = before, "walk made no progress");
                break;
            }
        }
        Ok(total)
    }

    fn run(
        &self,
        state: &mut TraversalState,
        view: &mut DistributionView,
        sink: &mut SegmentSink,
    ) -> Result<()> {
        if state.is_done() {
            return Ok(());
        }
        let aggregate = self.tree.aggregate_size();
        state.stack[0].max_elements = state.final_offset / aggregate + 1;
        let mut seeking = state.target_offset > state.type_offset;
        debug!(
            target_index = view.target_index,
            type_offset = state.type_offset,
            target_offset = state.target_offset,
            final_offset = state.final_offset,
            seeking,
            "walk request"
        );

        loop {
            let (offset, contig_size, pop) = match self.region(state)? {
                Region::Descend(frame) => {
                    trace!(level = state.stack.len(), node = frame.node, "push level");
                    state.stack.push(frame);
                    continue;
                }
                Region::Contiguous { offset, size, pop } => (offset, size, pop),
            };

            let consumed = if seeking {
                if state.type_offset + contig_size >= state.target_offset {
                    state.target_offset - state.type_offset
                } else {
                    contig_size
                }
            } else {
                let offset = u64::try_from(offset).map_err(|_| RequestError::NegativeOffset(offset))?;
                if sink.mode() == OutputMode::ClientRelative {
                    sink.set_client_base(state.type_offset - state.target_offset);
                }
                let size = contig_size.min(state.final_offset.saturating_sub(state.type_offset));
                match distribute(self.dist, view, offset, size, sink) {
                    Some(coverage) => {
                        state.eof = coverage.eof;
                        coverage.covered
                    }
                    None => {
                        debug!(target_index = view.target_index, "target holds no data");
                        state.type_offset = state.final_offset;
                        return Ok(());
                    }
                }
            };

            state.type_offset += consumed;
            if consumed != contig_size {
                state.bytes += consumed;
                if seeking {
                    seeking = false;
                    continue;
                }
                break;
            }

            if pop {
                state.stack.pop();
            }
            if !self.advance(state) {
                break;
            }
            if sink.is_full() || state.type_offset >= state.final_offset {
                break;
            }
        }

        debug!(
            target_index = view.target_index,
            type_offset = state.type_offset,
            segments = sink.count(),
            bytes = sink.bytes(),
            eof = state.eof,
            "walk stopped"
        );
        Ok(())
    }

    /// Classify the top frame's current position
    fn region(&self, state: &TraversalState) -> Result<Region> {
        let Some(frame) = state.stack.last().copied() else {
            return Err(RequestError::CorruptArena("empty traversal stack".to_string()));
        };
        let node = self.tree.node(frame.node);
        let base = self.tree.node(frame.base);
        let element = node.element.map(|e| self.tree.node(e));
        let resumed = state.bytes as i64;

        let flat = element.is_none_or(|e| {
            node.aggregate_size as i64 == base.extent() && e.contiguous_chunks == 1
        });
        if frame.node == frame.base && flat {
            return Ok(Region::Contiguous {
                offset: node.offset
                    + frame.chunk_offset
                    + resumed
                    + self.tree.displacement(frame.node),
                size: frame.max_elements * node.aggregate_size - state.bytes,
                pop: true,
            });
        }

        let block_start = frame.chunk_offset
            + frame.element as i64 * base.extent()
            + node.offset
            + node.stride * frame.block as i64;

        let Some(element_index) = node.element else {
            return Err(RequestError::CorruptArena(format!(
                "node {} has no element type",
                frame.node
            )));
        };
        let element = self.tree.node(element_index);
        if element.is_dense() {
            return Ok(Region::Contiguous {
                offset: block_start + resumed + self.tree.displacement(frame.node),
                size: element.aggregate_size * node.num_elements - state.bytes,
                pop: false,
            });
        }

        let depth = self.tree.depth();
        if state.stack.len() >= depth as usize {
            return Err(RequestError::DepthExceeded {
                level: state.stack.len(),
                depth,
            });
        }
        Ok(Region::Descend(TraversalFrame {
            element: 0,
            max_elements: node.num_elements,
            block: 0,
            chunk_offset: block_start,
            node: element_index,
            base: element_index,
        }))
    }

    /// Step past the region just consumed; false once the stack empties
    fn advance(&self, state: &mut TraversalState) -> bool {
        state.bytes = 0;
        loop {
            let Some(frame) = state.stack.last_mut() else {
                return false;
            };
            let node = self.tree.node(frame.node);
            frame.block += 1;
            if frame.block < node.block_count {
                return true;
            }
            frame.block = 0;
            if let Some(next) = node.sequence_next {
                frame.node = next;
                return true;
            }
            frame.node = frame.base;
            frame.element += 1;
            if frame.element < frame.max_elements {
                return true;
            }
            trace!(level = state.stack.len() - 1, "pop level");
            state.stack.pop();
        }
    }
}

fn check_view(view: &DistributionView) -> Result<()> {
    if view.target_count == 0 {
        return Err(RequestError::InvalidView("no targets".to_string()));
    }
    if view.target_index >= view.target_count {
        return Err(RequestError::InvalidView(format!(
            "target {} of {}",
            view.target_index, view.target_count
        )));
    }
    Ok(())
}
