//! Resumable traversal state

use crate::tree::{NodeIndex, RequestTree};
use serde::{Deserialize, Serialize};

/// One level of the traversal stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraversalFrame {
    /// Current repetition of the base node
    pub element: u64,
    /// Repetitions of the base node at this level
    pub max_elements: u64,
    /// Current block within `node`
    pub block: u64,
    /// Absolute logical start of this level's repetitions
    pub chunk_offset: i64,
    /// Node being processed; moves along the sequence chain
    pub node: NodeIndex,
    /// Head of the chain being repeated
    pub base: NodeIndex,
}

impl TraversalFrame {
    const fn root(root: NodeIndex) -> Self {
        Self {
            element: 0,
            max_elements: 1,
            block: 0,
            chunk_offset: 0,
            node: root,
            base: root,
        }
    }
}

/// Where a walk stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalkStatus {
    /// Fast-forwarding to the requested start without output
    Seeking,
    /// Emitting segments
    Producing,
    /// Nothing left for this target
    Exhausted,
}

/// Per-target cursor into a request tree, carried across walker calls
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraversalState {
    pub(crate) stack: Vec<TraversalFrame>,
    /// Bytes of the current contiguous region already consumed
    pub(crate) bytes: u64,
    /// Request-stream position reached
    pub(crate) type_offset: u64,
    /// Request-stream position to start producing at
    pub(crate) target_offset: u64,
    /// Request-stream position to stop at
    pub(crate) final_offset: u64,
    pub(crate) eof: bool,
    root: NodeIndex,
}

impl TraversalState {
    /// Fresh state covering one instance of the request
    pub fn new(tree: &RequestTree) -> Self {
        let mut stack = Vec::with_capacity(tree.depth() as usize);
        stack.push(TraversalFrame::root(tree.root_index()));
        Self {
            stack,
            bytes: 0,
            type_offset: 0,
            target_offset: 0,
            final_offset: tree.aggregate_size(),
            eof: false,
            root: tree.root_index(),
        }
    }

    /// Fresh state covering request-stream bytes `[start, start + len)`
    pub fn with_range(tree: &RequestTree, start: u64, len: u64) -> Self {
        let mut state = Self::new(tree);
        state.set_target_offset(start);
        state.set_final_offset(start + len);
        state
    }

    /// Move the start position.
    ///
    /// Seeking forward is lazy; a start behind the recorded progress
    /// rewinds the traversal to the beginning of the request first.
    pub fn set_target_offset(&mut self, offset: u64) {
        if offset < self.type_offset {
            self.rewind();
        }
        self.target_offset = offset;
    }

    pub fn set_final_offset(&mut self, offset: u64) {
        self.final_offset = offset;
    }

    fn rewind(&mut self) {
        self.stack.clear();
        self.stack.push(TraversalFrame::root(self.root));
        self.bytes = 0;
        self.type_offset = 0;
        self.eof = false;
    }

    pub const fn type_offset(&self) -> u64 {
        self.type_offset
    }

    pub const fn target_offset(&self) -> u64 {
        self.target_offset
    }

    pub const fn final_offset(&self) -> u64 {
        self.final_offset
    }

    pub const fn eof(&self) -> bool {
        self.eof
    }

    pub fn frames(&self) -> &[TraversalFrame] {
        &self.stack
    }

    /// Traversal has nothing more to visit
    pub(crate) fn is_done(&self) -> bool {
        self.stack.is_empty() || self.type_offset >= self.final_offset
    }

    pub fn status(&self) -> WalkStatus {
        if self.is_done() || self.eof {
            WalkStatus::Exhausted
        } else if self.target_offset > self.type_offset {
            WalkStatus::Seeking
        } else {
            WalkStatus::Producing
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_state_covers_one_instance() {
        let tree = RequestTree::contiguous(300).unwrap();
        let state = TraversalState::new(&tree);
        assert_eq!(state.final_offset(), 300);
        assert_eq!(state.frames().len(), 1);
        assert_eq!(state.status(), WalkStatus::Producing);
    }

    #[test]
    fn test_range_starts_seeking() {
        let tree = RequestTree::contiguous(300).unwrap();
        let state = TraversalState::with_range(&tree, 100, 50);
        assert_eq!(state.target_offset(), 100);
        assert_eq!(state.final_offset(), 150);
        assert_eq!(state.status(), WalkStatus::Seeking);
    }

    #[test]
    fn test_seek_backwards_rewinds() {
        let tree = RequestTree::contiguous(300).unwrap();
        let mut state = TraversalState::new(&tree);
        state.type_offset = 200;
        state.bytes = 20;
        state.stack.clear();
        state.set_target_offset(50);
        assert_eq!(state.type_offset(), 0);
        assert_eq!(state.frames().len(), 1);
        assert_eq!(state.status(), WalkStatus::Seeking);
    }

    #[test]
    fn test_exhausted_at_final_offset() {
        let tree = RequestTree::contiguous(10).unwrap();
        let mut state = TraversalState::new(&tree);
        state.type_offset = 10;
        assert_eq!(state.status(), WalkStatus::Exhausted);
    }
}
