#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::uninlined_format_args)]

//! Request Trees and Segment Generation
//!
//! This crate turns one logical I/O request into per-target physical byte
//! ranges.
//!
//! # Key Components
//!
//! - **Request Tree**: nested strided access patterns built from typed
//!   constructors and committed into an index-addressed arena
//! - **Segment Generator**: maps one contiguous logical range onto one
//!   target, coalescing adjacent pieces and honoring budgets
//! - **Request Walker**: resumable explicit-stack traversal of a committed
//!   tree that feeds the segment generator
//! - **Segment Streams**: pull one bounded batch at a time, optionally
//!   mapped through a memory request onto a scattered client buffer

pub mod segment;
pub mod state;
pub mod stream;
pub mod tree;
pub mod walker;

pub use segment::{Coverage, OutputMode, Segment, SegmentBudget, SegmentSink, distribute};
pub use state::{TraversalFrame, TraversalState, WalkStatus};
pub use stream::{BufferSegments, SegmentStream};
pub use tree::{CommittedNode, NodeIndex, Request, RequestNode, RequestTree};
pub use walker::{RequestWalker, WalkResult};

use thiserror::Error;

/// Request processing error types
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// Malformed request description
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Traversal tried to go deeper than the tree's recorded depth
    #[error("Request depth exceeded: level {level} of {depth}")]
    DepthExceeded {
        /// Level that would have been pushed
        level: usize,
        /// Recorded tree depth
        depth: u32,
    },

    /// Segment or byte budget unusable
    #[error("Invalid budget: {0}")]
    InvalidBudget(String),

    /// Pattern produced a negative file offset
    #[error("Negative file offset {0}")]
    NegativeOffset(i64),

    /// Committed arena failed validation
    #[error("Corrupt request arena: {0}")]
    CorruptArena(String),

    /// Distribution view unusable
    #[error("Invalid distribution view: {0}")]
    InvalidView(String),
}

/// Result type for pario-request operations
pub type Result<T> = std::result::Result<T, RequestError>;
