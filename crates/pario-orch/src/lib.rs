#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::uninlined_format_args)]

//! Fan-out I/O Orchestration
//!
//! One logical read or write against a striped file becomes one small
//! request per storage target, an acknowledgment from each, a bulk data
//! transfer per target and, for writes, a final completion message. This
//! crate drives all of those concurrently from a single task and reports
//! per-target failures without letting one target hold up the others.
//!
//! # Key Components
//!
//! - **Protocol**: request, acknowledgment and write-completion messages
//! - **Codec**: framed MessagePack encoding of protocol messages
//! - **Transport / Bulk Transfer**: post-and-poll contracts for control
//!   messages and data movement
//! - **Per-Target Operation**: state machine for one target's share of a call
//! - **Orchestrator**: the poll loop that drives every target to completion
//! - **Loopback**: in-memory targets and fabric with fault injection

pub mod codec;
pub mod loopback;
pub mod orchestrator;
pub mod protocol;
pub mod target;
pub mod transport;

pub use codec::{Codec, MsgPackCodec};
pub use loopback::{Fault, LoopbackFabric};
pub use orchestrator::{FileLayout, IoOutcome, Orchestrator};
pub use protocol::{IoAck, IoMode, IoRequest, Message, ObjectId, Tag, WriteCompletion, status};
pub use target::{CompletionMarker, PerTargetOperation, Phase};
pub use transport::{
    Address, BulkTransfer, Endpoint, FlowDescription, MessageCompletion, OpHandle, PollTimeout,
    SharedBuffer, TargetId, TransferCompletion, TransferDescriptor, Transport,
};

use pario_config::ConfigError;
use pario_dist::DistError;
use pario_request::RequestError;
use thiserror::Error;

/// Call-level error types
#[derive(Debug, Error)]
pub enum IoError {
    /// Call rejected before anything was sent
    #[error("Invalid I/O request: {0}")]
    InvalidRequest(String),

    /// No target holds any part of the request
    #[error("No targets available for the request")]
    NoTargets,

    /// Orchestrator configuration rejected
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Request tree or walker failure
    #[error("Request error: {0}")]
    Request(#[from] RequestError),

    /// Distribution could not be built or sized
    #[error("Distribution error: {0}")]
    Distribution(#[from] DistError),

    /// The poll primitive itself failed; the whole call is abandoned
    #[error("Critical orchestration failure: {0}")]
    Critical(String),
}

/// Failure confined to one target's share of a call
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TargetError {
    /// Posting or completing a network operation failed
    #[error("Communication failure while {phase}: {message}")]
    Communication {
        /// Phase the target was in
        phase: Phase,
        /// Transport error message
        message: String,
    },

    /// No completion before the phase deadline
    #[error("Timed out while {phase}")]
    Timeout {
        /// Phase the target was in
        phase: Phase,
    },

    /// Target answered with a failure status
    #[error("Target rejected the request with status {status}")]
    Rejected {
        /// Status carried by the reply
        status: i32,
    },

    /// Reply could not be decoded or did not match the request
    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Transport and bulk-transfer error types
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Target identity has no address
    #[error("Cannot resolve target {0}")]
    Unresolved(TargetId),

    /// Operation could not be posted or failed in flight
    #[error("Operation failed: {0}")]
    Failed(String),

    /// Handle is not known to this transport
    #[error("Unknown handle {0:?}")]
    UnknownHandle(OpHandle),

    /// Polling itself failed
    #[error("Poll failed: {0}")]
    Poll(String),
}

/// Wire codec error types
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Frame does not start with the protocol magic
    #[error("Bad frame magic {0:#010x}")]
    BadMagic(u32),

    /// Frame shorter than its header claims
    #[error("Truncated frame: need {needed} bytes, have {available}")]
    Truncated {
        /// Bytes required
        needed: usize,
        /// Bytes present
        available: usize,
    },

    /// Payload exceeds the frame limit
    #[error("Payload too large: {0} bytes")]
    TooLarge(usize),

    /// Serialization failed
    #[error("Encode error: {0}")]
    Encode(String),

    /// Deserialization failed
    #[error("Decode error: {0}")]
    Decode(String),
}

/// Result type for pario-orch operations
pub type Result<T> = std::result::Result<T, IoError>;
