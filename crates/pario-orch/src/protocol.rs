//! Control messages exchanged with storage targets

use pario_dist::DistributionSpec;
use pario_request::RequestTree;
use serde::{Deserialize, Serialize};

/// Identifier of a file object on a target
pub type ObjectId = u64;

/// Correlates a request with its replies and its bulk transfer
pub type Tag = u64;

/// Reply status codes
pub mod status {
    /// Success
    pub const OK: i32 = 0;
    /// Generic I/O failure on the target
    pub const EIO: i32 = -5;
    /// Malformed or unsupported request
    pub const EINVAL: i32 = -22;
    /// Request could not be decoded
    pub const EPROTO: i32 = -71;
}

/// Direction of a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IoMode {
    /// Target to client buffer
    Read,
    /// Client buffer to target
    Write,
}

/// One target's share of a logical call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoRequest {
    pub tag: Tag,
    pub object: ObjectId,
    pub mode: IoMode,
    /// Position of the receiving target in the distribution
    pub target_index: u32,
    pub target_count: u32,
    pub distribution: DistributionSpec,
    /// Access pattern over the logical file
    pub file_request: RequestTree,
    /// Request-stream position the call starts at
    pub request_offset: u64,
    /// Request-stream bytes the call covers
    pub length: u64,
}

/// First reply to an [`IoRequest`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoAck {
    pub tag: Tag,
    pub status: i32,
    /// Physical size of the target's datafile when the request arrived
    pub datafile_size: u64,
}

/// Final reply to a write, sent once the data has landed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteCompletion {
    pub tag: Tag,
    pub status: i32,
    pub bytes_written: u64,
}

/// Everything that crosses the control channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    Request(IoRequest),
    Ack(IoAck),
    WriteCompletion(WriteCompletion),
}

impl Message {
    pub fn tag(&self) -> Tag {
        match self {
            Self::Request(request) => request.tag,
            Self::Ack(ack) => ack.tag,
            Self::WriteCompletion(completion) => completion.tag,
        }
    }
}
