//! Post-and-poll contracts for control messages and bulk data
//!
//! Operations are posted without blocking and return an opaque
//! [`OpHandle`]. Completions are collected by polling a batch of handles;
//! a handle reported complete is never reported again.

use crate::protocol::{ObjectId, Tag};
use crate::TransportError;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use pario_dist::{Distribution, DistributionSpec, DistributionView};
use pario_request::{
    BufferSegments, OutputMode, RequestTree, RequestWalker, SegmentBudget, SegmentStream,
    TraversalState,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Identity of a storage target as named by the file layout
pub type TargetId = u32;

/// Resolved network address of a target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Address(pub u64);

/// Opaque handle of a posted operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpHandle(pub u64);

/// How long a poll may wait for completions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollTimeout {
    /// Report what is already complete
    Immediate,
    /// Wait up to the duration for at least one completion
    Wait(Duration),
}

/// Completion of a send or receive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageCompletion {
    pub handle: OpHandle,
    /// `None` for sends, the received frame for receives
    pub result: Result<Option<Bytes>, TransportError>,
}

/// Control-message transport
#[async_trait]
pub trait Transport: Send + Sync {
    fn resolve(&self, target: TargetId) -> Result<Address, TransportError>;

    fn post_send(&self, address: Address, payload: Bytes, tag: Tag)
    -> Result<OpHandle, TransportError>;

    /// Expect the next message carrying `tag` from `address`
    fn post_receive(&self, address: Address, tag: Tag) -> Result<OpHandle, TransportError>;

    /// Completions among `handles`. An `Err` means polling itself broke.
    async fn poll(
        &self,
        handles: &[OpHandle],
        timeout: PollTimeout,
    ) -> Result<Vec<MessageCompletion>, TransportError>;
}

/// Client memory shared with the bulk engine for the duration of a call
pub type SharedBuffer = Arc<Mutex<BytesMut>>;

/// One side of a bulk transfer
#[derive(Debug, Clone)]
pub enum Endpoint {
    /// Client buffer, addressed through the descriptor's flow
    Memory { buffer: SharedBuffer },
    /// A target's datafile; the target supplies its own segments
    Target { address: Address, object: ObjectId },
}

/// The part of a call one transfer covers.
///
/// Carries the request rather than its segments, so the bulk engine can
/// regenerate the client side in bounded batches while data moves.
#[derive(Debug, Clone)]
pub struct FlowDescription {
    pub file_request: Arc<RequestTree>,
    /// Layout of a non-contiguous client buffer; `None` means contiguous
    pub memory_request: Option<Arc<RequestTree>>,
    pub distribution: DistributionSpec,
    /// Target view sized by the acknowledged datafile length
    pub view: DistributionView,
    pub request_offset: u64,
    pub length: u64,
    /// Walker batch limit for the client side
    pub budget: SegmentBudget,
}

impl FlowDescription {
    /// Client buffer ranges in request-stream order. `dist` must be built
    /// from `self.distribution`.
    pub fn buffer_segments<'a>(
        &'a self,
        dist: &'a dyn Distribution,
    ) -> pario_request::Result<BufferSegments<'a>> {
        let file = SegmentStream::new(
            RequestWalker::new(&self.file_request, dist),
            TraversalState::with_range(&self.file_request, self.request_offset, self.length),
            self.view,
            self.budget,
            OutputMode::ClientRelative,
        )?;
        let memory = self
            .memory_request
            .as_deref()
            .map(|tree| SegmentStream::memory(tree, self.length, self.budget))
            .transpose()?;
        BufferSegments::new(file, memory)
    }
}

/// Everything the bulk engine needs to move one target's data
#[derive(Debug, Clone)]
pub struct TransferDescriptor {
    pub tag: Tag,
    pub source: Endpoint,
    pub destination: Endpoint,
    pub flow: FlowDescription,
    /// Bytes expected to move
    pub bytes: u64,
}

/// Completion of a bulk transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferCompletion {
    pub handle: OpHandle,
    /// Bytes moved
    pub result: Result<u64, TransportError>,
}

/// Bulk data-movement engine
#[async_trait]
pub trait BulkTransfer: Send + Sync {
    fn post_transfer(&self, descriptor: TransferDescriptor) -> Result<OpHandle, TransportError>;

    async fn poll(
        &self,
        handles: &[OpHandle],
        timeout: PollTimeout,
    ) -> Result<Vec<TransferCompletion>, TransportError>;
}
