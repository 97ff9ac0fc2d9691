//! Fan-out I/O coordinator
//!
//! [`Orchestrator::submit_io`] turns one logical call into a
//! [`PerTargetOperation`] per participating target and drives all of them
//! from a single task: post everything that can be posted, poll the
//! outstanding handles without blocking, advance whichever slots completed,
//! sleep briefly when nothing did. Failures stay in their slot; only a
//! broken poll primitive aborts the call.

use crate::codec::{Codec, MsgPackCodec};
use crate::protocol::{IoAck, IoMode, IoRequest, Message, ObjectId, status};
use crate::target::{PerTargetOperation, Phase};
use crate::transport::{
    BulkTransfer, Endpoint, FlowDescription, OpHandle, PollTimeout, SharedBuffer, TargetId,
    TransferDescriptor, Transport,
};
use crate::{IoError, Result, TargetError, TransportError};
use bytes::Bytes;
use pario_config::IoConfig;
use pario_dist::{Distribution, DistributionSpec, DistributionView};
use pario_request::{RequestTree, RequestWalker, SegmentBudget, SegmentStream, TraversalState};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, trace, warn};

/// Where a file's data lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileLayout {
    pub object: ObjectId,
    pub distribution: DistributionSpec,
    /// Datafile holders, in distribution order
    pub targets: Vec<TargetId>,
}

impl FileLayout {
    pub fn new(object: ObjectId, distribution: DistributionSpec, targets: Vec<TargetId>) -> Self {
        Self {
            object,
            distribution,
            targets,
        }
    }

    /// Layout using the configured default distribution over at most
    /// `config.max_targets` of `targets`.
    ///
    /// The datafile count is fixed here; later calls never re-stripe.
    pub fn from_config(
        object: ObjectId,
        config: &IoConfig,
        mut targets: Vec<TargetId>,
    ) -> Result<Self> {
        let distribution = DistributionSpec::parse(&config.distribution)?;
        if targets.len() > config.max_targets as usize {
            debug!(
                offered = targets.len(),
                max_targets = config.max_targets,
                "trimming layout to the target limit"
            );
            targets.truncate(config.max_targets as usize);
        }
        Ok(Self::new(object, distribution, targets))
    }
}

/// Aggregate result of one logical call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IoOutcome {
    /// Bytes moved by targets that finished without error
    pub bytes_transferred: u64,
    /// Failed targets by distribution index
    pub errors: Vec<(u32, TargetError)>,
}

impl IoOutcome {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    fn collect(ops: &[PerTargetOperation]) -> Self {
        let mut outcome = Self::default();
        for op in ops {
            match &op.error {
                Some(error) => outcome.errors.push((op.target_index, error.clone())),
                None => outcome.bytes_transferred += op.bytes_transferred,
            }
        }
        outcome
    }
}

/// Everything about the call that every slot shares
struct CallContext<'a> {
    file: &'a FileLayout,
    /// Shared with every transfer descriptor of the call
    file_request: Arc<RequestTree>,
    memory_request: Option<Arc<RequestTree>>,
    dist: &'a dyn Distribution,
    mode: IoMode,
    offset: u64,
    length: u64,
    target_count: u32,
    buffer: &'a SharedBuffer,
}

/// Drives logical I/O calls across storage targets
pub struct Orchestrator {
    transport: Arc<dyn Transport>,
    bulk: Arc<dyn BulkTransfer>,
    codec: Arc<dyn Codec>,
    config: IoConfig,
    next_tag: AtomicU64,
}

impl Orchestrator {
    pub fn new(
        transport: Arc<dyn Transport>,
        bulk: Arc<dyn BulkTransfer>,
        config: IoConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            transport,
            bulk,
            codec: Arc::new(MsgPackCodec),
            config,
            next_tag: AtomicU64::new(1),
        })
    }

    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn config(&self) -> &IoConfig {
        &self.config
    }

    /// Walker batch budget from configuration
    pub fn budget(&self) -> SegmentBudget {
        SegmentBudget::new(self.config.max_segments, self.config.max_bytes)
    }

    /// Read or write `buffer` through `tree` starting at request-stream
    /// position 0
    pub async fn submit_io(
        &self,
        file: &FileLayout,
        tree: &RequestTree,
        buffer: SharedBuffer,
        mode: IoMode,
    ) -> Result<IoOutcome> {
        self.submit_io_at(file, tree, 0, buffer, mode).await
    }

    /// Read or write `buffer` through `tree` starting at request-stream
    /// position `offset`.
    ///
    /// The buffer length is the number of request-stream bytes covered.
    /// Returns `Err` only for bad input or a failed poll; target failures are
    /// reported in the outcome.
    pub async fn submit_io_at(
        &self,
        file: &FileLayout,
        tree: &RequestTree,
        offset: u64,
        buffer: SharedBuffer,
        mode: IoMode,
    ) -> Result<IoOutcome> {
        let length = buffer.lock().len() as u64;
        self.submit(file, tree, offset, length, None, buffer, mode).await
    }

    /// Like [`submit_io_at`](Self::submit_io_at) for a non-contiguous
    /// buffer: stream byte `i` of the call lives where the `i`th byte of
    /// `memory` lands in `buffer`.
    ///
    /// The call covers `memory.aggregate_size()` stream bytes, and every
    /// byte `memory` names must lie inside `buffer`.
    pub async fn submit_io_mapped(
        &self,
        file: &FileLayout,
        tree: &RequestTree,
        offset: u64,
        memory: &RequestTree,
        buffer: SharedBuffer,
        mode: IoMode,
    ) -> Result<IoOutcome> {
        let length = memory.aggregate_size();
        let span = self.memory_span(memory, length)?;
        let available = buffer.lock().len() as u64;
        if span > available {
            return Err(IoError::InvalidRequest(format!(
                "memory request reaches byte {span} of a {available} byte buffer"
            )));
        }
        self.submit(file, tree, offset, length, Some(memory), buffer, mode)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn submit(
        &self,
        file: &FileLayout,
        tree: &RequestTree,
        offset: u64,
        length: u64,
        memory: Option<&RequestTree>,
        buffer: SharedBuffer,
        mode: IoMode,
    ) -> Result<IoOutcome> {
        if length == 0 {
            return Err(IoError::InvalidRequest("empty buffer".to_string()));
        }
        if file.targets.is_empty() {
            return Err(IoError::NoTargets);
        }
        if file.targets.len() > self.config.max_targets as usize {
            return Err(IoError::InvalidRequest(format!(
                "layout spans {} targets, limit is {}",
                file.targets.len(),
                self.config.max_targets
            )));
        }
        let dist = file.distribution.build()?;
        let target_count = dist.target_count(file.targets.len() as u32)?;

        let call = CallContext {
            file,
            file_request: Arc::new(tree.clone()),
            memory_request: memory.map(|m| Arc::new(m.clone())),
            dist: dist.as_ref(),
            mode,
            offset,
            length,
            target_count,
            buffer: &buffer,
        };
        let participants = self.select_targets(&call)?;
        if participants.is_empty() {
            return Err(IoError::NoTargets);
        }

        let base_tag = self
            .next_tag
            .fetch_add(u64::from(target_count), Ordering::Relaxed);
        let mut ops: Vec<PerTargetOperation> = participants
            .iter()
            .map(|&index| {
                PerTargetOperation::new(index, file.targets[index as usize], base_tag + u64::from(index))
            })
            .collect();
        debug!(
            object = file.object,
            ?mode,
            offset,
            length,
            mapped = memory.is_some(),
            targets = ops.len(),
            "submit io"
        );

        for op in &mut ops {
            self.post_request(op, &call);
        }
        self.drive(&mut ops, &call).await?;

        let outcome = IoOutcome::collect(&ops);
        if outcome.is_success() {
            debug!(object = file.object, bytes = outcome.bytes_transferred, "io complete");
        } else {
            warn!(
                object = file.object,
                bytes = outcome.bytes_transferred,
                failed = outcome.errors.len(),
                "io complete with target failures"
            );
        }
        Ok(outcome)
    }

    /// One past the highest buffer byte `memory` names for `length` stream
    /// bytes, walked in bounded batches
    fn memory_span(&self, memory: &RequestTree, length: u64) -> Result<u64> {
        let mut span = 0;
        for segment in SegmentStream::memory(memory, length, self.budget())? {
            span = span.max(segment?.end());
        }
        Ok(span)
    }

    /// Distribution indices holding any part of the call
    fn select_targets(&self, call: &CallContext<'_>) -> Result<Vec<u32>> {
        let walker = RequestWalker::new(&call.file_request, call.dist);
        let state = TraversalState::with_range(&call.file_request, call.offset, call.length);
        let mut participants = Vec::new();
        for index in 0..call.target_count {
            let view = DistributionView::new(index, call.target_count).with_extend(true);
            let counted = walker.count(&state, &view, SegmentBudget::unlimited())?;
            if counted.bytes > 0 {
                participants.push(index);
            } else {
                trace!(target_index = index, "target holds nothing for this call");
            }
        }
        Ok(participants)
    }

    fn post_request(&self, op: &mut PerTargetOperation, call: &CallContext<'_>) {
        let address = match self.transport.resolve(op.target) {
            Ok(address) => address,
            Err(e) => {
                op.fail(communication(Phase::Initial, &e));
                return;
            }
        };
        op.address = Some(address);

        let request = IoRequest {
            tag: op.tag,
            object: call.file.object,
            mode: call.mode,
            target_index: op.target_index,
            target_count: call.target_count,
            distribution: call.file.distribution.clone(),
            file_request: call.file_request.as_ref().clone(),
            request_offset: call.offset,
            length: call.length,
        };
        let frame: Bytes = match self.codec.encode(&Message::Request(request)) {
            Ok(frame) => frame,
            Err(e) => {
                op.fail(TargetError::Protocol(e.to_string()));
                return;
            }
        };
        op.request = Some(frame.clone());

        match self.transport.post_send(address, frame, op.tag) {
            Ok(handle) => op.advance(
                Phase::AwaitingSend,
                handle,
                Instant::now() + self.config.message_timeout(),
            ),
            Err(e) => op.fail(communication(Phase::AwaitingSend, &e)),
        }
    }

    async fn drive(&self, ops: &mut [PerTargetOperation], call: &CallContext<'_>) -> Result<()> {
        loop {
            let now = Instant::now();
            for op in ops.iter_mut() {
                op.expire(now);
            }
            if ops.iter().all(PerTargetOperation::is_done) {
                return Ok(());
            }

            let message_handles = handles_in(ops, |phase| {
                matches!(
                    phase,
                    Phase::AwaitingSend | Phase::AwaitingAcknowledgment | Phase::AwaitingWriteCompletion
                )
            });
            let transfer_handles = handles_in(ops, |phase| phase == Phase::AwaitingTransfer);
            let mut progressed = false;

            if !message_handles.is_empty() {
                let completions = self
                    .transport
                    .poll(&message_handles, PollTimeout::Immediate)
                    .await
                    .map_err(|e| IoError::Critical(e.to_string()))?;
                for completion in completions {
                    let Some(op) = ops.iter_mut().find(|op| op.owns(completion.handle)) else {
                        trace!(handle = ?completion.handle, "ignoring late message completion");
                        continue;
                    };
                    progressed = true;
                    self.on_message(op, completion.result, call);
                }
            }

            if !transfer_handles.is_empty() {
                let completions = self
                    .bulk
                    .poll(&transfer_handles, PollTimeout::Immediate)
                    .await
                    .map_err(|e| IoError::Critical(e.to_string()))?;
                for completion in completions {
                    let Some(op) = ops.iter_mut().find(|op| op.owns(completion.handle)) else {
                        trace!(handle = ?completion.handle, "ignoring late transfer completion");
                        continue;
                    };
                    progressed = true;
                    self.on_transfer(op, completion.result, call);
                }
            }

            if !progressed {
                tokio::time::sleep(self.config.poll_interval()).await;
            }
        }
    }

    fn on_message(
        &self,
        op: &mut PerTargetOperation,
        result: std::result::Result<Option<Bytes>, TransportError>,
        call: &CallContext<'_>,
    ) {
        let phase = op.phase;
        let reply = match result {
            Err(e) => {
                op.fail(communication(phase, &e));
                return;
            }
            Ok(reply) => reply,
        };

        match phase {
            Phase::AwaitingSend => self.post_receive(op, Phase::AwaitingAcknowledgment),
            Phase::AwaitingAcknowledgment => match self.decode_reply(op, reply) {
                Some(Message::Ack(ack)) => self.on_ack(op, ack, call),
                Some(other) => op.fail(unexpected(&other)),
                None => {}
            },
            Phase::AwaitingWriteCompletion => match self.decode_reply(op, reply) {
                Some(Message::WriteCompletion(done)) if done.status != status::OK => {
                    op.fail(TargetError::Rejected { status: done.status });
                }
                Some(Message::WriteCompletion(done)) => op.complete(done.bytes_written),
                Some(other) => op.fail(unexpected(&other)),
                None => {}
            },
            _ => {}
        }
    }

    /// Decode a reply and check its tag; failures are recorded on `op`
    fn decode_reply(&self, op: &mut PerTargetOperation, reply: Option<Bytes>) -> Option<Message> {
        let Some(frame) = reply else {
            op.fail(TargetError::Protocol("empty reply".to_string()));
            return None;
        };
        match self.codec.decode(&frame) {
            Ok(message) if message.tag() == op.tag => Some(message),
            Ok(message) => {
                op.fail(TargetError::Protocol(format!(
                    "reply tag {} does not match {}",
                    message.tag(),
                    op.tag
                )));
                None
            }
            Err(e) => {
                op.fail(TargetError::Protocol(e.to_string()));
                None
            }
        }
    }

    fn on_ack(&self, op: &mut PerTargetOperation, ack: IoAck, call: &CallContext<'_>) {
        op.ack = Some(ack);
        if ack.status != status::OK {
            op.fail(TargetError::Rejected { status: ack.status });
            return;
        }

        let view = DistributionView::new(op.target_index, call.target_count)
            .with_file_size(ack.datafile_size)
            .with_extend(call.mode == IoMode::Write);
        let bytes = match self.transfer_bytes(view, call) {
            Ok(bytes) => bytes,
            Err(e) => {
                op.fail(TargetError::Protocol(format!("cannot map request: {e}")));
                return;
            }
        };
        if bytes == 0 {
            // nothing on this target below its end of file
            op.complete(0);
            return;
        }
        let Some(address) = op.address else {
            op.fail(TargetError::Protocol("acknowledgment before resolve".to_string()));
            return;
        };

        let memory = Endpoint::Memory {
            buffer: Arc::clone(call.buffer),
        };
        let remote = Endpoint::Target {
            address,
            object: call.file.object,
        };
        let (source, destination) = match call.mode {
            IoMode::Read => (remote, memory),
            IoMode::Write => (memory, remote),
        };
        let descriptor = TransferDescriptor {
            tag: op.tag,
            source,
            destination,
            flow: FlowDescription {
                file_request: Arc::clone(&call.file_request),
                memory_request: call.memory_request.clone(),
                distribution: call.file.distribution.clone(),
                view,
                request_offset: call.offset,
                length: call.length,
                budget: self.budget(),
            },
            bytes,
        };
        match self.bulk.post_transfer(descriptor.clone()) {
            Ok(handle) => {
                op.transfer = Some(descriptor);
                op.advance(
                    Phase::AwaitingTransfer,
                    handle,
                    Instant::now() + self.config.transfer_timeout(),
                );
            }
            Err(e) => op.fail(communication(Phase::AwaitingTransfer, &e)),
        }
    }

    /// Bytes this target's share holds below the acknowledged datafile
    /// size. Counting keeps no segments.
    fn transfer_bytes(&self, view: DistributionView, call: &CallContext<'_>) -> Result<u64> {
        let walker = RequestWalker::new(&call.file_request, call.dist);
        let state = TraversalState::with_range(&call.file_request, call.offset, call.length);
        Ok(walker.count(&state, &view, SegmentBudget::unlimited())?.bytes)
    }

    fn on_transfer(
        &self,
        op: &mut PerTargetOperation,
        result: std::result::Result<u64, TransportError>,
        call: &CallContext<'_>,
    ) {
        match result {
            Err(e) => op.fail(communication(Phase::AwaitingTransfer, &e)),
            Ok(moved) => match call.mode {
                IoMode::Read => op.complete(moved),
                IoMode::Write => {
                    op.bytes_transferred = moved;
                    self.post_receive(op, Phase::AwaitingWriteCompletion);
                }
            },
        }
    }

    fn post_receive(&self, op: &mut PerTargetOperation, next: Phase) {
        let Some(address) = op.address else {
            op.fail(TargetError::Protocol("receive before resolve".to_string()));
            return;
        };
        match self.transport.post_receive(address, op.tag) {
            Ok(handle) => op.advance(next, handle, Instant::now() + self.config.message_timeout()),
            Err(e) => op.fail(communication(next, &e)),
        }
    }
}

fn handles_in(ops: &[PerTargetOperation], wanted: impl Fn(Phase) -> bool) -> Vec<OpHandle> {
    ops.iter()
        .filter(|op| wanted(op.phase))
        .filter_map(|op| op.handle)
        .collect()
}

fn communication(phase: Phase, error: &TransportError) -> TargetError {
    TargetError::Communication {
        phase,
        message: error.to_string(),
    }
}

fn unexpected(message: &Message) -> TargetError {
    let kind = match message {
        Message::Request(_) => "request",
        Message::Ack(_) => "acknowledgment",
        Message::WriteCompletion(_) => "write completion",
    };
    TargetError::Protocol(format!("unexpected {kind}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_sums_successful_targets_only() {
        let mut ok = PerTargetOperation::new(0, 10, 1);
        ok.complete(100);
        let mut failed = PerTargetOperation::new(1, 11, 2);
        failed.bytes_transferred = 50;
        failed.fail(TargetError::Rejected { status: -5 });
        let mut ok2 = PerTargetOperation::new(2, 12, 3);
        ok2.complete(70);

        let outcome = IoOutcome::collect(&[ok, failed, ok2]);
        assert_eq!(outcome.bytes_transferred, 170);
        assert_eq!(outcome.errors, vec![(1, TargetError::Rejected { status: -5 })]);
        assert!(!outcome.is_success());
    }

    #[test]
    fn test_layout_from_config() {
        let config = IoConfig::default().with_distribution("simple_stripe:1K");
        let layout = FileLayout::from_config(5, &config, vec![1, 2]).unwrap();
        assert_eq!(layout.distribution, DistributionSpec::SimpleStripe { strip_size: 1024 });

        let narrow = IoConfig::default().with_max_targets(2);
        let layout = FileLayout::from_config(5, &narrow, vec![4, 5, 6, 7]).unwrap();
        assert_eq!(layout.targets, vec![4, 5]);

        let bad = IoConfig::default().with_distribution("bogus");
        assert!(matches!(
            FileLayout::from_config(5, &bad, vec![1]),
            Err(IoError::Distribution(_))
        ));
    }
}
