//! In-memory storage targets
//!
//! [`LoopbackFabric`] implements both [`Transport`] and [`BulkTransfer`]
//! and plays the server side of the protocol itself: requests are served
//! as soon as they are posted, datafiles live in memory, and each target
//! can be given a [`Fault`] to exercise failure handling.

use crate::codec::{Codec, MsgPackCodec};
use crate::protocol::{IoAck, IoMode, IoRequest, Message, ObjectId, Tag, WriteCompletion, status};
use crate::transport::{
    Address, BulkTransfer, Endpoint, MessageCompletion, OpHandle, PollTimeout, SharedBuffer,
    TargetId, TransferCompletion, TransferDescriptor, Transport,
};
use crate::TransportError;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use pario_dist::DistributionView;
use pario_request::{
    OutputMode, RequestError, RequestWalker, Segment, SegmentBudget, SegmentStream,
    TraversalState,
};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Failure injected on one target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Target cannot be resolved
    Unreachable,
    /// Request send completes with an error
    SendError,
    /// Acknowledgment is never sent
    DropAck,
    /// Acknowledgment carries this status
    RejectAck(i32),
    /// Acknowledgment frame is garbage
    CorruptAck,
    /// Bulk transfer completes with an error
    TransferError,
    /// Bulk transfer never completes
    DropTransfer,
    /// Write completion is never sent
    DropWriteCompletion,
    /// Write completion carries this status
    RejectWrite(i32),
}

/// Target-side record of an acknowledged request awaiting its data
#[derive(Debug, Clone)]
struct Flow {
    request: IoRequest,
    /// Datafile length the acknowledgment reported
    datafile_size: u64,
}

/// Loopback transport, bulk engine and targets in one
#[derive(Debug)]
pub struct LoopbackFabric {
    target_count: u32,
    datafiles: DashMap<(TargetId, ObjectId), Vec<u8>>,
    faults: DashMap<TargetId, Fault>,
    /// Replies waiting for a matching receive
    outbox: Mutex<HashMap<(Address, Tag), VecDeque<Bytes>>>,
    flows: Mutex<HashMap<(Address, Tag), Flow>>,
    receives: Mutex<HashMap<OpHandle, (Address, Tag)>>,
    sends: Mutex<HashMap<OpHandle, Result<Option<Bytes>, TransportError>>>,
    transfers: Mutex<HashMap<OpHandle, Result<u64, TransportError>>>,
    next_handle: AtomicU64,
    fail_polls: AtomicBool,
    /// Walker batch limit for the target side of transfers
    budget: SegmentBudget,
    codec: MsgPackCodec,
}

impl LoopbackFabric {
    /// Fabric with targets `0..target_count`
    pub fn new(target_count: u32) -> Self {
        Self {
            target_count,
            datafiles: DashMap::new(),
            faults: DashMap::new(),
            outbox: Mutex::new(HashMap::new()),
            flows: Mutex::new(HashMap::new()),
            receives: Mutex::new(HashMap::new()),
            sends: Mutex::new(HashMap::new()),
            transfers: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            fail_polls: AtomicBool::new(false),
            budget: SegmentBudget::default(),
            codec: MsgPackCodec,
        }
    }

    /// Batch limit the targets walk their side of a transfer with
    pub fn with_budget(mut self, budget: SegmentBudget) -> Self {
        self.budget = budget;
        self
    }

    pub fn target_count(&self) -> u32 {
        self.target_count
    }

    pub fn inject(&self, target: TargetId, fault: Fault) {
        self.faults.insert(target, fault);
    }

    pub fn clear_faults(&self) {
        self.faults.clear();
    }

    /// Make every poll fail
    pub fn fail_polls(&self, fail: bool) {
        self.fail_polls.store(fail, Ordering::SeqCst);
    }

    pub fn datafile(&self, target: TargetId, object: ObjectId) -> Option<Vec<u8>> {
        self.datafiles.get(&(target, object)).map(|d| d.value().clone())
    }

    pub fn set_datafile(&self, target: TargetId, object: ObjectId, data: Vec<u8>) {
        self.datafiles.insert((target, object), data);
    }

    fn fault(&self, target: TargetId) -> Option<Fault> {
        self.faults.get(&target).map(|f| *f)
    }

    fn handle(&self) -> OpHandle {
        OpHandle(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    fn target_of(address: Address) -> TargetId {
        address.0 as TargetId
    }

    fn datafile_len(&self, target: TargetId, object: ObjectId) -> u64 {
        self.datafiles
            .get(&(target, object))
            .map_or(0, |d| d.len() as u64)
    }

    fn reply(&self, address: Address, tag: Tag, frame: Bytes) {
        self.outbox
            .lock()
            .entry((address, tag))
            .or_default()
            .push_back(frame);
    }

    fn reply_message(&self, address: Address, message: &Message) {
        match self.codec.encode(message) {
            Ok(frame) => self.reply(address, message.tag(), frame),
            Err(e) => debug!(error = %e, "loopback reply could not be encoded"),
        }
    }

    /// Handle an incoming request frame the way a storage target would
    fn serve(&self, address: Address, payload: &[u8], tag: Tag) {
        let target = Self::target_of(address);
        let ack = match self.codec.decode(payload) {
            Ok(Message::Request(request)) => self.acknowledge(address, &request),
            Ok(_) | Err(_) => IoAck {
                tag,
                status: status::EPROTO,
                datafile_size: 0,
            },
        };

        match self.fault(target) {
            Some(Fault::DropAck) => {
                trace!(target_index = target, tag, "dropping acknowledgment");
                self.flows.lock().remove(&(address, tag));
            }
            Some(Fault::CorruptAck) => {
                self.reply(address, tag, Bytes::from_static(b"not a frame"));
            }
            Some(Fault::RejectAck(code)) => {
                self.flows.lock().remove(&(address, tag));
                self.reply_message(
                    address,
                    &Message::Ack(IoAck {
                        status: code,
                        ..ack
                    }),
                );
            }
            _ => self.reply_message(address, &Message::Ack(ack)),
        }
    }

    fn acknowledge(&self, address: Address, request: &IoRequest) -> IoAck {
        let target = Self::target_of(address);
        let current = self.datafile_len(target, request.object);
        let ack_with = |code: i32| IoAck {
            tag: request.tag,
            status: code,
            datafile_size: current,
        };

        let Ok(dist) = request.distribution.build() else {
            return ack_with(status::EINVAL);
        };
        let walker = RequestWalker::new(&request.file_request, dist.as_ref());
        let state = TraversalState::with_range(
            &request.file_request,
            request.request_offset,
            request.length,
        );
        let view = target_view(request, current);
        let counted = match walker.count(&state, &view, SegmentBudget::unlimited()) {
            Ok(counted) => counted,
            Err(e) => {
                debug!(target_index = target, error = %e, "loopback request rejected");
                return ack_with(status::EINVAL);
            }
        };

        debug!(
            target_index = target,
            tag = request.tag,
            mode = ?request.mode,
            segments = counted.segment_count,
            bytes = counted.bytes,
            "loopback request accepted"
        );
        self.flows.lock().insert(
            (address, request.tag),
            Flow {
                request: request.clone(),
                datafile_size: current,
            },
        );
        ack_with(status::OK)
    }

    /// Move data between client memory and a datafile
    fn execute(&self, descriptor: &TransferDescriptor) -> Result<u64, TransportError> {
        let (buffer, address, object, mode) = match (&descriptor.source, &descriptor.destination) {
            (Endpoint::Target { address, object }, Endpoint::Memory { buffer }) => {
                (buffer, *address, *object, IoMode::Read)
            }
            (Endpoint::Memory { buffer }, Endpoint::Target { address, object }) => {
                (buffer, *address, *object, IoMode::Write)
            }
            _ => {
                return Err(TransportError::Failed(
                    "transfer needs one memory and one target endpoint".to_string(),
                ));
            }
        };

        let flow = self
            .flows
            .lock()
            .remove(&(address, descriptor.tag))
            .ok_or_else(|| {
                TransportError::Failed(format!("no request with tag {}", descriptor.tag))
            })?;
        let request = &flow.request;
        if request.mode != mode || request.object != object {
            return Err(TransportError::Failed(
                "transfer does not match the acknowledged request".to_string(),
            ));
        }

        let client_dist = descriptor
            .flow
            .distribution
            .build()
            .map_err(|e| TransportError::Failed(e.to_string()))?;
        let mut memory = descriptor
            .flow
            .buffer_segments(client_dist.as_ref())
            .map_err(walk_failed)?;

        let target_dist = request
            .distribution
            .build()
            .map_err(|e| TransportError::Failed(e.to_string()))?;
        let mut disk = SegmentStream::new(
            RequestWalker::new(&request.file_request, target_dist.as_ref()),
            TraversalState::with_range(&request.file_request, request.request_offset, request.length),
            target_view(request, flow.datafile_size),
            self.budget,
            OutputMode::TargetRelative,
        )
        .map_err(walk_failed)?;

        let target = Self::target_of(address);
        let moved = for_each_pair(
            || memory.next_segment().map_err(walk_failed),
            || disk.next_segment().map_err(walk_failed),
            |mem, file, len| match mode {
                IoMode::Read => self.read_into(buffer, target, object, mem, file, len),
                IoMode::Write => self.write_from(buffer, target, object, mem, file, len),
            },
        )?;
        trace!(
            target_index = target,
            tag = descriptor.tag,
            bytes = moved,
            client_batches = memory.batches(),
            target_batches = disk.batches(),
            "transfer done"
        );
        if moved != descriptor.bytes {
            return Err(TransportError::Failed(format!(
                "moved {moved} bytes, descriptor expected {}",
                descriptor.bytes
            )));
        }
        Ok(moved)
    }

    fn read_into(
        &self,
        buffer: &SharedBuffer,
        target: TargetId,
        object: ObjectId,
        mem: u64,
        file: u64,
        len: u64,
    ) -> Result<(), TransportError> {
        let datafile = self.datafiles.get(&(target, object));
        let datafile = datafile.as_ref().map_or(&[][..], |d| d.as_slice());
        let mut memory = buffer.lock();
        let dst = checked_range(mem, len, memory.len())?;
        let src = checked_range(file, len, datafile.len())?;
        memory[dst].copy_from_slice(&datafile[src]);
        Ok(())
    }

    fn write_from(
        &self,
        buffer: &SharedBuffer,
        target: TargetId,
        object: ObjectId,
        mem: u64,
        file: u64,
        len: u64,
    ) -> Result<(), TransportError> {
        let memory = buffer.lock();
        let src = checked_range(mem, len, memory.len())?;
        let mut datafile = self.datafiles.entry((target, object)).or_default();
        let end = (file + len) as usize;
        if datafile.len() < end {
            datafile.resize(end, 0);
        }
        let dst = checked_range(file, len, datafile.len())?;
        datafile[dst].copy_from_slice(&memory[src]);
        Ok(())
    }

    fn collect_messages(&self, handles: &[OpHandle]) -> Vec<MessageCompletion> {
        let mut ready = Vec::new();
        let mut sends = self.sends.lock();
        let mut receives = self.receives.lock();
        let mut outbox = self.outbox.lock();
        for &handle in handles {
            if let Some(result) = sends.remove(&handle) {
                ready.push(MessageCompletion { handle, result });
                continue;
            }
            let Some(key) = receives.get(&handle).copied() else {
                continue;
            };
            if let Some(frame) = outbox.get_mut(&key).and_then(VecDeque::pop_front) {
                receives.remove(&handle);
                ready.push(MessageCompletion {
                    handle,
                    result: Ok(Some(frame)),
                });
            }
        }
        ready
    }

    fn collect_transfers(&self, handles: &[OpHandle]) -> Vec<TransferCompletion> {
        let mut transfers = self.transfers.lock();
        handles
            .iter()
            .filter_map(|&handle| {
                transfers
                    .remove(&handle)
                    .map(|result| TransferCompletion { handle, result })
            })
            .collect()
    }

    fn check_polls(&self) -> Result<(), TransportError> {
        if self.fail_polls.load(Ordering::SeqCst) {
            return Err(TransportError::Poll("injected poll failure".to_string()));
        }
        Ok(())
    }
}

/// View of the request's target at the acknowledged datafile size
fn target_view(request: &IoRequest, datafile_size: u64) -> DistributionView {
    DistributionView::new(request.target_index, request.target_count)
        .with_file_size(datafile_size)
        .with_extend(request.mode == IoMode::Write)
}

fn walk_failed(error: RequestError) -> TransportError {
    TransportError::Failed(format!("cannot walk request: {error}"))
}

/// Pull segments from both sides in lockstep, calling `copy` with
/// `(memory offset, datafile offset, len)` for each overlap. Returns the
/// bytes paired; the two sides must run out together.
fn for_each_pair(
    mut memory: impl FnMut() -> Result<Option<Segment>, TransportError>,
    mut disk: impl FnMut() -> Result<Option<Segment>, TransportError>,
    mut copy: impl FnMut(u64, u64, u64) -> Result<(), TransportError>,
) -> Result<u64, TransportError> {
    let mut moved = 0;
    let (mut m, mut d) = (memory()?, disk()?);
    loop {
        let (mem, file) = match (m, d) {
            (None, None) => return Ok(moved),
            (Some(mem), Some(file)) => (mem, file),
            (Some(_), None) | (None, Some(_)) => {
                return Err(TransportError::Failed(format!(
                    "client and target disagree after {moved} bytes"
                )));
            }
        };
        let len = mem.len.min(file.len);
        copy(mem.offset, file.offset, len)?;
        moved += len;
        m = if len == mem.len {
            memory()?
        } else {
            Some(Segment::new(mem.offset + len, mem.len - len))
        };
        d = if len == file.len {
            disk()?
        } else {
            Some(Segment::new(file.offset + len, file.len - len))
        };
    }
}

fn checked_range(
    offset: u64,
    len: u64,
    available: usize,
) -> Result<std::ops::Range<usize>, TransportError> {
    let start = offset as usize;
    let end = start + len as usize;
    if end > available {
        return Err(TransportError::Failed(format!(
            "range {start}..{end} outside {available} bytes"
        )));
    }
    Ok(start..end)
}

#[async_trait]
impl Transport for LoopbackFabric {
    fn resolve(&self, target: TargetId) -> Result<Address, TransportError> {
        if target >= self.target_count || self.fault(target) == Some(Fault::Unreachable) {
            return Err(TransportError::Unresolved(target));
        }
        Ok(Address(u64::from(target)))
    }

    fn post_send(
        &self,
        address: Address,
        payload: Bytes,
        tag: Tag,
    ) -> Result<OpHandle, TransportError> {
        let handle = self.handle();
        let result = if self.fault(Self::target_of(address)) == Some(Fault::SendError) {
            Err(TransportError::Failed("injected send failure".to_string()))
        } else {
            self.serve(address, &payload, tag);
            Ok(None)
        };
        self.sends.lock().insert(handle, result);
        Ok(handle)
    }

    fn post_receive(&self, address: Address, tag: Tag) -> Result<OpHandle, TransportError> {
        let handle = self.handle();
        self.receives.lock().insert(handle, (address, tag));
        Ok(handle)
    }

    async fn poll(
        &self,
        handles: &[OpHandle],
        timeout: PollTimeout,
    ) -> Result<Vec<MessageCompletion>, TransportError> {
        let deadline = match timeout {
            PollTimeout::Immediate => None,
            PollTimeout::Wait(wait) => Some(Instant::now() + wait),
        };
        loop {
            self.check_polls()?;
            let ready = self.collect_messages(handles);
            if !ready.is_empty() || deadline.is_none_or(|d| Instant::now() >= d) {
                return Ok(ready);
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
}

#[async_trait]
impl BulkTransfer for LoopbackFabric {
    fn post_transfer(&self, descriptor: TransferDescriptor) -> Result<OpHandle, TransportError> {
        let handle = self.handle();
        let address = match (&descriptor.source, &descriptor.destination) {
            (Endpoint::Target { address, .. }, _) | (_, Endpoint::Target { address, .. }) => {
                *address
            }
            _ => {
                return Err(TransportError::Failed(
                    "transfer has no target endpoint".to_string(),
                ));
            }
        };
        let target = Self::target_of(address);

        let result = match self.fault(target) {
            Some(Fault::DropTransfer) => {
                trace!(target_index = target, tag = descriptor.tag, "dropping transfer");
                return Ok(handle);
            }
            Some(Fault::TransferError) => {
                Err(TransportError::Failed("injected transfer failure".to_string()))
            }
            _ => self.execute(&descriptor),
        };

        if let (Ok(written), Endpoint::Target { .. }) = (&result, &descriptor.destination) {
            let completion = match self.fault(target) {
                Some(Fault::DropWriteCompletion) => None,
                Some(Fault::RejectWrite(code)) => Some(WriteCompletion {
                    tag: descriptor.tag,
                    status: code,
                    bytes_written: 0,
                }),
                _ => Some(WriteCompletion {
                    tag: descriptor.tag,
                    status: status::OK,
                    bytes_written: *written,
                }),
            };
            if let Some(completion) = completion {
                self.reply_message(address, &Message::WriteCompletion(completion));
            }
        }

        self.transfers.lock().insert(handle, result);
        Ok(handle)
    }

    async fn poll(
        &self,
        handles: &[OpHandle],
        timeout: PollTimeout,
    ) -> Result<Vec<TransferCompletion>, TransportError> {
        let deadline = match timeout {
            PollTimeout::Immediate => None,
            PollTimeout::Wait(wait) => Some(Instant::now() + wait),
        };
        loop {
            self.check_polls()?;
            let ready = self.collect_transfers(handles);
            if !ready.is_empty() || deadline.is_none_or(|d| Instant::now() >= d) {
                return Ok(ready);
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::FlowDescription;
    use bytes::BytesMut;
    use pario_dist::DistributionSpec;
    use pario_request::{Request, RequestTree};
    use std::sync::Arc;

    pub(super) fn pull(
        segments: &[Segment],
    ) -> impl FnMut() -> Result<Option<Segment>, TransportError> + '_ {
        let mut iter = segments.iter().copied();
        move || Ok(iter.next())
    }

    fn request(tag: Tag, mode: IoMode, target_index: u32, length: u64) -> IoRequest {
        IoRequest {
            tag,
            object: 1,
            mode,
            target_index,
            target_count: 2,
            distribution: DistributionSpec::SimpleStripe { strip_size: 100 },
            file_request: RequestTree::contiguous(length).unwrap(),
            request_offset: 0,
            length,
        }
    }

    async fn next_reply(fabric: &LoopbackFabric, address: Address, tag: Tag) -> Message {
        let handle = fabric.post_receive(address, tag).unwrap();
        let done = Transport::poll(fabric, &[handle], PollTimeout::Wait(Duration::from_millis(50)))
            .await
            .unwrap();
        assert_eq!(done.len(), 1);
        let frame = done[0].result.clone().unwrap().unwrap();
        MsgPackCodec.decode(&frame).unwrap()
    }

    #[test]
    fn test_resolve() {
        let fabric = LoopbackFabric::new(2);
        assert_eq!(fabric.resolve(1).unwrap(), Address(1));
        assert_eq!(fabric.resolve(2), Err(TransportError::Unresolved(2)));
        fabric.inject(0, Fault::Unreachable);
        assert_eq!(fabric.resolve(0), Err(TransportError::Unresolved(0)));
        fabric.clear_faults();
        assert!(fabric.resolve(0).is_ok());
    }

    #[tokio::test]
    async fn test_read_ack_reports_datafile_size() {
        let fabric = LoopbackFabric::new(2);
        fabric.set_datafile(1, 1, vec![7; 40]);
        let frame = MsgPackCodec
            .encode(&Message::Request(request(5, IoMode::Read, 1, 300)))
            .unwrap();
        let send = fabric.post_send(Address(1), frame, 5).unwrap();
        let sent = Transport::poll(&fabric, &[send], PollTimeout::Immediate)
            .await
            .unwrap();
        assert_eq!(sent[0].result, Ok(None));

        match next_reply(&fabric, Address(1), 5).await {
            Message::Ack(ack) => {
                assert_eq!(ack.status, status::OK);
                assert_eq!(ack.datafile_size, 40);
            }
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_undecodable_request_gets_eproto() {
        let fabric = LoopbackFabric::new(1);
        fabric
            .post_send(Address(0), Bytes::from_static(b"junk"), 9)
            .unwrap();
        match next_reply(&fabric, Address(0), 9).await {
            Message::Ack(ack) => assert_eq!(ack.status, status::EPROTO),
            other => panic!("unexpected reply {other:?}"),
        }
    }

    fn flow_for(request: &IoRequest, datafile_size: u64, budget: SegmentBudget) -> FlowDescription {
        FlowDescription {
            file_request: Arc::new(request.file_request.clone()),
            memory_request: None,
            distribution: request.distribution.clone(),
            view: target_view(request, datafile_size),
            request_offset: request.request_offset,
            length: request.length,
            budget,
        }
    }

    #[tokio::test]
    async fn test_write_transfer_fills_datafile() {
        let fabric = LoopbackFabric::new(2);
        let write = request(3, IoMode::Write, 1, 250);
        let frame = MsgPackCodec.encode(&Message::Request(write.clone())).unwrap();
        fabric.post_send(Address(1), frame, 3).unwrap();
        let _ = next_reply(&fabric, Address(1), 3).await;

        // target 1 holds logical [100, 200)
        let buffer: SharedBuffer = Arc::new(Mutex::new(BytesMut::from(&[9u8; 250][..])));
        let descriptor = TransferDescriptor {
            tag: 3,
            source: Endpoint::Memory { buffer },
            destination: Endpoint::Target {
                address: Address(1),
                object: 1,
            },
            flow: flow_for(&write, 0, SegmentBudget::default()),
            bytes: 100,
        };
        let handle = fabric.post_transfer(descriptor).unwrap();
        let done = BulkTransfer::poll(&fabric, &[handle], PollTimeout::Immediate)
            .await
            .unwrap();
        assert_eq!(done[0].result, Ok(100));
        assert_eq!(fabric.datafile(1, 1).unwrap(), vec![9u8; 100]);

        match next_reply(&fabric, Address(1), 3).await {
            Message::WriteCompletion(done) => assert_eq!(done.bytes_written, 100),
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_small_batches_on_both_sides() {
        let fabric = LoopbackFabric::new(1).with_budget(SegmentBudget::new(1, 5));
        let write = IoRequest {
            tag: 4,
            object: 2,
            mode: IoMode::Write,
            target_index: 0,
            target_count: 1,
            distribution: DistributionSpec::SimpleStripe { strip_size: 64 },
            file_request: Request::hvector(40, 3, 7, &Request::byte()).unwrap().commit(),
            request_offset: 0,
            length: 120,
        };
        let frame = MsgPackCodec.encode(&Message::Request(write.clone())).unwrap();
        fabric.post_send(Address(0), frame, 4).unwrap();
        let _ = next_reply(&fabric, Address(0), 4).await;

        let data: Vec<u8> = (0..120).collect();
        let buffer: SharedBuffer = Arc::new(Mutex::new(BytesMut::from(&data[..])));
        let handle = fabric
            .post_transfer(TransferDescriptor {
                tag: 4,
                source: Endpoint::Memory { buffer },
                destination: Endpoint::Target {
                    address: Address(0),
                    object: 2,
                },
                flow: flow_for(&write, 0, SegmentBudget::new(2, 4)),
                bytes: 120,
            })
            .unwrap();
        let done = BulkTransfer::poll(&fabric, &[handle], PollTimeout::Immediate)
            .await
            .unwrap();
        assert_eq!(done[0].result, Ok(120));

        // block i of 3 bytes sits at 7 * i
        let datafile = fabric.datafile(0, 2).unwrap();
        assert_eq!(datafile.len(), 39 * 7 + 3);
        for block in 0..40usize {
            let expected: Vec<u8> = (block * 3..block * 3 + 3).map(|b| b as u8).collect();
            assert_eq!(&datafile[block * 7..block * 7 + 3], &expected[..]);
        }
    }

    #[tokio::test]
    async fn test_transfer_byte_mismatch_fails() {
        let fabric = LoopbackFabric::new(2);
        fabric.set_datafile(0, 1, vec![1; 100]);
        let read = request(6, IoMode::Read, 0, 200);
        let frame = MsgPackCodec.encode(&Message::Request(read.clone())).unwrap();
        fabric.post_send(Address(0), frame, 6).unwrap();
        let _ = next_reply(&fabric, Address(0), 6).await;

        // client believes the datafile is half as long as it is
        let buffer: SharedBuffer = Arc::new(Mutex::new(BytesMut::zeroed(200)));
        let handle = fabric
            .post_transfer(TransferDescriptor {
                tag: 6,
                source: Endpoint::Target {
                    address: Address(0),
                    object: 1,
                },
                destination: Endpoint::Memory { buffer },
                flow: flow_for(&read, 50, SegmentBudget::default()),
                bytes: 50,
            })
            .unwrap();
        let done = BulkTransfer::poll(&fabric, &[handle], PollTimeout::Immediate)
            .await
            .unwrap();
        assert!(matches!(done[0].result, Err(TransportError::Failed(_))));
    }

    #[tokio::test]
    async fn test_transfer_without_request_fails() {
        let fabric = LoopbackFabric::new(1);
        let buffer: SharedBuffer = Arc::new(Mutex::new(BytesMut::zeroed(10)));
        let handle = fabric
            .post_transfer(TransferDescriptor {
                tag: 77,
                source: Endpoint::Target {
                    address: Address(0),
                    object: 1,
                },
                destination: Endpoint::Memory { buffer },
                flow: flow_for(&request(77, IoMode::Read, 0, 10), 10, SegmentBudget::default()),
                bytes: 10,
            })
            .unwrap();
        let done = BulkTransfer::poll(&fabric, &[handle], PollTimeout::Immediate)
            .await
            .unwrap();
        assert!(matches!(done[0].result, Err(TransportError::Failed(_))));
    }

    #[tokio::test]
    async fn test_failed_polls() {
        let fabric = LoopbackFabric::new(1);
        fabric.fail_polls(true);
        let result = Transport::poll(&fabric, &[OpHandle(1)], PollTimeout::Immediate).await;
        assert!(matches!(result, Err(TransportError::Poll(_))));
    }

    #[test]
    fn test_pairs_split_on_both_sides() {
        let memory = [Segment::new(0, 30), Segment::new(50, 10)];
        let disk = [Segment::new(0, 10), Segment::new(100, 30)];
        let mut seen = Vec::new();
        let moved = for_each_pair(pull(&memory), pull(&disk), |m, d, len| {
            seen.push((m, d, len));
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec![(0, 0, 10), (10, 100, 20), (50, 120, 10)]);
        assert_eq!(moved, 40);
    }

    #[test]
    fn test_pairs_of_unequal_length_fail() {
        let memory = [Segment::new(0, 30)];
        let disk = [Segment::new(0, 10)];
        let result = for_each_pair(pull(&memory), pull(&disk), |_, _, _| Ok(()));
        assert!(matches!(result, Err(TransportError::Failed(_))));
    }
}
