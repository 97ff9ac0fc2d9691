//! Per-target operation state machine
//!
//! ```text
//! Initial -> AwaitingSend -> AwaitingAcknowledgment -> AwaitingTransfer -> Done
//!                                                            |
//!                                        (writes) AwaitingWriteCompletion -> Done
//! ```
//!
//! Any failure moves straight to `Done` with the error recorded.

use crate::protocol::{IoAck, Tag};
use crate::transport::{Address, OpHandle, TargetId, TransferDescriptor};
use crate::TargetError;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;
use tracing::{debug, warn};

/// Where one target's share of a call stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    Initial,
    AwaitingSend,
    AwaitingAcknowledgment,
    AwaitingTransfer,
    AwaitingWriteCompletion,
    Done,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Initial => "preparing",
            Self::AwaitingSend => "sending request",
            Self::AwaitingAcknowledgment => "awaiting acknowledgment",
            Self::AwaitingTransfer => "transferring data",
            Self::AwaitingWriteCompletion => "awaiting write completion",
            Self::Done => "done",
        })
    }
}

/// Coarse progress derived from [`Phase`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompletionMarker {
    Initial,
    AcknowledgmentReceived,
    Done,
}

/// Bookkeeping for one target during one call
#[derive(Debug, Clone)]
pub struct PerTargetOperation {
    /// Position of the target in the distribution
    pub target_index: u32,
    pub target: TargetId,
    pub address: Option<Address>,
    pub tag: Tag,
    /// Encoded request frame
    pub request: Option<Bytes>,
    pub ack: Option<IoAck>,
    pub transfer: Option<TransferDescriptor>,
    /// Outstanding transport or bulk handle
    pub handle: Option<OpHandle>,
    pub deadline: Option<Instant>,
    pub phase: Phase,
    pub error: Option<TargetError>,
    pub bytes_transferred: u64,
}

impl PerTargetOperation {
    pub fn new(target_index: u32, target: TargetId, tag: Tag) -> Self {
        Self {
            target_index,
            target,
            address: None,
            tag,
            request: None,
            ack: None,
            transfer: None,
            handle: None,
            deadline: None,
            phase: Phase::Initial,
            error: None,
            bytes_transferred: 0,
        }
    }

    pub fn marker(&self) -> CompletionMarker {
        match self.phase {
            Phase::Initial | Phase::AwaitingSend | Phase::AwaitingAcknowledgment => {
                CompletionMarker::Initial
            }
            Phase::AwaitingTransfer | Phase::AwaitingWriteCompletion => {
                CompletionMarker::AcknowledgmentReceived
            }
            Phase::Done => CompletionMarker::Done,
        }
    }

    pub fn is_done(&self) -> bool {
        self.phase == Phase::Done
    }

    pub fn is_success(&self) -> bool {
        self.is_done() && self.error.is_none()
    }

    /// Enter `phase` with `handle` outstanding until `deadline`
    pub fn advance(&mut self, phase: Phase, handle: OpHandle, deadline: Instant) {
        debug!(
            target_index = self.target_index,
            tag = self.tag,
            from = ?self.phase,
            to = ?phase,
            "target phase"
        );
        self.phase = phase;
        self.handle = Some(handle);
        self.deadline = Some(deadline);
    }

    /// Finish successfully with `bytes` moved
    pub fn complete(&mut self, bytes: u64) {
        debug!(target_index = self.target_index, tag = self.tag, bytes, "target done");
        self.bytes_transferred = bytes;
        self.phase = Phase::Done;
        self.handle = None;
        self.deadline = None;
    }

    /// Finish with `error`; later completions for the old handle are ignored
    pub fn fail(&mut self, error: TargetError) {
        warn!(
            target_index = self.target_index,
            tag = self.tag,
            phase = %self.phase,
            %error,
            "target failed"
        );
        self.error = Some(error);
        self.phase = Phase::Done;
        self.handle = None;
        self.deadline = None;
    }

    /// Fail with a timeout if the current phase has outlived its deadline
    pub fn expire(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if !self.is_done() && now >= deadline => {
                let phase = self.phase;
                self.fail(TargetError::Timeout { phase });
                true
            }
            _ => false,
        }
    }

    /// Handle this slot is waiting on, if it matches `handle`
    pub fn owns(&self, handle: OpHandle) -> bool {
        !self.is_done() && self.handle == Some(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_marker_follows_phase() {
        let mut op = PerTargetOperation::new(0, 10, 1);
        assert_eq!(op.marker(), CompletionMarker::Initial);
        let deadline = Instant::now() + Duration::from_secs(1);
        op.advance(Phase::AwaitingSend, OpHandle(1), deadline);
        assert_eq!(op.marker(), CompletionMarker::Initial);
        op.advance(Phase::AwaitingTransfer, OpHandle(2), deadline);
        assert_eq!(op.marker(), CompletionMarker::AcknowledgmentReceived);
        op.complete(100);
        assert_eq!(op.marker(), CompletionMarker::Done);
        assert!(op.is_success());
        assert_eq!(op.bytes_transferred, 100);
    }

    #[test]
    fn test_failure_releases_handle() {
        let mut op = PerTargetOperation::new(1, 11, 2);
        op.advance(
            Phase::AwaitingAcknowledgment,
            OpHandle(5),
            Instant::now() + Duration::from_secs(1),
        );
        assert!(op.owns(OpHandle(5)));
        op.fail(TargetError::Rejected { status: -5 });
        assert!(op.is_done());
        assert!(!op.is_success());
        assert!(!op.owns(OpHandle(5)));
    }

    #[test]
    fn test_expire_records_phase() {
        let mut op = PerTargetOperation::new(2, 12, 3);
        let now = Instant::now();
        op.advance(Phase::AwaitingAcknowledgment, OpHandle(7), now);
        assert!(op.expire(now + Duration::from_millis(1)));
        assert_eq!(
            op.error,
            Some(TargetError::Timeout {
                phase: Phase::AwaitingAcknowledgment
            })
        );
        // already done, nothing more to expire
        assert!(!op.expire(now + Duration::from_secs(5)));
    }

    #[test]
    fn test_phase_display() {
        let error = TargetError::Timeout {
            phase: Phase::AwaitingWriteCompletion,
        };
        assert_eq!(error.to_string(), "Timed out while awaiting write completion");
    }
}
