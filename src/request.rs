// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Request record (§3) — a polymorphic record tagged by kind, with a
// bitset of lifecycle flags. The flag bitset mirrors the bit-flag style the
// teacher uses for `RingSlot::size` (`SIZE_LAST`/`SIZE_STORAGE`/`SIZE_MASK`
// packed into one u32): plain associated `const` masks on a `u32`, not an
// external bitflags dependency.

use crate::error::Status;
use crate::partner::PartnerKey;

/// Opaque handle into an endpoint's request table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub u32);

/// Request state flags (§3), packed into one word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RequestState(u32);

impl RequestState {
    pub const NEED_ACK: u32 = 1 << 0;
    pub const NEED_REPLY: u32 = 1 << 1;
    pub const QUEUED: u32 = 1 << 2;
    pub const IN_DRIVER: u32 = 1 << 3;
    pub const REQUEUED: u32 = 1 << 4;
    pub const ZOMBIE: u32 = 1 << 5;
    pub const DONE: u32 = 1 << 6;
    pub const INTERNAL: u32 = 1 << 7;
    pub const MATCHED: u32 = 1 << 8;
    pub const RECV_PARTIAL: u32 = 1 << 9;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn set(&mut self, bit: u32) {
        self.0 |= bit;
    }

    pub fn clear(&mut self, bit: u32) {
        self.0 &= !bit;
    }

    pub fn has(&self, bit: u32) -> bool {
        self.0 & bit != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestKind {
    SendTiny,
    SendSmall,
    SendMedium,
    SendLarge,
    Recv,
    RecvLarge,
    Connect,
}

/// Completion status/statistics recorded at `done`.
#[derive(Debug, Clone, Default)]
pub struct Outcome {
    pub match_info: u64,
    pub msg_length: u32,
    pub xfer_length: u32,
    pub context: u64,
    pub status: Option<Status>,
}

/// Extra bookkeeping for fragmented medium sends.
#[derive(Debug, Clone, Default)]
pub struct MediumSendState {
    pub sendq_slots: Vec<u32>,
    pub frags_pending_nr: u32,
}

/// Extra bookkeeping for rendezvous sends and large receives.
#[derive(Debug, Clone, Default)]
pub struct LargeTransferState {
    pub region_id: Option<u32>,
    pub peer_rdma_id: u32,
    pub peer_rdma_offset: u32,
    pub pull_handle_id: Option<u32>,
}

/// A single in-flight application request.
pub struct Request {
    pub id: RequestId,
    pub kind: RequestKind,
    pub state: RequestState,
    pub outcome: Outcome,
    pub seqnum: u16,
    pub submit_time: std::time::Instant,
    pub last_send_time: Option<std::time::Instant>,
    pub resends: u32,
    pub partner: Option<PartnerKey>,
    pub match_mask: u64,
    pub buffer: Vec<u8>,
    pub medium: MediumSendState,
    pub large: LargeTransferState,
    /// Already-encoded outbound frames for this send, kept verbatim so a
    /// retransmission replays the exact bytes (same seqnum) rather than
    /// re-running strategy selection.
    pub pending_wire_frames: Vec<Vec<u8>>,
}

impl Request {
    pub fn new(id: RequestId, kind: RequestKind) -> Self {
        Request {
            id,
            kind,
            state: RequestState::new(),
            outcome: Outcome::default(),
            seqnum: 0,
            submit_time: std::time::Instant::now(),
            last_send_time: None,
            resends: 0,
            partner: None,
            match_mask: u64::MAX,
            buffer: Vec::new(),
            medium: MediumSendState::default(),
            large: LargeTransferState::default(),
            pending_wire_frames: Vec::new(),
        }
    }

    pub fn finish(&mut self, status: Status) {
        self.outcome.status = Some(status);
        self.state.set(RequestState::DONE);
    }

    pub fn is_done(&self) -> bool {
        self.state.has(RequestState::DONE)
    }

    /// `cancel()` succeeds only for unmatched receives and unsent connects
    /// (§5 Cancellation).
    pub fn cancellable(&self) -> bool {
        match self.kind {
            RequestKind::Recv | RequestKind::RecvLarge => !self.state.has(RequestState::MATCHED),
            RequestKind::Connect => !self.state.has(RequestState::IN_DRIVER),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_bits_set_clear_independent() {
        let mut s = RequestState::new();
        s.set(RequestState::NEED_ACK);
        s.set(RequestState::MATCHED);
        assert!(s.has(RequestState::NEED_ACK));
        assert!(s.has(RequestState::MATCHED));
        s.clear(RequestState::NEED_ACK);
        assert!(!s.has(RequestState::NEED_ACK));
        assert!(s.has(RequestState::MATCHED));
    }

    #[test]
    fn cancellable_rules() {
        let mut recv = Request::new(RequestId(1), RequestKind::Recv);
        assert!(recv.cancellable());
        recv.state.set(RequestState::MATCHED);
        assert!(!recv.cancellable());

        let send = Request::new(RequestId(2), RequestKind::SendTiny);
        assert!(!send.cancellable());

        let mut connect = Request::new(RequestId(3), RequestKind::Connect);
        assert!(connect.cancellable());
        connect.state.set(RequestState::IN_DRIVER);
        assert!(!connect.cancellable());
    }
}
