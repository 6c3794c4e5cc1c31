// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Partner table (§4.D) — per-remote-endpoint state, populated lazily.

use std::collections::{HashMap, VecDeque};

use crate::request::RequestId;

/// Whether a partner is known to share the local host (affects rendezvous
/// threshold via `shared_rndv_threshold`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Localization {
    Unknown,
    LocalShared,
    Remote,
}

/// Ack-scheduling state for one partner (§4.H): which list it is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NeedAck {
    None,
    Delayed,
    Immediate,
}

/// A 16-bit seqnum with a 6-bit session number folded into its high bits,
/// per the glossary. Arithmetic on the 10-bit counter portion is modular.
pub const SEQNUM_BITS: u32 = 10;
pub const SEQNUM_MASK: u16 = (1 << SEQNUM_BITS) - 1;
pub const SESSION_BITS: u32 = 6;

pub fn pack_seqnum(session: u8, counter: u16) -> u16 {
    ((session as u16 & 0x3f) << SEQNUM_BITS) | (counter & SEQNUM_MASK)
}

pub fn unpack_seqnum(seqnum: u16) -> (u8, u16) {
    ((seqnum >> SEQNUM_BITS) as u8 & 0x3f, seqnum & SEQNUM_MASK)
}

/// Modular "a - b" over the counter's bit width, sign-extended so callers
/// can test negativity (duplicate) vs a window bound (out-of-range).
pub fn seq_diff(a: u16, b: u16) -> i32 {
    let width = 1i32 << SEQNUM_BITS;
    let raw = (a as i32 & (width - 1)) - (b as i32 & (width - 1));
    if raw >= width / 2 {
        raw - width
    } else if raw < -width / 2 {
        raw + width
    } else {
        raw
    }
}

/// Per-(peer_index, endpoint_index) state (§3 Partner).
pub struct Partner {
    pub peer_index: u32,
    pub board_addr: u64, // 48-bit MAC, stored in the low bits
    pub endpoint_index: u8,

    pub true_session_id: u32,
    pub back_session_id: u32,

    pub next_send_seq: u16,
    pub next_acked_send_seq: u16,
    pub last_send_acknum: u32,
    pub last_recv_acknum: u32,

    pub next_match_recv_seq: u16,
    pub next_frag_recv_seq: u16,
    pub last_acked_recv_seq: u16,

    pub oldest_recv_time_not_acked: Option<std::time::Instant>,
    pub not_acked_count: u32,
    pub need_ack: NeedAck,

    pub throttling_sends_nr: u32,
    pub localization: Localization,

    /// FIFO of request ids sent but not yet acked (time-ordered by send).
    pub non_acked_sends: VecDeque<RequestId>,
    /// Pending connect requests toward this partner.
    pub connect_requests: VecDeque<RequestId>,
    /// Partial (fragment-reassembly) medium receives, keyed by seqnum.
    pub partial_receives: HashMap<u16, RequestId>,
    /// Messages that arrived with seqnum beyond `next_match_recv_seq`,
    /// buffered until their predecessors are matched (§4.F FIFO rule).
    pub early_arrivals: VecDeque<(u16, RequestId)>,
    /// Sends deferred because the partner lacks acked sequence headroom.
    pub throttled_sends: VecDeque<RequestId>,
}

impl Partner {
    pub fn new(peer_index: u32, board_addr: u64, endpoint_index: u8) -> Self {
        Partner {
            peer_index,
            board_addr,
            endpoint_index,
            true_session_id: 0,
            back_session_id: 0,
            next_send_seq: 0,
            next_acked_send_seq: 0,
            last_send_acknum: 0,
            last_recv_acknum: 0,
            next_match_recv_seq: 0,
            next_frag_recv_seq: 0,
            last_acked_recv_seq: 0,
            oldest_recv_time_not_acked: None,
            not_acked_count: 0,
            need_ack: NeedAck::None,
            throttling_sends_nr: 0,
            localization: Localization::Unknown,
            non_acked_sends: VecDeque::new(),
            connect_requests: VecDeque::new(),
            partial_receives: HashMap::new(),
            early_arrivals: VecDeque::new(),
            throttled_sends: VecDeque::new(),
        }
    }

    /// Consume the next send sequence number (§4.E "Sequence assignment").
    pub fn take_send_seq(&mut self) -> u16 {
        let seq = self.next_send_seq;
        self.next_send_seq = self.next_send_seq.wrapping_add(1) & SEQNUM_MASK;
        seq
    }

    pub fn check_invariants(&self) -> bool {
        seq_diff(self.next_send_seq, self.next_acked_send_seq) >= 0
            && seq_diff(self.next_frag_recv_seq, self.last_acked_recv_seq) >= 0
            && seq_diff(self.next_frag_recv_seq, self.next_match_recv_seq) >= 0
    }
}

/// Key for [`PartnerTable`]: a peer address index plus the remote endpoint
/// index at that peer (§4.D).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PartnerKey {
    pub peer_index: u32,
    pub endpoint_index: u8,
}

#[derive(Default)]
pub struct PartnerTable {
    partners: HashMap<PartnerKey, Partner>,
}

impl PartnerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(
        &mut self,
        key: PartnerKey,
        board_addr: u64,
    ) -> &mut Partner {
        self.partners
            .entry(key)
            .or_insert_with(|| Partner::new(key.peer_index, board_addr, key.endpoint_index))
    }

    pub fn get(&self, key: PartnerKey) -> Option<&Partner> {
        self.partners.get(&key)
    }

    pub fn get_mut(&mut self, key: PartnerKey) -> Option<&mut Partner> {
        self.partners.get_mut(&key)
    }

    pub fn remove(&mut self, key: PartnerKey) -> Option<Partner> {
        self.partners.remove(&key)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&PartnerKey, &mut Partner)> {
        self.partners.iter_mut()
    }

    pub fn keys(&self) -> impl Iterator<Item = &PartnerKey> {
        self.partners.keys()
    }
}
