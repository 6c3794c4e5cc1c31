// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Receive engine (§4.F) — matching against posted/unexpected queues,
// FIFO ordering per partner via early-arrival buffering, and fragment
// reassembly for medium messages. Kept free of the request-table type so
// it can be driven directly from tests; the progress loop (endpoint.rs)
// owns the actual posted/unexpected queues and the request table.

use std::collections::HashMap;

use crate::partner::{Partner, SEQNUM_MASK};
use crate::request::RequestId;

/// A message that arrived with no matching posted receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnexpectedMessage {
    pub match_info: u64,
    pub length: u32,
    pub data: Vec<u8>,
}

/// A posted receive's match criteria, exposed by the caller's request
/// table (§4.F "Matching"): `match_info & match_mask == match_value &
/// match_mask`.
pub struct PostedMatch {
    pub request: RequestId,
    pub match_value: u64,
    pub match_mask: u64,
    pub buffer_len: u32,
}

/// Find the first posted receive (oldest-first: `posted` is searched in
/// order) whose mask matches `match_info`.
pub fn find_match(posted: &[PostedMatch], match_info: u64) -> Option<usize> {
    posted
        .iter()
        .position(|p| (match_info & p.match_mask) == (p.match_value & p.match_mask))
}

/// Truncate (or not) an arriving payload against a posted buffer's
/// capacity (§4.F "Truncation"): excess bytes are dropped, never
/// written past `buffer_len`.
pub fn deliver_len(message_len: u32, buffer_len: u32) -> (u32, bool) {
    if message_len > buffer_len {
        (buffer_len, true)
    } else {
        (message_len, false)
    }
}

/// Whether `seqnum` is the partner's next in-order fragment. If not, the
/// caller must buffer it in `partner.early_arrivals` instead of matching
/// it immediately, to preserve per-partner FIFO delivery order (§4.F).
pub fn is_next_in_order(partner: &Partner, seqnum: u16) -> bool {
    seqnum == partner.next_match_recv_seq
}

/// Advance the partner's expected-seqnum cursor after delivering (or
/// queuing as unexpected) the in-order message at `seqnum`.
pub fn advance_match_cursor(partner: &mut Partner) {
    partner.next_match_recv_seq = partner.next_match_recv_seq.wrapping_add(1) & SEQNUM_MASK;
}

/// After advancing the cursor, drain any buffered early arrivals that are
/// now next-in-line, in seqnum order. Returns them in delivery order.
pub fn release_early_arrivals(partner: &mut Partner) -> Vec<(u16, RequestId)> {
    let mut released = Vec::new();
    loop {
        let next = partner.next_match_recv_seq;
        let pos = partner
            .early_arrivals
            .iter()
            .position(|(seq, _)| *seq == next);
        match pos {
            Some(i) => {
                let entry = partner.early_arrivals.remove(i).unwrap();
                advance_match_cursor(partner);
                released.push(entry);
            }
            None => break,
        }
    }
    released
}

/// Buffer an out-of-order fragment's request id until its predecessors
/// arrive (§4.F FIFO rule).
pub fn buffer_early_arrival(partner: &mut Partner, seqnum: u16, request: RequestId) {
    partner.early_arrivals.push_back((seqnum, request));
}

/// Accumulates medium-message fragments into one contiguous buffer, keyed
/// externally by (partner, lib_seqnum) — the partner's `partial_receives`
/// map records which [`RequestId`] (or unexpected-queue slot) a given
/// seqnum belongs to; this struct is the byte-level reassembly state for
/// one such in-flight message.
#[derive(Debug, Clone)]
pub struct Reassembly {
    buffer: Vec<u8>,
    received_mask: u32,
    frags_expected: u32,
    frag_max: u32,
}

impl Reassembly {
    pub fn new(total_length: u32, frags_expected: u32, frag_max: u32) -> Self {
        Reassembly {
            buffer: vec![0u8; total_length as usize],
            received_mask: 0,
            frags_expected,
            frag_max,
        }
    }

    /// Record one fragment's bytes at its slot. Returns `true` once every
    /// expected fragment has been received.
    pub fn accept(&mut self, frag_seqnum: u8, data: &[u8]) -> bool {
        let offset = frag_seqnum as usize * self.frag_max as usize;
        if offset < self.buffer.len() {
            let end = (offset + data.len()).min(self.buffer.len());
            self.buffer[offset..end].copy_from_slice(&data[..end - offset]);
        }
        self.received_mask |= 1 << frag_seqnum;
        self.is_complete()
    }

    pub fn is_complete(&self) -> bool {
        let mask = if self.frags_expected >= 32 {
            u32::MAX
        } else {
            (1u32 << self.frags_expected) - 1
        };
        self.received_mask & mask == mask
    }

    pub fn into_buffer(self) -> Vec<u8> {
        self.buffer
    }
}

/// Table of in-flight medium reassemblies, keyed by (partner, seqnum).
#[derive(Default)]
pub struct ReassemblyTable {
    inflight: HashMap<(crate::partner::PartnerKey, u16), Reassembly>,
}

impl ReassemblyTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(
        &mut self,
        key: crate::partner::PartnerKey,
        seqnum: u16,
        total_length: u32,
        frags_expected: u32,
        frag_max: u32,
    ) -> &mut Reassembly {
        self.inflight
            .entry((key, seqnum))
            .or_insert_with(|| Reassembly::new(total_length, frags_expected, frag_max))
    }

    /// Remove and return a completed reassembly, if present and done.
    pub fn take_if_complete(
        &mut self,
        key: crate::partner::PartnerKey,
        seqnum: u16,
    ) -> Option<Vec<u8>> {
        let complete = self
            .inflight
            .get(&(key, seqnum))
            .map(|r| r.is_complete())
            .unwrap_or(false);
        if complete {
            self.inflight.remove(&(key, seqnum)).map(|r| r.into_buffer())
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partner::{Partner, PartnerKey};

    #[test]
    fn match_picks_first_compatible_posted_receive() {
        let posted = vec![
            PostedMatch {
                request: RequestId(1),
                match_value: 0x10,
                match_mask: 0xff,
                buffer_len: 64,
            },
            PostedMatch {
                request: RequestId(2),
                match_value: 0x20,
                match_mask: 0xff,
                buffer_len: 64,
            },
        ];
        assert_eq!(find_match(&posted, 0x20), Some(1));
        assert_eq!(find_match(&posted, 0x30), None);
    }

    #[test]
    fn truncation_caps_at_buffer_len() {
        assert_eq!(deliver_len(100, 64), (64, true));
        assert_eq!(deliver_len(40, 64), (40, false));
    }

    #[test]
    fn fifo_buffers_then_releases_in_order() {
        let mut p = Partner::new(0, 0, 0);
        assert!(is_next_in_order(&p, 0));
        advance_match_cursor(&mut p); // consumed seq 0
        assert!(!is_next_in_order(&p, 2));
        buffer_early_arrival(&mut p, 2, RequestId(20));
        buffer_early_arrival(&mut p, 1, RequestId(10));
        // seq 1 is now next; releasing should drain 1 then 2.
        let released = release_early_arrivals(&mut p);
        assert_eq!(released, vec![(1, RequestId(10)), (2, RequestId(20))]);
        assert_eq!(p.next_match_recv_seq, 3);
    }

    #[test]
    fn reassembly_completes_after_all_fragments() {
        let mut r = Reassembly::new(10, 3, 4);
        assert!(!r.accept(0, &[1, 2, 3, 4]));
        assert!(!r.accept(2, &[9, 10]));
        assert!(r.accept(1, &[5, 6, 7, 8]));
        assert_eq!(r.into_buffer(), vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
    }

    #[test]
    fn reassembly_table_reports_complete_only_once_done() {
        let mut table = ReassemblyTable::new();
        let key = PartnerKey {
            peer_index: 0,
            endpoint_index: 0,
        };
        table.start(key, 5, 6, 2, 4);
        assert!(table.take_if_complete(key, 5).is_none());
        {
            let r = table.inflight.get_mut(&(key, 5)).unwrap();
            r.accept(0, &[1, 2, 3, 4]);
            r.accept(1, &[5, 6]);
        }
        assert_eq!(table.take_if_complete(key, 5), Some(vec![1, 2, 3, 4, 5, 6]));
        assert!(table.take_if_complete(key, 5).is_none());
    }
}
