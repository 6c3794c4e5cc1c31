// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Ack/nack scheduler (§4.H).

use std::collections::VecDeque;
use std::time::Instant;

use crate::config::Config;
use crate::partner::{NeedAck, Partner, PartnerKey};

/// A `liback` to emit: one per partner that needs acking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibAck {
    pub partner: PartnerKey,
    pub next_frag_recv_seq: u16,
    pub acknum: u32,
}

/// Feed one accepted inbound fragment into the ack scheduler. Moves the
/// partner onto the immediate list once `not_acked_max` is reached,
/// otherwise onto the delayed list timestamped at first entry.
pub fn on_fragment_accepted(partner: &mut Partner, cfg: &Config, now: Instant) {
    partner.not_acked_count += 1;
    if partner.oldest_recv_time_not_acked.is_none() {
        partner.oldest_recv_time_not_acked = Some(now);
    }
    if partner.not_acked_count >= cfg.not_acked_max as u32 {
        partner.need_ack = NeedAck::Immediate;
    } else if partner.need_ack == NeedAck::None {
        partner.need_ack = NeedAck::Delayed;
    }
}

/// Scan the partner table, draining the immediate list first, then the
/// delayed list if its oldest timestamp has aged past `ack_delay_jiffies`
/// (§4.I progress loop step 5).
pub fn due_acks<'a>(
    partners: impl Iterator<Item = (&'a PartnerKey, &'a mut Partner)>,
    cfg: &Config,
    now: Instant,
) -> Vec<LibAck> {
    // Two passes so immediate partners are always drained first, matching
    // "The progress loop drains the immediate list first".
    let mut immediate = Vec::new();
    let mut delayed = Vec::new();

    for (key, partner) in partners {
        let key = *key;
        match partner.need_ack {
            NeedAck::Immediate => immediate.push((key, partner)),
            NeedAck::Delayed => {
                let due = partner
                    .oldest_recv_time_not_acked
                    .map(|t| now.duration_since(t).as_millis() as u64 >= cfg.ack_delay_ms())
                    .unwrap_or(false);
                if due {
                    delayed.push((key, partner));
                }
            }
            NeedAck::None => {}
        }
    }

    let mut out = Vec::with_capacity(immediate.len() + delayed.len());
    for (key, partner) in immediate.into_iter().chain(delayed) {
        partner.last_send_acknum += 1;
        out.push(LibAck {
            partner: key,
            next_frag_recv_seq: partner.next_frag_recv_seq,
            acknum: partner.last_send_acknum,
        });
        partner.need_ack = NeedAck::None;
        partner.not_acked_count = 0;
        partner.oldest_recv_time_not_acked = None;
        partner.last_acked_recv_seq = partner.next_frag_recv_seq.wrapping_sub(1);
    }
    out
}

/// Apply an incoming `liback` (or an incoming piggyack, which follows the
/// identical sweep — Open Question (b)). `seqnum_of` maps a queued request
/// id to its send seqnum, exactly like [`drain_acked_with`], so only
/// entries with `send_seqnum < ack_before` are released (spec.md §4.H:
/// "mark every non-acked request with `send_seqnum < ack_before` as
/// acked") — never the whole queue regardless of `ack_before`. Returns the
/// now-acked sends, to be released by the caller.
///
/// Idempotent per §8 invariant #5: a duplicate (`acknum <=
/// last_recv_acknum`) changes no state and returns nothing.
pub fn apply_ack(
    partner: &mut Partner,
    ack_before: u16,
    acknum: u32,
    session: u32,
    seqnum_of: impl Fn(crate::request::RequestId) -> u16,
) -> Vec<crate::request::RequestId> {
    if acknum != 0 && acknum <= partner.last_recv_acknum {
        return Vec::new();
    }
    if session != 0 && session != partner.true_session_id {
        return Vec::new();
    }
    if acknum != 0 {
        partner.last_recv_acknum = acknum;
    }
    if crate::partner::seq_diff(ack_before, partner.next_acked_send_seq) <= 0 {
        return Vec::new();
    }
    partner.next_acked_send_seq = ack_before;
    drain_acked_with(&mut partner.non_acked_sends, ack_before, seqnum_of)
}

/// Same windowed release as [`apply_ack`], split out so callers already
/// holding a `seqnum_of` closure (and no acknum/session to validate, as
/// with piggybacked acks) can drive the queue directly.
pub fn drain_acked_with(
    queue: &mut VecDeque<crate::request::RequestId>,
    ack_before: u16,
    seqnum_of: impl Fn(crate::request::RequestId) -> u16,
) -> Vec<crate::request::RequestId> {
    let mut released = Vec::new();
    while let Some(&front) = queue.front() {
        if crate::partner::seq_diff(seqnum_of(front), ack_before) < 0 {
            queue.pop_front();
            released.push(front);
        } else {
            break;
        }
    }
    released
}

/// Compute the `piggyack` value for an outgoing data packet (§4.H).
pub fn piggyack_for(partner: &Partner) -> u16 {
    partner.next_frag_recv_seq.wrapping_sub(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partner::Partner;

    fn seqnums_1_at_3_2_at_9(id: crate::request::RequestId) -> u16 {
        match id.0 {
            1 => 3,
            2 => 9,
            _ => u16::MAX,
        }
    }

    #[test]
    fn duplicate_liback_is_idempotent() {
        let mut p = Partner::new(0, 0, 0);
        p.last_recv_acknum = 10;
        p.non_acked_sends.push_back(crate::request::RequestId(1));
        let before = p.next_acked_send_seq;
        let released = apply_ack(&mut p, 5, 10, 0, seqnums_1_at_3_2_at_9);
        assert!(released.is_empty());
        assert_eq!(p.next_acked_send_seq, before);
        assert_eq!(p.non_acked_sends.len(), 1);
    }

    #[test]
    fn fresh_ack_releases_only_seqnums_below_ack_before() {
        let mut p = Partner::new(0, 0, 0);
        p.non_acked_sends.push_back(crate::request::RequestId(1));
        p.non_acked_sends.push_back(crate::request::RequestId(2));
        let released = apply_ack(&mut p, 5, 11, 0, seqnums_1_at_3_2_at_9);
        assert_eq!(released, vec![crate::request::RequestId(1)]);
        assert_eq!(p.last_recv_acknum, 11);
        assert_eq!(p.next_acked_send_seq, 5);
        assert_eq!(p.non_acked_sends.len(), 1);
    }

    #[test]
    fn not_acked_threshold_promotes_to_immediate() {
        let cfg = Config::default();
        let mut p = Partner::new(0, 0, 0);
        let now = Instant::now();
        for _ in 0..cfg.not_acked_max {
            on_fragment_accepted(&mut p, &cfg, now);
        }
        assert_eq!(p.need_ack, NeedAck::Immediate);
    }

    #[test]
    fn drain_acked_with_respects_seqnum_window() {
        let mut queue = VecDeque::new();
        queue.push_back(crate::request::RequestId(1));
        queue.push_back(crate::request::RequestId(2));
        let seqnums = [(crate::request::RequestId(1), 3u16), (crate::request::RequestId(2), 9u16)];
        let seqnum_of = |id: crate::request::RequestId| {
            seqnums.iter().find(|(i, _)| *i == id).unwrap().1
        };
        let released = drain_acked_with(&mut queue, 5, seqnum_of);
        assert_eq!(released, vec![crate::request::RequestId(1)]);
        assert_eq!(queue.len(), 1);
    }
}
