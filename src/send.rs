// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Send engine (§4.E) — per-message-size strategy selection, sequence
// assignment, and the outgoing wire frames each strategy produces. The
// progress loop (endpoint.rs) owns actually handing these to the
// transport and driving retransmission; this module is the pure decision
// logic so it can be unit-tested without a transport.

use crate::ack::piggyack_for;
use crate::config::Config;
use crate::partner::Partner;
use crate::request::{Request, RequestKind, RequestState};
use crate::wire::{Body, DataBody, DataHeader, MediumFragBody, RendezvousBody};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Tiny,
    Small,
    Medium,
    Rendezvous,
}

/// Number of fragments `fragment_medium` would produce for `length` bytes
/// (§4.E "fragmented into ≤ 8 fragments each ≤ `MEDIUM_FRAG_LENGTH_MAX`").
fn medium_frag_count(length: u32, cfg: &Config) -> u32 {
    length.div_ceil(cfg.medium_frag_max.max(1))
}

/// Choose a strategy by total payload length (§4.E thresholds). A length
/// within `medium_max` that would still need more than `medium_frags_max`
/// fragments (e.g. `medium_max` raised, or `medium_frag_max` lowered, past
/// their matched defaults) falls back to Rendezvous instead of producing a
/// fragment count `frag_seqnum: u8`/the reassembly bitmask cannot represent.
pub fn choose_strategy(length: u32, cfg: &Config) -> Strategy {
    if length <= cfg.tiny_max {
        Strategy::Tiny
    } else if length <= cfg.small_max {
        Strategy::Small
    } else if length <= cfg.medium_max && medium_frag_count(length, cfg) <= cfg.medium_frags_max as u32 {
        Strategy::Medium
    } else {
        Strategy::Rendezvous
    }
}

/// One or more frames composing a single outbound message, plus whether the
/// request should be considered locally "done-early" (tiny/small: yes,
/// since the driver owns retransmission once posted) or must wait on
/// driver fragment-DONE events and an ack (medium) or a pull round-trip
/// (rendezvous).
pub struct ComposedSend {
    pub frames: Vec<Body>,
    pub frags_pending_nr: u32,
}

/// Build the outgoing frame(s) for `request` against `partner`, assigning
/// its sequence number and marking its lifecycle state (§4.E).
pub fn compose(
    request: &mut Request,
    partner: &mut Partner,
    dst_ep: u8,
    src_ep: u8,
    src_gen: u8,
    match_a: u32,
    match_b: u32,
    cfg: &Config,
) -> ComposedSend {
    let length = request.buffer.len() as u32;
    let strategy = choose_strategy(length, cfg);
    let seqnum = partner.take_send_seq();
    request.seqnum = seqnum;

    let header = DataHeader {
        dst_ep,
        src_ep,
        src_gen,
        length: length.min(u16::MAX as u32) as u16,
        lib_seqnum: seqnum,
        lib_piggyack: piggyack_for(partner),
        match_a,
        match_b,
        // Stamped with the session *the partner* assigned us at connect
        // time; incoming packets are validated against our own
        // `true_session_id` instead (see ack::apply_ack).
        session: partner.back_session_id,
    };

    request.state.set(RequestState::NEED_ACK);
    partner.non_acked_sends.push_back(request.id);

    match strategy {
        Strategy::Tiny => {
            request.kind = RequestKind::SendTiny;
            request.state.set(RequestState::DONE); // done-early (§4.E)
            ComposedSend {
                frames: vec![Body::Tiny(DataBody {
                    header,
                    data: request.buffer.clone(),
                })],
                frags_pending_nr: 0,
            }
        }
        Strategy::Small => {
            request.kind = RequestKind::SendSmall;
            request.state.set(RequestState::DONE);
            ComposedSend {
                frames: vec![Body::Small(DataBody {
                    header,
                    data: request.buffer.clone(),
                })],
                frags_pending_nr: 0,
            }
        }
        Strategy::Medium => {
            request.kind = RequestKind::SendMedium;
            let frames = fragment_medium(&request.buffer, header, cfg.medium_frag_max);
            let frags_pending_nr = frames.len() as u32;
            request.medium.frags_pending_nr = frags_pending_nr;
            // All fragments are copied into per-fragment buffers above, so
            // the application's buffer is reusable immediately (§4.E
            // "done-early"), same as tiny/small; only the wire-level ack
            // bookkeeping (NEED_ACK) still tracks peer-side receipt.
            request.state.set(RequestState::DONE);
            ComposedSend {
                frames: frames.into_iter().map(Body::MediumFrag).collect(),
                frags_pending_nr,
            }
        }
        Strategy::Rendezvous => {
            request.kind = RequestKind::SendLarge;
            request.state.set(RequestState::NEED_REPLY);
            let region_id = request
                .large
                .region_id
                .expect("rendezvous send requires a registered region");
            ComposedSend {
                frames: vec![Body::Rendezvous(RendezvousBody {
                    header,
                    msg_length: length,
                    rdma_id: region_id.min(u8::MAX as u32) as u8,
                    rdma_seqnum: 0,
                    rdma_offset: 0,
                })],
                frags_pending_nr: 0,
            }
        }
    }
}

fn fragment_medium(buffer: &[u8], header: DataHeader, frag_max: u32) -> Vec<MediumFragBody> {
    let frag_max = frag_max as usize;
    let mut out = Vec::new();
    let mut pipeline = 0u8;
    for (seqnum, chunk) in buffer.chunks(frag_max.max(1)).enumerate() {
        out.push(MediumFragBody {
            header: header.clone(),
            frag_length: chunk.len() as u16,
            frag_seqnum: seqnum as u8,
            frag_pipeline: pipeline,
            data: chunk.to_vec(),
        });
        pipeline = pipeline.wrapping_add(1);
    }
    out
}

/// Retransmission decision for one non-acked request (§4.E
/// "Retransmission"). `now` and `submit_time`/`last_send_time` are in the
/// same clock.
pub enum ResendDecision {
    NotDue,
    Resend,
    DisconnectPartner,
}

pub fn resend_decision(
    request: &Request,
    cfg: &Config,
    now: std::time::Instant,
) -> ResendDecision {
    if now.duration_since(request.submit_time).as_millis() as u64 > cfg.disconnect_timeout_ms {
        return ResendDecision::DisconnectPartner;
    }
    if request.resends >= cfg.resends_max {
        return ResendDecision::DisconnectPartner;
    }
    let last = request.last_send_time.unwrap_or(request.submit_time);
    if now.duration_since(last).as_millis() as u64 >= cfg.resend_delay_ms() {
        ResendDecision::Resend
    } else {
        ResendDecision::NotDue
    }
}

/// Whether a new send to `partner` must be throttled because it lacks
/// acked sequence-space headroom (§4.E "Throttling"). `window` is the
/// receive window advertised/assumed for the partner (sendq_entries acts
/// as the practical bound in this single-process model).
pub fn needs_throttle(partner: &Partner, window: u32) -> bool {
    let in_flight = crate::partner::seq_diff(partner.next_send_seq, partner.next_acked_send_seq);
    in_flight.max(0) as u32 >= window
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::RequestId;

    #[test]
    fn strategy_thresholds() {
        let cfg = Config::default();
        assert_eq!(choose_strategy(0, &cfg), Strategy::Tiny);
        assert_eq!(choose_strategy(cfg.tiny_max, &cfg), Strategy::Tiny);
        assert_eq!(choose_strategy(cfg.tiny_max + 1, &cfg), Strategy::Small);
        assert_eq!(choose_strategy(cfg.small_max + 1, &cfg), Strategy::Medium);
        assert_eq!(choose_strategy(cfg.medium_max + 1, &cfg), Strategy::Rendezvous);
    }

    #[test]
    fn tiny_send_is_done_early_with_one_frame() {
        let cfg = Config::default();
        let mut partner = Partner::new(0, 0, 0);
        let mut req = Request::new(RequestId(1), RequestKind::SendTiny);
        req.buffer = b"hello\0".to_vec();
        let composed = compose(&mut req, &mut partner, 0, 0, 0, 0x1234, 0x5678, &cfg);
        assert_eq!(composed.frames.len(), 1);
        assert!(req.state.has(RequestState::DONE));
        assert_eq!(partner.non_acked_sends.len(), 1);
    }

    #[test]
    fn medium_send_fragments_and_tracks_pending() {
        let cfg = Config::default();
        let mut partner = Partner::new(0, 0, 0);
        let mut req = Request::new(RequestId(1), RequestKind::SendMedium);
        req.buffer = vec![0xAB; 13_274];
        let composed = compose(&mut req, &mut partner, 0, 0, 0, 0, 0, &cfg);
        let expected_frags = (13_274u32).div_ceil(cfg.medium_frag_max);
        assert_eq!(composed.frames.len(), expected_frags as usize);
        assert_eq!(composed.frags_pending_nr, expected_frags);
        // reassembly check
        let mut reassembled = Vec::new();
        for f in &composed.frames {
            if let Body::MediumFrag(m) = f {
                reassembled.extend_from_slice(&m.data);
            }
        }
        assert_eq!(reassembled, req.buffer);
    }

    #[test]
    fn resend_disconnects_after_max_resends() {
        let cfg = Config::default();
        let mut req = Request::new(RequestId(1), RequestKind::SendTiny);
        req.resends = cfg.resends_max;
        let decision = resend_decision(&req, &cfg, std::time::Instant::now());
        assert!(matches!(decision, ResendDecision::DisconnectPartner));
    }
}
