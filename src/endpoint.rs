// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Endpoint (§4.I progress loop, §5 public surface) — the component that
// ties the wire codec, partner table, send/recv engines, pull engine and
// ack scheduler together into the request-based API applications use.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use crate::ack;
use crate::config::Config;
use crate::error::{Error, Status};
use crate::event_ring::{EventRing, NotifyOutcome};
use crate::partner::{PartnerKey, PartnerTable};
use crate::pull::{self, PullHandle, PullHandleTable, PullReplyAction};
use crate::recv;
use crate::region::RegionTable;
use crate::request::{Request, RequestId, RequestKind, RequestState};
use crate::send;
use crate::transport::Transport;
use crate::wire;

/// Outcome of [`Endpoint::wait`] (§6 "wait-event" control op).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    Event,
    Timeout,
    Wakeup,
}

/// A message that arrived with no matching posted receive (§4.F).
struct UnexpectedEntry {
    partner: PartnerKey,
    match_info: u64,
    data: Vec<u8>,
    rendezvous: Option<RendezvousMeta>,
}

#[derive(Clone, Copy)]
struct RendezvousMeta {
    total_length: u32,
    peer_rdma_id: u32,
    peer_rdma_offset: u32,
    dst_ep: u8,
    src_ep: u8,
}

/// An inbound message buffered because it arrived ahead of its
/// predecessors in the partner's FIFO order (§4.F).
struct PendingInbound {
    partner: PartnerKey,
    match_info: u64,
    data: Vec<u8>,
    rendezvous: Option<RendezvousMeta>,
}

/// A matched-messaging endpoint bound to one [`Transport`].
pub struct Endpoint<T: Transport> {
    cfg: Config,
    transport: T,
    endpoint_index: u8,
    session_counter: u32,

    partners: PartnerTable,
    regions: RegionTable,
    pulls: PullHandleTable,
    reassembly: recv::ReassemblyTable,

    requests: HashMap<RequestId, Request>,
    next_request_id: u32,

    posted_recvs: VecDeque<RequestId>,
    unexpected: VecDeque<UnexpectedEntry>,
    pending_inbound: HashMap<RequestId, PendingInbound>,

    completion_ring: EventRing<RequestId>,
    ring_cursor: u32,
    frame_buf: Vec<u8>,
}

impl<T: Transport> Endpoint<T> {
    pub fn open(cfg: Config, transport: T, endpoint_index: u8) -> Self {
        let ring_capacity = cfg.recvq_entries.max(cfg.sendq_entries).max(1);
        Endpoint {
            session_counter: 0,
            partners: PartnerTable::new(),
            regions: RegionTable::new(cfg.user_region_max),
            pulls: PullHandleTable::new(),
            reassembly: recv::ReassemblyTable::new(),
            requests: HashMap::new(),
            next_request_id: 1,
            posted_recvs: VecDeque::new(),
            unexpected: VecDeque::new(),
            pending_inbound: HashMap::new(),
            completion_ring: EventRing::new(ring_capacity),
            ring_cursor: 0,
            frame_buf: Vec::new(),
            cfg,
            transport,
            endpoint_index,
        }
    }

    fn alloc_request_id(&mut self) -> RequestId {
        let id = RequestId(self.next_request_id);
        self.next_request_id += 1;
        id
    }

    fn partner_key(peer_index: u16) -> PartnerKey {
        PartnerKey {
            peer_index: peer_index as u32,
            endpoint_index: 0,
        }
    }

    fn send_frame(&mut self, peer_index: u16, body: wire::Body) -> Result<(), Error> {
        let local_peer_index = self.transport.local_board().peer_index;
        let frame = wire::Frame {
            dst_src_peer_index: local_peer_index,
            body,
        };
        wire::encode(&frame, &mut self.frame_buf);
        self.transport.send(peer_index, &self.frame_buf)
    }

    fn post_completion(&mut self, id: RequestId) {
        if matches!(self.completion_ring.notify(id), NotifyOutcome::Busy) {
            log::warn!("completion ring full, request {} completion delayed", id.0);
        }
    }

    // ---- Connection setup (§4.D) -----------------------------------

    pub fn connect(&mut self, peer_index: u16) -> Result<RequestId, Error> {
        let key = Self::partner_key(peer_index);
        self.session_counter = self.session_counter.wrapping_add(1);
        let assigned = self.session_counter;
        {
            let partner = self.partners.get_or_create(key, 0);
            partner.true_session_id = assigned;
        }
        let id = self.alloc_request_id();
        let mut req = Request::new(id, RequestKind::Connect);
        req.partner = Some(key);
        self.partners.get_mut(key).unwrap().connect_requests.push_back(id);

        let body = wire::ConnectBody {
            dst_ep: 0,
            src_ep: self.endpoint_index,
            src_gen: 0,
            length: 4,
            lib_seqnum: 0,
            dest_peer_index: peer_index,
            src_mac_low32: self.transport.local_board().board_addr as u32,
            data: assigned.to_le_bytes().to_vec(),
        };
        self.send_frame(peer_index, wire::Body::Connect(body))?;
        self.requests.insert(id, req);
        Ok(id)
    }

    fn handle_connect(&mut self, peer_index: u16, b: wire::ConnectBody) {
        let key = Self::partner_key(peer_index);
        let remote_session = decode_session(&b.data);
        if b.lib_seqnum == 0 {
            self.session_counter = self.session_counter.wrapping_add(1);
            let assigned = self.session_counter;
            {
                let partner = self.partners.get_or_create(key, b.src_mac_low32 as u64);
                partner.true_session_id = assigned;
                partner.back_session_id = remote_session;
            }
            let reply = wire::ConnectBody {
                dst_ep: b.src_ep,
                src_ep: self.endpoint_index,
                src_gen: 0,
                length: 4,
                lib_seqnum: 1,
                dest_peer_index: peer_index,
                src_mac_low32: self.transport.local_board().board_addr as u32,
                data: assigned.to_le_bytes().to_vec(),
            };
            let _ = self.send_frame(peer_index, wire::Body::Connect(reply));
        } else if let Some(partner) = self.partners.get_mut(key) {
            partner.back_session_id = remote_session;
            if let Some(req_id) = partner.connect_requests.pop_front() {
                if let Some(req) = self.requests.get_mut(&req_id) {
                    req.finish(Status::Success);
                }
                self.post_completion(req_id);
            }
        }
    }

    // ---- Send path (§4.E) ------------------------------------------

    pub fn isend(
        &mut self,
        peer_index: u16,
        data: Vec<u8>,
        match_a: u32,
        match_b: u32,
        context: u64,
    ) -> Result<RequestId, Error> {
        let key = Self::partner_key(peer_index);
        let id = self.alloc_request_id();
        let mut req = Request::new(id, RequestKind::SendTiny);
        req.partner = Some(key);
        req.outcome.context = context;
        req.buffer = data;

        let strategy = send::choose_strategy(req.buffer.len() as u32, &self.cfg);
        if strategy == send::Strategy::Rendezvous {
            let region_id = self.regions.register(req.buffer.len() as u32)?;
            let handle = self.regions.acquire(region_id)?;
            handle.fill_pages_from_frame(0, &req.buffer)?;
            req.large.region_id = Some(region_id);
        }

        let src_ep = self.endpoint_index;
        let partner = self.partners.get_or_create(key, 0);
        let composed = send::compose(&mut req, partner, 0, src_ep, 0, match_a, match_b, &self.cfg);

        for frame in composed.frames {
            let mut buf = Vec::new();
            wire::encode(
                &wire::Frame {
                    dst_src_peer_index: self.transport.local_board().peer_index,
                    body: frame,
                },
                &mut buf,
            );
            self.transport.send(peer_index, &buf)?;
            req.pending_wire_frames.push(buf);
        }

        self.requests.insert(id, req);
        Ok(id)
    }

    fn drain_due_acks(&mut self, now: Instant) {
        let due = ack::due_acks(self.partners.iter_mut(), &self.cfg, now);
        for a in due {
            let session = self
                .partners
                .get(a.partner)
                .map(|p| p.back_session_id)
                .unwrap_or(0);
            let mut data = Vec::with_capacity(6);
            data.extend_from_slice(&a.next_frag_recv_seq.to_le_bytes());
            data.extend_from_slice(&a.acknum.to_le_bytes());
            let body = wire::TrucBody {
                dst_ep: 0,
                src_ep: self.endpoint_index,
                src_gen: 0,
                length: data.len() as u8,
                session,
                data,
            };
            let peer_index = a.partner.peer_index as u16;
            let _ = self.send_frame(peer_index, wire::Body::Truc(body));
        }
    }

    fn drain_resends(&mut self, now: Instant) {
        let keys: Vec<PartnerKey> = self.partners.keys().copied().collect();
        for key in keys {
            let peer_index = key.peer_index as u16;
            let req_ids: Vec<RequestId> = self
                .partners
                .get(key)
                .map(|p| p.non_acked_sends.iter().copied().collect())
                .unwrap_or_default();
            for req_id in req_ids {
                let decision = match self.requests.get(&req_id) {
                    Some(req) if req.state.has(RequestState::NEED_ACK) => {
                        send::resend_decision(req, &self.cfg, now)
                    }
                    _ => continue,
                };
                match decision {
                    send::ResendDecision::NotDue => {}
                    send::ResendDecision::Resend => {
                        if let Some(req) = self.requests.get_mut(&req_id) {
                            req.resends += 1;
                            req.last_send_time = Some(now);
                            let frames = req.pending_wire_frames.clone();
                            for f in frames {
                                let _ = self.transport.send(peer_index, &f);
                            }
                        }
                    }
                    send::ResendDecision::DisconnectPartner => {
                        if let Some(req) = self.requests.get_mut(&req_id) {
                            req.finish(Status::Disconnected(Error::NoDriver));
                        }
                        self.post_completion(req_id);
                    }
                }
            }
        }
    }

    // ---- Receive path (§4.F) ----------------------------------------

    pub fn irecv(&mut self, buffer_len: u32, match_value: u64, match_mask: u64, context: u64) -> RequestId {
        let id = self.alloc_request_id();
        let mut req = Request::new(id, RequestKind::Recv);
        req.buffer = vec![0u8; buffer_len as usize];
        req.match_mask = match_mask;
        req.outcome.match_info = match_value;
        req.outcome.context = context;

        if let Some(pos) = self
            .unexpected
            .iter()
            .position(|u| (u.match_info & match_mask) == (match_value & match_mask))
        {
            let entry = self.unexpected.remove(pos).unwrap();
            self.requests.insert(id, req);
            if let Some(meta) = entry.rendezvous {
                let _ = self.start_pull(
                    id,
                    entry.partner,
                    meta.total_length,
                    meta.peer_rdma_id,
                    meta.peer_rdma_offset,
                );
            } else {
                self.complete_matched(id, entry.match_info, entry.data);
            }
            return id;
        }

        self.requests.insert(id, req);
        self.posted_recvs.push_back(id);
        id
    }

    /// Peek at (without consuming) the oldest unexpected message matching
    /// `match_value`/`match_mask` (§6 "probe").
    pub fn probe(&self, match_value: u64, match_mask: u64) -> Option<u64> {
        self.unexpected
            .iter()
            .find(|u| (u.match_info & match_mask) == (match_value & match_mask))
            .map(|u| u.match_info)
    }

    fn complete_matched(&mut self, req_id: RequestId, match_info: u64, data: Vec<u8>) {
        let buffer_len = self.requests.get(&req_id).map(|r| r.buffer.len() as u32).unwrap_or(0);
        let (deliver_len, truncated) = recv::deliver_len(data.len() as u32, buffer_len);
        if let Some(req) = self.requests.get_mut(&req_id) {
            req.buffer[..deliver_len as usize].copy_from_slice(&data[..deliver_len as usize]);
            req.outcome.match_info = match_info;
            req.outcome.msg_length = data.len() as u32;
            req.outcome.xfer_length = deliver_len;
            req.state.set(RequestState::MATCHED);
            req.finish(if truncated { Status::Truncated } else { Status::Success });
        }
        self.post_completion(req_id);
    }

    fn deliver_one(&mut self, key: PartnerKey, match_info: u64, data: Vec<u8>) {
        let posted = self.posted_matches();
        match recv::find_match(&posted, match_info) {
            Some(idx) => {
                let req_id = posted[idx].request;
                self.posted_recvs.retain(|id| *id != req_id);
                self.complete_matched(req_id, match_info, data);
            }
            None => {
                self.unexpected.push_back(UnexpectedEntry {
                    partner: key,
                    match_info,
                    data,
                    rendezvous: None,
                });
            }
        }
    }

    fn posted_matches(&self) -> Vec<recv::PostedMatch> {
        self.posted_recvs
            .iter()
            .filter_map(|id| {
                self.requests.get(id).map(|r| recv::PostedMatch {
                    request: *id,
                    match_value: r.outcome.match_info,
                    match_mask: r.match_mask,
                    buffer_len: r.buffer.len() as u32,
                })
            })
            .collect()
    }

    fn deliver_rendezvous(
        &mut self,
        key: PartnerKey,
        match_info: u64,
        total_length: u32,
        peer_rdma_id: u32,
        peer_rdma_offset: u32,
        dst_ep: u8,
        src_ep: u8,
    ) {
        let posted = self.posted_matches();
        match recv::find_match(&posted, match_info) {
            Some(idx) => {
                let req_id = posted[idx].request;
                self.posted_recvs.retain(|id| *id != req_id);
                let _ = self.start_pull(req_id, key, total_length, peer_rdma_id, peer_rdma_offset);
            }
            None => {
                self.unexpected.push_back(UnexpectedEntry {
                    partner: key,
                    match_info,
                    data: Vec::new(),
                    rendezvous: Some(RendezvousMeta {
                        total_length,
                        peer_rdma_id,
                        peer_rdma_offset,
                        dst_ep,
                        src_ep,
                    }),
                });
            }
        }
    }

    fn apply_piggyack(&mut self, key: PartnerKey, ack_before: u16) {
        let requests = &self.requests;
        let released = match self.partners.get_mut(key) {
            Some(partner) => {
                if crate::partner::seq_diff(ack_before, partner.next_acked_send_seq) <= 0 {
                    Vec::new()
                } else {
                    partner.next_acked_send_seq = ack_before;
                    ack::drain_acked_with(&mut partner.non_acked_sends, ack_before, |id| {
                        requests.get(&id).map(|r| r.seqnum).unwrap_or(0)
                    })
                }
            }
            None => Vec::new(),
        };
        for id in released {
            if let Some(req) = self.requests.get_mut(&id) {
                req.state.clear(RequestState::NEED_ACK);
            }
        }
    }

    fn handle_liback(&mut self, key: PartnerKey, b: wire::TrucBody) {
        if b.data.len() < 6 {
            return;
        }
        let next_frag_recv_seq = u16::from_le_bytes([b.data[0], b.data[1]]);
        let acknum = u32::from_le_bytes(b.data[2..6].try_into().unwrap());
        let requests = &self.requests;
        let released = match self.partners.get_mut(key) {
            Some(partner) => ack::apply_ack(partner, next_frag_recv_seq, acknum, b.session, |id| {
                requests.get(&id).map(|r| r.seqnum).unwrap_or(0)
            }),
            None => Vec::new(),
        };
        for id in released {
            if let Some(req) = self.requests.get_mut(&id) {
                req.state.clear(RequestState::NEED_ACK);
            }
        }
    }

    fn handle_data(&mut self, key: PartnerKey, header: wire::DataHeader, data: Vec<u8>, now: Instant) {
        self.apply_piggyack(key, header.lib_piggyack.wrapping_add(1));
        self.sequence_and_deliver(key, header.lib_seqnum, header.match_a, header.match_b, data, now);
    }

    fn sequence_and_deliver(
        &mut self,
        key: PartnerKey,
        seqnum: u16,
        match_a: u32,
        match_b: u32,
        data: Vec<u8>,
        now: Instant,
    ) {
        let match_info = ((match_a as u64) << 32) | match_b as u64;
        let in_order = self
            .partners
            .get(key)
            .map(|p| recv::is_next_in_order(p, seqnum))
            .unwrap_or(true);
        if !in_order {
            let token = self.alloc_request_id();
            self.pending_inbound.insert(
                token,
                PendingInbound {
                    partner: key,
                    match_info,
                    data,
                    rendezvous: None,
                },
            );
            if let Some(partner) = self.partners.get_mut(key) {
                recv::buffer_early_arrival(partner, seqnum, token);
            }
            return;
        }
        if let Some(partner) = self.partners.get_mut(key) {
            recv::advance_match_cursor(partner);
            ack::on_fragment_accepted(partner, &self.cfg, now);
        }
        self.deliver_one(key, match_info, data);
        self.drain_early_arrivals(key, now);
    }

    fn drain_early_arrivals(&mut self, key: PartnerKey, now: Instant) {
        let released = self
            .partners
            .get_mut(key)
            .map(recv::release_early_arrivals)
            .unwrap_or_default();
        for (_, token) in released {
            if let Some(pending) = self.pending_inbound.remove(&token) {
                if let Some(meta) = pending.rendezvous {
                    self.deliver_rendezvous(
                        pending.partner,
                        pending.match_info,
                        meta.total_length,
                        meta.peer_rdma_id,
                        meta.peer_rdma_offset,
                        meta.dst_ep,
                        meta.src_ep,
                    );
                } else {
                    self.deliver_one(pending.partner, pending.match_info, pending.data);
                }
                let _ = now;
            }
        }
    }

    fn handle_medium_frag(&mut self, key: PartnerKey, b: wire::MediumFragBody, now: Instant) {
        self.apply_piggyack(key, b.header.lib_piggyack.wrapping_add(1));
        let total_length = b.header.length as u32;
        let frag_max = self.cfg.medium_frag_max;
        let frags_expected = total_length.div_ceil(frag_max.max(1)).max(1);
        let seqnum = b.header.lib_seqnum;
        let complete = self
            .reassembly
            .start(key, seqnum, total_length, frags_expected, frag_max)
            .accept(b.frag_seqnum, &b.data);
        if !complete {
            return;
        }
        let buffer = self.reassembly.take_if_complete(key, seqnum).unwrap_or_default();
        self.sequence_and_deliver(key, seqnum, b.header.match_a, b.header.match_b, buffer, now);
    }

    fn handle_rendezvous(&mut self, key: PartnerKey, b: wire::RendezvousBody, now: Instant) {
        self.apply_piggyack(key, b.header.lib_piggyack.wrapping_add(1));
        let match_info = ((b.header.match_a as u64) << 32) | b.header.match_b as u64;
        let seqnum = b.header.lib_seqnum;
        let in_order = self
            .partners
            .get(key)
            .map(|p| recv::is_next_in_order(p, seqnum))
            .unwrap_or(true);
        if !in_order {
            let token = self.alloc_request_id();
            self.pending_inbound.insert(
                token,
                PendingInbound {
                    partner: key,
                    match_info,
                    data: Vec::new(),
                    rendezvous: Some(RendezvousMeta {
                        total_length: b.msg_length,
                        peer_rdma_id: b.rdma_id as u32,
                        peer_rdma_offset: b.rdma_offset as u32,
                        dst_ep: b.header.dst_ep,
                        src_ep: b.header.src_ep,
                    }),
                },
            );
            if let Some(partner) = self.partners.get_mut(key) {
                recv::buffer_early_arrival(partner, seqnum, token);
            }
            return;
        }
        if let Some(partner) = self.partners.get_mut(key) {
            recv::advance_match_cursor(partner);
            ack::on_fragment_accepted(partner, &self.cfg, now);
        }
        self.deliver_rendezvous(
            key,
            match_info,
            b.msg_length,
            b.rdma_id as u32,
            b.rdma_offset as u32,
            b.header.dst_ep,
            b.header.src_ep,
        );
        self.drain_early_arrivals(key, now);
    }

    // ---- Pull engine wiring (§4.G) ------------------------------------

    fn start_pull(
        &mut self,
        req_id: RequestId,
        partner_key: PartnerKey,
        announced_length: u32,
        peer_rdma_id: u32,
        peer_rdma_offset: u32,
    ) -> Result<(), Error> {
        let buffer_len = self.requests.get(&req_id).map(|r| r.buffer.len() as u32).unwrap_or(0);
        let pull_length = announced_length.min(buffer_len);
        let region_id = self.regions.register(pull_length)?;
        let region = self.regions.acquire(region_id)?;
        let partner_session = self.partners.get(partner_key).map(|p| p.back_session_id).unwrap_or(0);
        let peer_index = partner_key.peer_index as u16;

        let handle_id = self.pulls.insert(|id| PullHandle {
            id,
            request_id: req_id,
            peer_index,
            region: region.clone(),
            puller_rdma_offset: 0,
            pulled_rdma_offset: peer_rdma_offset,
            total_length: pull_length,
            remaining_length: pull_length,
            frame_index: 0,
            next_frame_index: 0,
            block_frames: 0,
            frame_missing_bitmap: 0,
            frame_copying_bitmap: 0,
            lib_cookie: req_id.0 as u64,
            local_rdma_id: region_id,
            src_pull_handle_remote: peer_rdma_id,
            partner_session,
            last_request_time: std::time::Instant::now(),
        });

        if let Some(req) = self.requests.get_mut(&req_id) {
            req.kind = RequestKind::RecvLarge;
            req.outcome.msg_length = announced_length;
            req.large.region_id = Some(region_id);
            req.large.pull_handle_id = Some(handle_id);
            req.state.set(RequestState::MATCHED);
        }

        let src_magic_val = wire::src_magic(self.endpoint_index as u32);
        let reqs = self
            .pulls
            .with_mut(handle_id, |h| pull::build_initial_requests(h, &self.cfg, src_magic_val))
            .unwrap_or_default();
        for pr in reqs {
            let _ = self.send_frame(peer_index, wire::Body::PullRequest(pr));
        }
        Ok(())
    }

    fn handle_pull_request(&mut self, peer_index: u16, b: wire::PullRequestBody) {
        let region_id = b.pulled_rdma_id;
        let region = match self.regions.acquire(region_id) {
            Ok(r) => r,
            Err(_) => {
                let nack = wire::NackBody {
                    dst_ep: b.src_ep,
                    src_ep: self.endpoint_index,
                    src_gen: 0,
                    session: b.session,
                    lib_seqnum: 0,
                    nack_type: crate::error::NackType::BadRdmaId.wire_code(),
                };
                let _ = self.send_frame(peer_index, wire::Body::NackMcp(nack));
                return;
            }
        };
        let replies = match pull::build_replies(&region, &b, self.cfg.pull_reply_length_max) {
            Ok(r) => r,
            Err(_) => {
                drop(region);
                self.regions.release_if_unused(region_id);
                return;
            }
        };
        let mut offset = 0u32;
        for (frame_seqnum, payload) in replies {
            let reply = wire::PullReplyBody {
                length: b.length,
                puller_rdma_id: b.puller_rdma_id,
                puller_offset: b.puller_offset,
                dst_pull_handle: b.src_pull_handle,
                dst_magic: b.src_magic,
                frame_seqnum,
                frame_length: payload.len() as u16,
                msg_offset: b.puller_offset + offset,
                payload,
            };
            offset += reply.frame_length as u32;
            let _ = self.send_frame(peer_index, wire::Body::PullReply(reply));
        }
        drop(region);
        self.regions.release_if_unused(region_id);
    }

    fn handle_pull_reply(&mut self, b: wire::PullReplyBody, now: Instant) {
        let handle_id = b.dst_pull_handle;
        let src_magic_val = wire::src_magic(self.endpoint_index as u32);
        let outcome = self.pulls.with_mut(handle_id, |h| {
            h.last_request_time = now;
            pull::on_pull_reply(h, &b, &self.cfg, src_magic_val)
        });
        let Some(Ok(action)) = outcome else {
            return;
        };
        match action {
            PullReplyAction::Continue => {}
            PullReplyAction::PostNextBlock(req) => {
                let peer_index = self
                    .pulls
                    .with_mut(handle_id, |h| h.peer_index)
                    .unwrap_or(0);
                let _ = self.send_frame(peer_index, wire::Body::PullRequest(req));
            }
            PullReplyAction::Done {
                lib_cookie,
                pulled_length,
                local_rdma_id,
            } => {
                let req_id = RequestId(lib_cookie as u32);
                let peer_index = self.pulls.with_mut(handle_id, |h| h.peer_index).unwrap_or(0);
                // The id the *sender* registered for this region, as
                // advertised in the original rendezvous and echoed back to
                // us on every pull-request/-reply; carried in `notify` so
                // the sender can look its own SendLarge request back up.
                let remote_region_id = self
                    .pulls
                    .with_mut(handle_id, |h| h.src_pull_handle_remote)
                    .unwrap_or(0);
                let partner_key = Self::partner_key(peer_index);
                let partner_session = self.partners.get(partner_key).map(|p| p.back_session_id).unwrap_or(0);
                let removed = self.pulls.remove(handle_id);

                if let Some(req) = self.requests.get_mut(&req_id) {
                    req.outcome.xfer_length = pulled_length;
                    if let Some(handle) = &removed {
                        if let Ok(bytes) = handle.region.append_pages_to_frame(0, pulled_length) {
                            let n = bytes.len().min(req.buffer.len());
                            req.buffer[..n].copy_from_slice(&bytes[..n]);
                        }
                    }
                    let truncated = pulled_length < req.outcome.msg_length;
                    req.finish(if truncated { Status::Truncated } else { Status::Success });
                }
                // Drop the handle's region reference before asking the table
                // to free the slot, or the refcount this check sees still
                // includes the handle we just removed.
                drop(removed);
                self.regions.release_if_unused(local_rdma_id);
                self.post_completion(req_id);

                let notify = wire::NotifyBody {
                    header: wire::DataHeader {
                        dst_ep: 0,
                        src_ep: self.endpoint_index,
                        src_gen: 0,
                        length: 0,
                        lib_seqnum: 0,
                        lib_piggyack: 0,
                        match_a: 0,
                        match_b: 0,
                        session: partner_session,
                    },
                    total_length: pulled_length,
                    puller_rdma_id: remote_region_id.min(u8::MAX as u32) as u8,
                    puller_rdma_seqnum: 0,
                };
                let _ = self.send_frame(peer_index, wire::Body::Notify(notify));
            }
        }
    }

    fn handle_notify(&mut self, _key: PartnerKey, b: wire::NotifyBody) {
        // The sender side of a rendezvous learns its region can be
        // released once the puller confirms completion (§4.G), identified
        // by the region id it originally advertised in the rendezvous.
        let found = self.requests.iter().find_map(|(id, req)| {
            if req.kind == RequestKind::SendLarge && req.large.region_id == Some(b.puller_rdma_id as u32) {
                Some(*id)
            } else {
                None
            }
        });
        let Some(req_id) = found else { return };
        if let Some(req) = self.requests.get_mut(&req_id) {
            req.outcome.xfer_length = b.total_length;
            req.finish(Status::Success);
            if let Some(region_id) = req.large.region_id {
                self.regions.release_if_unused(region_id);
            }
        }
        self.post_completion(req_id);
    }

    fn handle_nack(&mut self, key: PartnerKey, b: wire::NackBody) {
        let nack = crate::error::NackType::from_wire_code(b.nack_type);
        log::debug!("nack from partner {:?}: {:?}", key, nack);
        if let Some(partner) = self.partners.get_mut(key) {
            if let Some(req_id) = partner.non_acked_sends.pop_front() {
                if let Some(req) = self.requests.get_mut(&req_id) {
                    req.finish(Status::Nack(nack.unwrap_or(crate::error::NackType::BadEndpoint)));
                }
                self.post_completion(req_id);
            }
        }
    }

    // ---- Progress loop (§4.I) ------------------------------------------

    fn handle_frame(&mut self, frame: wire::Frame, now: Instant) {
        let key = Self::partner_key(frame.dst_src_peer_index);
        let peer_index = frame.dst_src_peer_index;
        match frame.body {
            wire::Body::Truc(b) => self.handle_liback(key, b),
            wire::Body::Connect(b) => self.handle_connect(peer_index, b),
            wire::Body::Tiny(b) => self.handle_data(key, b.header, b.data, now),
            wire::Body::Small(b) => self.handle_data(key, b.header, b.data, now),
            wire::Body::MediumFrag(b) => self.handle_medium_frag(key, b, now),
            wire::Body::Rendezvous(b) => self.handle_rendezvous(key, b, now),
            wire::Body::PullRequest(b) => self.handle_pull_request(peer_index, b),
            wire::Body::PullReply(b) => self.handle_pull_reply(b, now),
            wire::Body::Notify(b) => self.handle_notify(key, b),
            wire::Body::NackLib(b) => self.handle_nack(key, b),
            wire::Body::NackMcp(b) => self.handle_nack(key, b),
        }
    }

    fn drain_inbound(&mut self, now: Instant) {
        loop {
            let (_, bytes) = match self.transport.recv() {
                Ok(Some(v)) => v,
                Ok(None) => break,
                Err(e) => {
                    log::warn!("transport recv error: {e}");
                    break;
                }
            };
            match wire::decode(&bytes, u16::MAX) {
                Ok(frame) => self.handle_frame(frame, now),
                Err(e) => log::debug!("dropping malformed frame: {e}"),
            }
        }
    }

    /// One tick of the progress loop: drain inbound frames, dispatch to
    /// recv/pull/ack, emit due acks, and drive retransmission.
    pub fn progress(&mut self, now: Instant) {
        self.drain_inbound(now);
        self.drain_due_acks(now);
        self.drain_resends(now);
        if self.completion_ring.overflow_count() > 0 {
            self.completion_ring.release_chunk();
        }
    }

    pub fn test(&mut self, id: RequestId) -> bool {
        self.requests.get(&id).map(|r| r.is_done()).unwrap_or(false)
    }

    /// Busy-loop the progress loop until `id` completes or `timeout`
    /// elapses (§5: the driver has no background thread in this design,
    /// so `wait` is cooperative rather than blocking on a kernel wait
    /// queue).
    pub fn wait(&mut self, id: RequestId, timeout: std::time::Duration) -> WaitStatus {
        let deadline = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            self.progress(now);
            if self.test(id) {
                return WaitStatus::Event;
            }
            if now >= deadline {
                return WaitStatus::Timeout;
            }
        }
    }

    /// Cancel `id` if it is still cancellable (§5 Cancellation): unmatched
    /// receives and unsent connects only.
    pub fn cancel(&mut self, id: RequestId) -> bool {
        match self.requests.get_mut(&id) {
            Some(req) if req.cancellable() => {
                req.finish(Status::Cancelled);
                self.posted_recvs.retain(|r| *r != id);
                true
            }
            _ => false,
        }
    }

    pub fn outcome(&self, id: RequestId) -> Option<&crate::request::Outcome> {
        self.requests.get(&id).map(|r| &r.outcome)
    }

    /// Bytes delivered into a completed receive's buffer, truncated to
    /// `outcome.xfer_length` (§4.F "Truncation"). `None` if `id` is unknown
    /// or not yet matched.
    pub fn recv_buffer(&self, id: RequestId) -> Option<&[u8]> {
        let req = self.requests.get(&id)?;
        let len = req.outcome.xfer_length as usize;
        req.buffer.get(..len)
    }

    /// Drain delivered completion notifications from the event ring.
    pub fn poll_completions(&mut self) -> Vec<RequestId> {
        let mut out = Vec::new();
        while let Some(id) = self.completion_ring.poll(&mut self.ring_cursor) {
            out.push(id);
        }
        out
    }

    /// Tear down the endpoint (§3 "destroyed by close"): every request not
    /// already done completes with a terminal status, every outstanding
    /// pull handle and pinned region is released, and all waiters are
    /// woken. Consumes `self` — there is nothing left to call afterwards.
    pub fn close(mut self) {
        let region_ids: Vec<u32> = self.requests.values().filter_map(|r| r.large.region_id).collect();
        let ids: Vec<RequestId> = self.requests.keys().copied().collect();

        for id in &ids {
            if let Some(req) = self.requests.get_mut(id) {
                if !req.is_done() {
                    req.finish(Status::Disconnected(Error::EndpointClosed));
                }
            }
        }

        // Drop every in-flight pull handle (and the region reference each
        // one holds) before asking the region table to reclaim slots --
        // same ordering constraint as the single-handle case in
        // `handle_pull_reply`.
        drop(self.pulls.drain());

        for region_id in region_ids {
            self.regions.release_if_unused(region_id);
        }

        for id in ids {
            self.post_completion(id);
        }
        self.completion_ring.wakeup();
    }
}

fn decode_session(data: &[u8]) -> u32 {
    if data.len() >= 4 {
        u32::from_le_bytes(data[0..4].try_into().unwrap())
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoopbackTransport;

    fn pair() -> (Endpoint<LoopbackTransport>, Endpoint<LoopbackTransport>) {
        let mut mesh = LoopbackTransport::mesh(2);
        let b_t = mesh.pop().unwrap();
        let a_t = mesh.pop().unwrap();
        (
            Endpoint::open(Config::default(), a_t, 0),
            Endpoint::open(Config::default(), b_t, 0),
        )
    }

    #[test]
    fn connect_handshake_completes_both_sides() {
        let (mut a, mut b) = pair();
        let creq = a.connect(1).unwrap();
        let now = Instant::now();
        b.progress(now);
        a.progress(now);
        assert!(a.test(creq));
    }

    #[test]
    fn tiny_send_recv_round_trip() {
        let (mut a, mut b) = pair();
        let rreq = b.irecv(64, 0x42, u64::MAX, 7);
        let sreq = a.isend(1, b"hello".to_vec(), 0, 0x42, 0).unwrap();
        let now = Instant::now();
        b.progress(now);
        a.progress(now);
        assert!(a.test(sreq));
        assert!(b.test(rreq));
        let outcome = b.outcome(rreq).unwrap();
        assert_eq!(outcome.xfer_length, 5);
    }

    #[test]
    fn unexpected_message_then_matched_by_later_irecv() {
        let (mut a, mut b) = pair();
        let sreq = a.isend(1, b"early".to_vec(), 0, 9, 0).unwrap();
        let now = Instant::now();
        b.progress(now);
        assert!(b.probe(9, u64::MAX).is_some());
        let rreq = b.irecv(64, 9, u64::MAX, 0);
        assert!(b.test(rreq));
        a.progress(now);
        assert!(a.test(sreq));
    }

    #[test]
    fn medium_message_reassembles_before_matching() {
        let (mut a, mut b) = pair();
        let rreq = b.irecv(20_000, 3, u64::MAX, 0);
        let payload = vec![0x7Au8; 13_000];
        a.isend(1, payload.clone(), 0, 3, 0).unwrap();
        let now = Instant::now();
        for _ in 0..10 {
            b.progress(now);
        }
        assert!(b.test(rreq));
        assert_eq!(b.outcome(rreq).unwrap().xfer_length, 13_000);
    }

    #[test]
    fn rendezvous_transfer_completes() {
        let (mut a, mut b) = pair();
        let rreq = b.irecv(200_000, 11, u64::MAX, 0);
        let payload = vec![0x11u8; 100_000];
        let sreq = a.isend(1, payload.clone(), 0, 11, 0).unwrap();
        let now = Instant::now();
        for _ in 0..50 {
            b.progress(now);
            a.progress(now);
            if b.test(rreq) && a.test(sreq) {
                break;
            }
        }
        assert!(b.test(rreq), "receive did not complete");
        assert_eq!(b.outcome(rreq).unwrap().xfer_length, 100_000);
        assert!(a.test(sreq), "send did not complete");
    }

    #[test]
    fn cancel_unmatched_receive_succeeds() {
        let (mut _a, mut b) = pair();
        let id = b.irecv(16, 0, 0, 0);
        assert!(b.cancel(id));
        assert!(b.test(id));
    }

    #[test]
    fn close_tears_down_an_endpoint_with_a_posted_receive() {
        let (_a, mut b) = pair();
        let _rreq = b.irecv(16, 5, u64::MAX, 0);
        b.close();
    }

    #[test]
    fn close_releases_in_flight_rendezvous_region() {
        let (mut a, mut b) = pair();
        let rreq = b.irecv(200_000, 11, u64::MAX, 0);
        let payload = vec![0x11u8; 100_000];
        let sreq = a.isend(1, payload, 0, 11, 0).unwrap();
        let now = Instant::now();
        // Drive one tick so the rendezvous handshake and first pull
        // request are in flight, but close before the transfer finishes.
        b.progress(now);
        a.progress(now);
        assert!(!b.test(rreq));
        assert!(!a.test(sreq));
        b.close();
        a.close();
    }
}
