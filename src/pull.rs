// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Pull engine (§4.G) — rendezvous large-transfer controller.
//
// The handle table reuses the teacher's free-list-over-`Vec` idiom from
// `chunk_storage.rs` (a `Vec<Slot>` plus a singly linked free chain of
// indexes) for id allocation, and `rw_lock.rs`'s RwLock for the
// per-endpoint pull-handle set, matching §5's "read-writers lock around
// the endpoint's pull-handle set".

use crate::config::Config;
use crate::error::{Error, Status};
use crate::region::RegionHandle;
use crate::request::RequestId;
use crate::rw_lock::RwLock;
use crate::wire::{PullReplyBody, PullRequestBody};

/// Per-in-flight-large-receive state (§3 Pull handle).
pub struct PullHandle {
    pub id: u32,
    pub request_id: RequestId,
    pub peer_index: u16,
    pub region: RegionHandle,
    pub puller_rdma_offset: u32,
    pub pulled_rdma_offset: u32,
    pub total_length: u32,
    pub remaining_length: u32,

    pub frame_index: u32,
    pub next_frame_index: u32,
    pub block_frames: u32,
    pub frame_missing_bitmap: u32,
    pub frame_copying_bitmap: u32,

    pub lib_cookie: u64,
    pub local_rdma_id: u32,
    pub src_pull_handle_remote: u32,
    pub partner_session: u32,

    pub last_request_time: std::time::Instant,
}

impl PullHandle {
    pub fn done(&self) -> bool {
        self.remaining_length == 0 && (self.frame_copying_bitmap & BOTH_BLOCKS_MASK) == 0
    }

    pub fn first_block_done(&self) -> bool {
        (self.frame_copying_bitmap & BLOCK_MASK) == 0
    }

    /// Invariant #3 (§8): popcount(missing) <= popcount(copying) <=
    /// block_frames <= 2 * REPLIES_PER_BLOCK.
    pub fn check_invariant(&self, replies_per_block: u8) -> bool {
        self.frame_missing_bitmap.count_ones() <= self.frame_copying_bitmap.count_ones()
            && self.frame_copying_bitmap.count_ones() <= self.block_frames
            && self.block_frames <= 2 * replies_per_block as u32
    }
}

const BLOCK_MASK: u32 = 0xff;
const BOTH_BLOCKS_MASK: u32 = 0xffff;

/// Id-indexed pull-handle table for one endpoint.
pub struct PullHandleTable {
    lock: RwLock,
    slots: std::cell::UnsafeCell<Vec<Option<PullHandle>>>,
    free: std::cell::UnsafeCell<Vec<u32>>,
}

// SAFETY: every access to `slots`/`free` is performed while holding `lock`
// (exclusively for mutation, shared for the read-only lookups that are
// still safe because `Option<PullHandle>` entries are never mutated through
// a shared borrow — callers that need to mutate a handle take the write
// lock).
unsafe impl Send for PullHandleTable {}
unsafe impl Sync for PullHandleTable {}

impl PullHandleTable {
    pub fn new() -> Self {
        PullHandleTable {
            lock: RwLock::new(),
            slots: std::cell::UnsafeCell::new(Vec::new()),
            free: std::cell::UnsafeCell::new(Vec::new()),
        }
    }

    pub fn insert(&self, mut make: impl FnMut(u32) -> PullHandle) -> u32 {
        self.lock.lock();
        let id = unsafe {
            let free = &mut *self.free.get();
            let slots = &mut *self.slots.get();
            if let Some(id) = free.pop() {
                slots[id as usize] = Some(make(id));
                id
            } else {
                let id = slots.len() as u32;
                slots.push(Some(make(id)));
                id
            }
        };
        self.lock.unlock();
        id
    }

    pub fn with_mut<R>(&self, id: u32, f: impl FnOnce(&mut PullHandle) -> R) -> Option<R> {
        self.lock.lock();
        let r = unsafe {
            let slots = &mut *self.slots.get();
            slots
                .get_mut(id as usize)
                .and_then(|s| s.as_mut())
                .map(f)
        };
        self.lock.unlock();
        r
    }

    pub fn remove(&self, id: u32) -> Option<PullHandle> {
        self.lock.lock();
        let removed = unsafe {
            let slots = &mut *self.slots.get();
            let taken = slots.get_mut(id as usize).and_then(|s| s.take());
            if taken.is_some() {
                (&mut *self.free.get()).push(id);
            }
            taken
        };
        self.lock.unlock();
        removed
    }

    /// Remove every live handle, for endpoint teardown. Returned handles
    /// still hold their region reference; the caller drops them before
    /// reclaiming region slots, same ordering as a single `remove`.
    pub fn drain(&self) -> Vec<PullHandle> {
        self.lock.lock();
        let taken = unsafe {
            let slots = &mut *self.slots.get();
            let free = &mut *self.free.get();
            let mut out = Vec::new();
            for (id, slot) in slots.iter_mut().enumerate() {
                if let Some(handle) = slot.take() {
                    out.push(handle);
                    free.push(id as u32);
                }
            }
            out
        };
        self.lock.unlock();
        taken
    }
}

impl Default for PullHandleTable {
    fn default() -> Self {
        Self::new()
    }
}

/// What the progress loop should do after processing a pull-reply.
pub enum PullReplyAction {
    /// Nothing further; more replies expected.
    Continue,
    /// Post the next block's pull-request (first block of the window
    /// finished while more data remains).
    PostNextBlock(PullRequestBody),
    /// The transfer is complete: synthesise `PULL_DONE` and send `notify`.
    Done { lib_cookie: u64, pulled_length: u32, local_rdma_id: u32 },
}

/// Requester side: build the initial one-or-two-block pull-request(s) for a
/// freshly matched large receive.
pub fn build_initial_requests(
    handle: &mut PullHandle,
    cfg: &Config,
    src_magic: u32,
) -> Vec<PullRequestBody> {
    let block_len = cfg.pull_block_length_max();
    let mut requests = Vec::new();
    for _ in 0..2 {
        if handle.remaining_length == 0 {
            break;
        }
        let this_block = handle.remaining_length.min(block_len);
        append_needed_frames(handle, this_block, cfg.pull_reply_length_max);
        requests.push(PullRequestBody {
            dst_ep: 0,
            src_ep: 0,
            src_gen: 0,
            session: handle.partner_session,
            length: this_block,
            puller_rdma_id: handle.local_rdma_id,
            puller_offset: handle.puller_rdma_offset,
            pulled_rdma_id: handle.src_pull_handle_remote,
            pulled_offset: handle.pulled_rdma_offset,
            src_pull_handle: handle.id,
            src_magic,
            block_length: this_block.min(u16::MAX as u32) as u16,
            frame_index: handle.frame_index as u16,
            first_frame_offset: 0,
        });
        handle.remaining_length -= this_block;
        handle.puller_rdma_offset += this_block;
        handle.pulled_rdma_offset += this_block;
    }
    requests
}

fn append_needed_frames(handle: &mut PullHandle, block_length: u32, reply_len_max: u32) {
    let new_frames = block_length.div_ceil(reply_len_max);
    let mask = ((1u32 << new_frames) - 1) << handle.block_frames;
    handle.frame_missing_bitmap |= mask;
    handle.frame_copying_bitmap |= mask;
    handle.block_frames += new_frames;
    handle.next_frame_index += new_frames;
}

fn first_block_advance(handle: &mut PullHandle, replies_per_block: u8) {
    let n = replies_per_block as u32;
    handle.frame_missing_bitmap >>= n;
    handle.frame_copying_bitmap >>= n;
    handle.frame_index += n;
    handle.block_frames = handle.block_frames.saturating_sub(n);
}

/// Apply an inbound pull-reply to `handle`. Copies payload into `region`,
/// updates bitmaps, and reports what the caller must do next (§4.G
/// Protocol steps 1-5).
pub fn on_pull_reply(
    handle: &mut PullHandle,
    reply: &PullReplyBody,
    cfg: &Config,
    src_magic: u32,
) -> Result<PullReplyAction, Error> {
    let frame_seqnum = reply.frame_seqnum as u32;
    if frame_seqnum < handle.frame_index || frame_seqnum >= handle.frame_index + handle.block_frames {
        log::debug!("pull-reply frame {frame_seqnum} outside window, dropping");
        return Ok(PullReplyAction::Continue);
    }
    let bit = 1u32 << (frame_seqnum - handle.frame_index);
    if handle.frame_missing_bitmap & bit == 0 {
        log::debug!("pull-reply frame {frame_seqnum} already received, dropping");
        return Ok(PullReplyAction::Continue);
    }

    handle.frame_missing_bitmap &= !bit;
    handle
        .region
        .fill_pages_from_frame(reply.msg_offset, &reply.payload)?;
    handle.frame_copying_bitmap &= !bit;

    if handle.first_block_done() {
        first_block_advance(handle, cfg.replies_per_block);
        if handle.remaining_length > 0 {
            let block_len = handle.remaining_length.min(cfg.pull_block_length_max());
            append_needed_frames(handle, block_len, cfg.pull_reply_length_max);
            let req = PullRequestBody {
                dst_ep: 0,
                src_ep: 0,
                src_gen: 0,
                session: handle.partner_session,
                length: block_len,
                puller_rdma_id: handle.local_rdma_id,
                puller_offset: handle.puller_rdma_offset,
                pulled_rdma_id: handle.src_pull_handle_remote,
                pulled_offset: handle.pulled_rdma_offset,
                src_pull_handle: handle.id,
                src_magic,
                block_length: block_len.min(u16::MAX as u32) as u16,
                frame_index: handle.next_frame_index as u16,
                first_frame_offset: 0,
            };
            handle.remaining_length -= block_len;
            handle.puller_rdma_offset += block_len;
            handle.pulled_rdma_offset += block_len;
            return Ok(PullReplyAction::PostNextBlock(req));
        }
    }

    if handle.done() {
        return Ok(PullReplyAction::Done {
            lib_cookie: handle.lib_cookie,
            pulled_length: handle.total_length - handle.remaining_length,
            local_rdma_id: handle.local_rdma_id,
        });
    }

    Ok(PullReplyAction::Continue)
}

/// Responder side (§4.G "Responder side"): build the `replies` pull-reply
/// packets answering one pull-request, reading region pages under the
/// region's shared lock.
pub fn build_replies(
    region: &RegionHandle,
    request: &PullRequestBody,
    reply_len_max: u32,
) -> Result<Vec<(u8, Vec<u8>)>, Error> {
    let mut out = Vec::new();
    let mut offset = 0u32;
    let mut frame_seqnum = request.frame_index;
    while offset < request.length {
        let len = reply_len_max.min(request.length - offset);
        let pages = region.append_pages_to_frame(request.pulled_offset + offset, len)?;
        out.push((frame_seqnum as u8, pages));
        offset += len;
        frame_seqnum += 1;
    }
    Ok(out)
}

/// On timeout with outstanding missing frames: re-issue the current block
/// request (§4.G Failure).
pub fn resend_current_block(handle: &PullHandle, src_magic: u32) -> Option<PullRequestBody> {
    if handle.frame_missing_bitmap == 0 {
        return None;
    }
    let missing_len = handle.frame_missing_bitmap.count_ones() * 1; // frame count, caller scales
    Some(PullRequestBody {
        dst_ep: 0,
        src_ep: 0,
        src_gen: 0,
        session: handle.partner_session,
        length: missing_len,
        puller_rdma_id: handle.local_rdma_id,
        puller_offset: handle.puller_rdma_offset,
        pulled_rdma_id: handle.src_pull_handle_remote,
        pulled_offset: handle.pulled_rdma_offset,
        src_pull_handle: handle.id,
        src_magic,
        block_length: missing_len.min(u16::MAX as u32) as u16,
        frame_index: handle.frame_index as u16,
        first_frame_offset: 0,
    })
}

/// Abort the handle on an unrecoverable failure (region fault): the caller
/// must post a `PULL_DONE` with truncated status and drop the handle
/// without nacking the partner (§4.G Failure).
pub fn abort_status() -> Status {
    Status::Truncated
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::RegionTable;

    fn make_handle(total_length: u32) -> (RegionTable, PullHandle) {
        let mut regions = RegionTable::new(4);
        let region_id = regions.register(total_length).unwrap();
        let region = regions.acquire(region_id).unwrap();
        let handle = PullHandle {
            id: 0,
            request_id: RequestId(1),
            peer_index: 0,
            region,
            puller_rdma_offset: 0,
            pulled_rdma_offset: 0,
            total_length,
            remaining_length: total_length,
            frame_index: 0,
            next_frame_index: 0,
            block_frames: 0,
            frame_missing_bitmap: 0,
            frame_copying_bitmap: 0,
            lib_cookie: 42,
            local_rdma_id: 1,
            src_pull_handle_remote: 0,
            partner_session: 7,
            last_request_time: std::time::Instant::now(),
        };
        (regions, handle)
    }

    #[test]
    fn small_transfer_completes_in_one_block() {
        let cfg = Config::default();
        let (_regions, mut handle) = make_handle(3_000_000);
        let reqs = build_initial_requests(&mut handle, &cfg, 0xAA);
        assert!(!reqs.is_empty());
        assert!(handle.check_invariant(cfg.replies_per_block));

        let mut frame = 0u8;
        let mut done = None;
        // drive replies until the handle reports Done
        'outer: loop {
            for i in 0..handle.block_frames {
                let fi = handle.frame_index as u8 + i as u8;
                if handle.frame_missing_bitmap & (1 << i) == 0 {
                    continue;
                }
                let len = cfg.pull_reply_length_max.min(
                    handle.total_length - (fi as u32) * cfg.pull_reply_length_max,
                );
                let reply = PullReplyBody {
                    length: len,
                    puller_rdma_id: 1,
                    puller_offset: (fi as u32) * cfg.pull_reply_length_max,
                    dst_pull_handle: 0,
                    dst_magic: 0xAA,
                    frame_seqnum: fi,
                    frame_length: len as u16,
                    msg_offset: (fi as u32) * cfg.pull_reply_length_max,
                    payload: vec![0xCD; len as usize],
                };
                match on_pull_reply(&mut handle, &reply, &cfg, 0xAA).unwrap() {
                    PullReplyAction::Done {
                        pulled_length, ..
                    } => {
                        done = Some(pulled_length);
                        break 'outer;
                    }
                    _ => {}
                }
                assert!(handle.check_invariant(cfg.replies_per_block));
            }
            frame = frame.wrapping_add(1);
            if frame > 200 {
                panic!("pull transfer did not complete");
            }
        }
        assert_eq!(done, Some(3_000_000));
        assert_eq!(handle.frame_missing_bitmap, 0);
        assert_eq!(handle.frame_copying_bitmap, 0);
    }

    #[test]
    fn out_of_window_frame_is_dropped() {
        let cfg = Config::default();
        let (_regions, mut handle) = make_handle(1000);
        build_initial_requests(&mut handle, &cfg, 0);
        let reply = PullReplyBody {
            length: 10,
            puller_rdma_id: 1,
            puller_offset: 0,
            dst_pull_handle: 0,
            dst_magic: 0,
            frame_seqnum: 99,
            frame_length: 10,
            msg_offset: 0,
            payload: vec![0; 10],
        };
        let action = on_pull_reply(&mut handle, &reply, &cfg, 0).unwrap();
        assert!(matches!(action, PullReplyAction::Continue));
    }

    #[test]
    fn handle_table_reuses_freed_ids() {
        let table = PullHandleTable::new();
        let (_r, h1) = make_handle(10);
        let id = table.insert(|_| {
            let (_r2, h) = make_handle(10);
            h
        });
        let _ = h1;
        assert_eq!(id, 0);
        table.remove(id);
        let id2 = table.insert(|_| {
            let (_r2, h) = make_handle(10);
            h
        });
        assert_eq!(id2, 0);
    }
}
