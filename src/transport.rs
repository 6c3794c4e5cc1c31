// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Transport boundary (§5 AMBIENT) — the privileged half of the
// split-process design is reduced here to a trait: something that can
// hand raw Ethernet-framed bytes to a peer and hand back whatever
// arrived. A real deployment backs this with a raw socket or a kernel
// driver ioctl; tests and demos back it with `LoopbackTransport`.

use crate::error::Error;

/// A board's identity as exposed to the library: its Ethernet address and
/// which local peer-table slot it occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoardInfo {
    pub board_addr: u64,
    pub peer_index: u16,
    pub hostname_hash: u64,
}

/// Send/receive primitive the protocol engine is built against. All
/// methods are non-blocking: `recv` returns `Ok(None)` when nothing is
/// pending, matching the progress loop's poll-don't-block style (§4.I).
pub trait Transport {
    /// This endpoint's own board identity.
    fn local_board(&self) -> BoardInfo;

    /// Transmit one already-encoded wire frame to `peer_index`.
    fn send(&mut self, peer_index: u16, frame: &[u8]) -> Result<(), Error>;

    /// Poll for one inbound frame, if any is queued, alongside the sender's
    /// peer index (resolved from the source MAC by the privileged half in
    /// a real deployment; the loopback mesh tags it directly).
    fn recv(&mut self) -> Result<Option<(u16, Vec<u8>)>, Error>;
}

type Inbox = std::rc::Rc<std::cell::RefCell<std::collections::VecDeque<(u16, Vec<u8>)>>>;

/// An in-process transport connecting two or more endpoints via shared
/// queues, for tests and demos. Each `LoopbackTransport` is one
/// endpoint's end of a fully-connected mesh over its peers: `peers[i]` is
/// the inbox every transport (including this one) delivers into when
/// sending to peer `i`.
pub struct LoopbackTransport {
    board: BoardInfo,
    peers: Vec<Inbox>,
}

impl LoopbackTransport {
    /// Build a mesh of `n` loopback transports, peer-indexed 0..n, each
    /// able to deliver directly into the others' inboxes.
    pub fn mesh(n: u16) -> Vec<Self> {
        let inboxes: Vec<Inbox> = (0..n).map(|_| Inbox::default()).collect();
        (0..n)
            .map(|i| LoopbackTransport {
                board: BoardInfo {
                    board_addr: 0x0200_0000_0000 | i as u64,
                    peer_index: i,
                    hostname_hash: i as u64,
                },
                peers: inboxes.clone(),
            })
            .collect()
    }
}

impl Transport for LoopbackTransport {
    fn local_board(&self) -> BoardInfo {
        self.board
    }

    fn send(&mut self, peer_index: u16, frame: &[u8]) -> Result<(), Error> {
        let slot = self
            .peers
            .get(peer_index as usize)
            .ok_or(Error::InternalMiscEinval)?;
        slot.borrow_mut().push_back((self.board.peer_index, frame.to_vec()));
        Ok(())
    }

    fn recv(&mut self) -> Result<Option<(u16, Vec<u8>)>, Error> {
        Ok(self.peers[self.board.peer_index as usize]
            .borrow_mut()
            .pop_front())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mesh_delivers_across_peers() {
        let mut mesh = LoopbackTransport::mesh(2);
        let (mut a, mut b) = {
            let b = mesh.pop().unwrap();
            let a = mesh.pop().unwrap();
            (a, b)
        };
        a.send(1, b"hi").unwrap();
        assert_eq!(b.recv().unwrap(), Some((0, b"hi".to_vec())));
        assert_eq!(a.recv().unwrap(), None);
    }
}
