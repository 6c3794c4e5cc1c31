// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Fixed-layout little-endian wire codec for the messaging protocol's
// packet taxonomy (§6). Hand-packed rather than derived: the layout is a
// wire contract, not a Rust memory layout, so every field is written with
// explicit `to_le_bytes`/`from_le_bytes` at its documented offset.

use crate::error::Error;

/// 16-bit EtherType carried by every frame.
pub const ETHERTYPE_OMX: u16 = 0x86DF;

/// Maximum frame size the codec will accept (Ethernet MTU headroom).
pub const MAX_FRAME_LEN: usize = 9000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Truc = 32,
    Connect = 33,
    Tiny = 34,
    Small = 35,
    MediumFrag = 36,
    Rendezvous = 37,
    PullRequest = 38,
    PullReply = 39,
    Notify = 40,
    NackLib = 41,
    NackMcp = 42,
}

impl PacketType {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            32 => PacketType::Truc,
            33 => PacketType::Connect,
            34 => PacketType::Tiny,
            35 => PacketType::Small,
            36 => PacketType::MediumFrag,
            37 => PacketType::Rendezvous,
            38 => PacketType::PullRequest,
            39 => PacketType::PullReply,
            40 => PacketType::Notify,
            41 => PacketType::NackLib,
            42 => PacketType::NackMcp,
            _ => return None,
        })
    }
}

/// The shared header carried by tiny/small/medium/rendezvous/notify bodies
/// ("tiny-header" in §6's body-field table).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataHeader {
    pub dst_ep: u8,
    pub src_ep: u8,
    pub src_gen: u8,
    pub length: u16,
    pub lib_seqnum: u16,
    pub lib_piggyack: u16,
    pub match_a: u32,
    pub match_b: u32,
    pub session: u32,
}

const DATA_HEADER_LEN: usize = 1 + 1 + 1 + 1 /*pad-to-align length field start*/ + 2 + 2 + 2 + 2 + 4 + 4 + 4;

impl DataHeader {
    fn encode(&self, buf: &mut Vec<u8>) {
        buf.push(self.dst_ep);
        buf.push(self.src_ep);
        buf.push(self.src_gen);
        buf.push(0); // pad
        buf.extend_from_slice(&self.length.to_le_bytes());
        buf.extend_from_slice(&0u16.to_le_bytes()); // pad
        buf.extend_from_slice(&self.lib_seqnum.to_le_bytes());
        buf.extend_from_slice(&self.lib_piggyack.to_le_bytes());
        buf.extend_from_slice(&self.match_a.to_le_bytes());
        buf.extend_from_slice(&self.match_b.to_le_bytes());
        buf.extend_from_slice(&self.session.to_le_bytes());
    }

    fn decode(buf: &[u8]) -> Result<(Self, usize), Error> {
        if buf.len() < DATA_HEADER_LEN {
            return Err(Error::InternalMiscEinval);
        }
        let dst_ep = buf[0];
        let src_ep = buf[1];
        let src_gen = buf[2];
        // buf[3] pad
        let length = u16::from_le_bytes([buf[4], buf[5]]);
        // buf[6..8] pad
        let lib_seqnum = u16::from_le_bytes([buf[8], buf[9]]);
        let lib_piggyack = u16::from_le_bytes([buf[10], buf[11]]);
        let match_a = u32::from_le_bytes(buf[12..16].try_into().unwrap());
        let match_b = u32::from_le_bytes(buf[16..20].try_into().unwrap());
        let session = u32::from_le_bytes(buf[20..24].try_into().unwrap());
        Ok((
            DataHeader {
                dst_ep,
                src_ep,
                src_gen,
                length,
                lib_seqnum,
                lib_piggyack,
                match_a,
                match_b,
                session,
            },
            DATA_HEADER_LEN,
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrucBody {
    pub dst_ep: u8,
    pub src_ep: u8,
    pub src_gen: u8,
    pub length: u8,
    pub session: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectBody {
    pub dst_ep: u8,
    pub src_ep: u8,
    pub src_gen: u8,
    pub length: u8,
    pub lib_seqnum: u16,
    pub dest_peer_index: u16,
    pub src_mac_low32: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataBody {
    pub header: DataHeader,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediumFragBody {
    pub header: DataHeader,
    pub frag_length: u16,
    pub frag_seqnum: u8,
    pub frag_pipeline: u8,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RendezvousBody {
    pub header: DataHeader,
    pub msg_length: u32,
    pub rdma_id: u8,
    pub rdma_seqnum: u8,
    pub rdma_offset: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequestBody {
    pub dst_ep: u8,
    pub src_ep: u8,
    pub src_gen: u8,
    pub session: u32,
    pub length: u32,
    pub puller_rdma_id: u32,
    pub puller_offset: u32,
    pub pulled_rdma_id: u32,
    pub pulled_offset: u32,
    pub src_pull_handle: u32,
    pub src_magic: u32,
    pub block_length: u16,
    pub frame_index: u16,
    pub first_frame_offset: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullReplyBody {
    pub length: u32,
    pub puller_rdma_id: u32,
    pub puller_offset: u32,
    pub dst_pull_handle: u32,
    pub dst_magic: u32,
    pub frame_seqnum: u8,
    pub frame_length: u16,
    pub msg_offset: u32,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyBody {
    pub header: DataHeader,
    pub total_length: u32,
    pub puller_rdma_id: u8,
    pub puller_rdma_seqnum: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NackBody {
    pub dst_ep: u8,
    pub src_ep: u8,
    pub src_gen: u8,
    pub session: u32,
    pub lib_seqnum: u16,
    pub nack_type: u8,
}

/// A decoded packet: the peer index from `omx_pkt_head` plus the
/// ptype-selected body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub dst_src_peer_index: u16,
    pub body: Body,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Truc(TrucBody),
    Connect(ConnectBody),
    Tiny(DataBody),
    Small(DataBody),
    MediumFrag(MediumFragBody),
    Rendezvous(RendezvousBody),
    PullRequest(PullRequestBody),
    PullReply(PullReplyBody),
    Notify(NotifyBody),
    NackLib(NackBody),
    NackMcp(NackBody),
}

impl Body {
    pub fn ptype(&self) -> PacketType {
        match self {
            Body::Truc(_) => PacketType::Truc,
            Body::Connect(_) => PacketType::Connect,
            Body::Tiny(_) => PacketType::Tiny,
            Body::Small(_) => PacketType::Small,
            Body::MediumFrag(_) => PacketType::MediumFrag,
            Body::Rendezvous(_) => PacketType::Rendezvous,
            Body::PullRequest(_) => PacketType::PullRequest,
            Body::PullReply(_) => PacketType::PullReply,
            Body::Notify(_) => PacketType::Notify,
            Body::NackLib(_) => PacketType::NackLib,
            Body::NackMcp(_) => PacketType::NackMcp,
        }
    }
}

/// `src_magic` as computed by the sender to let the pull responder locate
/// the requester's endpoint without trusting wire data (§6).
pub fn src_magic(endpoint_index: u32) -> u32 {
    (endpoint_index << 13) ^ 0x22111867
}

/// Encode `frame` into `buf` (cleared first), returning the number of bytes
/// written.
pub fn encode(frame: &Frame, buf: &mut Vec<u8>) -> usize {
    buf.clear();
    buf.extend_from_slice(&frame.dst_src_peer_index.to_le_bytes());
    buf.push(frame.body.ptype() as u8);

    match &frame.body {
        Body::Truc(b) => {
            buf.push(b.dst_ep);
            buf.push(b.src_ep);
            buf.push(b.src_gen);
            buf.push(b.length);
            buf.extend_from_slice(&[0u8; 3]);
            buf.extend_from_slice(&b.session.to_le_bytes());
            buf.extend_from_slice(&b.data);
        }
        Body::Connect(b) => {
            buf.push(b.dst_ep);
            buf.push(b.src_ep);
            buf.push(b.src_gen);
            buf.push(b.length);
            buf.extend_from_slice(&[0u8; 3]);
            buf.extend_from_slice(&b.lib_seqnum.to_le_bytes());
            buf.extend_from_slice(&b.dest_peer_index.to_le_bytes());
            buf.extend_from_slice(&b.src_mac_low32.to_le_bytes());
            buf.extend_from_slice(&b.data);
        }
        Body::Tiny(b) | Body::Small(b) => {
            b.header.encode(buf);
            buf.extend_from_slice(&b.data);
        }
        Body::MediumFrag(b) => {
            b.header.encode(buf);
            buf.extend_from_slice(&b.frag_length.to_le_bytes());
            buf.push(b.frag_seqnum);
            buf.push(b.frag_pipeline);
            buf.extend_from_slice(&[0u8; 4]);
            buf.extend_from_slice(&b.data);
        }
        Body::Rendezvous(b) => {
            b.header.encode(buf);
            buf.extend_from_slice(&b.msg_length.to_le_bytes());
            buf.push(b.rdma_id);
            buf.push(b.rdma_seqnum);
            buf.extend_from_slice(&b.rdma_offset.to_le_bytes());
        }
        Body::PullRequest(b) => {
            buf.push(b.dst_ep);
            buf.push(b.src_ep);
            buf.push(b.src_gen);
            buf.extend_from_slice(&b.session.to_le_bytes());
            buf.extend_from_slice(&b.length.to_le_bytes());
            buf.extend_from_slice(&b.puller_rdma_id.to_le_bytes());
            buf.extend_from_slice(&b.puller_offset.to_le_bytes());
            buf.extend_from_slice(&b.pulled_rdma_id.to_le_bytes());
            buf.extend_from_slice(&b.pulled_offset.to_le_bytes());
            buf.extend_from_slice(&b.src_pull_handle.to_le_bytes());
            buf.extend_from_slice(&b.src_magic.to_le_bytes());
            buf.extend_from_slice(&b.block_length.to_le_bytes());
            buf.extend_from_slice(&b.frame_index.to_le_bytes());
            buf.extend_from_slice(&b.first_frame_offset.to_le_bytes());
        }
        Body::PullReply(b) => {
            buf.extend_from_slice(&[0u8; 3]); // pad
            buf.extend_from_slice(&b.length.to_le_bytes());
            buf.extend_from_slice(&b.puller_rdma_id.to_le_bytes());
            buf.extend_from_slice(&b.puller_offset.to_le_bytes());
            buf.extend_from_slice(&b.dst_pull_handle.to_le_bytes());
            buf.extend_from_slice(&b.dst_magic.to_le_bytes());
            buf.push(b.frame_seqnum);
            buf.extend_from_slice(&b.frame_length.to_le_bytes());
            buf.extend_from_slice(&b.msg_offset.to_le_bytes());
            buf.extend_from_slice(&b.payload);
        }
        Body::Notify(b) => {
            b.header.encode(buf);
            buf.extend_from_slice(&b.total_length.to_le_bytes());
            buf.push(b.puller_rdma_id);
            buf.push(b.puller_rdma_seqnum);
        }
        Body::NackLib(b) | Body::NackMcp(b) => {
            buf.push(b.dst_ep);
            buf.push(b.src_ep);
            buf.push(b.src_gen);
            buf.extend_from_slice(&b.session.to_le_bytes());
            buf.extend_from_slice(&b.lib_seqnum.to_le_bytes());
            buf.push(b.nack_type);
        }
    }

    buf.len()
}

/// Decode a frame from `buf`. Checks: ptype valid, declared payload length
/// fits within `buf`, `buf` within [`MAX_FRAME_LEN`], peer index within
/// `peer_table_size`.
pub fn decode(buf: &[u8], peer_table_size: u16) -> Result<Frame, Error> {
    if buf.len() > MAX_FRAME_LEN {
        return Err(Error::InternalMiscEinval);
    }
    if buf.len() < 3 {
        return Err(Error::InternalMiscEinval);
    }
    let dst_src_peer_index = u16::from_le_bytes([buf[0], buf[1]]);
    if dst_src_peer_index >= peer_table_size {
        return Err(Error::InternalMiscEinval);
    }
    let ptype = PacketType::from_u8(buf[2]).ok_or(Error::InternalMiscEinval)?;
    let rest = &buf[3..];

    let body = match ptype {
        PacketType::Truc => {
            if rest.len() < 8 {
                return Err(Error::InternalMiscEinval);
            }
            let length = rest[3];
            let session = u32::from_le_bytes(rest[4..8].try_into().unwrap());
            let data = rest[8..].to_vec();
            check_len(length as usize, data.len())?;
            Body::Truc(TrucBody {
                dst_ep: rest[0],
                src_ep: rest[1],
                src_gen: rest[2],
                length,
                session,
                data,
            })
        }
        PacketType::Connect => {
            if rest.len() < 12 {
                return Err(Error::InternalMiscEinval);
            }
            let length = rest[3];
            let lib_seqnum = u16::from_le_bytes([rest[4], rest[5]]);
            let dest_peer_index = u16::from_le_bytes([rest[6], rest[7]]);
            let src_mac_low32 = u32::from_le_bytes(rest[8..12].try_into().unwrap());
            let data = rest[12..].to_vec();
            check_len(length as usize, data.len())?;
            Body::Connect(ConnectBody {
                dst_ep: rest[0],
                src_ep: rest[1],
                src_gen: rest[2],
                length,
                lib_seqnum,
                dest_peer_index,
                src_mac_low32,
                data,
            })
        }
        PacketType::Tiny | PacketType::Small => {
            let (header, used) = DataHeader::decode(rest)?;
            let data = rest[used..].to_vec();
            check_len(header.length as usize, data.len())?;
            let db = DataBody { header, data };
            if ptype == PacketType::Tiny {
                Body::Tiny(db)
            } else {
                Body::Small(db)
            }
        }
        PacketType::MediumFrag => {
            let (header, used) = DataHeader::decode(rest)?;
            let rest = &rest[used..];
            if rest.len() < 8 {
                return Err(Error::InternalMiscEinval);
            }
            let frag_length = u16::from_le_bytes([rest[0], rest[1]]);
            let frag_seqnum = rest[2];
            let frag_pipeline = rest[3];
            let data = rest[8..].to_vec();
            check_len(frag_length as usize, data.len())?;
            Body::MediumFrag(MediumFragBody {
                header,
                frag_length,
                frag_seqnum,
                frag_pipeline,
                data,
            })
        }
        PacketType::Rendezvous => {
            let (header, used) = DataHeader::decode(rest)?;
            let rest = &rest[used..];
            if rest.len() < 8 {
                return Err(Error::InternalMiscEinval);
            }
            let msg_length = u32::from_le_bytes(rest[0..4].try_into().unwrap());
            let rdma_id = rest[4];
            let rdma_seqnum = rest[5];
            let rdma_offset = u16::from_le_bytes([rest[6], rest[7]]);
            Body::Rendezvous(RendezvousBody {
                header,
                msg_length,
                rdma_id,
                rdma_seqnum,
                rdma_offset,
            })
        }
        PacketType::PullRequest => {
            if rest.len() < 3 + 4 * 8 + 2 * 3 {
                return Err(Error::InternalMiscEinval);
            }
            let dst_ep = rest[0];
            let src_ep = rest[1];
            let src_gen = rest[2];
            let mut o = 3;
            let session = take_u32(rest, &mut o);
            let length = take_u32(rest, &mut o);
            let puller_rdma_id = take_u32(rest, &mut o);
            let puller_offset = take_u32(rest, &mut o);
            let pulled_rdma_id = take_u32(rest, &mut o);
            let pulled_offset = take_u32(rest, &mut o);
            let src_pull_handle = take_u32(rest, &mut o);
            let src_magic = take_u32(rest, &mut o);
            let block_length = take_u16(rest, &mut o);
            let frame_index = take_u16(rest, &mut o);
            let first_frame_offset = take_u16(rest, &mut o);
            Body::PullRequest(PullRequestBody {
                dst_ep,
                src_ep,
                src_gen,
                session,
                length,
                puller_rdma_id,
                puller_offset,
                pulled_rdma_id,
                pulled_offset,
                src_pull_handle,
                src_magic,
                block_length,
                frame_index,
                first_frame_offset,
            })
        }
        PacketType::PullReply => {
            if rest.len() < 3 + 4 * 5 + 1 + 2 + 4 {
                return Err(Error::InternalMiscEinval);
            }
            let mut o = 3; // 3 bytes pad
            let length = take_u32(rest, &mut o);
            let puller_rdma_id = take_u32(rest, &mut o);
            let puller_offset = take_u32(rest, &mut o);
            let dst_pull_handle = take_u32(rest, &mut o);
            let dst_magic = take_u32(rest, &mut o);
            let frame_seqnum = rest[o];
            o += 1;
            let frame_length = take_u16(rest, &mut o);
            let msg_offset = take_u32(rest, &mut o);
            let payload = rest[o..].to_vec();
            check_len(frame_length as usize, payload.len())?;
            Body::PullReply(PullReplyBody {
                length,
                puller_rdma_id,
                puller_offset,
                dst_pull_handle,
                dst_magic,
                frame_seqnum,
                frame_length,
                msg_offset,
                payload,
            })
        }
        PacketType::Notify => {
            let (header, used) = DataHeader::decode(rest)?;
            let rest = &rest[used..];
            if rest.len() < 6 {
                return Err(Error::InternalMiscEinval);
            }
            let total_length = u32::from_le_bytes(rest[0..4].try_into().unwrap());
            let puller_rdma_id = rest[4];
            let puller_rdma_seqnum = rest[5];
            Body::Notify(NotifyBody {
                header,
                total_length,
                puller_rdma_id,
                puller_rdma_seqnum,
            })
        }
        PacketType::NackLib | PacketType::NackMcp => {
            if rest.len() < 10 {
                return Err(Error::InternalMiscEinval);
            }
            let mut o = 3;
            let session = take_u32(rest, &mut o);
            let lib_seqnum = take_u16(rest, &mut o);
            let nack_type = rest[o];
            let body = NackBody {
                dst_ep: rest[0],
                src_ep: rest[1],
                src_gen: rest[2],
                session,
                lib_seqnum,
                nack_type,
            };
            if ptype == PacketType::NackLib {
                Body::NackLib(body)
            } else {
                Body::NackMcp(body)
            }
        }
    };

    Ok(Frame {
        dst_src_peer_index,
        body,
    })
}

fn check_len(declared: usize, actual: usize) -> Result<(), Error> {
    if declared != actual {
        return Err(Error::InternalMiscEinval);
    }
    Ok(())
}

fn take_u32(buf: &[u8], o: &mut usize) -> u32 {
    let v = u32::from_le_bytes(buf[*o..*o + 4].try_into().unwrap());
    *o += 4;
    v
}

fn take_u16(buf: &[u8], o: &mut usize) -> u16 {
    let v = u16::from_le_bytes(buf[*o..*o + 2].try_into().unwrap());
    *o += 2;
    v
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> DataHeader {
        DataHeader {
            dst_ep: 1,
            src_ep: 2,
            src_gen: 3,
            length: 6,
            lib_seqnum: 42,
            lib_piggyack: 7,
            match_a: 0x87654321,
            match_b: 0x12345678,
            session: 0xdead_beef,
        }
    }

    #[test]
    fn tiny_round_trip() {
        let frame = Frame {
            dst_src_peer_index: 9,
            body: Body::Tiny(DataBody {
                header: header(),
                data: b"hello\0".to_vec(),
            }),
        };
        let mut buf = Vec::new();
        encode(&frame, &mut buf);
        let decoded = decode(&buf, 16).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn medium_frag_round_trip() {
        let frame = Frame {
            dst_src_peer_index: 1,
            body: Body::MediumFrag(MediumFragBody {
                header: header(),
                frag_length: 4,
                frag_seqnum: 1,
                frag_pipeline: 0,
                data: vec![1, 2, 3, 4],
            }),
        };
        let mut buf = Vec::new();
        encode(&frame, &mut buf);
        assert_eq!(decode(&buf, 16).unwrap(), frame);
    }

    #[test]
    fn pull_request_round_trip() {
        let frame = Frame {
            dst_src_peer_index: 3,
            body: Body::PullRequest(PullRequestBody {
                dst_ep: 0,
                src_ep: 1,
                src_gen: 2,
                session: 5,
                length: 8192 * 7,
                puller_rdma_id: 1,
                puller_offset: 0,
                pulled_rdma_id: 2,
                pulled_offset: 0,
                src_pull_handle: 77,
                src_magic: src_magic(1),
                block_length: (8192u32 * 7).min(u16::MAX as u32) as u16,
                frame_index: 0,
                first_frame_offset: 0,
            }),
        };
        let mut buf = Vec::new();
        encode(&frame, &mut buf);
        assert_eq!(decode(&buf, 16).unwrap(), frame);
    }

    #[test]
    fn pull_reply_round_trip() {
        let frame = Frame {
            dst_src_peer_index: 3,
            body: Body::PullReply(PullReplyBody {
                length: 100,
                puller_rdma_id: 1,
                puller_offset: 0,
                dst_pull_handle: 9,
                dst_magic: src_magic(2),
                frame_seqnum: 0,
                frame_length: 4,
                msg_offset: 0,
                payload: vec![9, 9, 9, 9],
            }),
        };
        let mut buf = Vec::new();
        encode(&frame, &mut buf);
        assert_eq!(decode(&buf, 16).unwrap(), frame);
    }

    #[test]
    fn rejects_peer_index_out_of_range() {
        let frame = Frame {
            dst_src_peer_index: 20,
            body: Body::Tiny(DataBody {
                header: header(),
                data: b"hello\0".to_vec(),
            }),
        };
        let mut buf = Vec::new();
        encode(&frame, &mut buf);
        assert!(decode(&buf, 16).is_err());
    }

    #[test]
    fn rejects_length_mismatch() {
        let mut header = header();
        header.length = 99;
        let frame = Frame {
            dst_src_peer_index: 1,
            body: Body::Tiny(DataBody {
                header,
                data: b"hello\0".to_vec(),
            }),
        };
        let mut buf = Vec::new();
        encode(&frame, &mut buf);
        assert!(decode(&buf, 16).is_err());
    }

    #[test]
    fn src_magic_matches_formula() {
        assert_eq!(src_magic(1), (1u32 << 13) ^ 0x22111867);
    }
}
