//! # Packet Envelope
//!
//! Every datagram between two nodes is a small fixed header followed by an
//! op-specific body:
//!
//! ```text
//! {version:u8, op:u8, id:u32, body_len:u32, body[body_len]}
//! ```
//!
//! `id` is the radar scan id for echoes, the QSPN round id for QSPN
//! packets, the broadcast id for plain tracer packets and the request id for
//! map requests (copied into the reply). The source address and the
//! interface a packet came in on are not part of the frame: the transport
//! fills them in.

use std::fmt;
use std::net::IpAddr;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::codec::{check_limit, expect_end, BufExt, DecodeError};
use crate::config::MAX_PACKET_SIZE;

/// Version byte of the envelope.
pub const WIRE_VERSION: u8 = 1;

/// Envelope header size.
pub const FRAME_HEADER_LEN: usize = 10;

// ---------------------------------------------------------------------------
// Ops
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PacketOp {
    EchoMe,
    EchoReply,
    TracerPkt,
    TracerPktConnect,
    QspnClose,
    QspnOpen,
    GetIntMap,
    PutIntMap,
    GetExtMap,
    PutExtMap,
    GetBnodeMap,
    PutBnodeMap,
}

impl PacketOp {
    pub fn code(self) -> u8 {
        match self {
            PacketOp::EchoMe => 1,
            PacketOp::EchoReply => 2,
            PacketOp::TracerPkt => 3,
            PacketOp::TracerPktConnect => 4,
            PacketOp::QspnClose => 5,
            PacketOp::QspnOpen => 6,
            PacketOp::GetIntMap => 10,
            PacketOp::PutIntMap => 11,
            PacketOp::GetExtMap => 12,
            PacketOp::PutExtMap => 13,
            PacketOp::GetBnodeMap => 14,
            PacketOp::PutBnodeMap => 15,
        }
    }

    pub fn from_code(code: u8) -> Result<Self, DecodeError> {
        Ok(match code {
            1 => PacketOp::EchoMe,
            2 => PacketOp::EchoReply,
            3 => PacketOp::TracerPkt,
            4 => PacketOp::TracerPktConnect,
            5 => PacketOp::QspnClose,
            6 => PacketOp::QspnOpen,
            10 => PacketOp::GetIntMap,
            11 => PacketOp::PutIntMap,
            12 => PacketOp::GetExtMap,
            13 => PacketOp::PutExtMap,
            14 => PacketOp::GetBnodeMap,
            15 => PacketOp::PutBnodeMap,
            other => return Err(DecodeError::Malformed(format!("packet op {other}"))),
        })
    }
}

impl fmt::Display for PacketOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PacketOp::EchoMe => "ECHO_ME",
            PacketOp::EchoReply => "ECHO_REPLY",
            PacketOp::TracerPkt => "TRACER_PKT",
            PacketOp::TracerPktConnect => "TRACER_PKT_CONNECT",
            PacketOp::QspnClose => "QSPN_CLOSE",
            PacketOp::QspnOpen => "QSPN_OPEN",
            PacketOp::GetIntMap => "GET_INT_MAP",
            PacketOp::PutIntMap => "PUT_INT_MAP",
            PacketOp::GetExtMap => "GET_EXT_MAP",
            PacketOp::PutExtMap => "PUT_EXT_MAP",
            PacketOp::GetBnodeMap => "GET_BNODE_MAP",
            PacketOp::PutBnodeMap => "PUT_BNODE_MAP",
        };
        f.write_str(name)
    }
}

/// The three maps a neighbor can be asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MapKind {
    Internal,
    External,
    Border,
}

impl MapKind {
    pub fn request_op(self) -> PacketOp {
        match self {
            MapKind::Internal => PacketOp::GetIntMap,
            MapKind::External => PacketOp::GetExtMap,
            MapKind::Border => PacketOp::GetBnodeMap,
        }
    }

    pub fn reply_op(self) -> PacketOp {
        match self {
            MapKind::Internal => PacketOp::PutIntMap,
            MapKind::External => PacketOp::PutExtMap,
            MapKind::Border => PacketOp::PutBnodeMap,
        }
    }

    /// The map asked for by a `GET_*` op.
    pub fn requested_by(op: PacketOp) -> Option<Self> {
        match op {
            PacketOp::GetIntMap => Some(MapKind::Internal),
            PacketOp::GetExtMap => Some(MapKind::External),
            PacketOp::GetBnodeMap => Some(MapKind::Border),
            _ => None,
        }
    }

    /// The map carried by a `PUT_*` op.
    pub fn carried_by(op: PacketOp) -> Option<Self> {
        match op {
            PacketOp::PutIntMap => Some(MapKind::Internal),
            PacketOp::PutExtMap => Some(MapKind::External),
            PacketOp::PutBnodeMap => Some(MapKind::Border),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Packet
// ---------------------------------------------------------------------------

/// One datagram, decoded envelope plus raw body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub op: PacketOp,
    pub id: u32,
    /// Source address (filled by the transport on receive).
    pub from: IpAddr,
    /// Interface the packet arrived on, when known.
    pub iface: Option<String>,
    pub body: Bytes,
}

impl Packet {
    pub fn new(op: PacketOp, id: u32, from: IpAddr, body: impl Into<Bytes>) -> Self {
        Self {
            op,
            id,
            from,
            iface: None,
            body: body.into(),
        }
    }

    pub fn to_frame(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + self.body.len());
        buf.put_u8(WIRE_VERSION);
        buf.put_u8(self.op.code());
        buf.put_u32(self.id);
        buf.put_u32(self.body.len() as u32);
        buf.put_slice(&self.body);
        buf.freeze()
    }

    pub fn from_frame(from: IpAddr, iface: Option<String>, raw: &[u8]) -> Result<Self, DecodeError> {
        let mut buf = raw;
        let version = buf.try_u8("frame version")?;
        if version != WIRE_VERSION {
            return Err(DecodeError::Version(version));
        }
        let op = PacketOp::from_code(buf.try_u8("frame op")?)?;
        let id = buf.try_u32("frame id")?;
        let len = buf.try_u32("frame body length")? as usize;
        check_limit("frame body", len, MAX_PACKET_SIZE)?;
        let body = buf.try_bytes(len, "frame body")?;
        expect_end(&buf, "frame")?;
        Ok(Self {
            op,
            id,
            from,
            iface,
            body: Bytes::from(body),
        })
    }
}

// ---------------------------------------------------------------------------
// Echo Body
// ---------------------------------------------------------------------------

const ECHO_FLAG_SCANNING: u8 = 1 << 0;
const ECHO_FLAG_HOOKING: u8 = 1 << 1;

/// Optional one-byte flag field of `ECHO_ME` / `ECHO_REPLY`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EchoFlags {
    /// The sender is itself still scanning (bootstrap).
    pub scanning: bool,
    /// The sender is hooking and not part of a gnode yet.
    pub hooking: bool,
}

impl EchoFlags {
    /// Empty when no flag is set.
    pub fn encode(self) -> Bytes {
        let mut bits = 0u8;
        if self.scanning {
            bits |= ECHO_FLAG_SCANNING;
        }
        if self.hooking {
            bits |= ECHO_FLAG_HOOKING;
        }
        if bits == 0 {
            Bytes::new()
        } else {
            Bytes::copy_from_slice(&[bits])
        }
    }

    pub fn decode(body: &[u8]) -> Result<Self, DecodeError> {
        match body {
            [] => Ok(Self::default()),
            [bits] => Ok(Self {
                scanning: bits & ECHO_FLAG_SCANNING != 0,
                hooking: bits & ECHO_FLAG_HOOKING != 0,
            }),
            _ => Err(DecodeError::Malformed(format!(
                "echo body of {} bytes",
                body.len()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> IpAddr {
        "10.0.0.1".parse().unwrap()
    }

    #[test]
    fn frame_roundtrip() {
        let pkt = Packet::new(PacketOp::QspnClose, 77, addr(), vec![1u8, 2, 3]);
        let back = Packet::from_frame(addr(), None, &pkt.to_frame()).unwrap();
        assert_eq!(back, pkt);
    }

    #[test]
    fn every_op_code_decodes_to_itself() {
        for code in 0..=u8::MAX {
            if let Ok(op) = PacketOp::from_code(code) {
                assert_eq!(op.code(), code);
            }
        }
    }

    #[test]
    fn lying_body_length_is_rejected() {
        let pkt = Packet::new(PacketOp::EchoMe, 1, addr(), vec![0u8; 4]);
        let mut frame = pkt.to_frame().to_vec();
        frame.truncate(frame.len() - 2);
        assert!(matches!(
            Packet::from_frame(addr(), None, &frame),
            Err(DecodeError::Truncated { .. })
        ));

        let mut huge = vec![WIRE_VERSION, 1, 0, 0, 0, 1];
        huge.extend_from_slice(&u32::MAX.to_be_bytes());
        assert!(matches!(
            Packet::from_frame(addr(), None, &huge),
            Err(DecodeError::TooLarge { .. })
        ));
    }

    #[test]
    fn echo_flags_are_optional() {
        assert_eq!(EchoFlags::decode(&[]).unwrap(), EchoFlags::default());
        let flags = EchoFlags {
            scanning: true,
            hooking: false,
        };
        assert_eq!(EchoFlags::decode(&flags.encode()).unwrap(), flags);
        assert!(EchoFlags::default().encode().is_empty());
        assert!(EchoFlags::decode(&[1, 2]).is_err());
    }

    #[test]
    fn map_ops_pair_up() {
        for kind in [MapKind::Internal, MapKind::External, MapKind::Border] {
            assert_eq!(MapKind::requested_by(kind.request_op()), Some(kind));
            assert_eq!(MapKind::carried_by(kind.reply_op()), Some(kind));
        }
    }
}
