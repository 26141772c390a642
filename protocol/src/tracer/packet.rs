//! Tracer packet encoding.
//!
//! ```text
//! broadcast header {gnode_id:u8, level:u8, gnode_ttl:u8, sub_id:u8, size:u32, flags:u8}
//! tracer header    {flags:u8, hop_count:u16, first_open_chunk:u16}
//! chunk            {node_id:u8, rtt:u32, gcount:u32} * hop_count
//! border blocks    (when the tracer header has TRCR_BBLOCK)
//! ```
//!
//! `size` counts every byte after the broadcast header.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::codec::{check_limit, expect_end, BufExt, DecodeError};
use crate::config::{MAX_PACKET_SIZE, MAX_TRACER_HOPS};
use crate::map::{NodeId, Rtt};

use super::bblock::{split_border_blocks, BorderBlock};

pub const BCAST_HEADER_LEN: usize = 9;
pub const TRACER_HEADER_LEN: usize = 5;
pub const CHUNK_LEN: usize = 9;

/// Broadcast flag: chunk 0 is the node that started this flood.
pub const BCAST_STARTER: u8 = 1 << 0;
/// Broadcast flag: an open packet built by an opener.
pub const BCAST_OPENER: u8 = 1 << 1;

/// Tracer flag: border blocks follow the chunks.
pub const TRCR_BBLOCK: u8 = 1 << 0;
/// Tracer flag: at least one block is an Internet-gateway block.
pub const TRCR_IGW: u8 = 1 << 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BcastHeader {
    /// Gnode of level `level + 1` the flood is confined to.
    pub gnode_id: NodeId,
    pub level: u8,
    pub gnode_ttl: u8,
    /// Flood originator, to tell concurrent starters apart.
    pub sub_id: u8,
    pub flags: u8,
}

/// One hop of the path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TracerChunk {
    pub node: NodeId,
    /// Rtt between this hop and the previous one.
    pub rtt: Rtt,
    /// Member count of this hop when it was recorded.
    pub gcount: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TracerPacket {
    pub bcast: BcastHeader,
    /// Index of the first chunk added during the open phase.
    pub first_open_chunk: u16,
    pub chunks: Vec<TracerChunk>,
    pub blocks: Vec<BorderBlock>,
}

impl TracerPacket {
    pub fn hops(&self) -> usize {
        self.chunks.len()
    }

    pub fn last_chunk(&self) -> Option<&TracerChunk> {
        self.chunks.last()
    }

    fn tracer_flags(&self, levels: u8) -> u8 {
        let mut flags = 0;
        if !self.blocks.is_empty() {
            flags |= TRCR_BBLOCK;
        }
        if self.blocks.iter().any(|b| b.is_gateway(levels)) {
            flags |= TRCR_IGW;
        }
        flags
    }

    pub fn encode(&self, levels: u8) -> Bytes {
        let blocks_len: usize = self.blocks.iter().map(BorderBlock::encoded_len).sum();
        let size = TRACER_HEADER_LEN + self.chunks.len() * CHUNK_LEN + blocks_len;

        let mut buf = BytesMut::with_capacity(BCAST_HEADER_LEN + size);
        buf.put_u8(self.bcast.gnode_id);
        buf.put_u8(self.bcast.level);
        buf.put_u8(self.bcast.gnode_ttl);
        buf.put_u8(self.bcast.sub_id);
        buf.put_u32(size as u32);
        buf.put_u8(self.bcast.flags);

        buf.put_u8(self.tracer_flags(levels));
        buf.put_u16(self.chunks.len() as u16);
        buf.put_u16(self.first_open_chunk);
        for chunk in &self.chunks {
            buf.put_u8(chunk.node);
            buf.put_u32(chunk.rtt);
            buf.put_u32(chunk.gcount);
        }
        for block in &self.blocks {
            block.encode(&mut buf);
        }
        buf.freeze()
    }

    /// Decodes a tracer body. Header fields are validated against the
    /// remaining buffer before anything is allocated.
    pub fn decode(raw: &[u8], levels: u8) -> Result<Self, DecodeError> {
        check_limit("tracer packet", raw.len(), MAX_PACKET_SIZE)?;
        let mut buf = raw;
        let gnode_id = buf.try_u8("bcast gnode_id")?;
        let level = buf.try_u8("bcast level")?;
        let gnode_ttl = buf.try_u8("bcast ttl")?;
        let sub_id = buf.try_u8("bcast sub_id")?;
        let size = buf.try_u32("bcast size")? as usize;
        let bcast_flags = buf.try_u8("bcast flags")?;
        if size != buf.len() {
            return Err(DecodeError::Malformed(format!(
                "bcast size {size}, {} bytes follow",
                buf.len()
            )));
        }
        if level >= levels {
            return Err(DecodeError::Malformed(format!(
                "tracer level {level} in a {levels}-level network"
            )));
        }

        let flags = buf.try_u8("tracer flags")?;
        let hops = buf.try_u16("tracer hops")? as usize;
        let first_open_chunk = buf.try_u16("tracer first_open_chunk")?;
        if hops == 0 {
            return Err(DecodeError::Malformed("tracer without hops".into()));
        }
        check_limit("tracer hops", hops, MAX_TRACER_HOPS)?;
        if first_open_chunk as usize > hops {
            return Err(DecodeError::Malformed(format!(
                "first_open_chunk {first_open_chunk} beyond {hops} hops"
            )));
        }
        buf.ensure(hops * CHUNK_LEN, "tracer chunks")?;
        let mut chunks = Vec::with_capacity(hops);
        for _ in 0..hops {
            chunks.push(TracerChunk {
                node: buf.try_u8("chunk node")?,
                rtt: buf.try_u32("chunk rtt")?,
                gcount: buf.try_u32("chunk gcount")?,
            });
        }

        let blocks = if flags & TRCR_BBLOCK != 0 {
            split_border_blocks(buf, levels)?
        } else {
            expect_end(&buf, "tracer packet")?;
            Vec::new()
        };

        Ok(Self {
            bcast: BcastHeader {
                gnode_id,
                level,
                gnode_ttl,
                sub_id,
                flags: bcast_flags,
            },
            first_open_chunk,
            chunks,
            blocks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::BnodeLink;

    fn sample() -> TracerPacket {
        TracerPacket {
            bcast: BcastHeader {
                gnode_id: 2,
                level: 0,
                gnode_ttl: 200,
                sub_id: 9,
                flags: BCAST_STARTER,
            },
            first_open_chunk: 0,
            chunks: vec![
                TracerChunk {
                    node: 9,
                    rtt: 0,
                    gcount: 1,
                },
                TracerChunk {
                    node: 4,
                    rtt: 25,
                    gcount: 1,
                },
            ],
            blocks: Vec::new(),
        }
    }

    #[test]
    fn roundtrip_without_blocks() {
        let pkt = sample();
        let raw = pkt.encode(4);
        assert_eq!(raw.len(), BCAST_HEADER_LEN + TRACER_HEADER_LEN + 2 * CHUNK_LEN);
        assert_eq!(TracerPacket::decode(&raw, 4).unwrap(), pkt);
    }

    #[test]
    fn roundtrip_with_blocks() {
        let mut pkt = sample();
        pkt.blocks.push(BorderBlock {
            gids: vec![4, 2, 1, 10],
            links: vec![BnodeLink {
                gnode: 7,
                level: 1,
                rtt: 33,
            }],
        });
        let raw = pkt.encode(4);
        assert_eq!(TracerPacket::decode(&raw, 4).unwrap(), pkt);
    }

    #[test]
    fn size_field_must_match() {
        let mut raw = sample().encode(4).to_vec();
        raw.push(0);
        assert!(matches!(
            TracerPacket::decode(&raw, 4),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn hop_count_is_checked_against_the_buffer() {
        let mut raw = sample().encode(4).to_vec();
        // hop_count lives right after the tracer flags byte.
        raw[BCAST_HEADER_LEN + 1..BCAST_HEADER_LEN + 3].copy_from_slice(&200u16.to_be_bytes());
        assert!(matches!(
            TracerPacket::decode(&raw, 4),
            Err(DecodeError::Truncated { .. })
        ));
    }

    #[test]
    fn level_outside_the_network_is_rejected() {
        let mut pkt = sample();
        pkt.bcast.level = 4;
        assert!(TracerPacket::decode(&pkt.encode(4), 4).is_err());
    }
}
