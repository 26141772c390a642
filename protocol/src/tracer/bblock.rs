//! Border-node blocks.
//!
//! A border node forwarding a tracer packet appends a block describing its
//! outward links, so every node of the gnode learns who the border nodes
//! are:
//!
//! ```text
//! {bnode_levels:u8, link_count:u16, gid[bnode_levels]:u8,
//!  {gnode:u8, level:u8, rtt:u32}*link_count}
//! ```
//!
//! `gid` holds the bnode's ids from the block level upward, so the block
//! level is `levels - bnode_levels`. A block whose links all point one level
//! above the top of the network announces an Internet gateway instead.

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::codec::{check_limit, BufExt, DecodeError};
use crate::config::{MAX_BNODE_BLOCKS, MAX_BNODE_LINKS};
use crate::map::{BnodeLink, NodeId};

const BLOCK_HEADER_LEN: usize = 3;
const BLOCK_LINK_LEN: usize = 6;

/// `BNODEBLOCK_SZ(levels, links)`: encoded size of a block.
pub const fn bnode_block_size(bnode_levels: usize, links: usize) -> usize {
    BLOCK_HEADER_LEN + bnode_levels + BLOCK_LINK_LEN * links
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BorderBlock {
    /// The bnode's ids from the block level upward.
    pub gids: Vec<u8>,
    pub links: Vec<BnodeLink>,
}

impl BorderBlock {
    /// Level of the border (g)node this block describes.
    pub fn level(&self, levels: u8) -> u8 {
        levels.saturating_sub(self.gids.len() as u8)
    }

    /// The border (g)node's id at its own level.
    pub fn bnode(&self) -> NodeId {
        self.gids.first().copied().unwrap_or(0)
    }

    /// True for an Internet-gateway block.
    pub fn is_gateway(&self, levels: u8) -> bool {
        !self.links.is_empty() && self.links.iter().all(|l| l.level == levels + 1)
    }

    pub fn encoded_len(&self) -> usize {
        bnode_block_size(self.gids.len(), self.links.len())
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.gids.len() as u8);
        buf.put_u16(self.links.len() as u16);
        buf.put_slice(&self.gids);
        for link in &self.links {
            buf.put_u8(link.gnode);
            buf.put_u8(link.level);
            buf.put_u32(link.rtt);
        }
    }
}

/// Parses every block of `buf`.
///
/// Either all blocks parse or none is returned: a single block whose link
/// count overruns the buffer rejects the whole list.
pub fn split_border_blocks(buf: &[u8], levels: u8) -> Result<Vec<BorderBlock>, DecodeError> {
    let mut rest = buf;
    let mut blocks = Vec::new();
    while !rest.is_empty() {
        check_limit("bnode blocks", blocks.len() + 1, MAX_BNODE_BLOCKS)?;

        let bnode_levels = rest.try_u8("bblock levels")? as usize;
        let link_count = rest.try_u16("bblock link count")? as usize;
        if bnode_levels == 0 || bnode_levels > levels as usize {
            return Err(DecodeError::Malformed(format!(
                "bblock with {bnode_levels} levels, network has {levels}"
            )));
        }
        check_limit("bblock links", link_count, MAX_BNODE_LINKS)?;
        let body = bnode_block_size(bnode_levels, link_count) - BLOCK_HEADER_LEN;
        rest.ensure(body, "bblock body")?;

        let gids = rest.try_bytes(bnode_levels, "bblock gids")?;
        let mut links = Vec::with_capacity(link_count);
        for _ in 0..link_count {
            let link = BnodeLink {
                gnode: rest.try_u8("bblock link gnode")?,
                level: rest.try_u8("bblock link level")?,
                rtt: rest.try_u32("bblock link rtt")?,
            };
            if link.level == 0 || link.level > levels + 1 {
                return Err(DecodeError::Malformed(format!(
                    "bblock link at level {}",
                    link.level
                )));
            }
            links.push(link);
        }
        blocks.push(BorderBlock { gids, links });
    }
    Ok(blocks)
}
