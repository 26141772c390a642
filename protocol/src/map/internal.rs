//! # Internal Map
//!
//! The level-0 view of the world: one [`Node`] slot per address in our own
//! level-1 gnode, indexed by the last byte of the address. The slot flagged
//! `ME` is this node; its rnodes are our direct links. Every other live slot
//! lists the routes we know towards it, each one through a direct neighbor.
//!
//! ## External rnodes
//!
//! Neighbors living in a different gnode cannot be addressed by slot, so the
//! map keeps them in a small arena of [`ExtRnode`]s holding their full
//! quadro-group. Links of the `ME` slot reference them by arena index.
//!
//! ## Packing
//!
//! ```text
//! {version:u8, me:u8, ext_count:u16, {id:u16, quadro}*ext_count,
//!  node_count:u16, {pos:u8, flags:u32, brdcast:u32, links:u8,
//!                   {kind:u8, target:u16, trtt:u32}*links}*node_count}
//! ```
//!
//! Only non-void slots are written. The decoder builds a fresh map and
//! returns it only when the whole buffer parsed.

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::codec::{check_limit, expect_end, BufExt, DecodeError};
use crate::config::{MAP_FORMAT_VERSION, MAXGROUPNODE, MAXROUTES, MAX_MAP_SIZE};

use super::node::{ExtRnodeId, Node, NodeFlags, NodeId, Rnode, RnodeTarget};
use super::quadro::QuadroGroup;

/// Arena bound: one entry per direct neighbor outside our gnode.
pub const MAX_EXT_RNODES: usize = MAXGROUPNODE * 4;

const TARGET_LOCAL: u8 = 0;
const TARGET_EXTERNAL: u8 = 1;

/// A direct neighbor that belongs to a different gnode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtRnode {
    pub quadg: QuadroGroup,
}

/// The level-0 map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalMap {
    nodes: Vec<Node>,
    ext_rnodes: Vec<Option<ExtRnode>>,
    me: NodeId,
}

/// `init_internal_map()`: 256 void slots.
pub fn init_internal_map() -> InternalMap {
    InternalMap::new(0)
}

impl Default for InternalMap {
    fn default() -> Self {
        init_internal_map()
    }
}

impl InternalMap {
    /// An all-void map whose `ME` slot is `me`.
    pub fn new(me: NodeId) -> Self {
        let mut nodes = vec![Node::void(); MAXGROUPNODE];
        nodes[me as usize].flags = NodeFlags::ME;
        Self {
            nodes,
            ext_rnodes: Vec::new(),
            me,
        }
    }

    pub fn me(&self) -> NodeId {
        self.me
    }

    pub fn node(&self, pos: NodeId) -> &Node {
        &self.nodes[pos as usize]
    }

    pub fn node_mut(&mut self, pos: NodeId) -> &mut Node {
        &mut self.nodes[pos as usize]
    }

    pub fn me_node(&self) -> &Node {
        self.node(self.me)
    }

    pub fn me_node_mut(&mut self) -> &mut Node {
        let me = self.me;
        self.node_mut(me)
    }

    /// Live slots with their positions, `ME` included.
    pub fn iter_alive(&self) -> impl Iterator<Item = (NodeId, &Node)> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| !node.is_void())
            .map(|(pos, node)| (pos as NodeId, node))
    }

    /// Number of live slots, `ME` included.
    pub fn alive_count(&self) -> usize {
        self.nodes.iter().filter(|node| !node.is_void()).count()
    }

    /// Lowest void slot, if any.
    pub fn first_void(&self) -> Option<NodeId> {
        self.nodes
            .iter()
            .position(Node::is_void)
            .map(|pos| pos as NodeId)
    }

    /// Clears `VOID` on `pos`. Returns true when the slot was void.
    pub fn revive(&mut self, pos: NodeId) -> bool {
        let node = self.node_mut(pos);
        let was_void = node.is_void();
        node.flags.remove(NodeFlags::VOID | NodeFlags::OLD);
        was_void
    }

    /// Resets `pos` to a void slot. The `ME` slot is never voided.
    /// Returns true when the slot was alive.
    pub fn void_node(&mut self, pos: NodeId) -> bool {
        if pos == self.me {
            return false;
        }
        let node = self.node_mut(pos);
        let was_alive = !node.is_void();
        *node = Node::void();
        was_alive
    }

    // -----------------------------------------------------------------------
    // External rnodes
    // -----------------------------------------------------------------------

    pub fn ext_rnode(&self, id: ExtRnodeId) -> Option<&ExtRnode> {
        self.ext_rnodes.get(id as usize).and_then(Option::as_ref)
    }

    pub fn find_ext_rnode(&self, quadg: &QuadroGroup) -> Option<ExtRnodeId> {
        self.ext_rnodes
            .iter()
            .position(|slot| slot.as_ref().is_some_and(|ext| &ext.quadg == quadg))
            .map(|id| id as ExtRnodeId)
    }

    /// Stores `quadg` in the arena, reusing an existing entry for the same
    /// address or the first free slot. `None` when the arena is full.
    pub fn alloc_ext_rnode(&mut self, quadg: QuadroGroup) -> Option<ExtRnodeId> {
        if let Some(id) = self.find_ext_rnode(&quadg) {
            return Some(id);
        }
        let entry = Some(ExtRnode { quadg });
        if let Some(free) = self.ext_rnodes.iter().position(Option::is_none) {
            self.ext_rnodes[free] = entry;
            return Some(free as ExtRnodeId);
        }
        if self.ext_rnodes.len() >= MAX_EXT_RNODES {
            return None;
        }
        self.ext_rnodes.push(entry);
        Some((self.ext_rnodes.len() - 1) as ExtRnodeId)
    }

    pub fn free_ext_rnode(&mut self, id: ExtRnodeId) -> Option<ExtRnode> {
        self.ext_rnodes.get_mut(id as usize).and_then(Option::take)
    }

    pub fn ext_rnodes(&self) -> impl Iterator<Item = (ExtRnodeId, &ExtRnode)> {
        self.ext_rnodes
            .iter()
            .enumerate()
            .filter_map(|(id, slot)| slot.as_ref().map(|ext| (id as ExtRnodeId, ext)))
    }

    // -----------------------------------------------------------------------
    // Route maintenance
    // -----------------------------------------------------------------------

    /// Removes every route going through `gateway`.
    ///
    /// Slots left without any route are voided. Returns the positions whose
    /// routes changed and, separately, those that were voided.
    pub fn drop_gateway(&mut self, gateway: RnodeTarget) -> (Vec<NodeId>, Vec<NodeId>) {
        let me = self.me;
        let mut touched = Vec::new();
        let mut voided = Vec::new();
        for (pos, node) in self.nodes.iter_mut().enumerate() {
            let pos = pos as NodeId;
            if pos == me || node.is_void() {
                continue;
            }
            if node.remove_rnode(gateway) {
                touched.push(pos);
                if node.rnodes().is_empty() {
                    *node = Node::void();
                    voided.push(pos);
                }
            }
        }
        (touched, voided)
    }

    /// Positions of our direct level-0 neighbors.
    pub fn local_links(&self) -> Vec<NodeId> {
        self.me_node()
            .rnodes()
            .iter()
            .filter_map(|r| match r.target {
                RnodeTarget::Local(pos) => Some(pos),
                RnodeTarget::External(_) => None,
            })
            .collect()
    }

    /// Link rtt to a direct neighbor.
    pub fn link_rtt(&self, target: RnodeTarget) -> Option<u32> {
        let me = self.me_node();
        me.find_rnode(target).map(|i| me.rnodes()[i].trtt)
    }

    // -----------------------------------------------------------------------
    // Packing
    // -----------------------------------------------------------------------

    pub fn pack(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(64 + self.alive_count() * 16);
        buf.put_u8(MAP_FORMAT_VERSION);
        buf.put_u8(self.me);

        let ext: Vec<_> = self.ext_rnodes().collect();
        buf.put_u16(ext.len() as u16);
        for (id, rnode) in ext {
            buf.put_u16(id);
            rnode.quadg.pack(&mut buf);
        }

        buf.put_u16(self.alive_count() as u16);
        for (pos, node) in self.iter_alive() {
            buf.put_u8(pos);
            buf.put_u32(node.flags.bits());
            buf.put_u32(node.brdcast);
            buf.put_u8(node.rnodes().len() as u8);
            for rnode in node.rnodes() {
                match rnode.target {
                    RnodeTarget::Local(pos) => {
                        buf.put_u8(TARGET_LOCAL);
                        buf.put_u16(u16::from(pos));
                    }
                    RnodeTarget::External(id) => {
                        buf.put_u8(TARGET_EXTERNAL);
                        buf.put_u16(id);
                    }
                }
                buf.put_u32(rnode.trtt);
            }
        }
        buf
    }

    pub fn unpack(raw: &[u8]) -> Result<Self, DecodeError> {
        check_limit("internal map", raw.len(), MAX_MAP_SIZE)?;
        let mut buf = raw;
        let version = buf.try_u8("int_map version")?;
        if version != MAP_FORMAT_VERSION {
            return Err(DecodeError::Version(version));
        }
        let me = buf.try_u8("int_map me")?;
        let mut map = InternalMap::new(me);

        let ext_count = buf.try_u16("int_map ext count")? as usize;
        check_limit("int_map ext rnodes", ext_count, MAX_EXT_RNODES)?;
        for _ in 0..ext_count {
            let id = buf.try_u16("ext rnode id")? as usize;
            check_limit("ext rnode id", id, MAX_EXT_RNODES - 1)?;
            let quadg = QuadroGroup::unpack(&mut buf)?;
            if map.ext_rnodes.len() <= id {
                map.ext_rnodes.resize(id + 1, None);
            }
            map.ext_rnodes[id] = Some(ExtRnode { quadg });
        }

        let node_count = buf.try_u16("int_map node count")? as usize;
        check_limit("int_map nodes", node_count, MAXGROUPNODE)?;
        for _ in 0..node_count {
            let pos = buf.try_u8("node pos")?;
            let flags = NodeFlags::from_bits(buf.try_u32("node flags")?);
            let brdcast = buf.try_u32("node brdcast")?;
            let links = buf.try_u8("node links")? as usize;
            check_limit("node links", links, MAXROUTES)?;
            buf.ensure(links * 7, "node rnodes")?;

            let mut rnodes = Vec::with_capacity(links);
            for _ in 0..links {
                let kind = buf.try_u8("rnode kind")?;
                let raw_target = buf.try_u16("rnode target")?;
                let trtt = buf.try_u32("rnode trtt")?;
                let target = match kind {
                    TARGET_LOCAL => {
                        check_limit("rnode slot", raw_target as usize, MAXGROUPNODE - 1)?;
                        RnodeTarget::Local(raw_target as NodeId)
                    }
                    TARGET_EXTERNAL if map.ext_rnode(raw_target).is_some() => {
                        RnodeTarget::External(raw_target)
                    }
                    TARGET_EXTERNAL => {
                        return Err(DecodeError::Malformed(format!(
                            "rnode points at missing ext rnode {raw_target}"
                        )))
                    }
                    other => {
                        return Err(DecodeError::Malformed(format!("rnode kind {other}")));
                    }
                };
                rnodes.push(Rnode { target, trtt });
            }

            let node = map.node_mut(pos);
            node.flags = flags;
            node.brdcast = brdcast;
            node.set_rnodes(rnodes);
        }
        expect_end(&buf, "internal map")?;

        if !map.node(me).is_me() {
            return Err(DecodeError::Malformed("internal map without ME slot".into()));
        }
        Ok(map)
    }
}
