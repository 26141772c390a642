//! # Topology: the shared map state of one node
//!
//! The quadro-group, internal map, external map and border map are shared by
//! the radar, the tracer engine and the QSPN engine, each running on its own
//! task. Every piece sits behind its own `parking_lot::RwLock` and the locks
//! are always taken in the same order:
//!
//! ```text
//! quadg -> int_map -> ext_map -> bmap
//! ```
//!
//! [`Topology::write`] and [`Topology::read`] hand out all four guards at
//! once in that order, so callers cannot get it wrong. Operations that touch
//! several maps at a time (linking a neighbor, voiding a node and fixing the
//! gnode counts above it) are methods of the write bundle.
//!
//! Identity changes (hook, rehook, sole-seed) take the quadro-group lock for
//! writing and rebuild everything under it: nobody can observe a new address
//! next to maps that still describe the old one.

use std::net::IpAddr;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::bmap::{BnodeLink, BorderMap};
use super::external::{ExternalMap, Gnode};
use super::internal::InternalMap;
use super::node::{Node, NodeFlags, NodeId, RnodeTarget, Rtt};
use super::quadro::{Family, IpPrefix, QuadroGroup};
use crate::config::get_levels;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Why no identity could be handed out.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AllocError {
    /// Our gnode at `level` has no free slot; another gnode may.
    #[error("gnode at level {level} is full")]
    GroupFull { level: u8 },

    /// Every level is full: there is nowhere left to hook.
    #[error("the whole addressable network is full")]
    NetworkFull,

    /// The address is not of the mesh's family.
    #[error("{0} is not a {1:?} address")]
    WrongFamily(IpAddr, Family),
}

// ---------------------------------------------------------------------------
// Kernel Route Updates
// ---------------------------------------------------------------------------

/// A best-path change to hand to the kernel route collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteUpdate {
    pub level: u8,
    pub pos: NodeId,
    /// Destination prefix of the (g)node.
    pub prefix: IpPrefix,
    /// Next hop; `None` removes the route.
    pub gateway: Option<IpAddr>,
    pub trtt: Option<Rtt>,
}

/// What [`TopologyWrite::link_neighbor`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NeighborLink {
    pub target: RnodeTarget,
    /// Divergence of the neighbor: the level its link belongs to.
    pub level: u8,
    /// New neighbor, or an rtt change above the threshold.
    pub changed: bool,
}

/// Serializable overview of the maps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MapSummary {
    pub ip: IpAddr,
    pub gids: Vec<u8>,
    pub hooking: bool,
    pub alive_nodes: usize,
    pub links: usize,
    pub ext_links: usize,
    /// Live gnodes per level, level 1 first.
    pub gnodes: Vec<usize>,
    /// Border entries per level, level 0 first.
    pub bnodes: Vec<usize>,
    /// Estimated size of the whole network.
    pub network_gcount: u32,
}

// ---------------------------------------------------------------------------
// Topology
// ---------------------------------------------------------------------------

pub struct Topology {
    family: Family,
    quadg: RwLock<QuadroGroup>,
    int_map: RwLock<InternalMap>,
    ext_map: RwLock<ExternalMap>,
    bmap: RwLock<BorderMap>,
}

/// All four guards, read side.
pub struct TopologyRead<'a> {
    pub quadg: RwLockReadGuard<'a, QuadroGroup>,
    pub int_map: RwLockReadGuard<'a, InternalMap>,
    pub ext_map: RwLockReadGuard<'a, ExternalMap>,
    pub bmap: RwLockReadGuard<'a, BorderMap>,
}

/// All four guards, maps writable. The identity stays read-only.
pub struct TopologyWrite<'a> {
    pub quadg: RwLockReadGuard<'a, QuadroGroup>,
    pub int_map: RwLockWriteGuard<'a, InternalMap>,
    pub ext_map: RwLockWriteGuard<'a, ExternalMap>,
    pub bmap: RwLockWriteGuard<'a, BorderMap>,
}

impl Topology {
    /// A node alone with address `ip`: itself in every map, nothing else.
    pub fn new(ip: IpAddr) -> Self {
        let quadg = QuadroGroup::from_ip(ip);
        let (int_map, ext_map, bmap) = fresh_maps(&quadg);
        Self {
            family: quadg.family(),
            quadg: RwLock::new(quadg),
            int_map: RwLock::new(int_map),
            ext_map: RwLock::new(ext_map),
            bmap: RwLock::new(bmap),
        }
    }

    /// Rebuilds a topology from loaded maps. Maps that do not fit the
    /// address (wrong level count, wrong `ME` slot) are replaced by fresh
    /// ones.
    pub fn from_parts(
        ip: IpAddr,
        int_map: Option<InternalMap>,
        ext_map: Option<ExternalMap>,
        bmap: Option<BorderMap>,
    ) -> Self {
        let topology = Self::new(ip);
        {
            let quadg = topology.quadg.read();
            let levels = quadg.levels();
            if let Some(map) = int_map.filter(|m| m.me() == quadg.gid(0)) {
                *topology.int_map.write() = map;
            }
            if let Some(map) = ext_map.filter(|m| m.levels() == levels) {
                let mut ext = topology.ext_map.write();
                *ext = map;
                ext.mark_me(&quadg);
            }
            if let Some(map) = bmap.filter(|m| m.levels() == levels) {
                *topology.bmap.write() = map;
            }
        }
        topology
    }

    pub fn family(&self) -> Family {
        self.family
    }

    pub fn levels(&self) -> u8 {
        get_levels(self.family)
    }

    pub fn quadg(&self) -> QuadroGroup {
        self.quadg.read().clone()
    }

    pub fn ip(&self) -> IpAddr {
        self.quadg.read().ip()
    }

    pub fn read(&self) -> TopologyRead<'_> {
        let quadg = self.quadg.read();
        let int_map = self.int_map.read();
        let ext_map = self.ext_map.read();
        let bmap = self.bmap.read();
        TopologyRead {
            quadg,
            int_map,
            ext_map,
            bmap,
        }
    }

    pub fn write(&self) -> TopologyWrite<'_> {
        let quadg = self.quadg.read();
        let int_map = self.int_map.write();
        let ext_map = self.ext_map.write();
        let bmap = self.bmap.write();
        TopologyWrite {
            quadg,
            int_map,
            ext_map,
            bmap,
        }
    }

    // -----------------------------------------------------------------------
    // Identity
    // -----------------------------------------------------------------------

    /// Takes a new address and resets every map around it. The node is
    /// flagged `HOOKING` until [`Topology::finish_hooking`].
    pub fn set_identity(&self, ip: IpAddr) -> Result<(), AllocError> {
        if Family::of(&ip) != self.family {
            return Err(AllocError::WrongFamily(ip, self.family));
        }
        let mut quadg = self.quadg.write();
        let mut int_map = self.int_map.write();
        let mut ext_map = self.ext_map.write();
        let mut bmap = self.bmap.write();

        *quadg = QuadroGroup::from_ip(ip);
        let (fresh_int, fresh_ext, fresh_bmap) = fresh_maps(&quadg);
        *int_map = fresh_int;
        *ext_map = fresh_ext;
        *bmap = fresh_bmap;
        int_map.me_node_mut().flags.insert(NodeFlags::HOOKING);
        info!(%ip, "identity changed, maps reset");
        Ok(())
    }

    /// Clears `HOOKING` once the node is part of its gnode.
    pub fn finish_hooking(&self) {
        self.int_map
            .write()
            .me_node_mut()
            .flags
            .remove(NodeFlags::HOOKING);
    }

    pub fn is_hooking(&self) -> bool {
        self.int_map
            .read()
            .me_node()
            .flags
            .contains(NodeFlags::HOOKING)
    }

    /// Makes this node the only member of a brand-new gnode at every level.
    pub fn become_sole_seed(&self) {
        let quadg = self.quadg.write();
        let mut int_map = self.int_map.write();
        let mut ext_map = self.ext_map.write();
        let mut bmap = self.bmap.write();

        let (fresh_int, fresh_ext, fresh_bmap) = fresh_maps(&quadg);
        *int_map = fresh_int;
        *ext_map = fresh_ext;
        *bmap = fresh_bmap;
        info!(ip = %quadg.ip(), "no neighbors, becoming the sole seed of a new gnode");
    }

    // -----------------------------------------------------------------------
    // Allocation
    // -----------------------------------------------------------------------

    /// A free slot at `level` inside our own gnode of `level + 1`.
    pub fn find_free_slot(&self, level: u8) -> Result<NodeId, AllocError> {
        let levels = self.levels();
        if level >= levels {
            return Err(AllocError::NetworkFull);
        }
        let quadg = self.quadg.read();
        let int_map = self.int_map.read();
        let ext_map = self.ext_map.read();
        if ext_map.me_gnode(&quadg, level + 1).is_full() {
            return Err(AllocError::GroupFull { level });
        }
        let free = if level == 0 {
            int_map.first_void()
        } else {
            ext_map.first_void(level)
        };
        free.ok_or(AllocError::GroupFull { level })
    }

    /// The lowest level with a free slot: `(level, id)`.
    pub fn allocation_hint(&self) -> Result<(u8, NodeId), AllocError> {
        for level in 0..self.levels() {
            match self.find_free_slot(level) {
                Ok(id) => return Ok((level, id)),
                Err(AllocError::GroupFull { level }) => {
                    debug!(level, "gnode full, trying one level up");
                }
                Err(other) => return Err(other),
            }
        }
        Err(AllocError::NetworkFull)
    }

    // -----------------------------------------------------------------------
    // Summary
    // -----------------------------------------------------------------------

    pub fn summary(&self) -> MapSummary {
        self.read().summary()
    }
}

fn fresh_maps(quadg: &QuadroGroup) -> (InternalMap, ExternalMap, BorderMap) {
    let levels = quadg.levels();
    let int_map = InternalMap::new(quadg.gid(0));
    let mut ext_map = ExternalMap::new(levels);
    ext_map.mark_me(quadg);
    for level in 1..=levels {
        ext_map.me_gnode_mut(quadg, level).gcount = 1;
    }
    (int_map, ext_map, BorderMap::new(levels))
}

// ---------------------------------------------------------------------------
// Read Bundle
// ---------------------------------------------------------------------------

impl TopologyRead<'_> {
    /// The (g)node at `level`, `id`.
    pub fn node(&self, level: u8, id: NodeId) -> &Node {
        if level == 0 {
            self.int_map.node(id)
        } else {
            &self.ext_map.gnode(level, id).node
        }
    }

    /// Builds the kernel update for `(level, id)` from its current best
    /// route.
    pub fn route_update(&self, level: u8, id: NodeId) -> RouteUpdate {
        let node = self.node(level, id);
        let best = if node.is_void() || node.is_me() {
            None
        } else {
            node.best().copied()
        };
        RouteUpdate {
            level,
            pos: id,
            prefix: self.quadg.prefix_of(level, id),
            gateway: best.and_then(|r| self.resolve_gateway(level, r.target)),
            trtt: best.map(|r| r.trtt),
        }
    }

    /// Address of the direct neighbor behind `target` at `level`.
    pub fn resolve_gateway(&self, level: u8, target: RnodeTarget) -> Option<IpAddr> {
        match target {
            RnodeTarget::External(id) => self.int_map.ext_rnode(id).map(|ext| ext.quadg.ip()),
            RnodeTarget::Local(pos) if level == 0 => {
                Some(self.quadg.with_gid(0, pos).ip())
            }
            RnodeTarget::Local(gid) => {
                // A neighbor of ours sitting in that gnode.
                let direct = self.int_map.ext_rnodes().find(|(_, ext)| {
                    self.quadg.divergence(&ext.quadg) == Some(level) && ext.quadg.gid(level) == gid
                });
                if let Some((_, ext)) = direct {
                    return Some(ext.quadg.ip());
                }
                // Otherwise the border node of our gnode that reaches it.
                (0..level).find_map(|lower| {
                    let bnode = self.bmap.find_bnode_by_rnode_target(lower, gid, level)?;
                    let via = self.node(lower, bnode);
                    if via.is_me() {
                        return None;
                    }
                    let next = via.best()?.target;
                    self.resolve_gateway(lower, next)
                })
            }
        }
    }

    pub fn summary(&self) -> MapSummary {
        let levels = self.quadg.levels();
        let me = self.int_map.me_node();
        let ext_links = me
            .rnodes()
            .iter()
            .filter(|r| matches!(r.target, RnodeTarget::External(_)))
            .count();
        MapSummary {
            ip: self.quadg.ip(),
            gids: self.quadg.gids().to_vec(),
            hooking: me.flags.contains(NodeFlags::HOOKING),
            alive_nodes: self.int_map.alive_count(),
            links: me.rnodes().len() - ext_links,
            ext_links,
            gnodes: (1..levels)
                .map(|level| self.ext_map.iter_alive(level).count())
                .collect(),
            bnodes: (0..levels)
                .map(|level| self.bmap.entries(level).len())
                .collect(),
            network_gcount: self.ext_map.me_gnode(&self.quadg, levels).gcount,
        }
    }
}

// ---------------------------------------------------------------------------
// Write Bundle
// ---------------------------------------------------------------------------

impl TopologyWrite<'_> {
    pub fn node(&self, level: u8, id: NodeId) -> &Node {
        if level == 0 {
            self.int_map.node(id)
        } else {
            &self.ext_map.gnode(level, id).node
        }
    }

    pub fn node_mut(&mut self, level: u8, id: NodeId) -> &mut Node {
        if level == 0 {
            self.int_map.node_mut(id)
        } else {
            &mut self.ext_map.gnode_mut(level, id).node
        }
    }

    pub fn gnode(&self, level: u8, id: NodeId) -> &Gnode {
        self.ext_map.gnode(level, id)
    }

    /// Clears `VOID` on `(level, id)`. A revived level-0 node adds one to
    /// every gnode of ours above it. Returns true when it was void.
    pub fn revive(&mut self, level: u8, id: NodeId) -> bool {
        if level == 0 {
            if !self.int_map.revive(id) {
                return false;
            }
            self.ext_map.propagate_gcount(&self.quadg, 0, 1);
            let alive = self.int_map.alive_count();
            self.ext_map.set_level0_members(&self.quadg, alive);
            true
        } else {
            let gnode = self.ext_map.gnode_mut(level, id);
            let was_void = gnode.is_void();
            gnode.node.flags.remove(NodeFlags::VOID | NodeFlags::OLD);
            if was_void {
                self.ext_map.refresh_seeds(&self.quadg, level);
            }
            was_void
        }
    }

    /// Voids `(level, id)` and fixes the counts above it.
    pub fn void(&mut self, level: u8, id: NodeId) -> bool {
        if level == 0 {
            if !self.int_map.void_node(id) {
                return false;
            }
            self.ext_map.propagate_gcount(&self.quadg, 0, -1);
            let alive = self.int_map.alive_count();
            self.ext_map.set_level0_members(&self.quadg, alive);
            self.bmap.remove_bnode(0, id);
            true
        } else {
            let voided = self.ext_map.void_gnode(&self.quadg, level, id);
            if voided {
                self.bmap.remove_bnode(level, id);
            }
            voided
        }
    }

    /// Our own (g)node at `level`.
    pub fn me_node_mut(&mut self, level: u8) -> &mut Node {
        let id = self.quadg.gid(level);
        self.node_mut(level, id)
    }

    fn set_me_bnode(&mut self, level: u8, on: bool) {
        self.me_node_mut(level).flags.set(NodeFlags::BNODE, on);
    }

    /// Marks the neighbor behind `target` as not seen by the last scan.
    pub fn mark_old(&mut self, target: RnodeTarget) {
        if let RnodeTarget::Local(pos) = target {
            self.int_map.node_mut(pos).flags.insert(NodeFlags::OLD);
        }
    }

    pub fn clear_old(&mut self, target: RnodeTarget) {
        if let RnodeTarget::Local(pos) = target {
            self.int_map.node_mut(pos).flags.remove(NodeFlags::OLD);
        }
    }

    /// Adds (or refreshes) a direct neighbor measured at `rtt`.
    ///
    /// Neighbors of our level-1 gnode become internal map slots. Neighbors
    /// outside it become ext rnodes; we turn into a border node of every
    /// level below the divergence, and the neighbor's gnode at the
    /// divergence level gets a route through itself.
    ///
    /// `touched` collects the `(level, id)` pairs whose routes changed.
    pub fn link_neighbor(
        &mut self,
        nb: &QuadroGroup,
        rtt: Rtt,
        delta: Rtt,
        touched: &mut Vec<(u8, NodeId)>,
    ) -> Option<NeighborLink> {
        let Some(level) = self.quadg.divergence(nb) else {
            warn!(ip = %nb.ip(), "neighbor claims our own address");
            return None;
        };

        if level == 0 {
            let pos = nb.gid(0);
            let revived = self.revive(0, pos);
            let node = self.int_map.node_mut(pos);
            node.flags.insert(NodeFlags::RNODE);
            node.flags.remove(NodeFlags::OLD);
            let route = node.upsert_rnode(RnodeTarget::Local(pos), rtt, delta);
            let link = self
                .int_map
                .me_node_mut()
                .upsert_rnode(RnodeTarget::Local(pos), rtt, delta);
            let changed = revived || route.changed() || link.changed();
            if changed {
                touched.push((0, pos));
            }
            return Some(NeighborLink {
                target: RnodeTarget::Local(pos),
                level: 0,
                changed,
            });
        }

        let Some(id) = self.int_map.alloc_ext_rnode(nb.clone()) else {
            warn!(ip = %nb.ip(), "ext rnode arena full, neighbor ignored");
            return None;
        };
        let target = RnodeTarget::External(id);
        let link = self.int_map.me_node_mut().upsert_rnode(target, rtt, delta);

        let gid = nb.gid(level);
        for lower in 0..level {
            let me = self.quadg.gid(lower);
            self.bmap.add_link(
                lower,
                me,
                BnodeLink {
                    gnode: gid,
                    level,
                    rtt,
                },
            );
            self.set_me_bnode(lower, true);
        }

        let revived = self.revive(level, gid);
        if revived {
            self.ext_map.set_gcount(&self.quadg, level, gid, 1);
        }
        let gnode = self.ext_map.gnode_mut(level, gid);
        gnode.node.flags.insert(NodeFlags::RNODE);
        let route = gnode
            .node
            .upsert_rnode(RnodeTarget::Local(gid), rtt, delta);
        let me_link = self
            .ext_map
            .me_gnode_mut(&self.quadg, level)
            .node
            .upsert_rnode(RnodeTarget::Local(gid), rtt, delta);

        let changed = revived || link.changed() || route.changed() || me_link.changed();
        if changed {
            touched.push((level, gid));
        }
        Some(NeighborLink {
            target,
            level,
            changed,
        })
    }

    /// Removes a direct neighbor and everything that only existed through
    /// it: routes, voided (g)nodes, border links.
    pub fn unlink_neighbor(
        &mut self,
        nb: &QuadroGroup,
        target: RnodeTarget,
        touched: &mut Vec<(u8, NodeId)>,
    ) {
        match target {
            RnodeTarget::Local(pos) => {
                self.int_map.me_node_mut().remove_rnode(target);
                self.int_map.node_mut(pos).flags.remove(NodeFlags::RNODE);
                let (changed, voided) = self.int_map.drop_gateway(target);
                touched.extend(changed.iter().map(|&p| (0, p)));
                for pos in voided {
                    // drop_gateway already reset the slot.
                    self.ext_map.propagate_gcount(&self.quadg, 0, -1);
                    self.bmap.remove_bnode(0, pos);
                }
                let alive = self.int_map.alive_count();
                self.ext_map.set_level0_members(&self.quadg, alive);
            }
            RnodeTarget::External(id) => {
                self.int_map.me_node_mut().remove_rnode(target);
                self.int_map.free_ext_rnode(id);
                let Some(level) = self.quadg.divergence(nb) else {
                    return;
                };
                let gid = nb.gid(level);
                let still_linked = self.int_map.ext_rnodes().any(|(_, ext)| {
                    self.quadg.divergence(&ext.quadg) == Some(level) && ext.quadg.gid(level) == gid
                });
                if still_linked {
                    return;
                }

                self.ext_map
                    .me_gnode_mut(&self.quadg, level)
                    .node
                    .remove_rnode(RnodeTarget::Local(gid));
                self.ext_map
                    .gnode_mut(level, gid)
                    .node
                    .flags
                    .remove(NodeFlags::RNODE);
                let (changed, voided) =
                    self.ext_map
                        .drop_gateway(&self.quadg, level, RnodeTarget::Local(gid));
                touched.extend(changed.iter().map(|&g| (level, g)));
                for g in voided {
                    self.bmap.remove_bnode(level, g);
                }
                for lower in 0..level {
                    let me = self.quadg.gid(lower);
                    if self.bmap.del_bnode_rnode(lower, me, gid, level) {
                        self.set_me_bnode(lower, false);
                    }
                }
            }
        }
    }

    /// Direct neighbors of ours, as `(target, link rtt)`.
    pub fn links(&self) -> Vec<(RnodeTarget, Rtt)> {
        self.int_map
            .me_node()
            .rnodes()
            .iter()
            .map(|r| (r.target, r.trtt))
            .collect()
    }
}
