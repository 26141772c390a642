//! # External Map
//!
//! The view of every level above 0. Row `L` (for `1 <= L < levels`) holds
//! the 256 gnodes of level `L` that live inside our own gnode of level
//! `L + 1`; the last row (`L == levels`) is the whole network and has a
//! single slot. A [`Gnode`] embeds a [`Node`] by value, so routing code works
//! on both through the same accessors.
//!
//! ## Member counts
//!
//! `gcount` of our own gnode at level `L + 1` is the sum of the gcounts of
//! the live gnodes of row `L`. Tracer merges never overwrite a count
//! blindly: they compute the delta between the stored value and the chunk
//! snapshot and push that delta up through our own gnodes, so replaying a
//! chunk is a no-op.

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::codec::{check_limit, expect_end, BufExt, DecodeError};
use crate::config::{IPV6_LEVELS, MAP_FORMAT_VERSION, MAXGROUPNODE, MAXROUTES, MAX_MAP_SIZE};

use super::node::{Node, NodeFlags, NodeId, Rnode, RnodeTarget};
use super::quadro::QuadroGroup;

/// `seeds` value of a gnode whose 256 slots are all taken.
pub const FULL_SEEDS: u8 = (MAXGROUPNODE - 1) as u8;

/// A group of nodes seen as a single node one level up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gnode {
    pub node: Node,
    /// Live members directly known, minus one.
    pub seeds: u8,
    /// Approximate number of level-0 nodes inside.
    pub gcount: u32,
}

impl Gnode {
    pub fn void() -> Self {
        Self {
            node: Node::void(),
            seeds: 0,
            gcount: 0,
        }
    }

    pub fn is_void(&self) -> bool {
        self.node.is_void()
    }

    pub fn is_full(&self) -> bool {
        self.seeds == FULL_SEEDS || self.node.flags.contains(NodeFlags::FULL)
    }
}

/// Outcome of [`merge_external_maps`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// `(level, gid)` of gnodes copied into a void base slot.
    pub added: Vec<(u8, NodeId)>,
    /// `(level, gid)` of base gnodes that got a shorter route.
    pub improved: Vec<(u8, NodeId)>,
    /// `(level, gid)` of incoming gnodes only reachable through a root.
    pub dropped: Vec<(u8, NodeId)>,
}

/// The level-1..=levels map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalMap {
    levels: u8,
    rows: Vec<Vec<Gnode>>,
}

/// `init_external_map(levels)`: every slot void.
pub fn init_external_map(levels: u8) -> ExternalMap {
    ExternalMap::new(levels)
}

impl ExternalMap {
    pub fn new(levels: u8) -> Self {
        let rows = (1..=levels)
            .map(|level| vec![Gnode::void(); row_len(levels, level)])
            .collect();
        Self { levels, rows }
    }

    /// Number of address levels; also the index of the unity row.
    pub fn levels(&self) -> u8 {
        self.levels
    }

    pub fn row(&self, level: u8) -> &[Gnode] {
        &self.rows[row_index(level)]
    }

    pub fn gnode(&self, level: u8, gid: NodeId) -> &Gnode {
        &self.rows[row_index(level)][gid as usize]
    }

    pub fn gnode_mut(&mut self, level: u8, gid: NodeId) -> &mut Gnode {
        &mut self.rows[row_index(level)][gid as usize]
    }

    /// Our own gnode at `level`.
    pub fn me_gnode(&self, quadg: &QuadroGroup, level: u8) -> &Gnode {
        self.gnode(level, quadg.gid(level))
    }

    pub fn me_gnode_mut(&mut self, quadg: &QuadroGroup, level: u8) -> &mut Gnode {
        self.gnode_mut(level, quadg.gid(level))
    }

    /// Live gnodes of `level` with their ids.
    pub fn iter_alive(&self, level: u8) -> impl Iterator<Item = (NodeId, &Gnode)> {
        self.row(level)
            .iter()
            .enumerate()
            .filter(|(_, g)| !g.is_void())
            .map(|(gid, g)| (gid as NodeId, g))
    }

    /// Flags our own gnode at every level as `ME` and live.
    pub fn mark_me(&mut self, quadg: &QuadroGroup) {
        for level in 1..=self.levels {
            let gnode = self.me_gnode_mut(quadg, level);
            gnode.node.flags.remove(NodeFlags::VOID);
            gnode.node.flags.insert(NodeFlags::ME);
        }
    }

    /// Lowest void gid of `level`, if any.
    pub fn first_void(&self, level: u8) -> Option<NodeId> {
        self.row(level)
            .iter()
            .position(Gnode::is_void)
            .map(|gid| gid as NodeId)
    }

    /// Resets `gid` of `level` to void and removes its count from our own
    /// gnodes above. `ME` gnodes are never voided.
    pub fn void_gnode(&mut self, quadg: &QuadroGroup, level: u8, gid: NodeId) -> bool {
        let gnode = self.gnode(level, gid);
        if gnode.is_void() || gnode.node.is_me() {
            return false;
        }
        let old = gnode.gcount;
        *self.gnode_mut(level, gid) = Gnode::void();
        self.propagate_gcount(quadg, level, -i64::from(old));
        self.refresh_seeds(quadg, level);
        true
    }

    /// Sets the member count of `gid` from a tracer chunk.
    ///
    /// Only the difference to the stored value travels upward, so applying
    /// the same snapshot twice changes nothing the second time.
    pub fn set_gcount(&mut self, quadg: &QuadroGroup, level: u8, gid: NodeId, gcount: u32) {
        let old = self.gnode(level, gid).gcount;
        if old == gcount {
            return;
        }
        self.gnode_mut(level, gid).gcount = gcount;
        self.propagate_gcount(quadg, level, i64::from(gcount) - i64::from(old));
    }

    /// Applies `delta` to our own gnodes at every level above `level`.
    ///
    /// A negative delta larger than a stored count means the counts went
    /// out of sync somewhere; the count is clamped and the gnode marked
    /// full so nobody tries to hook into it on stale data.
    pub fn propagate_gcount(&mut self, quadg: &QuadroGroup, level: u8, delta: i64) {
        if delta == 0 {
            return;
        }
        for upper in (level + 1)..=self.levels {
            let gnode = self.me_gnode_mut(quadg, upper);
            let next = i64::from(gnode.gcount) + delta;
            if next < 0 {
                warn!(
                    level = upper,
                    gcount = gnode.gcount,
                    delta,
                    "logical contradiction detected: gcount underflow"
                );
                gnode.gcount = 0;
                gnode.node.flags.insert(NodeFlags::FULL);
            } else {
                gnode.gcount = next.min(i64::from(u32::MAX)) as u32;
            }
        }
    }

    /// Recomputes `seeds` of our gnode at `level + 1` from the live gnodes
    /// of `level`. Level 0 goes through [`ExternalMap::set_level0_members`].
    pub fn refresh_seeds(&mut self, quadg: &QuadroGroup, level: u8) {
        if level == 0 || level >= self.levels {
            return;
        }
        let alive = self.iter_alive(level).count();
        self.set_members(quadg, level + 1, alive);
    }

    /// Records how many live nodes our level-1 gnode has.
    pub fn set_level0_members(&mut self, quadg: &QuadroGroup, alive: usize) {
        self.set_members(quadg, 1, alive);
    }

    fn set_members(&mut self, quadg: &QuadroGroup, level: u8, alive: usize) {
        let gnode = self.me_gnode_mut(quadg, level);
        gnode.seeds = alive.saturating_sub(1).min(FULL_SEEDS as usize) as u8;
        gnode.node.flags.set(NodeFlags::FULL, gnode.seeds == FULL_SEEDS);
    }

    /// Removes every route of `level` going through `gateway`, voiding the
    /// gnodes left unreachable. Returns `(touched, voided)` gids.
    pub fn drop_gateway(
        &mut self,
        quadg: &QuadroGroup,
        level: u8,
        gateway: RnodeTarget,
    ) -> (Vec<NodeId>, Vec<NodeId>) {
        let mut touched = Vec::new();
        let mut emptied = Vec::new();
        for (gid, gnode) in self.rows[row_index(level)].iter_mut().enumerate() {
            if gnode.is_void() || gnode.node.is_me() {
                continue;
            }
            if gnode.node.remove_rnode(gateway) {
                touched.push(gid as NodeId);
                if gnode.node.rnodes().is_empty() {
                    emptied.push(gid as NodeId);
                }
            }
        }
        let voided = emptied
            .into_iter()
            .filter(|&gid| self.void_gnode(quadg, level, gid))
            .collect();
        (touched, voided)
    }

    // -----------------------------------------------------------------------
    // Packing
    // -----------------------------------------------------------------------

    /// ```text
    /// {version:u8, levels:u8, {level:u8, count:u16,
    ///   {gid:u8, flags:u32, brdcast:u32, seeds:u8, gcount:u32, links:u8,
    ///    {gid:u8, trtt:u32}*links}*count}*levels}
    /// ```
    pub fn pack(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(256);
        buf.put_u8(MAP_FORMAT_VERSION);
        buf.put_u8(self.levels);
        for level in 1..=self.levels {
            let alive: Vec<_> = self.iter_alive(level).collect();
            buf.put_u8(level);
            buf.put_u16(alive.len() as u16);
            for (gid, gnode) in alive {
                buf.put_u8(gid);
                buf.put_u32(gnode.node.flags.bits());
                buf.put_u32(gnode.node.brdcast);
                buf.put_u8(gnode.seeds);
                buf.put_u32(gnode.gcount);
                let links: Vec<_> = gnode
                    .node
                    .rnodes()
                    .iter()
                    .filter_map(|r| match r.target {
                        RnodeTarget::Local(gid) => Some((gid, r.trtt)),
                        RnodeTarget::External(_) => None,
                    })
                    .collect();
                buf.put_u8(links.len() as u8);
                for (gid, trtt) in links {
                    buf.put_u8(gid);
                    buf.put_u32(trtt);
                }
            }
        }
        buf
    }

    pub fn unpack(raw: &[u8]) -> Result<Self, DecodeError> {
        check_limit("external map", raw.len(), MAX_MAP_SIZE)?;
        let mut buf = raw;
        let version = buf.try_u8("ext_map version")?;
        if version != MAP_FORMAT_VERSION {
            return Err(DecodeError::Version(version));
        }
        let levels = buf.try_u8("ext_map levels")?;
        if levels == 0 {
            return Err(DecodeError::Malformed("external map with 0 levels".into()));
        }
        check_limit("ext_map levels", levels as usize, IPV6_LEVELS as usize)?;

        let mut map = ExternalMap::new(levels);
        for expected in 1..=levels {
            let level = buf.try_u8("ext_map level tag")?;
            if level != expected {
                return Err(DecodeError::Malformed(format!(
                    "ext_map row {level}, expected {expected}"
                )));
            }
            let count = buf.try_u16("ext_map row count")? as usize;
            let row_len = row_len(levels, level);
            check_limit("ext_map row", count, row_len)?;
            for _ in 0..count {
                let gid = buf.try_u8("gnode id")?;
                check_limit("gnode id", gid as usize, row_len - 1)?;
                let flags = NodeFlags::from_bits(buf.try_u32("gnode flags")?);
                let brdcast = buf.try_u32("gnode brdcast")?;
                let seeds = buf.try_u8("gnode seeds")?;
                let gcount = buf.try_u32("gnode gcount")?;
                let links = buf.try_u8("gnode links")? as usize;
                check_limit("gnode links", links, MAXROUTES)?;
                buf.ensure(links * 5, "gnode rnodes")?;
                let mut rnodes = Vec::with_capacity(links);
                for _ in 0..links {
                    let target = buf.try_u8("gnode rnode")?;
                    let trtt = buf.try_u32("gnode rnode trtt")?;
                    rnodes.push(Rnode {
                        target: RnodeTarget::Local(target),
                        trtt,
                    });
                }
                let gnode = map.gnode_mut(level, gid);
                gnode.node.flags = flags;
                gnode.node.brdcast = brdcast;
                gnode.node.set_rnodes(rnodes);
                gnode.seeds = seeds;
                gnode.gcount = gcount;
            }
        }
        expect_end(&buf, "external map")?;
        Ok(map)
    }
}

fn row_index(level: u8) -> usize {
    debug_assert!(level >= 1, "level 0 lives in the internal map");
    level as usize - 1
}

fn row_len(levels: u8, level: u8) -> usize {
    if level == levels {
        1
    } else {
        MAXGROUPNODE
    }
}

// ---------------------------------------------------------------------------
// Map Fusion
// ---------------------------------------------------------------------------

/// Fuses `incoming` into `base`.
///
/// For every live gnode of `incoming` that is neither root: routes whose
/// gateway is one of the two roots are discarded, the others are re-pointed
/// at the same slot of `base`. A gnode left with no route is dropped; a
/// gnode new to `base` is copied; a gnode known to both keeps, per gateway,
/// the shorter route.
pub fn merge_external_maps(
    base: &mut ExternalMap,
    incoming: &ExternalMap,
    base_root: &QuadroGroup,
    incoming_root: &QuadroGroup,
) -> MergeReport {
    let mut report = MergeReport::default();
    let levels = base.levels.min(incoming.levels);

    // The unity row has no neighbors to route through.
    for level in 1..levels {
        let base_me = base_root.gid(level);
        let incoming_me = incoming_root.gid(level);
        let is_root = |gid: NodeId| gid == base_me || gid == incoming_me;

        for (gid, inc) in incoming.iter_alive(level) {
            if is_root(gid) || inc.node.is_me() {
                continue;
            }
            let routes: Vec<Rnode> = inc
                .node
                .rnodes()
                .iter()
                .filter(|r| matches!(r.target, RnodeTarget::Local(gw) if !is_root(gw)))
                .copied()
                .collect();
            if routes.is_empty() {
                report.dropped.push((level, gid));
                continue;
            }

            let target = base.gnode(level, gid);
            if target.is_void() {
                let mut copy = Gnode::void();
                copy.node.flags = inc.node.flags;
                copy.node.flags.remove(NodeFlags::ME | NodeFlags::RNODE | NodeFlags::OLD);
                copy.node.brdcast = inc.node.brdcast;
                copy.node.set_rnodes(routes);
                copy.seeds = inc.seeds;
                let gcount = inc.gcount;
                *base.gnode_mut(level, gid) = copy;
                base.set_gcount(base_root, level, gid, gcount);
                report.added.push((level, gid));
                continue;
            }

            let mut improved = false;
            let node = &mut base.gnode_mut(level, gid).node;
            for route in routes {
                improved |= node.keep_shorter_rnode(route.target, route.trtt).changed();
            }
            if improved {
                report.improved.push((level, gid));
            }
        }
        base.refresh_seeds(base_root, level);
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    fn quadg(ip: &str) -> QuadroGroup {
        QuadroGroup::from_ip(ip.parse::<IpAddr>().unwrap())
    }

    fn map_for(root: &QuadroGroup) -> ExternalMap {
        let mut map = init_external_map(root.levels());
        map.mark_me(root);
        map
    }

    fn add_route(map: &mut ExternalMap, level: u8, gid: NodeId, gw: NodeId, trtt: u32) {
        let gnode = map.gnode_mut(level, gid);
        gnode.node.flags.remove(NodeFlags::VOID);
        gnode.node.upsert_rnode(RnodeTarget::Local(gw), trtt, 0);
    }

    #[test]
    fn unity_row_has_one_slot() {
        let map = init_external_map(4);
        assert_eq!(map.row(1).len(), MAXGROUPNODE);
        assert_eq!(map.row(4).len(), 1);
        assert!(map.row(2).iter().all(Gnode::is_void));
    }

    #[test]
    fn gcount_snapshots_are_idempotent() {
        let me = quadg("10.1.2.3");
        let mut map = map_for(&me);
        map.gnode_mut(1, 2).gcount = 1;
        map.propagate_gcount(&me, 1, 1);
        add_route(&mut map, 1, 9, 9, 20);

        map.set_gcount(&me, 1, 9, 5);
        map.set_gcount(&me, 1, 9, 5);
        assert_eq!(map.me_gnode(&me, 2).gcount, 6);
        assert_eq!(map.me_gnode(&me, 4).gcount, 6);

        map.set_gcount(&me, 1, 9, 3);
        assert_eq!(map.me_gnode(&me, 2).gcount, 4);
    }

    #[test]
    fn gcount_underflow_marks_full() {
        let me = quadg("10.1.2.3");
        let mut map = map_for(&me);
        map.propagate_gcount(&me, 1, -3);
        let parent = map.me_gnode(&me, 2);
        assert_eq!(parent.gcount, 0);
        assert!(parent.node.flags.contains(NodeFlags::FULL));
    }

    #[test]
    fn voiding_subtracts_from_parents() {
        let me = quadg("10.1.2.3");
        let mut map = map_for(&me);
        add_route(&mut map, 1, 9, 9, 20);
        map.set_gcount(&me, 1, 9, 7);
        assert!(map.void_gnode(&me, 1, 9));
        assert_eq!(map.me_gnode(&me, 2).gcount, 0);
        assert!(!map.void_gnode(&me, 1, me.gid(1)));
    }

    #[test]
    fn disjoint_maps_merge_and_converge_to_lower_rtt() {
        let a = quadg("10.1.2.3");
        let b = quadg("10.1.5.3");
        let mut base = map_for(&a);
        let mut incoming = map_for(&b);

        // Only in base.
        add_route(&mut base, 1, 20, 20, 15);
        // Only in incoming, reachable through gnode 30.
        add_route(&mut incoming, 1, 31, 30, 25);
        add_route(&mut incoming, 1, 30, 30, 10);
        // In both, incoming is faster.
        add_route(&mut base, 1, 40, 30, 90);
        add_route(&mut incoming, 1, 40, 30, 35);
        // Incoming only knows it through its own root.
        add_route(&mut incoming, 1, 50, 5, 12);

        let report = merge_external_maps(&mut base, &incoming, &a, &b);

        assert!(!base.gnode(1, 20).is_void());
        assert!(!base.gnode(1, 31).is_void());
        assert!(!base.gnode(1, 30).is_void());
        assert_eq!(base.gnode(1, 40).node.best().unwrap().trtt, 35);
        assert!(base.gnode(1, 50).is_void());
        assert_eq!(report.dropped, vec![(1, 50)]);
        assert!(report.improved.contains(&(1, 40)));
        assert!(report.added.contains(&(1, 31)));
        // The incoming root itself is not copied.
        assert!(base.gnode(1, b.gid(1)).is_void());
    }

    #[test]
    fn pack_roundtrip() {
        let me = quadg("10.1.2.3");
        let mut map = map_for(&me);
        add_route(&mut map, 1, 9, 9, 20);
        map.set_gcount(&me, 1, 9, 12);
        add_route(&mut map, 3, 77, 77, 300);
        let back = ExternalMap::unpack(&map.pack()).unwrap();
        assert_eq!(back, map);
    }

    #[test]
    fn oversized_row_count_is_rejected() {
        let mut raw = vec![MAP_FORMAT_VERSION, 4, 1];
        raw.extend_from_slice(&1000u16.to_be_bytes());
        assert!(matches!(
            ExternalMap::unpack(&raw),
            Err(DecodeError::TooLarge { .. })
        ));
    }
}
