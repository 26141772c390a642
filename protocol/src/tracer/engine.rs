//! # Tracer Engine
//!
//! Turns a received tracer packet into map updates and forward actions.
//! QSPN reuses the same building blocks ([`validate`], [`merge_into_map`],
//! [`apply_border_blocks`], [`append_entry`]) and only adds its close/open
//! bookkeeping on top.
//!
//! ## Path accounting
//!
//! Chunk `j` carries the rtt between hop `j - 1` and hop `j`, measured by
//! hop `j` when it appended itself. A receiver reaches hop `i` through the
//! sender, at
//!
//! ```text
//! trtt(i) = rtt(me, sender) + sum(chunk[j].rtt for j > i)
//! ```
//!
//! Walking the chunk list backwards accumulates exactly that, and stops at
//! our own chunk: anything older was reached through us.
//!
//! ## Levels
//!
//! At level 0 every hop is a node of our gnode. At level `L > 0` hops are
//! gnodes of level `L`; members of the same gnode forward the packet to one
//! another without adding a hop (they only grow the rtt of the last one) and
//! a border node adds our gnode's hop when the packet leaves the gnode.

use std::net::IpAddr;

use tracing::{debug, trace, warn};

use crate::codec::DecodeError;
use crate::config::{ProtocolConfig, MAX_BNODE_BLOCKS, MAX_TRACER_HOPS};
use crate::map::{
    BorderMap, NodeFlags, NodeId, QuadroGroup, RnodeTarget, Rtt, Topology, TopologyWrite,
};
use crate::radar::{RlistEntry, RnodeList};
use crate::wire::{Packet, PacketOp};

use super::bblock::BorderBlock;
use super::flood::{Outbound, SeenCache};
use super::packet::{BcastHeader, TracerChunk, TracerPacket, BCAST_STARTER};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Why a tracer packet was not processed. None of these are fatal: the
/// packet is dropped and the daemon moves on.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TracerReject {
    #[error("malformed tracer packet: {0}")]
    Decode(#[from] DecodeError),

    #[error("sender {0} is not a direct neighbor")]
    UnknownSender(IpAddr),

    #[error("sender {0} is still hooking")]
    SenderHooking(IpAddr),

    #[error("flood of gnode {got} at level {level}, ours is {expected}")]
    WrongGnode { level: u8, expected: NodeId, got: NodeId },

    #[error("sender {ip} is outside our gnode at level {level}")]
    SenderOutside { ip: IpAddr, level: u8 },

    #[error("ttl expired")]
    TtlExpired,

    #[error("last hop {last} at level {level} is not the sender ({sender})")]
    Spoofed { level: u8, last: NodeId, sender: NodeId },

    #[error("broadcast id {id} of first hop {node} is not newer than {last}")]
    StaleBroadcast { node: NodeId, id: u32, last: u32 },

    #[error("duplicate flood packet")]
    Duplicate,

    #[error("our own flood came back")]
    OwnFlood,

    #[error("identity collision in gnode {gnode} at level {level}")]
    Collision { gnode: NodeId, level: u8 },
}

/// How the sender relates to us at the packet's level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderRole {
    /// A link of ours at this level, towards the given (g)node id.
    Link(NodeId),
    /// A member of our own gnode forwarding inside it.
    Interior,
}

/// What a merge changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeOutcome {
    /// `(level, id)` of entries whose routes changed.
    pub touched: Vec<(u8, NodeId)>,
    /// Entries that were void before the merge.
    pub revived: usize,
}

// ---------------------------------------------------------------------------
// Building Blocks
// ---------------------------------------------------------------------------

/// Checks that `pkt` may be processed at all.
///
/// The flood must be confined to our gnode of `level + 1`, the sender must
/// be a known, hooked neighbor inside that gnode and, when it is one of our
/// links, the most recent hop must be the sender itself. A
/// `TRACER_PKT_CONNECT` with a single hop from the sender is accepted from a
/// hooking or unknown neighbor.
pub fn validate(
    me: &QuadroGroup,
    op: PacketOp,
    pkt: &TracerPacket,
    from: IpAddr,
    sender: Option<&RlistEntry>,
) -> Result<SenderRole, TracerReject> {
    let level = pkt.bcast.level;
    let expected = me.gid(level + 1);
    if pkt.bcast.gnode_id != expected {
        return Err(TracerReject::WrongGnode {
            level,
            expected,
            got: pkt.bcast.gnode_id,
        });
    }
    if pkt.bcast.gnode_ttl == 0 {
        return Err(TracerReject::TtlExpired);
    }

    let nb = QuadroGroup::from_ip(from);
    let connect = op == PacketOp::TracerPktConnect
        && pkt.hops() == 1
        && pkt.chunks[0].node == nb.gid(level);
    match sender {
        None if !connect => return Err(TracerReject::UnknownSender(from)),
        Some(entry) if entry.hooking && !connect => {
            return Err(TracerReject::SenderHooking(from));
        }
        _ => {}
    }

    let Some(divergence) = me.divergence(&nb) else {
        return Err(TracerReject::Collision {
            gnode: me.gid(1),
            level: 0,
        });
    };
    if divergence > level {
        return Err(TracerReject::SenderOutside { ip: from, level });
    }
    if divergence < level {
        return Ok(SenderRole::Interior);
    }

    let sender_id = nb.gid(level);
    let last = pkt.chunks.last().map(|c| c.node).unwrap_or(sender_id);
    if last != sender_id {
        return Err(TracerReject::Spoofed {
            level,
            last,
            sender: sender_id,
        });
    }
    Ok(SenderRole::Link(sender_id))
}

/// True when a hop equal to `me` cannot be us.
///
/// Our id legitimately shows up when we started the flood (chunk 0,
/// `own_origin`) or when we forwarded it, and then the hops around it are
/// our links. Anything else means another node holds our address.
pub fn detect_collision(
    me: NodeId,
    links: &[NodeId],
    chunks: &[TracerChunk],
    own_origin: bool,
) -> bool {
    chunks.iter().enumerate().any(|(i, chunk)| {
        if chunk.node != me {
            return false;
        }
        if i == 0 && !own_origin {
            return true;
        }
        let prev_ok = i == 0 || links.contains(&chunks[i - 1].node);
        let next_ok = chunks
            .get(i + 1)
            .map_or(true, |next| links.contains(&next.node));
        !(prev_ok && next_ok)
    })
}

/// `append_entry`: the chunk list grown by our own hop. The input is left
/// untouched.
pub fn append_entry(chunks: &[TracerChunk], me: NodeId, link_rtt: Rtt, gcount: u32) -> Vec<TracerChunk> {
    let mut grown = Vec::with_capacity(chunks.len() + 1);
    grown.extend_from_slice(chunks);
    grown.push(TracerChunk {
        node: me,
        rtt: link_rtt,
        gcount,
    });
    grown
}

/// The chunk list of a forwarded copy.
///
/// `outward` copies leave our gnode of `level` (always the case at level
/// 0) and carry our hop; interior copies only add the link rtt to the last
/// hop.
pub fn forward_chunks(
    me: &QuadroGroup,
    level: u8,
    chunks: &[TracerChunk],
    link_rtt: Rtt,
    gcount: u32,
    outward: bool,
) -> Vec<TracerChunk> {
    let my_id = me.gid(level);
    let last_is_me = chunks.last().is_some_and(|c| c.node == my_id);
    if (level == 0 || outward) && !last_is_me {
        return append_entry(chunks, my_id, link_rtt, gcount);
    }
    let mut copy = chunks.to_vec();
    if let Some(last) = copy.last_mut() {
        last.rtt = last.rtt.saturating_add(link_rtt);
    }
    copy
}

/// `merge_into_map`: stores a route through the most recent hop to every
/// hop from the newest back to `from_chunk`.
///
/// Revived entries leave `VOID`/`OLD` behind; at levels above 0 each hop's
/// member count is set from its chunk snapshot, which only moves the
/// difference up the hierarchy.
pub fn merge_into_map(
    w: &mut TopologyWrite<'_>,
    level: u8,
    chunks: &[TracerChunk],
    from_chunk: usize,
    link_rtt: Rtt,
    delta: Rtt,
) -> MergeOutcome {
    let mut outcome = MergeOutcome::default();
    let me = w.quadg.gid(level);
    let Some(gateway) = chunks.iter().rev().map(|c| c.node).find(|&n| n != me) else {
        return outcome;
    };

    let mut trtt = link_rtt;
    for chunk in chunks.iter().skip(from_chunk).rev() {
        if chunk.node == me {
            break;
        }
        let revived = w.revive(level, chunk.node);
        if level > 0 {
            w.ext_map
                .set_gcount(&w.quadg, level, chunk.node, chunk.gcount);
        }
        let change = w
            .node_mut(level, chunk.node)
            .upsert_rnode(RnodeTarget::Local(gateway), trtt, delta);
        if revived {
            outcome.revived += 1;
        }
        if revived || change.changed() {
            outcome.touched.push((level, chunk.node));
        }
        trtt = trtt.saturating_add(chunk.rtt);
    }
    outcome
}

/// Stores the border blocks of a packet in the bmap.
///
/// Blocks of (g)nodes outside our gnode, our own block and blocks of
/// entries we have no map slot for are skipped. Internet-gateway blocks are
/// returned for the gateway collaborator.
pub fn apply_border_blocks(w: &mut TopologyWrite<'_>, blocks: &[BorderBlock]) -> Vec<BorderBlock> {
    let levels = w.quadg.levels();
    let mut gateways = Vec::new();
    for block in blocks {
        if block.is_gateway(levels) {
            gateways.push(block.clone());
            continue;
        }
        let level = block.level(levels);
        let same_gnode = block
            .gids
            .iter()
            .enumerate()
            .skip(1)
            .all(|(i, gid)| *gid == w.quadg.gid(level + i as u8));
        let bnode = block.bnode();
        if !same_gnode || bnode == w.quadg.gid(level) || w.node(level, bnode).is_void() {
            trace!(level, bnode, "border block skipped");
            continue;
        }
        let links: Vec<_> = block
            .links
            .iter()
            .filter(|l| l.level > level && l.level <= levels)
            .copied()
            .collect();
        if links.is_empty() {
            continue;
        }
        if level == 0 {
            w.bmap.replace_links(0, bnode, links);
        } else {
            for link in links {
                w.bmap.add_link(level, bnode, link);
            }
        }
        w.node_mut(level, bnode).flags.insert(NodeFlags::BNODE);
    }
    gateways
}

/// Our own border block for `level`, when we are a border node there.
pub fn own_block(me: &QuadroGroup, bmap: &BorderMap, level: u8) -> Option<BorderBlock> {
    let entry = bmap.entry(level, me.gid(level))?;
    Some(BorderBlock {
        gids: me.gids()[level as usize..].to_vec(),
        links: entry.links.clone(),
    })
}

/// `blocks` with `own` replacing any previous block of the same bnode.
pub fn with_own_block(blocks: &[BorderBlock], own: Option<BorderBlock>) -> Vec<BorderBlock> {
    let mut out = blocks.to_vec();
    if let Some(own) = own {
        match out.iter().position(|b| b.gids == own.gids) {
            Some(i) => out[i] = own,
            None if out.len() < MAX_BNODE_BLOCKS => out.push(own),
            None => debug!("border block list full, own block not added"),
        }
    }
    out
}

/// Member count our own hop reports at `level`.
pub fn own_gcount(w: &TopologyWrite<'_>, level: u8) -> u32 {
    if level == 0 {
        1
    } else {
        w.ext_map.me_gnode(&w.quadg, level).gcount
    }
}

// ---------------------------------------------------------------------------
// Plain Tracer Floods
// ---------------------------------------------------------------------------

/// Result of processing one tracer packet.
#[derive(Debug, Default)]
pub struct TracerOutcome {
    pub outbound: Vec<Outbound>,
    /// `(level, id)` pairs needing a kernel route refresh.
    pub touched: Vec<(u8, NodeId)>,
    /// Internet-gateway blocks with the level they were seen at.
    pub gateways: Vec<(BorderBlock, u8)>,
}

/// Engine for `TRACER_PKT` / `TRACER_PKT_CONNECT`: one-shot floods that
/// announce a node (or gnode) to the rest of its gnode.
pub struct TracerEngine {
    levels: u8,
    rtt_delta: Rtt,
    seen: SeenCache,
}

impl TracerEngine {
    pub fn new(config: &ProtocolConfig) -> Self {
        Self {
            levels: config.levels(),
            rtt_delta: config.rtt_delta_ms,
            seen: SeenCache::new(config.seen_cache_size),
        }
    }

    /// `tracer_pkt_start(level)`: floods a fresh tracer with ourselves as
    /// the only hop. With `connect` the packet is a `TRACER_PKT_CONNECT`,
    /// the first announcement of a node that just hooked.
    pub fn start(
        &self,
        topology: &Topology,
        rlist: &RnodeList,
        level: u8,
        connect: bool,
    ) -> Vec<Outbound> {
        let me = topology.quadg();
        if level >= self.levels {
            warn!(level, "tracer start above the top level ignored");
            return Vec::new();
        }

        let (id, pkt) = {
            let mut w = topology.write();
            let gcount = own_gcount(&w, level);
            let node = w.me_node_mut(level);
            node.brdcast = node.brdcast.wrapping_add(1);
            let id = node.brdcast;
            let pkt = TracerPacket {
                bcast: BcastHeader {
                    gnode_id: me.gid(level + 1),
                    level,
                    gnode_ttl: MAX_TRACER_HOPS as u8,
                    sub_id: me.gid(0),
                    flags: BCAST_STARTER,
                },
                first_open_chunk: 0,
                chunks: vec![TracerChunk {
                    node: me.gid(level),
                    rtt: 0,
                    gcount,
                }],
                blocks: with_own_block(&[], own_block(&me, &w.bmap, level)),
            };
            (id, pkt)
        };

        let mut to: Vec<IpAddr> = rlist
            .links_at(&me, level)
            .into_iter()
            .map(|(_, ip)| ip)
            .collect();
        to.extend(rlist.interior_at(&me, level));
        if to.is_empty() {
            debug!(level, "no links, tracer not sent");
            return Vec::new();
        }
        let op = if connect {
            PacketOp::TracerPktConnect
        } else {
            PacketOp::TracerPkt
        };
        self.seen.insert(SeenCache::key(PacketOp::TracerPkt, id, &pkt));
        debug!(level, id, links = to.len(), "tracer flood started");
        vec![Outbound {
            to,
            packet: Packet::new(op, id, me.ip(), pkt.encode(self.levels)),
        }]
    }

    /// Handles a received `TRACER_PKT` or `TRACER_PKT_CONNECT`.
    pub fn handle(
        &self,
        topology: &Topology,
        rlist: &RnodeList,
        packet: &Packet,
    ) -> Result<TracerOutcome, TracerReject> {
        let pkt = TracerPacket::decode(&packet.body, self.levels)?;
        let me = topology.quadg();
        let level = pkt.bcast.level;
        let mut sender = rlist.get(&packet.from);
        let role = validate(&me, packet.op, &pkt, packet.from, sender.as_ref())?;

        if packet.op == PacketOp::TracerPktConnect {
            sender = Some(self.accept_connect(topology, rlist, packet, &pkt)?);
        }
        let Some(sender) = sender else {
            return Err(TracerReject::UnknownSender(packet.from));
        };
        if !self
            .seen
            .insert(SeenCache::key(PacketOp::TracerPkt, packet.id, &pkt))
        {
            return Err(TracerReject::Duplicate);
        }

        let mut outcome = TracerOutcome::default();
        let my_id = me.gid(level);
        let first = pkt.chunks[0].node;
        let (outward, interior) = {
            let mut w = topology.write();

            if level == 0 {
                if first == my_id && w.int_map.me_node().brdcast >= packet.id {
                    return Err(TracerReject::OwnFlood);
                }
                let links = w.int_map.local_links();
                if detect_collision(my_id, &links, &pkt.chunks, false) {
                    return Err(TracerReject::Collision {
                        gnode: me.gid(1),
                        level: 0,
                    });
                }
            }
            if first != my_id {
                let last = w.node(level, first).brdcast;
                if last >= packet.id {
                    return Err(TracerReject::StaleBroadcast {
                        node: first,
                        id: packet.id,
                        last,
                    });
                }
            }

            let merged = merge_into_map(&mut w, level, &pkt.chunks, 0, sender.rtt, self.rtt_delta);
            if first != my_id && !w.node(level, first).is_void() {
                w.node_mut(level, first).brdcast = packet.id;
            }
            outcome.touched = merged.touched;
            outcome.gateways = apply_border_blocks(&mut w, &pkt.blocks)
                .into_iter()
                .map(|b| (b, level))
                .collect();

            let gcount = own_gcount(&w, level);
            let own = own_block(&me, &w.bmap, level);
            let blocks = with_own_block(&pkt.blocks, own);
            let outward = forward_chunks(&me, level, &pkt.chunks, sender.rtt, gcount, true);
            let interior = forward_chunks(&me, level, &pkt.chunks, sender.rtt, gcount, false);
            ((outward, blocks.clone()), (interior, blocks))
        };
        trace!(level, id = packet.id, ?role, hops = pkt.hops(), "tracer merged");

        if pkt.bcast.gnode_ttl <= 1 {
            trace!(level, "ttl exhausted, tracer not forwarded");
            return Ok(outcome);
        }
        let bcast = BcastHeader {
            gnode_ttl: pkt.bcast.gnode_ttl - 1,
            ..pkt.bcast
        };

        let visited: Vec<NodeId> = pkt.chunks.iter().map(|c| c.node).collect();
        let links: Vec<IpAddr> = rlist
            .links_at(&me, level)
            .into_iter()
            .filter(|(gid, ip)| *ip != packet.from && !visited.contains(gid))
            .map(|(_, ip)| ip)
            .collect();
        let interior_to: Vec<IpAddr> = rlist
            .interior_at(&me, level)
            .into_iter()
            .filter(|ip| *ip != packet.from)
            .collect();

        let build = |chunks: Vec<TracerChunk>, blocks: Vec<BorderBlock>| TracerPacket {
            bcast,
            first_open_chunk: pkt.first_open_chunk,
            chunks,
            blocks,
        };
        if !links.is_empty() && outward.0.len() <= MAX_TRACER_HOPS {
            let fwd = build(outward.0, outward.1);
            outcome.outbound.push(Outbound {
                to: links,
                packet: Packet::new(PacketOp::TracerPkt, packet.id, me.ip(), fwd.encode(self.levels)),
            });
        }
        if !interior_to.is_empty() && level > 0 {
            let fwd = build(interior.0, interior.1);
            outcome.outbound.push(Outbound {
                to: interior_to,
                packet: Packet::new(PacketOp::TracerPkt, packet.id, me.ip(), fwd.encode(self.levels)),
            });
        }
        Ok(outcome)
    }

    /// Links a node announcing itself with `TRACER_PKT_CONNECT` and returns
    /// its (refreshed) rnode list entry.
    fn accept_connect(
        &self,
        topology: &Topology,
        rlist: &RnodeList,
        packet: &Packet,
        pkt: &TracerPacket,
    ) -> Result<RlistEntry, TracerReject> {
        if let Some(mut entry) = rlist.get(&packet.from) {
            entry.hooking = false;
            rlist.upsert(entry.clone());
            return Ok(entry);
        }
        let nb = QuadroGroup::from_ip(packet.from);
        let rtt = pkt.chunks[0].rtt.max(1);
        let mut touched = Vec::new();
        let link = topology
            .write()
            .link_neighbor(&nb, rtt, self.rtt_delta, &mut touched)
            .ok_or(TracerReject::UnknownSender(packet.from))?;
        let entry = RlistEntry {
            ip: packet.from,
            quadg: nb,
            ifaces: packet.iface.iter().cloned().collect(),
            rtt,
            target: link.target,
            hooking: false,
            misses: 0,
        };
        rlist.upsert(entry.clone());
        debug!(ip = %packet.from, "neighbor connected");
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::BnodeLink;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn chunk(node: NodeId, rtt: Rtt) -> TracerChunk {
        TracerChunk {
            node,
            rtt,
            gcount: 1,
        }
    }

    fn neighbor(s: &str, rtt: Rtt) -> RlistEntry {
        let quadg = QuadroGroup::from_ip(ip(s));
        RlistEntry {
            ip: quadg.ip(),
            target: RnodeTarget::Local(quadg.gid(0)),
            quadg,
            ifaces: vec!["eth0".into()],
            rtt,
            hooking: false,
            misses: 0,
        }
    }

    fn level0(chunks: Vec<TracerChunk>, ttl: u8) -> TracerPacket {
        at_level(0, chunks, ttl)
    }

    fn at_level(level: u8, chunks: Vec<TracerChunk>, ttl: u8) -> TracerPacket {
        TracerPacket {
            bcast: BcastHeader {
                gnode_id: 0,
                level,
                gnode_ttl: ttl,
                sub_id: chunks[0].node,
                flags: BCAST_STARTER,
            },
            first_open_chunk: 0,
            chunks,
            blocks: Vec::new(),
        }
    }

    fn packet(from: &str, id: u32, pkt: &TracerPacket) -> Packet {
        Packet::new(PacketOp::TracerPkt, id, ip(from), pkt.encode(4))
    }

    fn setup() -> (Topology, RnodeList, TracerEngine) {
        let topology = Topology::new(ip("10.0.0.1"));
        let rlist = RnodeList::new();
        rlist.upsert(neighbor("10.0.0.3", 15));
        rlist.upsert(neighbor("10.0.0.9", 40));
        (topology, rlist, TracerEngine::new(&ProtocolConfig::default()))
    }

    #[test]
    fn append_entry_leaves_the_input_alone() {
        let chunks = vec![chunk(5, 0)];
        let grown = append_entry(&chunks, 1, 30, 1);
        assert_eq!(chunks.len(), 1);
        assert_eq!(grown.len(), 2);
        assert_eq!(grown[1], chunk(1, 30));
    }

    #[test]
    fn interior_forward_only_grows_the_last_rtt() {
        let me = QuadroGroup::from_ip(ip("10.0.2.1"));
        let chunks = vec![TracerChunk {
            node: 7,
            rtt: 10,
            gcount: 3,
        }];
        let inner = forward_chunks(&me, 1, &chunks, 5, 4, false);
        assert_eq!(inner.len(), 1);
        assert_eq!(inner[0].rtt, 15);
        let outer = forward_chunks(&me, 1, &chunks, 5, 4, true);
        assert_eq!(outer.len(), 2);
        assert_eq!(outer[1].node, 2);
        assert_eq!(outer[1].gcount, 4);
    }

    #[test]
    fn own_id_in_the_path_is_a_collision_unless_it_is_us() {
        let links = [3, 4];
        // We forwarded between two links of ours.
        assert!(!detect_collision(1, &links, &[chunk(3, 0), chunk(1, 5), chunk(4, 5)], false));
        // Somebody started a flood with our id.
        assert!(detect_collision(1, &links, &[chunk(1, 0), chunk(3, 5)], false));
        assert!(!detect_collision(1, &links, &[chunk(1, 0), chunk(3, 5)], true));
        // Our id next to a node that is not a link of ours.
        assert!(detect_collision(1, &links, &[chunk(9, 0), chunk(1, 5), chunk(3, 5)], false));
    }

    #[test]
    fn merge_accumulates_rtt_backwards() {
        let (topology, _, _) = setup();
        let mut w = topology.write();
        let chunks = vec![chunk(5, 0), chunk(7, 20), chunk(3, 10)];
        let outcome = merge_into_map(&mut w, 0, &chunks, 0, 15, 0);
        assert_eq!(outcome.revived, 3);
        assert_eq!(w.node(0, 3).best().unwrap().trtt, 15);
        assert_eq!(w.node(0, 7).best().unwrap().trtt, 25);
        assert_eq!(w.node(0, 5).best().unwrap().trtt, 45);
        assert_eq!(w.node(0, 5).best().unwrap().target, RnodeTarget::Local(3));
        assert_eq!(w.ext_map.me_gnode(&w.quadg, 1).gcount, 4);
    }

    #[test]
    fn merge_stops_at_our_own_hop() {
        let (topology, _, _) = setup();
        let mut w = topology.write();
        let chunks = vec![chunk(5, 0), chunk(1, 20), chunk(3, 10)];
        let outcome = merge_into_map(&mut w, 0, &chunks, 0, 15, 0);
        assert_eq!(outcome.touched, vec![(0, 3)]);
        assert!(w.node(0, 5).is_void());
    }

    #[test]
    fn tracer_is_merged_and_forwarded_to_other_links() {
        let (topology, rlist, engine) = setup();
        let pkt = level0(vec![chunk(5, 0), chunk(7, 20), chunk(3, 10)], 10);
        let outcome = engine
            .handle(&topology, &rlist, &packet("10.0.0.3", 1, &pkt))
            .unwrap();

        assert_eq!(outcome.touched.len(), 3);
        assert_eq!(outcome.outbound.len(), 1);
        let out = &outcome.outbound[0];
        assert_eq!(out.to, vec![ip("10.0.0.9")]);
        let fwd = TracerPacket::decode(&out.packet.body, 4).unwrap();
        assert_eq!(fwd.bcast.gnode_ttl, 9);
        assert_eq!(fwd.chunks.last(), Some(&chunk(1, 15)));
        assert_eq!(topology.read().node(0, 5).brdcast, 1);
    }

    #[test]
    fn second_delivery_is_rejected() {
        let (topology, rlist, engine) = setup();
        let pkt = level0(vec![chunk(5, 0), chunk(3, 10)], 10);
        engine
            .handle(&topology, &rlist, &packet("10.0.0.3", 4, &pkt))
            .unwrap();
        assert_eq!(
            engine
                .handle(&topology, &rlist, &packet("10.0.0.3", 4, &pkt))
                .unwrap_err(),
            TracerReject::Duplicate
        );

        // Same flood, another path: the first hop's broadcast id catches it.
        let other = level0(vec![chunk(5, 0), chunk(9, 10)], 10);
        assert_eq!(
            engine
                .handle(&topology, &rlist, &packet("10.0.0.9", 4, &other))
                .unwrap_err(),
            TracerReject::StaleBroadcast {
                node: 5,
                id: 4,
                last: 4
            }
        );
    }

    #[test]
    fn invalid_packets_leave_the_map_alone() {
        let (topology, rlist, engine) = setup();
        let spoofed = level0(vec![chunk(5, 0), chunk(7, 10)], 10);
        assert!(matches!(
            engine.handle(&topology, &rlist, &packet("10.0.0.3", 1, &spoofed)),
            Err(TracerReject::Spoofed { .. })
        ));
        let stranger = level0(vec![chunk(8, 0)], 10);
        assert!(matches!(
            engine.handle(&topology, &rlist, &packet("10.0.0.8", 1, &stranger)),
            Err(TracerReject::UnknownSender(_))
        ));
        let collision = level0(vec![chunk(1, 0), chunk(3, 10)], 10);
        assert!(matches!(
            engine.handle(&topology, &rlist, &packet("10.0.0.3", 1, &collision)),
            Err(TracerReject::Collision { level: 0, .. })
        ));
        assert_eq!(topology.read().int_map.alive_count(), 1);
    }

    #[test]
    fn expiring_ttl_stops_the_flood() {
        let (topology, rlist, engine) = setup();
        let pkt = level0(vec![chunk(3, 0)], 1);
        let outcome = engine
            .handle(&topology, &rlist, &packet("10.0.0.3", 1, &pkt))
            .unwrap();
        assert!(outcome.outbound.is_empty());
        assert!(!topology.read().node(0, 3).is_void());
    }

    #[test]
    fn interior_member_relays_upper_level_floods() {
        let (topology, rlist, engine) = setup();
        let pkt = at_level(
            1,
            vec![TracerChunk {
                node: 5,
                rtt: 10,
                gcount: 3,
            }],
            10,
        );
        let outcome = engine
            .handle(&topology, &rlist, &packet("10.0.0.3", 1, &pkt))
            .unwrap();

        assert!(!topology.read().node(1, 5).is_void());
        assert_eq!(outcome.outbound.len(), 1);
        let out = &outcome.outbound[0];
        assert_eq!(out.to, vec![ip("10.0.0.9")]);
        let fwd = TracerPacket::decode(&out.packet.body, 4).unwrap();
        assert_eq!(fwd.chunks.len(), 1);
        assert_eq!(fwd.chunks[0].node, 5);
        assert_eq!(fwd.chunks[0].rtt, 25);
    }

    #[test]
    fn gateway_blocks_are_handed_over_not_stored() {
        let (topology, rlist, engine) = setup();
        let gateway = BorderBlock {
            gids: vec![3, 0, 0, 10],
            links: vec![BnodeLink {
                gnode: 0,
                level: 5,
                rtt: 8,
            }],
        };
        let mut pkt = level0(vec![chunk(3, 0)], 10);
        pkt.blocks = vec![gateway.clone()];
        let outcome = engine
            .handle(&topology, &rlist, &packet("10.0.0.3", 1, &pkt))
            .unwrap();

        assert_eq!(outcome.gateways, vec![(gateway, 0)]);
        let r = topology.read();
        assert!(r.bmap.entry(0, 3).is_none());
        assert!(!r.node(0, 3).flags.contains(NodeFlags::BNODE));
    }

    #[test]
    fn start_sends_to_every_link() {
        let (topology, rlist, engine) = setup();
        let out = engine.start(&topology, &rlist, 0, false);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].to.len(), 2);
        let pkt = TracerPacket::decode(&out[0].packet.body, 4).unwrap();
        assert_eq!(pkt.chunks, vec![chunk(1, 0)]);
        assert_eq!(out[0].packet.id, 1);
    }

    #[test]
    fn connect_links_an_unknown_neighbor() {
        let (topology, rlist, engine) = setup();
        let pkt = level0(vec![chunk(20, 7)], 10);
        let raw = Packet::new(PacketOp::TracerPktConnect, 1, ip("10.0.0.20"), pkt.encode(4));
        engine.handle(&topology, &rlist, &raw).unwrap();
        assert!(rlist.contains(&ip("10.0.0.20")));
        assert!(topology.read().int_map.me_node().find_rnode(RnodeTarget::Local(20)).is_some());
    }
}
