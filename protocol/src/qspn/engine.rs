//! # QSPN Engine
//!
//! Quantum Shortest Path Netsukuku: a two-phase flood run per level every
//! time the topology of a gnode changes.
//!
//! ## Close phase
//!
//! The starter floods a `QSPN_CLOSE` tracer. Each receiver merges the path
//! and marks the link it came from as closed, then passes the packet on to
//! the links that are still open. The node whose last link closes becomes an
//! opener.
//!
//! ## Open phase
//!
//! An opener answers the link that closed it with a minimal `QSPN_OPEN`
//! (only its own hop) and sends the full path to its other links, with
//! `first_open_chunk` pointing at its own hop so receivers only merge the
//! fresh part. Opens are tracked per flood originator (`sub_id`); once every
//! link opened for every known originator the level goes back to idle.
//!
//! ## Upper levels
//!
//! At level `L > 0` the state machine runs on the border nodes (the nodes
//! with links at `L`). Every member of the gnode relays the packets inside
//! it, growing the rtt of the last hop instead of adding one, and the
//! duplicate filter stops interior echoes.

use std::collections::BTreeSet;
use std::net::IpAddr;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, trace};

use crate::config::{ProtocolConfig, MAX_TRACER_HOPS};
use crate::map::{NodeId, Rtt, Topology};
use crate::radar::RnodeList;
use crate::tracer::{
    apply_border_blocks, detect_collision, forward_chunks, merge_into_map, own_block,
    own_gcount, validate, with_own_block, BcastHeader, BorderBlock, Outbound, SeenCache,
    SenderRole, TracerChunk, TracerPacket, TracerReject, BCAST_OPENER, BCAST_STARTER,
};
use crate::wire::{Packet, PacketOp};

use super::round::{CloseStep, LevelState, LevelStatus, Phase, RoundCheck, RoundClock};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QspnError {
    #[error(transparent)]
    Tracer(#[from] TracerReject),

    #[error("round {id} at level {level} is older than {current}")]
    StaleRound { level: u8, id: u32, current: u32 },

    #[error("a newer round at level {level} superseded this send")]
    Superseded { level: u8 },

    #[error("no links at level {level}")]
    NoLinks { level: u8 },

    #[error("level {0} is outside the network")]
    LevelOutOfRange(u8),
}

/// Result of processing one QSPN packet.
#[derive(Debug)]
pub struct QspnOutcome {
    pub outbound: Vec<Outbound>,
    pub touched: Vec<(u8, NodeId)>,
    pub gateways: Vec<(BorderBlock, u8)>,
    /// Phase of the level after the packet.
    pub phase: Phase,
}

/// What the state machine decided for one packet.
enum Step {
    /// Closed the sender's link; `opener` when it was the last one.
    Closed { opener: bool },
    /// The sender's link had already closed: merge only.
    MergeOnly,
    /// Opened the sender's link for the packet's flood.
    Opened,
    /// Relay without touching the state (interior sender).
    Relay,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct QspnEngine {
    levels: u8,
    rtt_delta: Rtt,
    config: ProtocolConfig,
    seen: SeenCache,
    rounds: Vec<RoundClock>,
    states: Mutex<Vec<LevelState>>,
    send_locks: Vec<tokio::sync::Mutex<()>>,
}

impl QspnEngine {
    pub fn new(config: &ProtocolConfig) -> Self {
        let levels = config.levels();
        Self {
            levels,
            rtt_delta: config.rtt_delta_ms,
            config: config.clone(),
            seen: SeenCache::new(config.seen_cache_size),
            rounds: (0..levels).map(|_| RoundClock::default()).collect(),
            states: Mutex::new((0..levels).map(|_| LevelState::default()).collect()),
            send_locks: (0..levels).map(|_| tokio::sync::Mutex::new(())).collect(),
        }
    }

    /// Current round id of `level`.
    pub fn round(&self, level: u8) -> u32 {
        self.rounds
            .get(level as usize)
            .map_or(0, RoundClock::current)
    }

    pub fn phase(&self, level: u8) -> Phase {
        self.states
            .lock()
            .get(level as usize)
            .map_or(Phase::Idle, |s| s.phase)
    }

    /// Forgets when the last rounds ran, so the next send at any level goes
    /// out immediately.
    pub fn reset_timers(&self) {
        for state in self.states.lock().iter_mut() {
            state.last_round = None;
        }
    }

    pub fn status(&self) -> Vec<LevelStatus> {
        let states = self.states.lock();
        states
            .iter()
            .enumerate()
            .map(|(level, state)| LevelStatus {
                level: level as u8,
                round: self.rounds[level].current(),
                phase: state.phase,
                closed: state.closed().iter().copied().collect(),
                starter: state.starter,
                opener: state.opener,
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Starting a Round
    // -----------------------------------------------------------------------

    /// `qspn_send(level)`: starts a new round at `level`.
    ///
    /// Sends are serialized per level. When the previous round is younger
    /// than the level's round spacing the call sleeps out the difference and
    /// gives up if another round started meanwhile.
    pub async fn send(
        &self,
        topology: &Topology,
        rlist: &RnodeList,
        level: u8,
    ) -> Result<Vec<Outbound>, QspnError> {
        let lock = self
            .send_locks
            .get(level as usize)
            .ok_or(QspnError::LevelOutOfRange(level))?;
        let _guard = lock.lock().await;

        let clock = &self.rounds[level as usize];
        let id = clock.current();
        let last_round = self.states.lock()[level as usize].last_round;
        if let Some(last) = last_round {
            let wait = self.config.wait_round(level);
            let elapsed = last.elapsed();
            if elapsed < wait {
                debug!(level, wait_ms = (wait - elapsed).as_millis() as u64, "waiting for the round spacing");
                tokio::time::sleep(wait - elapsed).await;
                if clock.current() != id {
                    return Err(QspnError::Superseded { level });
                }
            }
        }

        let me = topology.quadg();
        let links = rlist.links_at(&me, level);
        if links.is_empty() {
            debug!(level, "no links, round not started");
            return Err(QspnError::NoLinks { level });
        }
        let round = {
            let mut states = self.states.lock();
            let round = clock
                .bump(id)
                .map_err(|_| QspnError::Superseded { level })?;
            let state = &mut states[level as usize];
            state.reset(Instant::now());
            state.starter = true;
            state.phase = Phase::Close;
            round
        };

        let pkt = {
            let w = topology.write();
            TracerPacket {
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
                    gcount: own_gcount(&w, level),
                }],
                blocks: with_own_block(&[], own_block(&me, &w.bmap, level)),
            }
        };
        self.seen
            .insert(SeenCache::key(PacketOp::QspnClose, round, &pkt));

        let mut to: Vec<IpAddr> = links.into_iter().map(|(_, ip)| ip).collect();
        if level > 0 {
            to.extend(rlist.interior_at(&me, level));
        }
        info!(level, qspn_id = round, links = to.len(), "qspn round started");
        Ok(vec![Outbound {
            to,
            packet: Packet::new(PacketOp::QspnClose, round, me.ip(), pkt.encode(self.levels)),
        }])
    }

    // -----------------------------------------------------------------------
    // Receiving
    // -----------------------------------------------------------------------

    /// Handles a received `QSPN_CLOSE` or `QSPN_OPEN`.
    pub fn handle(
        &self,
        topology: &Topology,
        rlist: &RnodeList,
        packet: &Packet,
    ) -> Result<QspnOutcome, QspnError> {
        let pkt = TracerPacket::decode(&packet.body, self.levels).map_err(TracerReject::from)?;
        let me = topology.quadg();
        let level = pkt.bcast.level;
        let sender = rlist.get(&packet.from);
        let role = validate(&me, packet.op, &pkt, packet.from, sender.as_ref())?;
        let Some(sender) = sender else {
            return Err(TracerReject::UnknownSender(packet.from).into());
        };
        let close = packet.op == PacketOp::QspnClose;
        let sub_id = pkt.bcast.sub_id;

        let clock = &self.rounds[level as usize];
        let links = rlist.links_at(&me, level);
        let link_keys: BTreeSet<NodeId> = links.iter().map(|(gid, _)| *gid).collect();
        let my_id = me.gid(level);

        // State machine first, under its own lock; the map merge follows.
        // The round only moves once the packet passed every check.
        let (step, closed, opened, phase) = {
            let mut states = self.states.lock();
            let state = &mut states[level as usize];

            let check = clock.classify(packet.id);
            if check == RoundCheck::Stale {
                return Err(QspnError::StaleRound {
                    level,
                    id: packet.id,
                    current: clock.current(),
                });
            }
            if !self.seen.insert(SeenCache::key(packet.op, packet.id, &pkt)) {
                return Err(TracerReject::Duplicate.into());
            }

            let own_origin = check == RoundCheck::Current
                && pkt.chunks[0].node == my_id
                && ((pkt.bcast.flags & BCAST_STARTER != 0 && state.starter)
                    || (pkt.bcast.flags & BCAST_OPENER != 0 && state.opener));
            if level == 0 {
                let local_links = topology.read().int_map.local_links();
                if detect_collision(my_id, &local_links, &pkt.chunks, own_origin) {
                    return Err(TracerReject::Collision {
                        gnode: me.gid(1),
                        level: 0,
                    }
                    .into());
                }
            }

            if clock.observe(packet.id) == RoundCheck::Newer {
                debug!(level, qspn_id = packet.id, "new qspn round");
                state.reset(Instant::now());
            }
            let step = match (close, role) {
                (true, SenderRole::Link(link)) => match state.close_link(link, &link_keys) {
                    CloseStep::AlreadyClosed => Step::MergeOnly,
                    CloseStep::Closed { all } => Step::Closed { opener: all },
                },
                (false, SenderRole::Link(link)) => {
                    if state.is_opened(sub_id, link) {
                        return Err(TracerReject::Duplicate.into());
                    }
                    state.open_link(sub_id, link);
                    Step::Opened
                }
                (_, SenderRole::Interior) => Step::Relay,
            };
            let closed = state.closed().clone();
            let opened: BTreeSet<NodeId> = link_keys
                .iter()
                .copied()
                .filter(|k| state.is_opened(sub_id, *k))
                .collect();
            if matches!(step, Step::Opened) && state.finish_if_opened(&link_keys) {
                debug!(level, qspn_id = packet.id, "qspn round complete");
            }
            (step, closed, opened, state.phase)
        };

        let from_chunk = if close {
            0
        } else {
            pkt.first_open_chunk as usize
        };
        let mut outcome = QspnOutcome {
            outbound: Vec::new(),
            touched: Vec::new(),
            gateways: Vec::new(),
            phase,
        };
        let (outward, interior, blocks, gcount) = {
            let mut w = topology.write();
            let merged = merge_into_map(&mut w, level, &pkt.chunks, from_chunk, sender.rtt, self.rtt_delta);
            outcome.touched = merged.touched;
            outcome.gateways = apply_border_blocks(&mut w, &pkt.blocks)
                .into_iter()
                .map(|b| (b, level))
                .collect();
            let gcount = own_gcount(&w, level);
            let blocks = with_own_block(&pkt.blocks, own_block(&me, &w.bmap, level));
            let outward = forward_chunks(&me, level, &pkt.chunks, sender.rtt, gcount, true);
            let interior = forward_chunks(&me, level, &pkt.chunks, sender.rtt, gcount, false);
            (outward, interior, blocks, gcount)
        };
        trace!(level, qspn_id = packet.id, touched = outcome.touched.len(), "qspn merged");

        let interior_to: Vec<IpAddr> = if level > 0 {
            rlist
                .interior_at(&me, level)
                .into_iter()
                .filter(|ip| *ip != packet.from)
                .collect()
        } else {
            Vec::new()
        };
        let links_where = |keep: &dyn Fn(NodeId) -> bool| -> Vec<IpAddr> {
            links
                .iter()
                .filter(|(gid, ip)| *ip != packet.from && keep(*gid))
                .map(|(_, ip)| *ip)
                .collect()
        };
        let participant = !link_keys.is_empty();
        let ttl = pkt.bcast.gnode_ttl.saturating_sub(1);
        let forward = |chunks: Vec<TracerChunk>, first_open_chunk: u16, flags: u8, ttl: u8| {
            TracerPacket {
                bcast: BcastHeader {
                    gnode_ttl: ttl,
                    flags,
                    ..pkt.bcast
                },
                first_open_chunk,
                chunks,
                blocks: blocks.clone(),
            }
            .encode(self.levels)
        };
        let mut push = |to: Vec<IpAddr>, op: PacketOp, body: bytes::Bytes| {
            if !to.is_empty() {
                outcome
                    .outbound
                    .push(Outbound {
                        to,
                        packet: Packet::new(op, packet.id, me.ip(), body),
                    });
            }
        };

        match step {
            Step::MergeOnly => {}
            Step::Closed { opener: true } => {
                info!(level, qspn_id = packet.id, "all links closed, opening");
                let minimal = vec![TracerChunk {
                    node: my_id,
                    rtt: 0,
                    gcount,
                }];
                push(
                    vec![packet.from],
                    PacketOp::QspnOpen,
                    forward(minimal, 0, BCAST_OPENER, MAX_TRACER_HOPS as u8),
                );
                if ttl > 0 && outward.len() <= MAX_TRACER_HOPS {
                    let first_open = (outward.len() - 1) as u16;
                    let from_link = match role {
                        SenderRole::Link(link) => Some(link),
                        SenderRole::Interior => None,
                    };
                    push(
                        links_where(&|gid| Some(gid) != from_link),
                        PacketOp::QspnOpen,
                        forward(outward.clone(), first_open, BCAST_OPENER, ttl),
                    );
                    let first_open = interior.len().saturating_sub(1) as u16;
                    push(
                        interior_to.clone(),
                        PacketOp::QspnOpen,
                        forward(interior.clone(), first_open, BCAST_OPENER, ttl),
                    );
                }
            }
            Step::Closed { opener: false } | Step::Opened | Step::Relay => {
                let (op, done) = if close {
                    (PacketOp::QspnClose, &closed)
                } else {
                    (PacketOp::QspnOpen, &opened)
                };
                if ttl > 0 && outward.len() <= MAX_TRACER_HOPS {
                    if participant {
                        push(
                            links_where(&|gid| !done.contains(&gid)),
                            op,
                            forward(outward.clone(), pkt.first_open_chunk, pkt.bcast.flags, ttl),
                        );
                    }
                    push(
                        interior_to.clone(),
                        op,
                        forward(interior.clone(), pkt.first_open_chunk, pkt.bcast.flags, ttl),
                    );
                }
            }
        }
        Ok(outcome)
    }
}
