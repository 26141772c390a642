//! # Node Daemon
//!
//! Wires the topology, the rnode list, the radar and the two flood engines to
//! a [`Transport`] and the [`Collaborators`], and runs them:
//!
//! - a radar loop scanning every `scan_interval`,
//! - an inbound loop dispatching each packet on its own task,
//! - detached QSPN sends for every level a scan found dirty.
//!
//! Packet-level failures never leave [`Daemon::handle_packet`]: they are
//! counted, logged and dropped. Identity collisions are the exception that
//! escapes as a rehook request, serialized by a single rehook lock.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use crate::codec::DecodeError;
use crate::config::ProtocolConfig;
use crate::map::{
    merge_external_maps, AllocError, BorderMap, ExternalMap, InternalMap, MapSummary, NodeId,
    QuadroGroup, Topology,
};
use crate::qspn::{LevelStatus, QspnEngine, QspnError};
use crate::radar::{Radar, RadarError, RadarPhase, RadarReport, RlistEntry, RnodeList};
use crate::store::{MapStore, StoreError};
use crate::tracer::{BorderBlock, Outbound, TracerEngine, TracerReject};
use crate::transport::{send_with_retry, Collaborators, ReplyTable, Transport, TransportError};
use crate::wire::{EchoFlags, MapKind, Packet, PacketOp};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("radar: {0}")]
    Radar(#[from] RadarError),

    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    #[error("qspn: {0}")]
    Qspn(#[from] QspnError),

    #[error("store: {0}")]
    Store(#[from] StoreError),

    #[error("allocation: {0}")]
    Alloc(#[from] AllocError),

    #[error("map from {from} is malformed: {source}")]
    BadMap {
        from: IpAddr,
        #[source]
        source: DecodeError,
    },

    #[error("{from} answered {op} to a map request")]
    UnexpectedReply { from: IpAddr, op: PacketOp },
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

/// Counters read by the metrics exporter.
#[derive(Debug, Default)]
pub struct DaemonStats {
    pub scans: AtomicU64,
    pub packets_handled: AtomicU64,
    pub packets_dropped: AtomicU64,
    pub rounds_started: AtomicU64,
    pub tracers_started: AtomicU64,
    pub routes_updated: AtomicU64,
    pub rehooks: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub scans: u64,
    pub packets_handled: u64,
    pub packets_dropped: u64,
    pub rounds_started: u64,
    pub tracers_started: u64,
    pub routes_updated: u64,
    pub rehooks: u64,
}

impl DaemonStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            scans: self.scans.load(Ordering::Relaxed),
            packets_handled: self.packets_handled.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
            rounds_started: self.rounds_started.load(Ordering::Relaxed),
            tracers_started: self.tracers_started.load(Ordering::Relaxed),
            routes_updated: self.routes_updated.load(Ordering::Relaxed),
            rehooks: self.rehooks.load(Ordering::Relaxed),
        }
    }
}

/// Everything `/status` shows.
#[derive(Debug, Clone, Serialize)]
pub struct DaemonStatus {
    pub map: MapSummary,
    pub radar: RadarPhase,
    pub qspn: Vec<LevelStatus>,
    pub neighbors: Vec<RlistEntry>,
    pub stats: StatsSnapshot,
}

/// A map fetched from a neighbor.
#[derive(Debug)]
pub enum FetchedMap {
    Internal(InternalMap),
    External(ExternalMap),
    Border(BorderMap),
}

/// How [`Daemon::hook`] entered the network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HookOutcome {
    /// Nobody answered: a brand-new gnode was created.
    SoleSeed,
    /// Joined through `via`, whose external map taught us `gnodes_learned`
    /// gnodes.
    Joined { via: IpAddr, gnodes_learned: usize },
}

// ---------------------------------------------------------------------------
// Daemon
// ---------------------------------------------------------------------------

pub struct Daemon {
    config: ProtocolConfig,
    topology: Arc<Topology>,
    rlist: Arc<RnodeList>,
    radar: Radar,
    tracer: TracerEngine,
    qspn: QspnEngine,
    replies: ReplyTable,
    transport: Arc<dyn Transport>,
    collab: Arc<dyn Collaborators>,
    store: Option<MapStore>,
    rehook_lock: Mutex<()>,
    stats: DaemonStats,
}

impl Daemon {
    pub fn new(
        config: ProtocolConfig,
        topology: Arc<Topology>,
        transport: Arc<dyn Transport>,
        collab: Arc<dyn Collaborators>,
    ) -> Self {
        Self {
            radar: Radar::new(&config),
            tracer: TracerEngine::new(&config),
            qspn: QspnEngine::new(&config),
            config,
            topology,
            rlist: Arc::new(RnodeList::new()),
            replies: ReplyTable::new(),
            transport,
            collab,
            store: None,
            rehook_lock: Mutex::new(()),
            stats: DaemonStats::default(),
        }
    }

    /// Saves the maps to `store` on shutdown.
    pub fn with_store(mut self, store: MapStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    pub fn rlist(&self) -> &Arc<RnodeList> {
        &self.rlist
    }

    pub fn qspn(&self) -> &QspnEngine {
        &self.qspn
    }

    pub fn stats(&self) -> &DaemonStats {
        &self.stats
    }

    pub fn status(&self) -> DaemonStatus {
        DaemonStatus {
            map: self.topology.summary(),
            radar: self.radar.phase(),
            qspn: self.qspn.status(),
            neighbors: self.rlist.snapshot(),
            stats: self.stats.snapshot(),
        }
    }

    // -----------------------------------------------------------------------
    // Radar
    // -----------------------------------------------------------------------

    /// `radar_scan()`: one scan, reconciled into the maps. Dirty levels get
    /// a QSPN round on a detached task.
    pub async fn radar_scan(self: &Arc<Self>) -> Result<RadarReport, DaemonError> {
        let report = self.scan_and_reconcile(false).await?;
        if report.alone {
            self.qspn.reset_timers();
        } else {
            for &level in &report.dirty_levels {
                self.spawn_qspn_send(level);
            }
        }
        Ok(report)
    }

    /// The first scan of a joining node. Nobody answering makes this node
    /// the sole seed of a brand-new gnode; no round is started either way.
    pub async fn bootstrap_scan(&self) -> Result<RadarReport, DaemonError> {
        let report = self.scan_and_reconcile(true).await?;
        if report.alone {
            self.topology.become_sole_seed();
            self.topology.finish_hooking();
            self.qspn.reset_timers();
        }
        Ok(report)
    }

    /// Joins the network: scans as a hooking node, then either seeds a new
    /// gnode or takes the external map of the closest neighbor, clears the
    /// hooking flag and announces itself with a `TRACER_PKT_CONNECT`.
    pub async fn hook(&self) -> Result<HookOutcome, DaemonError> {
        let report = self.bootstrap_scan().await?;
        if report.alone {
            return Ok(HookOutcome::SoleSeed);
        }
        let Some(via) = self
            .rlist
            .snapshot()
            .into_iter()
            .filter(|e| !e.hooking)
            .min_by_key(|e| e.rtt)
            .map(|e| e.ip)
        else {
            return Ok(HookOutcome::SoleSeed);
        };

        let gnodes_learned = match self.request_map(MapKind::External, via).await {
            Ok(FetchedMap::External(ext)) => {
                let mut w = self.topology.write();
                let merged = merge_external_maps(
                    &mut w.ext_map,
                    &ext,
                    &w.quadg,
                    &QuadroGroup::from_ip(via),
                );
                merged.added.len()
            }
            Ok(_) => 0,
            Err(e) => {
                warn!(%via, error = %e, "external map not fetched, hooking with our own");
                0
            }
        };

        self.topology.finish_hooking();
        let announced = self.tracer_pkt_start(0, true).await;
        info!(%via, gnodes_learned, announced, "hooked");
        Ok(HookOutcome::Joined { via, gnodes_learned })
    }

    async fn scan_and_reconcile(&self, scanning: bool) -> Result<RadarReport, DaemonError> {
        let flags = EchoFlags {
            scanning,
            hooking: self.topology.is_hooking(),
        };
        let (id, queue) = self
            .radar
            .scan(self.transport.as_ref(), self.topology.ip(), flags)
            .await?;
        let report = self.radar.reconcile(&self.topology, &self.rlist, id, queue);
        DaemonStats::bump(&self.stats.scans);
        self.push_routes(&report.touched);
        debug!(
            scan_id = id,
            replies = report.replies,
            new = report.new.len(),
            removed = report.removed.len(),
            alone = report.alone,
            "scan reconciled"
        );
        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Floods
    // -----------------------------------------------------------------------

    /// `tracer_pkt_start(level)`: announces this node to its gnode of
    /// `level + 1`. Returns the number of neighbors reached.
    pub async fn tracer_pkt_start(&self, level: u8, connect: bool) -> usize {
        let outbound = self.tracer.start(&self.topology, &self.rlist, level, connect);
        if !outbound.is_empty() {
            DaemonStats::bump(&self.stats.tracers_started);
        }
        self.dispatch(outbound).await
    }

    /// `qspn_send(level)`: starts a QSPN round at `level` and waits for the
    /// round spacing if needed.
    pub async fn qspn_send(&self, level: u8) -> Result<usize, DaemonError> {
        let outbound = self.qspn.send(&self.topology, &self.rlist, level).await?;
        DaemonStats::bump(&self.stats.rounds_started);
        Ok(self.dispatch(outbound).await)
    }

    pub fn spawn_qspn_send(self: &Arc<Self>, level: u8) {
        let daemon = Arc::clone(self);
        tokio::spawn(async move {
            match daemon.qspn_send(level).await {
                Ok(sent) => trace!(level, sent, "qspn send done"),
                Err(DaemonError::Qspn(
                    e @ (QspnError::NoLinks { .. } | QspnError::Superseded { .. }),
                )) => debug!(level, reason = %e, "qspn send skipped"),
                Err(e) => warn!(level, error = %e, "qspn send failed"),
            }
        });
    }

    /// Sends every action concurrently; returns how many unicasts went out.
    async fn dispatch(&self, outbound: Vec<Outbound>) -> usize {
        let transport = self.transport.as_ref();
        let sends = outbound.iter().flat_map(move |action| {
            action.to.iter().map(move |&to| async move {
                let result = send_with_retry(transport, to, &action.packet).await;
                if let Err(e) = &result {
                    warn!(%to, op = %action.packet.op, error = %e, "send failed");
                }
                result.is_ok()
            })
        });
        join_all(sends).await.into_iter().filter(|sent| *sent).count()
    }

    fn push_routes(&self, touched: &[(u8, NodeId)]) {
        if touched.is_empty() {
            return;
        }
        let updates: Vec<_> = {
            let read = self.topology.read();
            touched
                .iter()
                .map(|&(level, id)| read.route_update(level, id))
                .collect()
        };
        for update in &updates {
            self.collab.kernel_route_update(update);
        }
        self.stats
            .routes_updated
            .fetch_add(updates.len() as u64, Ordering::Relaxed);
    }

    fn store_gateways(&self, gateways: &[(BorderBlock, u8)]) {
        for (block, level) in gateways {
            self.collab.internet_gateway_store(block, *level);
        }
    }

    /// Hands an identity collision to the rehook collaborator unless a
    /// rehook is already running.
    fn rehook(&self, gnode: NodeId, level: u8) {
        let Some(_guard) = self.rehook_lock.try_lock() else {
            warn!(gnode, level, "collision while a rehook is running, skipped");
            return;
        };
        warn!(gnode, level, "identity collision, rehooking");
        DaemonStats::bump(&self.stats.rehooks);
        self.collab.rehook(gnode, level);
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    /// Processes one inbound packet. Never fails: rejected packets are
    /// counted and dropped.
    pub async fn handle_packet(&self, packet: Packet) {
        DaemonStats::bump(&self.stats.packets_handled);
        trace!(op = %packet.op, from = %packet.from, id = packet.id, "packet in");

        match packet.op {
            PacketOp::EchoMe => self.answer_echo(&packet).await,
            PacketOp::EchoReply => {
                if !self.radar.on_echo_reply(&packet) {
                    self.dropped(&packet, "echo reply outside a scan");
                }
            }
            PacketOp::TracerPkt | PacketOp::TracerPktConnect => {
                match self.tracer.handle(&self.topology, &self.rlist, &packet) {
                    Ok(outcome) => {
                        self.push_routes(&outcome.touched);
                        self.store_gateways(&outcome.gateways);
                        self.dispatch(outcome.outbound).await;
                    }
                    Err(reject) => self.rejected(&packet, reject),
                }
            }
            PacketOp::QspnClose | PacketOp::QspnOpen => {
                match self.qspn.handle(&self.topology, &self.rlist, &packet) {
                    Ok(outcome) => {
                        self.push_routes(&outcome.touched);
                        self.store_gateways(&outcome.gateways);
                        self.dispatch(outcome.outbound).await;
                    }
                    Err(QspnError::Tracer(reject)) => self.rejected(&packet, reject),
                    Err(e) => {
                        DaemonStats::bump(&self.stats.packets_dropped);
                        debug!(op = %packet.op, from = %packet.from, reason = %e, "qspn packet dropped");
                    }
                }
            }
            PacketOp::GetIntMap | PacketOp::GetExtMap | PacketOp::GetBnodeMap => {
                self.serve_map(&packet).await;
            }
            PacketOp::PutIntMap | PacketOp::PutExtMap | PacketOp::PutBnodeMap => {
                if !self.replies.complete(packet.clone()) {
                    self.dropped(&packet, "unsolicited map");
                }
            }
        }
    }

    fn rejected(&self, packet: &Packet, reject: TracerReject) {
        DaemonStats::bump(&self.stats.packets_dropped);
        match reject {
            TracerReject::Collision { gnode, level } => self.rehook(gnode, level),
            TracerReject::Decode(e) => {
                warn!(op = %packet.op, from = %packet.from, error = %e, "malformed packet dropped");
            }
            other => debug!(op = %packet.op, from = %packet.from, reason = %other, "packet dropped"),
        }
    }

    fn dropped(&self, packet: &Packet, reason: &str) {
        DaemonStats::bump(&self.stats.packets_dropped);
        debug!(op = %packet.op, from = %packet.from, reason, "packet dropped");
    }

    async fn answer_echo(&self, probe: &Packet) {
        let flags = EchoFlags {
            scanning: false,
            hooking: self.topology.is_hooking(),
        };
        let mut reply = Packet::new(PacketOp::EchoReply, probe.id, self.topology.ip(), flags.encode());
        reply.iface = probe.iface.clone();
        if let Err(e) = self.transport.send(probe.from, &reply).await {
            debug!(to = %probe.from, error = %e, "echo reply not sent");
        }
    }

    // -----------------------------------------------------------------------
    // Map Exchange
    // -----------------------------------------------------------------------

    async fn serve_map(&self, request: &Packet) {
        let Some(kind) = MapKind::requested_by(request.op) else {
            return;
        };
        let body = {
            let read = self.topology.read();
            match kind {
                MapKind::Internal => read.int_map.pack(),
                MapKind::External => read.ext_map.pack(),
                MapKind::Border => read.bmap.pack(),
            }
        };
        let reply = Packet::new(kind.reply_op(), request.id, self.topology.ip(), body.freeze());
        if let Err(e) = send_with_retry(self.transport.as_ref(), request.from, &reply).await {
            warn!(to = %request.from, ?kind, error = %e, "map reply not sent");
        }
    }

    /// Fetches one of `neighbor`'s maps.
    pub async fn request_map(&self, kind: MapKind, neighbor: IpAddr) -> Result<FetchedMap, DaemonError> {
        let id = self.replies.next_id();
        let rx = self.replies.register(neighbor, id);
        let request = Packet::new(kind.request_op(), id, self.topology.ip(), bytes::Bytes::new());
        if let Err(e) = send_with_retry(self.transport.as_ref(), neighbor, &request).await {
            self.replies.cancel(neighbor, id);
            return Err(e.into());
        }
        let reply = self
            .replies
            .wait(neighbor, id, rx, self.config.request_timeout())
            .await?;
        if MapKind::carried_by(reply.op) != Some(kind) {
            return Err(DaemonError::UnexpectedReply {
                from: neighbor,
                op: reply.op,
            });
        }
        let bad_map = |source| DaemonError::BadMap {
            from: neighbor,
            source,
        };
        let map = match kind {
            MapKind::Internal => FetchedMap::Internal(InternalMap::unpack(&reply.body).map_err(bad_map)?),
            MapKind::External => FetchedMap::External(ExternalMap::unpack(&reply.body).map_err(bad_map)?),
            MapKind::Border => FetchedMap::Border(BorderMap::unpack(&reply.body).map_err(bad_map)?),
        };
        debug!(%neighbor, ?kind, "map fetched");
        Ok(map)
    }

    // -----------------------------------------------------------------------
    // Main Loop
    // -----------------------------------------------------------------------

    /// Runs the radar and inbound loops until `shutdown` turns true or the
    /// transport closes, then saves the maps.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<(), DaemonError> {
        info!(ip = %self.topology.ip(), "node daemon starting");
        let period = self.config.scan_interval();
        let mut scans = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        scans.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("node daemon shutting down");
                    break;
                }
                _ = scans.tick() => {
                    let daemon = Arc::clone(&self);
                    tokio::spawn(async move {
                        match daemon.radar_scan().await {
                            Ok(_) | Err(DaemonError::Radar(RadarError::Busy)) => {}
                            Err(e) => warn!(error = %e, "radar scan failed"),
                        }
                    });
                }
                inbound = self.transport.recv() => match inbound {
                    Ok(packet) => {
                        let daemon = Arc::clone(&self);
                        tokio::spawn(async move { daemon.handle_packet(packet).await });
                    }
                    Err(TransportError::Closed) => {
                        info!("transport closed");
                        break;
                    }
                    Err(e) => warn!(error = %e, "receive failed"),
                },
            }
        }

        if let Some(store) = &self.store {
            store.save_topology(&self.topology)?;
        }
        Ok(())
    }
}
