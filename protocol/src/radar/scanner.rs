//! # Radar
//!
//! Periodic neighbor discovery. One scan walks through
//!
//! ```text
//! Idle -> Scanning -> Waiting -> Reconciling -> Idle
//! ```
//!
//! - **Scanning**: `radar_scans` `ECHO_ME` probes are broadcast on every
//!   interface, all carrying the random id of the scan.
//! - **Waiting**: `ECHO_REPLY`s with the scan id land in the radar queue,
//!   each measured against the send time of the probe it answers.
//! - **Reconciling**: the queue is diffed against the rnode list. New and
//!   changed neighbors are linked into the maps, a neighbor missing once is
//!   flagged `OLD`, a neighbor missing twice is removed with everything that
//!   was only reachable through it.
//!
//! Only one scan runs at a time; a concurrent request gets
//! [`RadarError::Busy`].

use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::ProtocolConfig;
use crate::map::{NodeId, QuadroGroup, RnodeTarget, Topology};
use crate::transport::{Transport, TransportError};
use crate::wire::{EchoFlags, Packet, PacketOp};

use super::queue::RadarQueue;
use super::rlist::{RlistEntry, RnodeList};

#[derive(Debug, thiserror::Error)]
pub enum RadarError {
    #[error("a scan is already running")]
    Busy,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RadarPhase {
    Idle,
    Scanning,
    Waiting,
    Reconciling,
}

/// What a reconciliation changed.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RadarReport {
    pub scan_id: u32,
    /// Neighbors that answered.
    pub replies: usize,
    pub new: Vec<IpAddr>,
    pub updated: Vec<IpAddr>,
    /// Neighbors missing for the first time.
    pub old: Vec<IpAddr>,
    pub removed: Vec<IpAddr>,
    /// Levels whose topology changed and need a QSPN round.
    pub dirty_levels: BTreeSet<u8>,
    #[serde(skip)]
    pub touched: Vec<(u8, NodeId)>,
    /// No hooked neighbor is left.
    pub alone: bool,
}

struct ScanState {
    id: u32,
    sent: HashMap<String, Vec<Instant>>,
    queue: RadarQueue,
}

/// Puts the radar back to idle when a scan ends early: a failed probe or
/// a dropped scan future.
struct ScanReset<'a> {
    radar: &'a Radar,
    armed: bool,
}

impl Drop for ScanReset<'_> {
    fn drop(&mut self) {
        if self.armed {
            *self.radar.scan.lock() = None;
            self.radar.set_phase(RadarPhase::Idle);
        }
    }
}

pub struct Radar {
    config: ProtocolConfig,
    scan_lock: tokio::sync::Mutex<()>,
    phase: Mutex<RadarPhase>,
    scan: Mutex<Option<ScanState>>,
}

impl Radar {
    pub fn new(config: &ProtocolConfig) -> Self {
        Self {
            config: config.clone(),
            scan_lock: tokio::sync::Mutex::new(()),
            phase: Mutex::new(RadarPhase::Idle),
            scan: Mutex::new(None),
        }
    }

    pub fn phase(&self) -> RadarPhase {
        *self.phase.lock()
    }

    fn set_phase(&self, phase: RadarPhase) {
        *self.phase.lock() = phase;
    }

    /// Id of the scan in progress.
    pub fn scan_id(&self) -> Option<u32> {
        self.scan.lock().as_ref().map(|s| s.id)
    }

    /// Probes every interface and collects replies for the wait window.
    /// The returned queue goes to [`Radar::reconcile`].
    pub async fn scan(
        &self,
        transport: &dyn Transport,
        me: IpAddr,
        flags: EchoFlags,
    ) -> Result<(u32, RadarQueue), RadarError> {
        let _guard = self.scan_lock.try_lock().map_err(|_| RadarError::Busy)?;
        let id = rand::random::<u32>();
        *self.scan.lock() = Some(ScanState {
            id,
            sent: HashMap::new(),
            queue: RadarQueue::new(),
        });

        let mut reset = ScanReset {
            radar: self,
            armed: true,
        };

        self.set_phase(RadarPhase::Scanning);
        self.probe(transport, me, id, flags).await?;

        self.set_phase(RadarPhase::Waiting);
        tokio::time::sleep(self.config.radar_wait()).await;

        reset.armed = false;
        self.set_phase(RadarPhase::Reconciling);
        let queue = self
            .scan
            .lock()
            .take()
            .map(|s| s.queue)
            .unwrap_or_default();
        debug!(scan_id = id, replies = queue.len(), "scan window closed");
        Ok((id, queue))
    }

    async fn probe(
        &self,
        transport: &dyn Transport,
        me: IpAddr,
        id: u32,
        flags: EchoFlags,
    ) -> Result<(), RadarError> {
        let probe = Packet::new(PacketOp::EchoMe, id, me, flags.encode());
        for iface in transport.interfaces() {
            for _ in 0..self.config.radar_scans {
                if let Some(state) = self.scan.lock().as_mut() {
                    state.sent.entry(iface.clone()).or_default().push(Instant::now());
                }
                transport.broadcast(&iface, &probe).await?;
            }
        }
        Ok(())
    }

    /// Records an `ECHO_REPLY`. False when it does not belong to the scan
    /// in progress.
    pub fn on_echo_reply(&self, packet: &Packet) -> bool {
        let guard = self.scan.lock();
        let Some(state) = guard.as_ref().filter(|s| s.id == packet.id) else {
            return false;
        };
        let hooking = EchoFlags::decode(&packet.body).is_ok_and(|f| f.hooking);
        let iface = packet
            .iface
            .clone()
            .or_else(|| state.sent.keys().next().cloned())
            .unwrap_or_default();
        let sent = state.sent.get(&iface).map(Vec::as_slice).unwrap_or(&[]);
        state.queue.record(packet.from, &iface, sent, hooking)
    }

    /// Diffs the replies of a scan against the rnode list and updates the
    /// maps.
    pub fn reconcile(
        &self,
        topology: &Topology,
        rlist: &RnodeList,
        scan_id: u32,
        queue: RadarQueue,
    ) -> RadarReport {
        let me = topology.quadg();
        let probes = self.config.radar_scans;
        let delta = self.config.rtt_delta_ms;
        let mut report = RadarReport {
            scan_id,
            replies: queue.len(),
            ..RadarReport::default()
        };

        let mut heard = BTreeSet::new();
        for entry in queue.drain_sorted() {
            let nb = QuadroGroup::from_ip(entry.ip);
            if nb.family() != me.family() || entry.ip == me.ip() {
                continue;
            }
            heard.insert(entry.ip);
            let rtt = entry.average_rtt(probes);
            let prev = rlist.get(&entry.ip);

            if entry.hooking {
                if let Some(prev) = prev.as_ref().filter(|p| !p.hooking) {
                    self.drop_neighbor(topology, &me, prev, &mut report);
                }
                rlist.upsert(RlistEntry {
                    ip: entry.ip,
                    target: RnodeTarget::Local(nb.gid(0)),
                    quadg: nb,
                    ifaces: entry.ifaces,
                    rtt,
                    hooking: true,
                    misses: 0,
                });
                continue;
            }

            let link = {
                let mut w = topology.write();
                let link = w.link_neighbor(&nb, rtt, delta, &mut report.touched);
                if let Some(link) = &link {
                    w.clear_old(link.target);
                }
                link
            };
            let Some(link) = link else {
                warn!(neighbor = %entry.ip, "neighbor answers with our own address");
                continue;
            };

            match &prev {
                None => {
                    info!(neighbor = %entry.ip, rtt, level = link.level, "new neighbor");
                    report.new.push(entry.ip);
                    report.dirty_levels.insert(link.level);
                }
                Some(p) if p.hooking => {
                    info!(neighbor = %entry.ip, rtt, level = link.level, "neighbor finished hooking");
                    report.new.push(entry.ip);
                    report.dirty_levels.insert(link.level);
                }
                Some(_) if link.changed => {
                    debug!(neighbor = %entry.ip, rtt, "neighbor rtt changed");
                    report.updated.push(entry.ip);
                    report.dirty_levels.insert(link.level);
                }
                Some(_) => {}
            }
            rlist.upsert(RlistEntry {
                ip: entry.ip,
                quadg: nb,
                ifaces: entry.ifaces,
                rtt,
                target: link.target,
                hooking: false,
                misses: 0,
            });
        }

        for prev in rlist.snapshot() {
            if heard.contains(&prev.ip) {
                continue;
            }
            if prev.hooking {
                rlist.remove(&prev.ip);
                continue;
            }
            if prev.misses == 0 {
                debug!(neighbor = %prev.ip, "neighbor missed a scan");
                topology.write().mark_old(prev.target);
                report.old.push(prev.ip);
                rlist.upsert(RlistEntry { misses: 1, ..prev });
            } else {
                self.drop_neighbor(topology, &me, &prev, &mut report);
                rlist.remove(&prev.ip);
            }
        }

        report.alone = rlist.snapshot().iter().all(|e| e.hooking);
        self.set_phase(RadarPhase::Idle);
        report
    }

    fn drop_neighbor(
        &self,
        topology: &Topology,
        me: &QuadroGroup,
        prev: &RlistEntry,
        report: &mut RadarReport,
    ) {
        info!(neighbor = %prev.ip, "neighbor lost");
        topology
            .write()
            .unlink_neighbor(&prev.quadg, prev.target, &mut report.touched);
        report.removed.push(prev.ip);
        if let Some(level) = prev.level(me) {
            report.dirty_levels.insert(level);
        }
    }
}
