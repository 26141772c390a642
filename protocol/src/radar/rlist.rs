//! The rnode list: one entry per direct neighbor.
//!
//! Independent from the maps: it answers "which interfaces reach this
//! address, what did the last scan measure, which map slot stands for it".
//! The flood engines use it to turn link keys back into addresses.

use std::net::IpAddr;

use dashmap::DashMap;
use serde::Serialize;

use crate::map::{NodeId, QuadroGroup, RnodeTarget, Rtt};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RlistEntry {
    pub ip: IpAddr,
    pub quadg: QuadroGroup,
    pub ifaces: Vec<String>,
    pub rtt: Rtt,
    pub target: RnodeTarget,
    /// The neighbor said it is still hooking.
    pub hooking: bool,
    /// Consecutive scans that missed this neighbor.
    pub misses: u8,
}

impl RlistEntry {
    /// Divergence level of this neighbor as seen from `me`.
    pub fn level(&self, me: &QuadroGroup) -> Option<u8> {
        me.divergence(&self.quadg)
    }
}

#[derive(Debug, Default)]
pub struct RnodeList {
    entries: DashMap<IpAddr, RlistEntry>,
}

impl RnodeList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, ip: &IpAddr) -> Option<RlistEntry> {
        self.entries.get(ip).map(|e| e.value().clone())
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.entries.contains_key(ip)
    }

    pub fn upsert(&self, entry: RlistEntry) {
        self.entries.insert(entry.ip, entry);
    }

    pub fn remove(&self, ip: &IpAddr) -> Option<RlistEntry> {
        self.entries.remove(ip).map(|(_, e)| e)
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Every entry, sorted by address so callers iterate deterministically.
    pub fn snapshot(&self) -> Vec<RlistEntry> {
        let mut all: Vec<_> = self.entries.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|e| e.ip);
        all
    }

    /// Neighbors whose link belongs to `level`, with the neighbor gnode id
    /// at that level.
    pub fn links_at(&self, me: &QuadroGroup, level: u8) -> Vec<(NodeId, IpAddr)> {
        self.snapshot()
            .into_iter()
            .filter(|e| !e.hooking && e.level(me) == Some(level))
            .map(|e| (e.quadg.gid(level), e.ip))
            .collect()
    }

    /// Neighbors inside our own gnode of `level` (divergence below it).
    pub fn interior_at(&self, me: &QuadroGroup, level: u8) -> Vec<IpAddr> {
        self.snapshot()
            .into_iter()
            .filter(|e| !e.hooking && e.level(me).is_some_and(|d| d < level))
            .map(|e| e.ip)
            .collect()
    }
}
