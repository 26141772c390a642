//! Flood plumbing shared by plain tracer packets and QSPN.
//!
//! Engines never touch the network: they return [`Outbound`] actions and the
//! daemon executes them. Duplicate deliveries (the same flood reaching us
//! through two interior paths) are filtered by a [`SeenCache`] keyed by the
//! BLAKE3 hash of the packet identity.

use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use tracing::trace;

use crate::wire::{Packet, PacketOp};

use super::packet::TracerPacket;

/// Send `packet` to every address in `to`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub to: Vec<std::net::IpAddr>,
    pub packet: Packet,
}

/// Bounded set of recently processed flood packets.
pub struct SeenCache {
    seen: DashMap<[u8; 32], u64>,
    capacity: usize,
}

impl SeenCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            seen: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Identity of a flood packet: op, round, originator and path. Rtts are
    /// left out so the same path with a refreshed rtt still counts as seen.
    pub fn key(op: PacketOp, id: u32, pkt: &TracerPacket) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&[op.code(), pkt.bcast.level, pkt.bcast.sub_id]);
        hasher.update(&id.to_be_bytes());
        hasher.update(&pkt.first_open_chunk.to_be_bytes());
        for chunk in &pkt.chunks {
            hasher.update(&[chunk.node]);
        }
        *hasher.finalize().as_bytes()
    }

    /// Records `key`. Returns false when it was already there.
    pub fn insert(&self, key: [u8; 32]) -> bool {
        if self.seen.contains_key(&key) {
            trace!("dropping duplicate flood packet");
            return false;
        }
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros() as u64;
        self.seen.insert(key, now);
        self.maybe_evict();
        true
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn clear(&self) {
        self.seen.clear();
    }

    /// Drops the oldest entries down to 75% of capacity.
    fn maybe_evict(&self) {
        if self.seen.len() <= self.capacity {
            return;
        }
        let target = self.capacity * 3 / 4;
        let mut entries: Vec<([u8; 32], u64)> = self
            .seen
            .iter()
            .map(|entry| (*entry.key(), *entry.value()))
            .collect();
        entries.sort_by_key(|(_, ts)| *ts);
        let to_remove = entries.len().saturating_sub(target);
        for (key, _) in entries.iter().take(to_remove) {
            self.seen.remove(key);
        }
    }
}
