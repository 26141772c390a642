//! The radar queue: echo replies collected during one scan.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use dashmap::DashMap;

use crate::map::Rtt;

/// Replies of one neighbor during one scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub ip: IpAddr,
    /// Interfaces the neighbor answered on, in order of first reply.
    pub ifaces: Vec<String>,
    /// Rtt samples per interface, in milliseconds.
    samples: HashMap<String, Vec<Rtt>>,
    /// The neighbor said it is still hooking.
    pub hooking: bool,
}

impl QueueEntry {
    fn new(ip: IpAddr) -> Self {
        Self {
            ip,
            ifaces: Vec::new(),
            samples: HashMap::new(),
            hooking: false,
        }
    }

    pub fn replies(&self, iface: &str) -> usize {
        self.samples.get(iface).map_or(0, Vec::len)
    }

    pub fn record(&mut self, iface: &str, sample: Rtt) {
        if !self.ifaces.iter().any(|i| i == iface) {
            self.ifaces.push(iface.to_string());
        }
        self.samples.entry(iface.to_string()).or_default().push(sample);
    }

    /// Average rtt over `probes` probes on the best interface. Every probe
    /// left unanswered counts as the slowest reply of that interface.
    pub fn average_rtt(&self, probes: usize) -> Rtt {
        self.samples
            .values()
            .filter(|s| !s.is_empty())
            .map(|samples| {
                let worst = samples.iter().copied().max().unwrap_or(0);
                let missing = probes.saturating_sub(samples.len());
                let total: u64 = samples.iter().map(|&s| u64::from(s)).sum::<u64>()
                    + u64::from(worst) * missing as u64;
                let count = samples.len().max(probes) as u64;
                (total / count) as Rtt
            })
            .min()
            .unwrap_or(0)
            .max(1)
    }
}

/// Every neighbor heard during a scan.
#[derive(Debug, Default)]
pub struct RadarQueue {
    entries: DashMap<IpAddr, QueueEntry>,
}

impl RadarQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the reply of `ip` on `iface`, matched against the send times
    /// of that interface's probes: the n-th reply answers the n-th probe.
    /// Replies beyond the probes sent are ignored.
    pub fn record(&self, ip: IpAddr, iface: &str, sent: &[tokio::time::Instant], hooking: bool) -> bool {
        let mut entry = self.entries.entry(ip).or_insert_with(|| QueueEntry::new(ip));
        let n = entry.replies(iface);
        let Some(sent_at) = sent.get(n) else {
            return false;
        };
        let rtt = half_millis(sent_at.elapsed());
        entry.record(iface, rtt);
        entry.hooking |= hooking;
        true
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.entries.contains_key(ip)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries sorted by address.
    pub fn drain_sorted(self) -> Vec<QueueEntry> {
        let mut all: Vec<_> = self.entries.into_iter().map(|(_, e)| e).collect();
        all.sort_by_key(|e| e.ip);
        all
    }
}

/// One-way estimate of a measured round trip, in milliseconds.
fn half_millis(round_trip: Duration) -> Rtt {
    (round_trip.as_millis() / 2).min(u128::from(Rtt::MAX)) as Rtt
}
