//! # Protocol Configuration & Constants
//!
//! Every magic number of the mesh core lives here. The map sizes and level
//! counts are part of the wire and on-disk formats: two nodes that disagree
//! on `MAXGROUPNODE` cannot even parse each other's tracer packets, so treat
//! the first section as frozen.
//!
//! The timing values are the ones the network has been tuned with. They are
//! mirrored into [`ProtocolConfig`] so a deployment (or a test) can shrink
//! them without touching the constants.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::map::Family;

// ---------------------------------------------------------------------------
// Map Geometry
// ---------------------------------------------------------------------------

/// Bits of address consumed by one level of the hierarchy.
pub const MAXGROUPNODE_BITS: u32 = 8;

/// Slots in every group: 256 nodes per gnode, 256 gnodes per upper gnode.
pub const MAXGROUPNODE: usize = 1 << MAXGROUPNODE_BITS;

/// Maximum number of routes (rnodes) kept per node or gnode.
pub const MAXROUTES: usize = 20;

/// Levels of an IPv4 address space: 32 bits / 8 bits per level.
pub const IPV4_LEVELS: u8 = 4;

/// Levels of an IPv6 address space: 128 bits / 8 bits per level.
pub const IPV6_LEVELS: u8 = 16;

/// Version byte leading every packed map, quadro-group and border map.
pub const MAP_FORMAT_VERSION: u8 = 1;

// ---------------------------------------------------------------------------
// Radar
// ---------------------------------------------------------------------------

/// Echo probes sent per interface in one scan.
pub const MAX_RADAR_SCANS: usize = 16;

/// How long a scan waits for echo replies before reconciling.
pub const RADAR_WAIT: Duration = Duration::from_secs(10);

/// Pause between two scans of the radar loop.
pub const RADAR_SCAN_INTERVAL: Duration = Duration::from_secs(30);

/// An rtt change smaller than this (milliseconds) is noise, not news.
pub const RTT_DELTA_MS: u32 = 650;

// ---------------------------------------------------------------------------
// QSPN
// ---------------------------------------------------------------------------

/// Minimum spacing between two rounds started at level 0.
pub const QSPN_WAIT_ROUND: Duration = Duration::from_secs(32);

/// Extra spacing per level: upper levels change less and cost more to flood.
pub const QSPN_WAIT_ROUND_PER_LEVEL: Duration = Duration::from_secs(2);

/// Round spacing for `level`.
pub fn qspn_wait_round_lvl(level: u8) -> Duration {
    QSPN_WAIT_ROUND + QSPN_WAIT_ROUND_PER_LEVEL * u32::from(level)
}

// ---------------------------------------------------------------------------
// Wire Limits
// ---------------------------------------------------------------------------

/// A tracer never carries more hops than a gnode has slots. The broadcast
/// ttl is a `u8`, so 255 it is.
pub const MAX_TRACER_HOPS: usize = 255;

/// Maximum links a single border-node block may declare.
pub const MAX_BNODE_LINKS: usize = MAXGROUPNODE * 4;

/// Maximum border-node blocks appended to one tracer packet.
pub const MAX_BNODE_BLOCKS: usize = 64;

/// Largest packet body accepted from the transport.
pub const MAX_PACKET_SIZE: usize = 64 * 1024;

/// Largest packed map accepted from a neighbor or from disk.
pub const MAX_MAP_SIZE: usize = 4 * 1024 * 1024;

/// Default UDP port of the node daemon.
pub const DEFAULT_NTK_PORT: u16 = 269;

/// How long a map request waits for its reply.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Seen-packet cache size used by flood deduplication.
pub const SEEN_CACHE_SIZE: usize = 8_192;

// ---------------------------------------------------------------------------
// Runtime Configuration
// ---------------------------------------------------------------------------

/// Tunables of one node. Defaults match the constants above.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Address family of the mesh (decides the number of levels).
    pub family: Family,
    /// Echo probes per interface per scan.
    pub radar_scans: usize,
    /// Reply window of a scan, in milliseconds.
    pub radar_wait_ms: u64,
    /// Pause between scans of the radar loop, in milliseconds.
    pub scan_interval_ms: u64,
    /// Rtt change (milliseconds) that counts as a topology change.
    pub rtt_delta_ms: u32,
    /// Round spacing at level 0, in milliseconds.
    pub qspn_wait_round_ms: u64,
    /// Additional round spacing per level, in milliseconds.
    pub qspn_wait_per_level_ms: u64,
    /// Map request timeout, in milliseconds.
    pub request_timeout_ms: u64,
    /// Entries kept by the flood dedup cache.
    pub seen_cache_size: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            family: Family::Inet,
            radar_scans: MAX_RADAR_SCANS,
            radar_wait_ms: RADAR_WAIT.as_millis() as u64,
            scan_interval_ms: RADAR_SCAN_INTERVAL.as_millis() as u64,
            rtt_delta_ms: RTT_DELTA_MS,
            qspn_wait_round_ms: QSPN_WAIT_ROUND.as_millis() as u64,
            qspn_wait_per_level_ms: QSPN_WAIT_ROUND_PER_LEVEL.as_millis() as u64,
            request_timeout_ms: REQUEST_TIMEOUT.as_millis() as u64,
            seen_cache_size: SEEN_CACHE_SIZE,
        }
    }
}

impl ProtocolConfig {
    /// Loads a JSON config file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the protocol cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.radar_scans == 0 || self.radar_scans > u8::MAX as usize {
            return Err(ConfigError::Invalid(format!(
                "radar_scans must be in 1..=255, got {}",
                self.radar_scans
            )));
        }
        if self.seen_cache_size == 0 {
            return Err(ConfigError::Invalid("seen_cache_size must be > 0".into()));
        }
        Ok(())
    }

    /// Number of levels for the configured family.
    pub fn levels(&self) -> u8 {
        get_levels(self.family)
    }

    pub fn radar_wait(&self) -> Duration {
        Duration::from_millis(self.radar_wait_ms)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Round spacing for `level` under this configuration.
    pub fn wait_round(&self, level: u8) -> Duration {
        Duration::from_millis(
            self.qspn_wait_round_ms + self.qspn_wait_per_level_ms * u64::from(level),
        )
    }
}

/// Errors raised while loading a [`ProtocolConfig`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// `GET_LEVELS(family)`: number of group-id levels of an address family.
pub fn get_levels(family: Family) -> u8 {
    match family {
        Family::Inet => IPV4_LEVELS,
        Family::Inet6 => IPV6_LEVELS,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_cover_the_address() {
        assert_eq!(u32::from(IPV4_LEVELS) * MAXGROUPNODE_BITS, 32);
        assert_eq!(u32::from(IPV6_LEVELS) * MAXGROUPNODE_BITS, 128);
        assert_eq!(get_levels(Family::Inet), 4);
        assert_eq!(get_levels(Family::Inet6), 16);
    }

    #[test]
    fn round_wait_grows_with_level() {
        assert_eq!(qspn_wait_round_lvl(0), QSPN_WAIT_ROUND);
        assert!(qspn_wait_round_lvl(3) > qspn_wait_round_lvl(1));
        let config = ProtocolConfig::default();
        assert_eq!(config.wait_round(2), qspn_wait_round_lvl(2));
    }

    #[test]
    fn hop_limit_fits_the_ttl_byte() {
        assert!(MAX_TRACER_HOPS <= u8::MAX as usize);
    }

    #[test]
    fn partial_json_takes_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("ntk.json");
        std::fs::write(&path, r#"{ "radar_scans": 4, "family": "Inet6" }"#).expect("write");

        let config = ProtocolConfig::from_json_file(&path).expect("load");
        assert_eq!(config.radar_scans, 4);
        assert_eq!(config.levels(), IPV6_LEVELS);
        assert_eq!(config.rtt_delta_ms, RTT_DELTA_MS);
    }

    #[test]
    fn zero_scans_is_rejected() {
        let config = ProtocolConfig {
            radar_scans: 0,
            ..ProtocolConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
