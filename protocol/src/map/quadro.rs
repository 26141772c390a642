//! # Quadro-group: the hierarchical address of a node
//!
//! An address is read one byte per level, least significant byte first:
//! for `10.1.2.3` the node is slot `3` of its level-0 group, which is gnode
//! `2` at level 1, gnode `1` at level 2 and gnode `10` at level 3. The
//! vector of those ids is the quadro-group. Above the last level sits the
//! implicit "whole network" group, whose id is always 0.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::codec::{BufExt, DecodeError};
use crate::config::{get_levels, MAP_FORMAT_VERSION};

// ---------------------------------------------------------------------------
// Address Family
// ---------------------------------------------------------------------------

/// Address family of the mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Family {
    Inet,
    Inet6,
}

impl Family {
    /// Family of a concrete address.
    pub fn of(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => Family::Inet,
            IpAddr::V6(_) => Family::Inet6,
        }
    }

    /// Address length in bytes.
    pub fn addr_len(self) -> usize {
        match self {
            Family::Inet => 4,
            Family::Inet6 => 16,
        }
    }

    pub(crate) fn code(self) -> u8 {
        match self {
            Family::Inet => 4,
            Family::Inet6 => 6,
        }
    }

    pub(crate) fn from_code(code: u8) -> Result<Self, DecodeError> {
        match code {
            4 => Ok(Family::Inet),
            6 => Ok(Family::Inet6),
            other => Err(DecodeError::Malformed(format!("address family {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Prefix Conversions
// ---------------------------------------------------------------------------

/// An address prefix covering one (g)node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IpPrefix {
    pub addr: IpAddr,
    pub len: u8,
}

impl std::fmt::Display for IpPrefix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.addr, self.len)
    }
}

/// Splits an address into its group ids, level 0 first.
pub fn ip_to_group_ids(ip: IpAddr) -> Vec<u8> {
    let mut gids = match ip {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    };
    gids.reverse();
    gids
}

/// Rebuilds the prefix of the (g)node identified by `gids` at `level`.
///
/// Ids below `level` are ignored (zeroed), so a level-0 call over a full id
/// vector reproduces the host address with a full-length prefix.
pub fn group_ids_to_ip_prefix(family: Family, gids: &[u8], level: u8) -> IpPrefix {
    let levels = get_levels(family) as usize;
    let level = (level as usize).min(levels);
    let mut bytes = vec![0u8; family.addr_len()];
    for (l, gid) in gids.iter().enumerate().take(levels).skip(level) {
        // gid[l] is byte (levels - 1 - l) of the address.
        bytes[levels - 1 - l] = *gid;
    }
    IpPrefix {
        addr: bytes_to_ip(family, &bytes),
        len: ((levels - level) * 8) as u8,
    }
}

fn bytes_to_ip(family: Family, bytes: &[u8]) -> IpAddr {
    match family {
        Family::Inet => IpAddr::V4(Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3])),
        Family::Inet6 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&bytes[..16]);
            IpAddr::V6(Ipv6Addr::from(octets))
        }
    }
}

// ---------------------------------------------------------------------------
// QuadroGroup
// ---------------------------------------------------------------------------

/// The full hierarchical address of a node: one group id per level plus
/// the prefix each of those groups covers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QuadroGroup {
    family: Family,
    gid: Vec<u8>,
    ipstart: Vec<IpPrefix>,
}

impl QuadroGroup {
    /// Builds the quadro-group of `ip`.
    pub fn from_ip(ip: IpAddr) -> Self {
        Self::from_gids(Family::of(&ip), ip_to_group_ids(ip))
    }

    /// Builds a quadro-group from an id vector. The vector is padded or cut
    /// to the family's level count.
    pub fn from_gids(family: Family, mut gid: Vec<u8>) -> Self {
        gid.resize(get_levels(family) as usize, 0);
        let ipstart = (0..gid.len() as u8)
            .map(|level| group_ids_to_ip_prefix(family, &gid, level))
            .collect();
        Self {
            family,
            gid,
            ipstart,
        }
    }

    pub fn family(&self) -> Family {
        self.family
    }

    /// Number of addressable levels.
    pub fn levels(&self) -> u8 {
        self.gid.len() as u8
    }

    /// Group id at `level`. The level above the last one is the whole
    /// network, always id 0.
    pub fn gid(&self, level: u8) -> u8 {
        self.gid.get(level as usize).copied().unwrap_or(0)
    }

    pub fn gids(&self) -> &[u8] {
        &self.gid
    }

    /// Prefix of the group this node belongs to at `level`.
    pub fn ipstart(&self, level: u8) -> Option<IpPrefix> {
        self.ipstart.get(level as usize).copied()
    }

    /// The node's own address.
    pub fn ip(&self) -> IpAddr {
        group_ids_to_ip_prefix(self.family, &self.gid, 0).addr
    }

    /// Highest level at which the two addresses differ, `None` when equal.
    ///
    /// A neighbor with divergence `d` sits in the same gnode as us at level
    /// `d + 1` but in a different one at level `d`.
    pub fn divergence(&self, other: &QuadroGroup) -> Option<u8> {
        (0..self.levels())
            .rev()
            .find(|&level| self.gid(level) != other.gid(level))
    }

    /// Copy of this address with the id at `level` replaced.
    pub fn with_gid(&self, level: u8, gid: u8) -> Self {
        let mut gids = self.gid.clone();
        if let Some(slot) = gids.get_mut(level as usize) {
            *slot = gid;
        }
        Self::from_gids(self.family, gids)
    }

    /// Prefix of the (g)node `gid` at `level` inside our own hierarchy.
    pub fn prefix_of(&self, level: u8, gid: u8) -> IpPrefix {
        group_ids_to_ip_prefix(self.family, self.with_gid(level, gid).gids(), level)
    }

    // -----------------------------------------------------------------------
    // Packing
    // -----------------------------------------------------------------------

    /// Packed size in bytes.
    pub fn packed_len(&self) -> usize {
        3 + self.gid.len()
    }

    /// `{version:u8, family:u8, levels:u8, gid[levels]:u8}`.
    pub fn pack(&self, buf: &mut BytesMut) {
        buf.put_u8(MAP_FORMAT_VERSION);
        buf.put_u8(self.family.code());
        buf.put_u8(self.levels());
        buf.put_slice(&self.gid);
    }

    /// Reads a packed quadro-group. The prefixes are recomputed, not read.
    pub fn unpack(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        let version = buf.try_u8("quadro version")?;
        if version != MAP_FORMAT_VERSION {
            return Err(DecodeError::Version(version));
        }
        let family = Family::from_code(buf.try_u8("quadro family")?)?;
        let levels = buf.try_u8("quadro levels")?;
        if levels != get_levels(family) {
            return Err(DecodeError::Malformed(format!(
                "quadro-group with {levels} levels for {family:?}"
            )));
        }
        let gid = buf.try_bytes(levels as usize, "quadro gids")?;
        Ok(Self::from_gids(family, gid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(a, b, c, d))
    }

    #[test]
    fn gids_are_least_significant_first() {
        assert_eq!(ip_to_group_ids(v4(10, 1, 2, 3)), vec![3, 2, 1, 10]);
    }

    #[test]
    fn full_vector_reproduces_the_address() {
        for ip in [v4(10, 1, 2, 3), v4(192, 168, 0, 254), v4(0, 0, 0, 0)] {
            let prefix = group_ids_to_ip_prefix(Family::Inet, &ip_to_group_ids(ip), 0);
            assert_eq!(prefix.addr, ip);
            assert_eq!(prefix.len, 32);
        }

        let ip6: IpAddr = "fd00::1:2:3".parse().unwrap();
        let prefix = group_ids_to_ip_prefix(Family::Inet6, &ip_to_group_ids(ip6), 0);
        assert_eq!(prefix.addr, ip6);
        assert_eq!(prefix.len, 128);
    }

    #[test]
    fn upper_levels_zero_the_low_bytes() {
        let gids = ip_to_group_ids(v4(10, 1, 2, 3));
        let prefix = group_ids_to_ip_prefix(Family::Inet, &gids, 2);
        assert_eq!(prefix.addr, v4(10, 1, 0, 0));
        assert_eq!(prefix.len, 16);
    }

    #[test]
    fn divergence_finds_the_highest_differing_level() {
        let me = QuadroGroup::from_ip(v4(10, 1, 2, 3));
        assert_eq!(me.divergence(&me), None);
        assert_eq!(me.divergence(&QuadroGroup::from_ip(v4(10, 1, 2, 9))), Some(0));
        assert_eq!(me.divergence(&QuadroGroup::from_ip(v4(10, 1, 7, 3))), Some(1));
        assert_eq!(me.divergence(&QuadroGroup::from_ip(v4(11, 1, 2, 3))), Some(3));
    }

    #[test]
    fn unity_level_is_zero() {
        let me = QuadroGroup::from_ip(v4(10, 1, 2, 3));
        assert_eq!(me.gid(4), 0);
        assert_eq!(me.ipstart(1).unwrap().addr, v4(10, 1, 2, 0));
    }

    #[test]
    fn pack_roundtrip() {
        let me = QuadroGroup::from_ip(v4(10, 1, 2, 3));
        let mut buf = BytesMut::new();
        me.pack(&mut buf);
        assert_eq!(buf.len(), me.packed_len());
        let mut slice: &[u8] = &buf;
        assert_eq!(QuadroGroup::unpack(&mut slice).unwrap(), me);
        assert!(slice.is_empty());
    }

    #[test]
    fn unpack_rejects_level_mismatch() {
        let raw = [MAP_FORMAT_VERSION, 4, 16, 1, 2, 3, 4];
        let mut slice: &[u8] = &raw;
        assert!(matches!(
            QuadroGroup::unpack(&mut slice),
            Err(DecodeError::Malformed(_))
        ));
    }
}
