//! Border-node map.
//!
//! For every level `L` below the top, the list of (g)nodes of row `L` that
//! have links leaving our gnode, and which outer gnodes those links reach.
//! A link is `{gnode, level, rtt}`: the gnode id at `level` on the far side.
//! Entries are created from radar results (for ourselves) and from border
//! blocks carried by tracer packets (for everybody else), and dropped as soon
//! as their last link goes away.

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::codec::{check_limit, expect_end, BufExt, DecodeError};
use crate::config::{IPV6_LEVELS, MAP_FORMAT_VERSION, MAXGROUPNODE, MAX_BNODE_LINKS, MAX_MAP_SIZE};

use super::node::{NodeId, Rtt};

/// One outward link of a border node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BnodeLink {
    pub gnode: NodeId,
    pub level: u8,
    pub rtt: Rtt,
}

/// A border (g)node of some level and its outward links.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BnodeEntry {
    pub bnode: NodeId,
    pub links: Vec<BnodeLink>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BorderMap {
    levels: Vec<Vec<BnodeEntry>>,
}

impl BorderMap {
    /// An empty bmap for an address space of `levels` levels.
    pub fn new(levels: u8) -> Self {
        Self {
            levels: vec![Vec::new(); levels as usize],
        }
    }

    pub fn levels(&self) -> u8 {
        self.levels.len() as u8
    }

    pub fn entries(&self, level: u8) -> &[BnodeEntry] {
        self.levels
            .get(level as usize)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn entry(&self, level: u8, bnode: NodeId) -> Option<&BnodeEntry> {
        self.entries(level).iter().find(|e| e.bnode == bnode)
    }

    pub fn is_bnode(&self, level: u8, bnode: NodeId) -> bool {
        self.entry(level, bnode).is_some()
    }

    /// The border node of `level` holding a link to `gnode` at `link_level`.
    pub fn find_bnode_by_rnode_target(
        &self,
        level: u8,
        gnode: NodeId,
        link_level: u8,
    ) -> Option<NodeId> {
        self.entries(level)
            .iter()
            .find(|e| {
                e.links
                    .iter()
                    .any(|l| l.gnode == gnode && l.level == link_level)
            })
            .map(|e| e.bnode)
    }

    /// Adds or refreshes one link of `bnode`.
    pub fn add_link(&mut self, level: u8, bnode: NodeId, link: BnodeLink) {
        let Some(row) = self.levels.get_mut(level as usize) else {
            return;
        };
        let entry = match row.iter().position(|e| e.bnode == bnode) {
            Some(i) => &mut row[i],
            None => {
                row.push(BnodeEntry {
                    bnode,
                    links: Vec::new(),
                });
                let last = row.len() - 1;
                &mut row[last]
            }
        };
        match entry
            .links
            .iter_mut()
            .find(|l| l.gnode == link.gnode && l.level == link.level)
        {
            Some(existing) => existing.rtt = link.rtt,
            None => entry.links.push(link),
        }
    }

    /// Replaces every link of `bnode`. An empty list removes the entry.
    pub fn replace_links(&mut self, level: u8, bnode: NodeId, mut links: Vec<BnodeLink>) {
        let Some(row) = self.levels.get_mut(level as usize) else {
            return;
        };
        links.truncate(MAX_BNODE_LINKS);
        match row.iter().position(|e| e.bnode == bnode) {
            Some(i) if links.is_empty() => {
                row.swap_remove(i);
            }
            Some(i) => row[i].links = links,
            None if links.is_empty() => {}
            None => row.push(BnodeEntry { bnode, links }),
        }
    }

    /// Removes the link of `bnode` towards `gnode` at `link_level`.
    ///
    /// Returns true when the entry lost its last link and was dropped.
    pub fn del_bnode_rnode(
        &mut self,
        level: u8,
        bnode: NodeId,
        gnode: NodeId,
        link_level: u8,
    ) -> bool {
        let Some(row) = self.levels.get_mut(level as usize) else {
            return false;
        };
        let Some(i) = row.iter().position(|e| e.bnode == bnode) else {
            return false;
        };
        row[i]
            .links
            .retain(|l| !(l.gnode == gnode && l.level == link_level));
        if row[i].links.is_empty() {
            row.swap_remove(i);
            return true;
        }
        false
    }

    /// Drops the whole entry of `bnode`.
    pub fn remove_bnode(&mut self, level: u8, bnode: NodeId) -> bool {
        let Some(row) = self.levels.get_mut(level as usize) else {
            return false;
        };
        let before = row.len();
        row.retain(|e| e.bnode != bnode);
        before != row.len()
    }

    // -----------------------------------------------------------------------
    // Packing
    // -----------------------------------------------------------------------

    /// ```text
    /// {version:u8, levels:u8, {count:u16, {bnode:u8, links:u16,
    ///   {gnode:u8, level:u8, rtt:u32}*links}*count}*levels}
    /// ```
    pub fn pack(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u8(MAP_FORMAT_VERSION);
        buf.put_u8(self.levels());
        for row in &self.levels {
            buf.put_u16(row.len() as u16);
            for entry in row {
                buf.put_u8(entry.bnode);
                buf.put_u16(entry.links.len() as u16);
                for link in &entry.links {
                    buf.put_u8(link.gnode);
                    buf.put_u8(link.level);
                    buf.put_u32(link.rtt);
                }
            }
        }
        buf
    }

    pub fn unpack(raw: &[u8]) -> Result<Self, DecodeError> {
        check_limit("border map", raw.len(), MAX_MAP_SIZE)?;
        let mut buf = raw;
        let version = buf.try_u8("bmap version")?;
        if version != MAP_FORMAT_VERSION {
            return Err(DecodeError::Version(version));
        }
        let levels = buf.try_u8("bmap levels")?;
        check_limit("bmap levels", levels as usize, IPV6_LEVELS as usize)?;

        let mut map = BorderMap::new(levels);
        for row in map.levels.iter_mut() {
            let count = buf.try_u16("bmap row count")? as usize;
            check_limit("bmap row", count, MAXGROUPNODE)?;
            for _ in 0..count {
                let bnode = buf.try_u8("bnode id")?;
                let links = buf.try_u16("bnode links")? as usize;
                check_limit("bnode links", links, MAX_BNODE_LINKS)?;
                buf.ensure(links * 6, "bnode link list")?;
                let links = (0..links)
                    .map(|_| {
                        Ok(BnodeLink {
                            gnode: buf.try_u8("link gnode")?,
                            level: buf.try_u8("link level")?,
                            rtt: buf.try_u32("link rtt")?,
                        })
                    })
                    .collect::<Result<Vec<_>, DecodeError>>()?;
                row.push(BnodeEntry { bnode, links });
            }
        }
        expect_end(&buf, "border map")?;
        Ok(map)
    }
}
