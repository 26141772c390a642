//! # Map Store
//!
//! Persists the maps of a node in an embedded sled database so a restart
//! does not have to relearn the whole gnode.
//!
//! ## Layout
//!
//! Everything lives in the `maps` tree:
//!
//! | Key         | Value                                   |
//! |-------------|-----------------------------------------|
//! | `quadg`     | header + packed quadro-group (identity) |
//! | `int_map`   | header + packed internal map            |
//! | `ext_map`   | header + packed external map            |
//! | `bnode_map` | header + packed border map              |
//!
//! The header is `{levels:u8, block_size:u32}`: a blob written for another
//! level count, or whose size does not match what follows, is refused.
//! Loading never fails the node: a missing or corrupt map comes back fresh.

use std::net::IpAddr;
use std::path::Path;

use bytes::{BufMut, BytesMut};
use sled::{Batch, Db, Tree};
use tracing::{debug, warn};

use crate::codec::DecodeError;
use crate::config::MAX_MAP_SIZE;
use crate::map::{BorderMap, ExternalMap, InternalMap, NodeId, QuadroGroup, Topology};

const TREE_MAPS: &str = "maps";

const KEY_QUADG: &str = "quadg";
const KEY_INT_MAP: &str = "int_map";
const KEY_EXT_MAP: &str = "ext_map";
const KEY_BNODE_MAP: &str = "bnode_map";

const HEADER_LEN: usize = 5;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("{key}: {source}")]
    Decode {
        key: &'static str,
        #[source]
        source: DecodeError,
    },

    #[error("{key}: bad header: {reason}")]
    Header { key: &'static str, reason: String },

    #[error("{0} not stored")]
    Missing(&'static str),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone)]
pub struct MapStore {
    db: Db,
    maps: Tree,
}

impl MapStore {
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        Self::from_db(sled::open(path)?)
    }

    /// An in-memory store, gone on drop.
    pub fn open_temporary() -> StoreResult<Self> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: Db) -> StoreResult<Self> {
        let maps = db.open_tree(TREE_MAPS)?;
        Ok(Self { db, maps })
    }

    // -----------------------------------------------------------------------
    // Saving
    // -----------------------------------------------------------------------

    /// Writes identity and all three maps in one batch.
    pub fn save_topology(&self, topology: &Topology) -> StoreResult<()> {
        let maps = topology.read();
        let levels = maps.quadg.levels();
        let mut quadg = BytesMut::with_capacity(maps.quadg.packed_len());
        maps.quadg.pack(&mut quadg);

        let mut batch = Batch::default();
        batch.insert(KEY_QUADG, frame(levels, &quadg));
        batch.insert(KEY_INT_MAP, frame(levels, &maps.int_map.pack()));
        batch.insert(KEY_EXT_MAP, frame(levels, &maps.ext_map.pack()));
        batch.insert(KEY_BNODE_MAP, frame(levels, &maps.bmap.pack()));
        self.maps.apply_batch(batch)?;
        self.db.flush()?;
        debug!(ip = %maps.quadg.ip(), "maps saved");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Loading
    // -----------------------------------------------------------------------

    fn load_raw(&self, key: &'static str, levels: u8) -> StoreResult<Vec<u8>> {
        let raw = self.maps.get(key)?.ok_or(StoreError::Missing(key))?;
        unframe(key, levels, &raw).map(<[u8]>::to_vec)
    }

    pub fn load_quadg(&self, levels: u8) -> StoreResult<QuadroGroup> {
        let raw = self.load_raw(KEY_QUADG, levels)?;
        let mut buf = raw.as_slice();
        QuadroGroup::unpack(&mut buf).map_err(|source| StoreError::Decode {
            key: KEY_QUADG,
            source,
        })
    }

    pub fn load_int_map(&self, levels: u8) -> StoreResult<InternalMap> {
        let raw = self.load_raw(KEY_INT_MAP, levels)?;
        InternalMap::unpack(&raw).map_err(|source| StoreError::Decode {
            key: KEY_INT_MAP,
            source,
        })
    }

    pub fn load_ext_map(&self, levels: u8) -> StoreResult<ExternalMap> {
        let raw = self.load_raw(KEY_EXT_MAP, levels)?;
        ExternalMap::unpack(&raw).map_err(|source| StoreError::Decode {
            key: KEY_EXT_MAP,
            source,
        })
    }

    pub fn load_bmap(&self, levels: u8) -> StoreResult<BorderMap> {
        let raw = self.load_raw(KEY_BNODE_MAP, levels)?;
        BorderMap::unpack(&raw).map_err(|source| StoreError::Decode {
            key: KEY_BNODE_MAP,
            source,
        })
    }

    pub fn load_int_map_or_fresh(&self, levels: u8, me: NodeId) -> InternalMap {
        self.load_int_map(levels).unwrap_or_else(|e| {
            fresh_warning(KEY_INT_MAP, &e);
            InternalMap::new(me)
        })
    }

    pub fn load_ext_map_or_fresh(&self, levels: u8) -> ExternalMap {
        self.load_ext_map(levels).unwrap_or_else(|e| {
            fresh_warning(KEY_EXT_MAP, &e);
            ExternalMap::new(levels)
        })
    }

    pub fn load_bmap_or_fresh(&self, levels: u8) -> BorderMap {
        self.load_bmap(levels).unwrap_or_else(|e| {
            fresh_warning(KEY_BNODE_MAP, &e);
            BorderMap::new(levels)
        })
    }

    /// The topology of `ip` from the stored maps. Maps saved under another
    /// identity are ignored.
    pub fn load_topology(&self, ip: IpAddr) -> Topology {
        let me = QuadroGroup::from_ip(ip);
        let levels = me.levels();
        let same_identity = self.load_quadg(levels).is_ok_and(|q| q == me);
        if !same_identity {
            debug!(%ip, "no stored maps for this address");
            return Topology::new(ip);
        }
        Topology::from_parts(
            ip,
            Some(self.load_int_map_or_fresh(levels, me.gid(0))),
            Some(self.load_ext_map_or_fresh(levels)),
            Some(self.load_bmap_or_fresh(levels)),
        )
    }
}

fn fresh_warning(key: &str, error: &StoreError) {
    match error {
        StoreError::Missing(_) => debug!(key, "nothing stored, starting fresh"),
        other => warn!(key, error = %other, "stored map unusable, starting fresh"),
    }
}

fn frame(levels: u8, body: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + body.len());
    buf.put_u8(levels);
    buf.put_u32(body.len() as u32);
    buf.put_slice(body);
    buf.to_vec()
}

fn unframe<'a>(key: &'static str, levels: u8, raw: &'a [u8]) -> StoreResult<&'a [u8]> {
    if raw.len() < HEADER_LEN {
        return Err(StoreError::Header {
            key,
            reason: format!("{} bytes", raw.len()),
        });
    }
    let stored_levels = raw[0];
    let block_size = u32::from_be_bytes([raw[1], raw[2], raw[3], raw[4]]) as usize;
    let body = &raw[HEADER_LEN..];
    if stored_levels != levels {
        return Err(StoreError::Header {
            key,
            reason: format!("{stored_levels} levels, expected {levels}"),
        });
    }
    if block_size > MAX_MAP_SIZE || block_size != body.len() {
        return Err(StoreError::Header {
            key,
            reason: format!("block_size {block_size}, {} bytes follow", body.len()),
        });
    }
    Ok(body)
}
