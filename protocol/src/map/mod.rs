//! # Hierarchical Map Model
//!
//! - [`quadro`]: the address of a node, level by level
//! - [`node`]: map slots and their route edges
//! - [`internal`]: the level-0 map
//! - [`external`]: one row of gnodes per upper level
//! - [`bmap`]: border nodes and their outward links
//! - [`topology`]: the locked bundle the rest of the crate works on

pub mod bmap;
pub mod external;
pub mod internal;
pub mod node;
pub mod quadro;
pub mod topology;

pub use bmap::{BnodeEntry, BnodeLink, BorderMap};
pub use external::{init_external_map, merge_external_maps, ExternalMap, Gnode, MergeReport};
pub use internal::{init_internal_map, ExtRnode, InternalMap};
pub use node::{ExtRnodeId, Node, NodeFlags, NodeId, Rnode, RnodeChange, RnodeTarget, Rtt};
pub use quadro::{group_ids_to_ip_prefix, ip_to_group_ids, Family, IpPrefix, QuadroGroup};
pub use topology::{
    AllocError, MapSummary, NeighborLink, RouteUpdate, Topology, TopologyRead, TopologyWrite,
};
