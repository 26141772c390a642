//! # Tracer Packets
//!
//! A tracer packet is a flood confined to one gnode that records the path it
//! travelled: every hop appends `{id, rtt, gcount}`, so each receiver learns a
//! route (and its round-trip time) to every hop behind it. Border nodes also
//! append a block with their outward links.
//!
//! - [`packet`]: the wire format.
//! - [`bblock`]: border-node blocks.
//! - [`flood`]: outbound actions and the duplicate filter.
//! - [`engine`]: validation, map merging and forwarding.

pub mod bblock;
pub mod engine;
pub mod flood;
pub mod packet;

pub use bblock::{bnode_block_size, split_border_blocks, BorderBlock};
pub use engine::{
    append_entry, apply_border_blocks, detect_collision, forward_chunks, merge_into_map,
    own_block, own_gcount, validate, with_own_block, MergeOutcome, SenderRole, TracerEngine,
    TracerOutcome, TracerReject,
};
pub use flood::{Outbound, SeenCache};
pub use packet::{
    BcastHeader, TracerChunk, TracerPacket, BCAST_OPENER, BCAST_STARTER, TRCR_BBLOCK, TRCR_IGW,
};
