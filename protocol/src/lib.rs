// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # Netsukuku Node Core
//!
//! Topology discovery and map synchronization for a node of a Netsukuku
//! mesh. Addresses are split into group ids, one per level: 256 nodes make
//! a gnode, 256 gnodes a gnode of the next level, and so on. Each node keeps
//! a map of its own gnode plus one row of gnodes per upper level, never the
//! whole network.
//!
//! ## Architecture
//!
//! - **map** — quadro-groups, the internal/external/border maps and the
//!   [`map::Topology`] that locks them together.
//! - **radar** — neighbor discovery by timed echo probes.
//! - **tracer** — tracer packets: the hop list, border blocks, flood rules.
//! - **qspn** — the CLOSE/OPEN flood keeping routes fresh per level.
//! - **wire** — the packet envelope and op codes.
//! - **transport** — the I/O and side-effect seams the core talks through.
//! - **store** — sled persistence of the maps.
//! - **daemon** — everything above wired to a transport and run.
//! - **config** / **codec** — tunables and byte-level helpers.
//!
//! The core never touches sockets or the kernel routing table: the node
//! binary plugs those in behind [`transport::Transport`] and
//! [`transport::Collaborators`].

pub mod codec;
pub mod config;
pub mod daemon;
pub mod map;
pub mod qspn;
pub mod radar;
pub mod store;
pub mod tracer;
pub mod transport;
pub mod wire;
