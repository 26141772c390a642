//! # Radar
//!
//! Neighbor discovery: echo probes, rtt measurement, and the rnode list of
//! direct neighbors.

pub mod queue;
pub mod rlist;
pub mod scanner;

pub use queue::{QueueEntry, RadarQueue};
pub use rlist::{RlistEntry, RnodeList};
pub use scanner::{Radar, RadarError, RadarPhase, RadarReport};
