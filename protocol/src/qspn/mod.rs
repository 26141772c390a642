//! # QSPN Flood Protocol
//!
//! The close/open state machine that keeps the maps of a gnode in sync,
//! built on the tracer engine.

pub mod engine;
pub mod round;

pub use engine::{QspnEngine, QspnError, QspnOutcome};
pub use round::{CloseStep, LevelState, LevelStatus, Phase, RoundCheck, RoundClock};
