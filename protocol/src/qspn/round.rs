//! Per-level round bookkeeping.
//!
//! The round id of a level is an atomic counter: a packet carrying a newer
//! id moves it forward with a compare-and-swap, a starter claims the next id
//! the same way, and whoever loses the race sees it in the return value.
//! Writers hold the engine's level-state lock, so moving the id and
//! resetting the level are one step; readers need no lock.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};

use serde::Serialize;
use tokio::time::Instant;

use crate::map::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundCheck {
    /// A round we had not seen: the level starts over.
    Newer,
    /// The round in progress.
    Current,
    /// An older round, to be dropped.
    Stale,
}

/// Atomic round id of one level.
#[derive(Debug, Default)]
pub struct RoundClock {
    id: AtomicU32,
}

impl RoundClock {
    pub fn current(&self) -> u32 {
        self.id.load(Ordering::Acquire)
    }

    /// Classifies `id` against the current round without moving the clock.
    pub fn classify(&self, id: u32) -> RoundCheck {
        let current = self.current();
        if id < current {
            RoundCheck::Stale
        } else if id == current {
            RoundCheck::Current
        } else {
            RoundCheck::Newer
        }
    }

    /// Classifies `id` against the current round and moves the clock
    /// forward when it is newer.
    pub fn observe(&self, id: u32) -> RoundCheck {
        let mut current = self.current();
        loop {
            if id < current {
                return RoundCheck::Stale;
            }
            if id == current {
                return RoundCheck::Current;
            }
            match self
                .id
                .compare_exchange(current, id, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return RoundCheck::Newer,
                Err(actual) => current = actual,
            }
        }
    }

    /// Claims round `expected + 1`. Fails with the actual id when another
    /// round got there first.
    pub fn bump(&self, expected: u32) -> Result<u32, u32> {
        let next = expected.wrapping_add(1);
        self.id
            .compare_exchange(expected, next, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| next)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Close,
    Open,
}

/// Outcome of a close received from a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseStep {
    /// The link had already closed this round.
    AlreadyClosed,
    /// The link closed; `all` is true when it was the last one.
    Closed { all: bool },
}

/// State machine of one level.
#[derive(Debug)]
pub struct LevelState {
    pub phase: Phase,
    pub starter: bool,
    pub opener: bool,
    closed: BTreeSet<NodeId>,
    opened: HashMap<u8, BTreeSet<NodeId>>,
    pub last_round: Option<Instant>,
}

impl Default for LevelState {
    fn default() -> Self {
        Self {
            phase: Phase::Idle,
            starter: false,
            opener: false,
            closed: BTreeSet::new(),
            opened: HashMap::new(),
            last_round: None,
        }
    }
}

impl LevelState {
    /// Starts a new round. The round timer survives.
    pub fn reset(&mut self, now: Instant) {
        let last_round = Some(now);
        *self = Self {
            last_round,
            ..Self::default()
        };
    }

    pub fn is_closed(&self, link: NodeId) -> bool {
        self.closed.contains(&link)
    }

    pub fn closed(&self) -> &BTreeSet<NodeId> {
        &self.closed
    }

    /// Records a close from `link`. `links` are the links of the level.
    pub fn close_link(&mut self, link: NodeId, links: &BTreeSet<NodeId>) -> CloseStep {
        if !self.closed.insert(link) {
            return CloseStep::AlreadyClosed;
        }
        if self.phase == Phase::Idle {
            self.phase = Phase::Close;
        }
        let all = links.is_subset(&self.closed);
        if all {
            self.opener = true;
            self.phase = Phase::Open;
        }
        CloseStep::Closed { all }
    }

    pub fn is_opened(&self, sub_id: u8, link: NodeId) -> bool {
        self.opened
            .get(&sub_id)
            .is_some_and(|links| links.contains(&link))
    }

    /// Records an open from `link` for the flood of `sub_id`. False when
    /// that link had already opened it.
    pub fn open_link(&mut self, sub_id: u8, link: NodeId) -> bool {
        self.phase = Phase::Open;
        self.opened.entry(sub_id).or_default().insert(link)
    }

    /// Ends the round when every link opened for every known flood.
    pub fn finish_if_opened(&mut self, links: &BTreeSet<NodeId>) -> bool {
        let done = !self.opened.is_empty()
            && self.opened.values().all(|opened| links.is_subset(opened));
        if done {
            self.phase = Phase::Idle;
            self.starter = false;
            self.opener = false;
        }
        done
    }
}

/// Serializable view of one level.
#[derive(Debug, Clone, Serialize)]
pub struct LevelStatus {
    pub level: u8,
    pub round: u32,
    pub phase: Phase,
    pub closed: Vec<NodeId>,
    pub starter: bool,
    pub opener: bool,
}
