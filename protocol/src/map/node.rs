//! Map entries and their route edges.
//!
//! A [`Node`] is one slot of a map. Its rnodes are the ways to reach it,
//! always kept sorted by total round-trip time so `rnodes()[0]` is the best
//! path. For the slot flagged [`NodeFlags::ME`] the rnodes are our direct
//! links instead of routes.

use serde::{Deserialize, Serialize};

use crate::config::MAXROUTES;

/// Position of a (g)node inside a 256-slot map row.
pub type NodeId = u8;

/// Round-trip time in milliseconds.
pub type Rtt = u32;

/// Index of an [`ExtRnode`](super::ExtRnode) in the internal map's arena.
pub type ExtRnodeId = u16;

// ---------------------------------------------------------------------------
// Flags
// ---------------------------------------------------------------------------

/// Per-slot flag set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct NodeFlags(u32);

impl NodeFlags {
    /// The slot describing this node (or the gnode containing it).
    pub const ME: NodeFlags = NodeFlags(1 << 0);
    /// Empty slot: nobody lives here as far as we know.
    pub const VOID: NodeFlags = NodeFlags(1 << 1);
    /// Has at least one link into a different gnode.
    pub const BNODE: NodeFlags = NodeFlags(1 << 2);
    /// Still joining the network; not used for routing yet.
    pub const HOOKING: NodeFlags = NodeFlags(1 << 3);
    /// Direct neighbor of this node.
    pub const RNODE: NodeFlags = NodeFlags(1 << 4);
    /// Not refreshed by the last radar scan.
    pub const OLD: NodeFlags = NodeFlags(1 << 5);
    /// Gnode without free slots.
    pub const FULL: NodeFlags = NodeFlags(1 << 6);

    pub const fn empty() -> Self {
        NodeFlags(0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn from_bits(bits: u32) -> Self {
        NodeFlags(bits)
    }

    pub fn contains(self, other: NodeFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: NodeFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: NodeFlags) {
        self.0 &= !other.0;
    }

    pub fn set(&mut self, other: NodeFlags, on: bool) {
        if on {
            self.insert(other)
        } else {
            self.remove(other)
        }
    }
}

impl std::ops::BitOr for NodeFlags {
    type Output = NodeFlags;

    fn bitor(self, rhs: NodeFlags) -> NodeFlags {
        NodeFlags(self.0 | rhs.0)
    }
}

// ---------------------------------------------------------------------------
// Rnode
// ---------------------------------------------------------------------------

/// What an rnode edge points at. Edges never own their target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RnodeTarget {
    /// A slot of the same map row the edge lives in.
    Local(NodeId),
    /// A neighbor in a different gnode, kept in the internal map's arena.
    External(ExtRnodeId),
}

/// A route (or, on the `ME` slot, a link) with its total rtt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rnode {
    pub target: RnodeTarget,
    pub trtt: Rtt,
}

/// Result of [`Node::upsert_rnode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RnodeChange {
    Added,
    Updated,
    Unchanged,
    /// All `MAXROUTES` slots hold better routes.
    Rejected,
}

impl RnodeChange {
    pub fn changed(self) -> bool {
        matches!(self, RnodeChange::Added | RnodeChange::Updated)
    }
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// One slot of a map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub flags: NodeFlags,
    /// Highest broadcast id seen with this node as first tracer hop (or,
    /// on the `ME` slot, the last id we used).
    pub brdcast: u32,
    rnodes: Vec<Rnode>,
}

impl Default for Node {
    fn default() -> Self {
        Self::void()
    }
}

impl Node {
    /// An empty slot.
    pub fn void() -> Self {
        Self {
            flags: NodeFlags::VOID,
            brdcast: 0,
            rnodes: Vec::new(),
        }
    }

    pub fn is_void(&self) -> bool {
        self.flags.contains(NodeFlags::VOID)
    }

    pub fn is_me(&self) -> bool {
        self.flags.contains(NodeFlags::ME)
    }

    /// Routes, best first.
    pub fn rnodes(&self) -> &[Rnode] {
        &self.rnodes
    }

    pub fn best(&self) -> Option<&Rnode> {
        self.rnodes.first()
    }

    pub fn find_rnode(&self, target: RnodeTarget) -> Option<usize> {
        self.rnodes.iter().position(|r| r.target == target)
    }

    /// Inserts a route or refreshes its rtt.
    ///
    /// An existing route is only rewritten when the rtt moved by at least
    /// `delta`; a new route enters when there is room or when it beats the
    /// worst one kept.
    pub fn upsert_rnode(&mut self, target: RnodeTarget, trtt: Rtt, delta: Rtt) -> RnodeChange {
        if let Some(pos) = self.find_rnode(target) {
            let old = self.rnodes[pos].trtt;
            if old.abs_diff(trtt) < delta || old == trtt {
                return RnodeChange::Unchanged;
            }
            self.rnodes[pos].trtt = trtt;
            self.sort_rnodes();
            return RnodeChange::Updated;
        }

        if self.rnodes.len() >= MAXROUTES {
            match self.rnodes.last() {
                Some(worst) if worst.trtt > trtt => {
                    self.rnodes.pop();
                }
                _ => return RnodeChange::Rejected,
            }
        }
        self.rnodes.push(Rnode { target, trtt });
        self.sort_rnodes();
        RnodeChange::Added
    }

    /// Replaces a route's rtt only when it gets shorter, or inserts it.
    pub fn keep_shorter_rnode(&mut self, target: RnodeTarget, trtt: Rtt) -> RnodeChange {
        match self.find_rnode(target) {
            Some(pos) if self.rnodes[pos].trtt <= trtt => RnodeChange::Unchanged,
            Some(pos) => {
                self.rnodes[pos].trtt = trtt;
                self.sort_rnodes();
                RnodeChange::Updated
            }
            None => self.upsert_rnode(target, trtt, 0),
        }
    }

    pub fn remove_rnode(&mut self, target: RnodeTarget) -> bool {
        let before = self.rnodes.len();
        self.rnodes.retain(|r| r.target != target);
        before != self.rnodes.len()
    }

    /// Used by decoders, which validate the route count before calling.
    pub(crate) fn set_rnodes(&mut self, mut rnodes: Vec<Rnode>) {
        rnodes.truncate(MAXROUTES);
        self.rnodes = rnodes;
        self.sort_rnodes();
    }

    fn sort_rnodes(&mut self) {
        // Stable: equal rtts keep their insertion order.
        self.rnodes.sort_by_key(|r| r.trtt);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_sorted(node: &Node) {
        assert!(node
            .rnodes()
            .windows(2)
            .all(|pair| pair[0].trtt <= pair[1].trtt));
    }

    #[test]
    fn flags_compose() {
        let mut flags = NodeFlags::VOID | NodeFlags::OLD;
        assert!(flags.contains(NodeFlags::VOID));
        flags.remove(NodeFlags::VOID);
        assert!(!flags.contains(NodeFlags::VOID));
        assert!(flags.contains(NodeFlags::OLD));
        flags.set(NodeFlags::BNODE, true);
        assert_eq!(NodeFlags::from_bits(flags.bits()), flags);
    }

    #[test]
    fn rnodes_stay_sorted_after_every_mutation() {
        let mut node = Node::void();
        for (i, rtt) in [50u32, 10, 30, 70, 20].into_iter().enumerate() {
            node.upsert_rnode(RnodeTarget::Local(i as u8), rtt, 0);
            assert_sorted(&node);
        }
        assert_eq!(node.best().unwrap().target, RnodeTarget::Local(1));

        node.upsert_rnode(RnodeTarget::Local(3), 1, 0);
        assert_sorted(&node);
        assert_eq!(node.best().unwrap().target, RnodeTarget::Local(3));

        node.remove_rnode(RnodeTarget::Local(3));
        assert_sorted(&node);
        assert_eq!(node.rnodes().len(), 4);
    }

    #[test]
    fn small_rtt_changes_are_ignored() {
        let mut node = Node::void();
        node.upsert_rnode(RnodeTarget::Local(1), 100, 0);
        assert_eq!(
            node.upsert_rnode(RnodeTarget::Local(1), 120, 50),
            RnodeChange::Unchanged
        );
        assert_eq!(
            node.upsert_rnode(RnodeTarget::Local(1), 200, 50),
            RnodeChange::Updated
        );
        assert_eq!(node.rnodes()[0].trtt, 200);
    }

    #[test]
    fn route_table_is_capped() {
        let mut node = Node::void();
        for i in 0..MAXROUTES {
            node.upsert_rnode(RnodeTarget::Local(i as u8), 100 + i as u32, 0);
        }
        assert_eq!(
            node.upsert_rnode(RnodeTarget::Local(200), 5000, 0),
            RnodeChange::Rejected
        );
        assert_eq!(
            node.upsert_rnode(RnodeTarget::Local(201), 1, 0),
            RnodeChange::Added
        );
        assert_eq!(node.rnodes().len(), MAXROUTES);
        assert_eq!(node.best().unwrap().target, RnodeTarget::Local(201));
        assert_sorted(&node);
    }

    #[test]
    fn keep_shorter_only_improves() {
        let mut node = Node::void();
        node.upsert_rnode(RnodeTarget::Local(4), 40, 0);
        assert_eq!(
            node.keep_shorter_rnode(RnodeTarget::Local(4), 60),
            RnodeChange::Unchanged
        );
        assert_eq!(
            node.keep_shorter_rnode(RnodeTarget::Local(4), 15),
            RnodeChange::Updated
        );
        assert_eq!(node.best().unwrap().trtt, 15);
    }
}
