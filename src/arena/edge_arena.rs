// Edge arena - storage for dependency edge records
//
// An edge is the only connective tissue in the graph: one record per
// (source, target) pair currently observed. Each record is threaded through
// two intrusive doubly linked lists at once:
//
// - the target's sources list (head = most recently read dependency,
//   tail = first dependency read), spliced on every tracked read;
// - the source's dependents list, entered only while the edge is subscribed.
//
// Keeping one record in both lists is what makes re-tracking O(1): a reused
// dependency is moved to the head of the sources list with a single splice,
// and dropped dependencies are spliced out without touching their siblings.
//
// Subscribe and unsubscribe carry the lazy upward-subscription rule: the
// first dependent arriving on a derived turns its tracking on and subscribes
// the derived's own source edges, the last dependent leaving reverses both.

use std::cell::RefCell;

use slab::Slab;
use smallvec::SmallVec;

use crate::arena::node_arena::{NodeId, STALE, TRACKING};

thread_local! {
    static EDGES: RefCell<Slab<EdgeSlot>> = RefCell::new(Slab::new());
}

pub(crate) struct EdgeSlot {
    /// Upstream node this edge observes.
    pub(crate) source: NodeId,
    /// Downstream node (derived or effect) owning this edge.
    pub(crate) target: NodeId,
    /// The source's version at the moment the target last observed it.
    pub(crate) version: u64,
    /// Re-tracking scratch: set when the current evaluation read this edge.
    pub(crate) used: bool,
    /// Whether the edge is linked into the source's dependents list.
    pub(crate) subscribed: bool,
    /// Saved occupant of the source's tracking slot, restored on cleanup.
    pub(crate) rollback: Option<EdgeId>,
    // Sources list of `target`.
    pub(crate) prev_source: Option<EdgeId>,
    pub(crate) next_source: Option<EdgeId>,
    // Dependents list of `source`.
    pub(crate) prev_target: Option<EdgeId>,
    pub(crate) next_target: Option<EdgeId>,
}

/// Index of an edge in the arena.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub(crate) struct EdgeId(u32);

impl EdgeId {
    fn index(self) -> usize {
        self.0 as usize
    }

    /// Access the edge slot with a closure. Same borrow rules as
    /// [`NodeId::with`]: no re-entry from inside the closure.
    pub(crate) fn with<R>(self, f: impl FnOnce(&mut EdgeSlot) -> R) -> R {
        EDGES.with(|edges| {
            let mut edges = edges.borrow_mut();
            let slot = edges
                .get_mut(self.index())
                .expect("dependency edge referenced after free");
            f(slot)
        })
    }

    pub(crate) fn source(self) -> NodeId {
        self.with(|edge| edge.source)
    }

    pub(crate) fn version(self) -> u64 {
        self.with(|edge| edge.version)
    }

    pub(crate) fn set_version(self, version: u64) {
        self.with(|edge| edge.version = version);
    }
}

/// Allocate a fresh, unlinked edge. Retains the source end: an edge keeps
/// its upstream node alive even after the node's public handles are gone.
pub(crate) fn alloc_edge(source: NodeId, target: NodeId) -> EdgeId {
    source.retain();
    EDGES.with(|edges| {
        let mut edges = edges.borrow_mut();
        let key = edges.insert(EdgeSlot {
            source,
            target,
            version: 0,
            used: true,
            subscribed: false,
            rollback: None,
            prev_source: None,
            next_source: None,
            prev_target: None,
            next_target: None,
        });
        EdgeId(u32::try_from(key).expect("edge arena exceeded u32 indices"))
    })
}

/// Free an unlinked, unsubscribed edge and release its source end.
pub(crate) fn free_edge(edge: EdgeId) {
    let slot = EDGES.with(|edges| edges.borrow_mut().remove(edge.index()));
    debug_assert!(!slot.subscribed, "freed an edge still in a dependents list");
    slot.source.release();
}

/// Link `edge` at the head of its target's sources list.
pub(crate) fn push_source_head(target: NodeId, edge: EdgeId) {
    let old_head = target.with(|node| node.sources);
    edge.with(|slot| {
        slot.prev_source = None;
        slot.next_source = old_head;
    });
    match old_head {
        Some(head) => head.with(|slot| slot.prev_source = Some(edge)),
        None => target.with(|node| node.sources_tail = Some(edge)),
    }
    target.with(|node| node.sources = Some(edge));
}

/// Splice `edge` out of its target's sources list.
pub(crate) fn unlink_source(edge: EdgeId) {
    let (target, prev, next) = edge.with(|slot| (slot.target, slot.prev_source, slot.next_source));
    match prev {
        Some(prev) => prev.with(|slot| slot.next_source = next),
        None => target.with(|node| node.sources = next),
    }
    match next {
        Some(next) => next.with(|slot| slot.prev_source = prev),
        None => target.with(|node| node.sources_tail = prev),
    }
    edge.with(|slot| {
        slot.prev_source = None;
        slot.next_source = None;
    });
}

/// Move `edge` to the head of its target's sources list, keeping the list in
/// most-recently-read-first order. O(1); no-op when already at the head.
pub(crate) fn move_source_head(edge: EdgeId) {
    let (target, prev) = edge.with(|slot| (slot.target, slot.prev_source));
    if prev.is_none() {
        return;
    }
    cov_mark::hit!(edge_reordered_to_head);
    unlink_source(edge);
    push_source_head(target, edge);
}

/// Link `edge` into the head of its source's dependents list.
///
/// The first dependent arriving on a derived source flips the derived into
/// tracking mode: it marks itself stale and subscribes its own source edges,
/// so subscription propagates lazily up the chain.
pub(crate) fn subscribe(edge: EdgeId) {
    let (source, subscribed) = edge.with(|slot| (slot.source, slot.subscribed));
    if subscribed {
        return;
    }

    if source.is_derived() && source.with(|node| node.dependents.is_none()) {
        cov_mark::hit!(derived_subscribes_upward);
        source.add_flags(STALE | TRACKING);
        for upstream in source_edges(source) {
            subscribe(upstream);
        }
    }

    let old_head = source.with(|node| node.dependents);
    edge.with(|slot| {
        slot.subscribed = true;
        slot.prev_target = None;
        slot.next_target = old_head;
    });
    if let Some(head) = old_head {
        head.with(|slot| slot.prev_target = Some(edge));
    }
    source.with(|node| node.dependents = Some(edge));
}

/// Splice `edge` out of its source's dependents list. No-op when the edge is
/// not subscribed.
///
/// The last dependent leaving a derived source drops its tracking mode and
/// unsubscribes its own source edges.
pub(crate) fn unsubscribe(edge: EdgeId) {
    let (source, subscribed, prev, next) =
        edge.with(|slot| (slot.source, slot.subscribed, slot.prev_target, slot.next_target));
    if !subscribed {
        return;
    }
    edge.with(|slot| {
        slot.subscribed = false;
        slot.prev_target = None;
        slot.next_target = None;
    });
    match prev {
        Some(prev) => prev.with(|slot| slot.next_target = next),
        None => source.with(|node| node.dependents = next),
    }
    if let Some(next) = next {
        next.with(|slot| slot.prev_target = prev);
    }

    if source.is_derived() && source.with(|node| node.dependents.is_none()) {
        cov_mark::hit!(derived_unsubscribes_upward);
        source.remove_flags(TRACKING);
        for upstream in source_edges(source) {
            unsubscribe(upstream);
        }
    }
}

/// Snapshot of a target's source edges in most-recently-read-first order.
pub(crate) fn source_edges(target: NodeId) -> SmallVec<[EdgeId; 8]> {
    let mut out = SmallVec::new();
    let mut cursor = target.with(|node| node.sources);
    while let Some(edge) = cursor {
        out.push(edge);
        cursor = edge.with(|slot| slot.next_source);
    }
    out
}

/// Snapshot of the targets currently subscribed to `source`, most recently
/// subscribed first.
pub(crate) fn dependent_targets(source: NodeId) -> SmallVec<[NodeId; 8]> {
    let mut out = SmallVec::new();
    let mut cursor = source.with(|node| node.dependents);
    while let Some(edge) = cursor {
        let (target, next) = edge.with(|slot| (slot.target, slot.next_target));
        out.push(target);
        cursor = next;
    }
    out
}

#[cfg(test)]
pub(crate) fn live_edges() -> usize {
    EDGES.with(|edges| edges.borrow().len())
}

#[cfg(test)]
pub(crate) fn dependents_len(source: NodeId) -> usize {
    dependent_targets(source).len()
}

#[cfg(test)]
pub(crate) fn sources_in_first_read_order(target: NodeId) -> Vec<NodeId> {
    let mut out = Vec::new();
    let mut cursor = target.with(|node| node.sources_tail);
    while let Some(edge) = cursor {
        let (source, prev) = edge.with(|slot| (slot.source, slot.prev_source));
        out.push(source);
        cursor = prev;
    }
    out
}
