// Node arena - storage for reactive node metadata
//
// One slab holds every node in the graph. A slot carries the reactive
// metadata only (kind, flags, version, adjacency heads); values stay outside
// the arena in the public handles, shared with the compute closure where one
// exists.
//
// Slots are reference counted: `refs` counts live public handles plus edge
// records naming the node as their source. A slot is freed when the count
// reaches zero and the node is neither running nor sitting in the pending
// effect queue. Freeing a node detaches its own source edges first, so
// chains of unobserved derived nodes are reclaimed transitively.

use std::cell::RefCell;

use slab::Slab;
use smallvec::SmallVec;

use crate::arena::edge_arena::{self, EdgeId};
use crate::batch;
use crate::error::Error;

thread_local! {
    static NODES: RefCell<Slab<NodeSlot>> = RefCell::new(Slab::new());
}

/// Node is currently on the evaluation stack. Re-entering it is a cycle.
pub(crate) const RUNNING: u8 = 1 << 0;
/// Node has been marked in the current notification wave (deriveds) or is
/// sitting in the pending effect queue (effects).
pub(crate) const NOTIFIED: u8 = 1 << 1;
/// Node may need recomputation. Set by notify, cleared by refresh.
pub(crate) const STALE: u8 = 1 << 2;
/// Node keeps live subscriptions on its sources. Always set on effects; set
/// on a derived while it has at least one dependent.
pub(crate) const TRACKING: u8 = 1 << 3;
/// The cached state of a derived is a captured error, not a value.
pub(crate) const HAS_ERROR: u8 = 1 << 4;
/// Effect has been disposed; a queued entry is skipped and released on drain.
pub(crate) const DISPOSED: u8 = 1 << 5;

/// Outcome of one run of a derived node's compute closure.
///
/// The closure owns the value cell, so the arena only learns whether the
/// cached state changed; a change (or failure) bumps the node version so
/// downstream source-version scans notice.
pub(crate) enum Recomputed {
    /// New value equals the cached one; downstream stays fresh.
    Unchanged,
    /// New value stored; dependents must recompute when read.
    Changed,
    /// Formula failed; the error was captured in place of the value.
    Failed,
}

pub(crate) enum NodeKind {
    /// Writable value cell. The value lives in the handle.
    Source,
    /// Lazily recomputed value.
    Derived {
        /// Recompute closure, taken out of the slot for the duration of a
        /// run so the formula can re-enter the arena freely.
        compute: Option<Box<dyn FnMut() -> Recomputed>>,
        /// Last global version at which freshness was verified.
        last_global: u64,
    },
    /// Side-effecting reaction, scheduled through the batch queue.
    Effect {
        /// User callback, taken out of the slot while it runs.
        callback: Option<Box<dyn FnMut() -> Result<(), Error>>>,
        /// Single link threading the pending effect queue (LIFO).
        next_queued: Option<NodeId>,
    },
}

pub(crate) struct NodeSlot {
    pub(crate) kind: NodeKind,
    pub(crate) flags: u8,
    /// Local version, bumped whenever the cached value or error changes.
    pub(crate) version: u64,
    /// Live handles plus edges naming this node as their source.
    pub(crate) refs: u32,
    /// Head of the dependents list (edges pointing downstream).
    pub(crate) dependents: Option<EdgeId>,
    /// Head of the sources list: the most recently read dependency.
    pub(crate) sources: Option<EdgeId>,
    /// Tail of the sources list: the first dependency read.
    pub(crate) sources_tail: Option<EdgeId>,
    /// The active evaluator's edge into this node, while one is evaluating.
    pub(crate) tracking: Option<EdgeId>,
}

/// Index of a node in the arena.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub(crate) struct NodeId(u32);

impl NodeId {
    fn index(self) -> usize {
        self.0 as usize
    }

    /// Access the node slot with a closure.
    ///
    /// The borrow lasts only for the closure; callers must not re-enter the
    /// arena from inside it.
    pub(crate) fn with<R>(self, f: impl FnOnce(&mut NodeSlot) -> R) -> R {
        NODES.with(|nodes| {
            let mut nodes = nodes.borrow_mut();
            let slot = nodes
                .get_mut(self.index())
                .expect("reactive node referenced after free");
            f(slot)
        })
    }

    pub(crate) fn flags(self) -> u8 {
        self.with(|node| node.flags)
    }

    pub(crate) fn has(self, flag: u8) -> bool {
        self.flags() & flag != 0
    }

    pub(crate) fn add_flags(self, flags: u8) {
        self.with(|node| node.flags |= flags);
    }

    pub(crate) fn remove_flags(self, flags: u8) {
        self.with(|node| node.flags &= !flags);
    }

    pub(crate) fn version(self) -> u64 {
        self.with(|node| node.version)
    }

    pub(crate) fn bump_version(self) {
        self.with(|node| node.version += 1);
    }

    pub(crate) fn is_derived(self) -> bool {
        self.with(|node| matches!(node.kind, NodeKind::Derived { .. }))
    }

    pub(crate) fn last_global(self) -> u64 {
        self.with(|node| match &node.kind {
            NodeKind::Derived { last_global, .. } => *last_global,
            _ => unreachable!("only derived nodes verify against the global version"),
        })
    }

    pub(crate) fn set_last_global(self, value: u64) {
        self.with(|node| match &mut node.kind {
            NodeKind::Derived { last_global, .. } => *last_global = value,
            _ => unreachable!("only derived nodes verify against the global version"),
        });
    }

    /// Keep the slot alive for one more handle or edge.
    pub(crate) fn retain(self) {
        self.with(|node| node.refs += 1);
    }

    /// Drop one reference, freeing the slot once nothing keeps it alive.
    pub(crate) fn release(self) {
        self.with(|node| {
            debug_assert!(node.refs > 0, "node released more times than retained");
            node.refs -= 1;
        });
        self.release_if_dead();
    }

    /// Free the slot if it has no references and is neither running nor
    /// queued. Called after every event that could drop the last keeper.
    pub(crate) fn release_if_dead(self) {
        let dead = self.with(|node| node.refs == 0 && node.flags & (RUNNING | NOTIFIED) == 0);
        if dead {
            free(self);
        }
    }
}

pub(crate) fn alloc_source() -> NodeId {
    insert(NodeSlot {
        kind: NodeKind::Source,
        flags: 0,
        version: 0,
        refs: 1,
        dependents: None,
        sources: None,
        sources_tail: None,
        tracking: None,
    })
}

pub(crate) fn alloc_derived(compute: Box<dyn FnMut() -> Recomputed>) -> NodeId {
    insert(NodeSlot {
        kind: NodeKind::Derived {
            compute: Some(compute),
            last_global: 0,
        },
        // Starts stale so the first read computes.
        flags: STALE,
        version: 0,
        refs: 1,
        dependents: None,
        sources: None,
        sources_tail: None,
        tracking: None,
    })
}

pub(crate) fn alloc_effect(callback: Box<dyn FnMut() -> Result<(), Error>>) -> NodeId {
    insert(NodeSlot {
        kind: NodeKind::Effect {
            callback: Some(callback),
            next_queued: None,
        },
        // Effects subscribe their edges from the first run on.
        flags: TRACKING,
        version: 0,
        refs: 1,
        dependents: None,
        sources: None,
        sources_tail: None,
        tracking: None,
    })
}

fn insert(slot: NodeSlot) -> NodeId {
    NODES.with(|nodes| {
        let mut nodes = nodes.borrow_mut();
        let key = nodes.insert(slot);
        NodeId(u32::try_from(key).expect("node arena exceeded u32 indices"))
    })
}

fn free(id: NodeId) {
    detach_sources(id);
    let slot = NODES.with(|nodes| nodes.borrow_mut().remove(id.index()));
    debug_assert!(
        slot.dependents.is_none(),
        "freed a node that still had dependents"
    );
    // Dropping the slot drops any closure, whose captured handles may release
    // further nodes; the arena borrow is already gone at this point.
    drop(slot);
}

/// Unsubscribe and free every source edge of `id`, emptying its sources list.
///
/// Used by node free and by effect dispose. Releasing the upstream ends can
/// cascade into further frees.
pub(crate) fn detach_sources(id: NodeId) {
    let edges: SmallVec<[EdgeId; 8]> = edge_arena::source_edges(id);
    id.with(|node| {
        node.sources = None;
        node.sources_tail = None;
    });
    for edge in edges {
        edge_arena::unsubscribe(edge);
        edge_arena::free_edge(edge);
    }
}

/// Mark `id` and its transitive dependents as part of the current change
/// wave. Marking only: no value is computed here.
///
/// Deriveds turn stale and propagate; effects enqueue themselves LIFO on the
/// pending queue. The notified flag makes the traversal idempotent.
pub(crate) fn notify(id: NodeId) {
    enum Step {
        Done,
        Propagate,
        Enqueue,
    }

    let step = id.with(|node| {
        if node.flags & NOTIFIED != 0 {
            return Step::Done;
        }
        match node.kind {
            NodeKind::Source => Step::Done,
            NodeKind::Derived { .. } => {
                node.flags |= NOTIFIED | STALE;
                Step::Propagate
            }
            NodeKind::Effect { .. } => {
                node.flags |= NOTIFIED;
                Step::Enqueue
            }
        }
    });

    match step {
        Step::Done => {}
        Step::Propagate => {
            // Snapshot before recursing; notify never mutates the edge list.
            let targets: SmallVec<[NodeId; 8]> = edge_arena::dependent_targets(id);
            for target in targets {
                notify(target);
            }
        }
        Step::Enqueue => batch::enqueue_effect(id),
    }
}

pub(crate) fn take_compute(id: NodeId) -> Option<Box<dyn FnMut() -> Recomputed>> {
    id.with(|node| match &mut node.kind {
        NodeKind::Derived { compute, .. } => compute.take(),
        _ => None,
    })
}

pub(crate) fn put_compute(id: NodeId, f: Box<dyn FnMut() -> Recomputed>) {
    id.with(|node| match &mut node.kind {
        NodeKind::Derived { compute, .. } => *compute = Some(f),
        _ => unreachable!("compute closure restored into a non-derived node"),
    });
}

pub(crate) fn take_callback(id: NodeId) -> Option<Box<dyn FnMut() -> Result<(), Error>>> {
    id.with(|node| match &mut node.kind {
        NodeKind::Effect { callback, .. } => callback.take(),
        _ => None,
    })
}

pub(crate) fn put_callback(id: NodeId, f: Box<dyn FnMut() -> Result<(), Error>>) {
    id.with(|node| match &mut node.kind {
        NodeKind::Effect { callback, .. } => *callback = Some(f),
        _ => unreachable!("effect callback restored into a non-effect node"),
    });
}

pub(crate) fn set_next_queued(id: NodeId, next: Option<NodeId>) {
    id.with(|node| match &mut node.kind {
        NodeKind::Effect { next_queued, .. } => *next_queued = next,
        _ => unreachable!("only effects thread the pending queue"),
    });
}

pub(crate) fn take_next_queued(id: NodeId) -> Option<NodeId> {
    id.with(|node| match &mut node.kind {
        NodeKind::Effect { next_queued, .. } => next_queued.take(),
        _ => unreachable!("only effects thread the pending queue"),
    })
}

/// Owning reference from a public handle to its node slot.
///
/// Shared between clones of `Source`/`Derived` handles; the last clone to
/// drop releases the slot.
pub(crate) struct HandleRef {
    id: NodeId,
}

impl HandleRef {
    pub(crate) fn new(id: NodeId) -> Self {
        Self { id }
    }
}

impl Drop for HandleRef {
    fn drop(&mut self) {
        self.id.release();
    }
}

#[cfg(test)]
pub(crate) fn live_nodes() -> usize {
    NODES.with(|nodes| nodes.borrow().len())
}
