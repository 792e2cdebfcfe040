//! Ambient evaluation context and dependency tracking.
//!
//! While a derived or effect runs its closure, it is installed as the
//! current evaluator in a thread-local slot. Every tracked read performed by
//! the closure installs or refreshes exactly one edge from the evaluator to
//! the node being read. The slot is saved and restored in strict LIFO order
//! across nested evaluations, including on unwind.

use std::cell::Cell;

use crate::arena::edge_arena::{self, EdgeId};
use crate::arena::node_arena::{NodeId, RUNNING, TRACKING};
use crate::derived;

thread_local! {
    static EVAL_CONTEXT: Cell<Option<NodeId>> = const { Cell::new(None) };
}

/// The node currently running its closure, if any.
pub(crate) fn current() -> Option<NodeId> {
    EVAL_CONTEXT.with(Cell::get)
}

fn swap(value: Option<NodeId>) -> Option<NodeId> {
    EVAL_CONTEXT.with(|slot| slot.replace(value))
}

/// Scope of one closure run: installs the evaluator on entry; on drop
/// (normal return or unwind) restores the previous evaluator, rebuilds the
/// evaluator's sources list and clears its running flag.
pub(crate) struct EvalScope {
    id: NodeId,
    prev: Option<NodeId>,
}

impl EvalScope {
    pub(crate) fn enter(id: NodeId) -> Self {
        let prev = swap(Some(id));
        Self { id, prev }
    }
}

impl Drop for EvalScope {
    fn drop(&mut self) {
        swap(self.prev);
        cleanup_sources(self.id);
        self.id.remove_flags(RUNNING);
    }
}

/// Run `f` with dependency tracking suspended.
///
/// Reads inside `f` return current values but establish no edges, so the
/// surrounding derived or effect will not re-run when those nodes change.
///
/// ```
/// use fluss::{Effect, Source, untracked};
///
/// let watched = Source::new(1);
/// let ignored = Source::new(10);
/// let seen = std::rc::Rc::new(std::cell::Cell::new(0));
///
/// let sink = seen.clone();
/// let (watched2, ignored2) = (watched.clone(), ignored.clone());
/// let _effect = Effect::new(move || {
///     sink.set(watched2.get() + untracked(|| ignored2.get()));
/// });
/// assert_eq!(seen.get(), 11);
///
/// ignored.set(20).unwrap(); // no re-run
/// assert_eq!(seen.get(), 11);
/// watched.set(2).unwrap(); // re-runs, sees the new untracked value too
/// assert_eq!(seen.get(), 22);
/// ```
pub fn untracked<R>(f: impl FnOnce() -> R) -> R {
    struct Suspend {
        prev: Option<NodeId>,
    }
    impl Drop for Suspend {
        fn drop(&mut self) {
            swap(self.prev.take());
        }
    }

    let _guard = Suspend { prev: swap(None) };
    f()
}

/// Record a tracked read of `source` by the current evaluator, if any.
///
/// Reuses the evaluator's existing edge when one exists (flagging it used
/// and splicing it to the head of the sources list), otherwise allocates a
/// fresh edge, saving the displaced occupant of the source's tracking slot
/// for rollback. Returns the edge so the caller can stamp the observed
/// version once the value is read.
pub(crate) fn track_read(source: NodeId) -> Option<EdgeId> {
    let evaluator = current()?;

    match source.with(|node| node.tracking) {
        Some(edge) if edge.with(|slot| slot.target) == evaluator => {
            let already_used = edge.with(|slot| {
                let was = slot.used;
                slot.used = true;
                was
            });
            if already_used {
                cov_mark::hit!(repeated_read_is_free);
            } else {
                edge_arena::move_source_head(edge);
            }
            Some(edge)
        }
        displaced => {
            let edge = edge_arena::alloc_edge(source, evaluator);
            edge.with(|slot| slot.rollback = displaced);
            edge_arena::push_source_head(evaluator, edge);
            source.with(|node| node.tracking = Some(edge));
            if evaluator.has(TRACKING) {
                edge_arena::subscribe(edge);
            }
            Some(edge)
        }
    }
}

/// Ready an evaluator's existing sources list for re-tracking.
///
/// Every edge keeps its identity (subscribed edges stay subscribed); its
/// used flag is reset and the source's tracking slot is pointed at it,
/// saving the previous occupant for rollback when evaluations nest.
pub(crate) fn prepare_sources(target: NodeId) {
    let mut cursor = target.with(|node| node.sources);
    while let Some(edge) = cursor {
        let source = edge.with(|slot| slot.source);
        let displaced = source.with(|node| node.tracking.replace(edge));
        cursor = edge.with(|slot| {
            slot.used = false;
            slot.rollback = displaced;
            slot.next_source
        });
    }
}

/// Rebuild an evaluator's sources list after a run.
///
/// Edges the run did not use are unsubscribed and freed; every edge, kept
/// or dropped, hands its saved rollback back to the source's tracking slot.
/// The surviving list keeps read order, so the next short-circuit scan
/// walks dependencies first-read-first.
pub(crate) fn cleanup_sources(target: NodeId) {
    let mut cursor = target.with(|node| node.sources);
    while let Some(edge) = cursor {
        let (source, used, rollback, next) =
            edge.with(|slot| (slot.source, slot.used, slot.rollback.take(), slot.next_source));
        source.with(|node| node.tracking = rollback);
        if !used {
            cov_mark::hit!(unused_edge_dropped);
            edge_arena::unsubscribe(edge);
            edge_arena::unlink_source(edge);
            edge_arena::free_edge(edge);
        }
        cursor = next;
    }
}

/// Decide whether `target` must re-run by scanning its dependencies in
/// first-read order.
///
/// A version mismatch means a dependency changed since the last run. A
/// matching version is re-verified after refreshing the dependency, which
/// brings transitive deriveds up to date; a failure inside that refresh is
/// captured by the dependency itself (advancing its version) rather than
/// propagated, so the scan still detects the change and the evaluator's own
/// closure gets the chance to observe or handle the error.
pub(crate) fn needs_recompute(target: NodeId) -> bool {
    let mut cursor = target.with(|node| node.sources_tail);
    while let Some(edge) = cursor {
        let (source, seen) = edge.with(|slot| (slot.source, slot.version));
        if source.version() != seen || !derived::refresh(source) || source.version() != seen {
            return true;
        }
        cursor = edge.with(|slot| slot.prev_source);
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::node_arena::{self, alloc_effect, alloc_source};

    #[test]
    fn tracked_read_outside_any_evaluator_is_ignored() {
        let source = alloc_source();
        assert!(track_read(source).is_none());
        source.release();
    }

    #[test]
    fn repeated_reads_install_one_edge() {
        let source = alloc_source();
        let evaluator = alloc_effect(Box::new(|| Ok(())));

        prepare_sources(evaluator);
        {
            let _scope = EvalScope::enter(evaluator);
            let first = track_read(source).unwrap();
            let second = track_read(source).unwrap();
            assert_eq!(first, second);
        }
        assert_eq!(
            edge_arena::sources_in_first_read_order(evaluator),
            vec![source]
        );

        node_arena::detach_sources(evaluator);
        evaluator.release();
        source.release();
    }

    #[test]
    fn unused_edges_are_dropped_on_cleanup() {
        let a = alloc_source();
        let b = alloc_source();
        let evaluator = alloc_effect(Box::new(|| Ok(())));

        {
            let _scope = EvalScope::enter(evaluator);
            track_read(a);
            track_read(b);
        }
        assert_eq!(
            edge_arena::sources_in_first_read_order(evaluator),
            vec![a, b]
        );

        // Second run reads only b: a's edge must go.
        cov_mark::check!(unused_edge_dropped);
        prepare_sources(evaluator);
        {
            let _scope = EvalScope::enter(evaluator);
            track_read(b);
        }
        assert_eq!(edge_arena::sources_in_first_read_order(evaluator), vec![b]);

        node_arena::detach_sources(evaluator);
        evaluator.release();
        a.release();
        b.release();
    }

    #[test]
    fn nested_evaluations_roll_the_tracking_slot_back() {
        let shared = alloc_source();
        let outer = alloc_effect(Box::new(|| Ok(())));
        let inner = alloc_effect(Box::new(|| Ok(())));

        {
            let _outer_scope = EvalScope::enter(outer);
            let outer_edge = track_read(shared).unwrap();

            {
                let _inner_scope = EvalScope::enter(inner);
                let inner_edge = track_read(shared).unwrap();
                assert_ne!(outer_edge, inner_edge);
                assert_eq!(shared.with(|node| node.tracking), Some(inner_edge));
            }

            // Inner cleanup restored the outer evaluator's edge.
            assert_eq!(shared.with(|node| node.tracking), Some(outer_edge));
            assert_eq!(track_read(shared).unwrap(), outer_edge);
        }
        assert_eq!(shared.with(|node| node.tracking), None);

        node_arena::detach_sources(outer);
        node_arena::detach_sources(inner);
        outer.release();
        inner.release();
        shared.release();
    }

    #[test]
    fn untracked_restores_the_evaluator() {
        let evaluator = alloc_effect(Box::new(|| Ok(())));
        {
            let _scope = EvalScope::enter(evaluator);
            assert_eq!(current(), Some(evaluator));
            untracked(|| assert_eq!(current(), None));
            assert_eq!(current(), Some(evaluator));
        }
        assert_eq!(current(), None);
        evaluator.release();
    }
}
