//! Batch scheduler: write coalescing and deferred effect execution.
//!
//! Writes never run effects inline. They mark the graph and push notified
//! effects onto a LIFO pending queue; the queue drains when the outermost
//! batch scope exits. Every write wraps its own notification fan-out in an
//! implicit batch, so a bare write still defers its effects until the write
//! returns.

use std::cell::Cell;

use crate::arena::node_arena::{self, DISPOSED, NodeId};
use crate::context;
use crate::effect;
use crate::error::Error;

thread_local! {
    static BATCH_DEPTH: Cell<u32> = const { Cell::new(0) };
    static BATCH_ITERATION: Cell<u32> = const { Cell::new(0) };
    static QUEUE_HEAD: Cell<Option<NodeId>> = const { Cell::new(None) };
    static GLOBAL_VERSION: Cell<u64> = const { Cell::new(1) };
}

/// Maximum number of drain waves one batch may take before a write fails
/// with [`Error::Cycle`].
///
/// A drain wave is one pass over the pending effect queue; effects that
/// write sources they observe re-enqueue themselves and add waves. The
/// bound is a heuristic guard against such feedback loops, not a complete
/// cycle detector: a loop that stops re-enqueuing on its own never trips it.
pub const MAX_BATCH_ITERATIONS: u32 = 100;

/// Monotonic counter bumped on every source write that changes a value.
/// Lets a derived skip its dependency scan entirely when nothing anywhere
/// has changed since it last verified.
pub(crate) fn global_version() -> u64 {
    GLOBAL_VERSION.with(Cell::get)
}

pub(crate) fn bump_global_version() {
    GLOBAL_VERSION.with(|version| version.set(version.get() + 1));
}

/// Current drain wave count; zero outside a drain.
pub(crate) fn iteration() -> u32 {
    BATCH_ITERATION.with(Cell::get)
}

/// Push a notified effect onto the pending queue (LIFO).
pub(crate) fn enqueue_effect(id: NodeId) {
    let head = QUEUE_HEAD.with(|queue| queue.replace(Some(id)));
    node_arena::set_next_queued(id, head);
}

/// Open a batch scope. Writes inside the scope accumulate; effects run when
/// the matching [`end_batch`] closes the outermost scope.
pub(crate) fn start_batch() {
    BATCH_DEPTH.with(|depth| depth.set(depth.get() + 1));
}

/// Close a batch scope. Closing the outermost scope drains the pending
/// effect queue to a fixed point; the first error raised by an effect run
/// is returned after the drain completes, later effects still run.
pub(crate) fn end_batch() -> Result<(), Error> {
    let depth = BATCH_DEPTH.with(Cell::get);
    debug_assert!(depth > 0, "end_batch without matching start_batch");
    if depth > 1 {
        BATCH_DEPTH.with(|d| d.set(depth - 1));
        return Ok(());
    }

    let mut first_error: Option<Error> = None;

    // Effects run while the depth stays at 1, so anything they enqueue lands
    // back on the queue and is picked up by the next wave.
    loop {
        let Some(head) = QUEUE_HEAD.with(Cell::take) else {
            break;
        };
        BATCH_ITERATION.with(|iter| iter.set(iter.get() + 1));

        let mut cursor = Some(head);
        while let Some(id) = cursor {
            cursor = node_arena::take_next_queued(id);
            id.remove_flags(node_arena::NOTIFIED);
            if id.has(DISPOSED) {
                // A handle dropped while the effect sat in the queue could
                // not free the slot; it can go now. An effect that is
                // disposed during its own run is released by the run itself.
                id.release_if_dead();
                continue;
            }
            if context::needs_recompute(id) {
                let run = effect::run_effect(id);
                // The run's own batch scope is nested and cannot drain, so
                // this folds in nothing beyond the callback's outcome.
                if let Err(error) = run.callback.and(run.drained) {
                    if first_error.is_none() {
                        first_error = Some(error);
                    }
                }
            }
        }
    }

    BATCH_ITERATION.with(|iter| iter.set(0));
    BATCH_DEPTH.with(|d| d.set(depth - 1));
    match first_error {
        Some(error) => Err(error),
        None => Ok(()),
    }
}

/// Run `f` with writes coalesced: every effect affected by the writes runs
/// at most once, after `f` returns. Nested calls flatten into the outermost
/// scope. Returns `f`'s value, or the first error raised by a deferred
/// effect run.
///
/// ```
/// use fluss::{Derived, Effect, Source, batch};
///
/// let a = Source::new(1);
/// let b = Source::new(2);
/// let (a2, b2) = (a.clone(), b.clone());
/// let sum = Derived::new(move || a2.get() + b2.get());
///
/// let runs = std::rc::Rc::new(std::cell::Cell::new(0));
/// let counter = runs.clone();
/// let _effect = Effect::new(move || {
///     sum.get();
///     counter.set(counter.get() + 1);
/// });
/// assert_eq!(runs.get(), 1);
///
/// batch(|| {
///     a.set(10).unwrap();
///     b.set(20).unwrap();
/// })
/// .unwrap();
/// // Two writes, one run.
/// assert_eq!(runs.get(), 2);
/// ```
pub fn batch<R>(f: impl FnOnce() -> R) -> Result<R, Error> {
    struct DepthGuard {
        armed: bool,
    }
    impl Drop for DepthGuard {
        fn drop(&mut self) {
            // Unwind path: close the scope without draining. Pending effects
            // stay queued for the next outermost drain.
            if self.armed {
                BATCH_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
            }
        }
    }

    start_batch();
    let mut guard = DepthGuard { armed: true };
    let value = f();
    guard.armed = false;
    end_batch().map(|()| value)
}
