use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::arena::node_arena::{
    self, HAS_ERROR, HandleRef, NodeId, RUNNING, Recomputed, STALE, TRACKING,
};
use crate::batch;
use crate::context;
use crate::effect::Effect;
use crate::error::Error;

/// A read-only value computed from other nodes.
///
/// The formula runs lazily: creation computes nothing, and a value is only
/// recomputed when it is read after a dependency actually changed. Reads
/// inside another formula or effect record a dependency, so chains of
/// derived values re-verify and recompute along the shortest path.
///
/// ```
/// use fluss::{Derived, Source};
///
/// let items = Source::new(vec![1, 2, 3]);
/// let i = items.clone();
/// let total: Derived<i32> = Derived::new(move || i.get().iter().sum());
///
/// assert_eq!(total.get(), 6);
/// items.set(vec![10, 20]).unwrap();
/// assert_eq!(total.get(), 30);
/// ```
///
/// A formula may fail (see [`Derived::fallible`]); the failure is captured
/// and returned from every read until a dependency change lets the formula
/// succeed again.
pub struct Derived<T> {
    id: NodeId,
    state: Rc<RefCell<DerivedState<T>>>,
    handle: Rc<HandleRef>,
}

/// Cached result, shared between the handle and the compute closure stored
/// in the arena.
struct DerivedState<T> {
    value: Option<T>,
    error: Option<Error>,
}

impl<T: PartialEq + Clone + 'static> Derived<T> {
    /// Create a derived value from an infallible formula.
    pub fn new(mut formula: impl FnMut() -> T + 'static) -> Self {
        Self::fallible(move || Ok(formula()))
    }

    /// Create a derived value from a formula that may fail.
    ///
    /// An `Err` is captured in place of the value: the node still advances
    /// its version (so dependents notice) and every read returns a clone of
    /// the error until a later recomputation succeeds.
    pub fn fallible(mut formula: impl FnMut() -> Result<T, Error> + 'static) -> Self {
        let state = Rc::new(RefCell::new(DerivedState {
            value: None,
            error: None,
        }));

        let cell = Rc::clone(&state);
        let compute = Box::new(move || match formula() {
            Ok(value) => {
                let mut cell = cell.borrow_mut();
                // The first run and any run after an error always count as a
                // change; otherwise compare against the cached value.
                let changed = cell.error.is_some() || cell.value.as_ref() != Some(&value);
                cell.error = None;
                if changed {
                    cell.value = Some(value);
                    Recomputed::Changed
                } else {
                    Recomputed::Unchanged
                }
            }
            Err(error) => {
                cell.borrow_mut().error = Some(error);
                Recomputed::Failed
            }
        });

        let id = node_arena::alloc_derived(compute);
        Derived {
            id,
            state,
            handle: Rc::new(HandleRef::new(id)),
        }
    }

    /// Read the value, recomputing if a dependency changed.
    ///
    /// Inside a formula or effect callback this records a dependency on the
    /// derived. Returns [`Error::Cycle`] when the derived is read from
    /// within its own formula, or a clone of the captured error when the
    /// formula failed.
    pub fn try_get(&self) -> Result<T, Error> {
        if self.id.has(RUNNING) {
            return Err(Error::Cycle);
        }
        let edge = context::track_read(self.id);
        refresh(self.id);
        if let Some(edge) = edge {
            edge.set_version(self.id.version());
        }
        self.current()
    }

    /// Read the value, recomputing if a dependency changed.
    ///
    /// # Panics
    ///
    /// Panics on a cycle or a captured formula error; use
    /// [`try_get`](Derived::try_get) to handle those as values.
    pub fn get(&self) -> T {
        match self.try_get() {
            Ok(value) => value,
            Err(error) => panic!("derived read failed: {error}"),
        }
    }

    /// Read the value without recording a dependency.
    ///
    /// Still recomputes when stale: peeking never observes an outdated
    /// value, it only opts out of tracking.
    pub fn try_peek(&self) -> Result<T, Error> {
        if !refresh(self.id) {
            return Err(Error::Cycle);
        }
        self.current()
    }

    /// Read the value without recording a dependency.
    ///
    /// # Panics
    ///
    /// Panics on a cycle or a captured formula error; use
    /// [`try_peek`](Derived::try_peek) to handle those as values.
    pub fn peek(&self) -> T {
        match self.try_peek() {
            Ok(value) => value,
            Err(error) => panic!("derived read failed: {error}"),
        }
    }

    /// Install an effect that runs `f` with the current value now and after
    /// every relevant change. Fails if the first run observes an error.
    pub fn subscribe(&self, mut f: impl FnMut(T) + 'static) -> Result<Effect, Error> {
        let this = self.clone();
        Effect::try_new(move || {
            f(this.try_get()?);
            Ok(())
        })
    }

    #[cfg(test)]
    pub(crate) fn node_id(&self) -> NodeId {
        self.id
    }

    fn current(&self) -> Result<T, Error> {
        let cell = self.state.borrow();
        if self.id.has(HAS_ERROR) {
            Err(cell
                .error
                .clone()
                .expect("error flag is set together with a captured error"))
        } else {
            Ok(cell
                .value
                .clone()
                .expect("derived value is always cached after a refresh"))
        }
    }
}

impl<T> Clone for Derived<T> {
    fn clone(&self) -> Self {
        Derived {
            id: self.id,
            state: Rc::clone(&self.state),
            handle: Rc::clone(&self.handle),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Derived<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cell = self.state.borrow();
        f.debug_struct("Derived")
            .field("value", &cell.value)
            .field("error", &cell.error.as_ref().map(ToString::to_string))
            .finish()
    }
}

/// Bring a node up to date. Returns `false` only when the node is currently
/// running, which the caller must surface as a cycle.
///
/// Non-derived nodes are always fresh. For a derived node this is the whole
/// recomputation discipline: clear the notification mark, take the fast
/// paths when nothing can have changed, otherwise scan the recorded
/// dependency versions in first-read order and re-run the formula only when
/// one of them really moved.
pub(crate) fn refresh(id: NodeId) -> bool {
    if !id.is_derived() {
        return true;
    }

    id.remove_flags(node_arena::NOTIFIED);
    let flags = id.flags();
    if flags & RUNNING != 0 {
        return false;
    }

    // Subscribed and never notified since the last run: dependencies would
    // have marked this node stale, so the cache is current.
    if flags & (STALE | TRACKING) == TRACKING {
        cov_mark::hit!(subscribed_fresh_fast_path);
        return true;
    }
    id.remove_flags(STALE);

    // Nothing anywhere has been written since the last verification.
    if id.last_global() == batch::global_version() {
        cov_mark::hit!(global_quiescence_fast_path);
        return true;
    }
    id.set_last_global(batch::global_version());

    // Mark running before touching dependencies so re-entry is caught.
    id.add_flags(RUNNING);
    if id.version() > 0 && !context::needs_recompute(id) {
        cov_mark::hit!(version_scan_confirmed_fresh);
        id.remove_flags(RUNNING);
        return true;
    }
    recompute(id);
    true
}

/// Re-run the formula with this node as the ambient evaluator, then fold the
/// outcome into the node: a changed value or a captured failure advances the
/// version so downstream version scans notice.
fn recompute(id: NodeId) {
    struct ComputeGuard {
        id: NodeId,
        compute: Option<Box<dyn FnMut() -> Recomputed>>,
    }
    impl Drop for ComputeGuard {
        fn drop(&mut self) {
            if let Some(compute) = self.compute.take() {
                node_arena::put_compute(self.id, compute);
            }
        }
    }

    context::prepare_sources(id);
    let outcome = {
        let _scope = context::EvalScope::enter(id);
        let mut guard = ComputeGuard {
            id,
            compute: node_arena::take_compute(id),
        };
        match guard.compute.as_mut() {
            Some(compute) => compute(),
            None => Recomputed::Unchanged,
        }
        // `guard` restores the closure, then `_scope` restores the previous
        // evaluator, rebuilds the sources list and clears the running flag.
    };

    match outcome {
        Recomputed::Unchanged => {}
        Recomputed::Changed => {
            id.remove_flags(HAS_ERROR);
            id.bump_version();
        }
        Recomputed::Failed => {
            // The failure stays inside the node; version movement is what
            // lets downstream scans notice and rethrow or recover.
            cov_mark::hit!(formula_error_captured);
            id.add_flags(HAS_ERROR);
            id.bump_version();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::Source;
    use std::cell::Cell;

    #[test]
    fn formula_runs_lazily_and_caches() {
        let runs = Rc::new(Cell::new(0));
        let counter = runs.clone();
        let derived = Derived::new(move || {
            counter.set(counter.get() + 1);
            42
        });

        assert_eq!(runs.get(), 0);
        assert_eq!(derived.get(), 42);
        assert_eq!(derived.get(), 42);
        assert_eq!(runs.get(), 1);
    }

    #[test]
    fn unobserved_writes_do_not_recompute() {
        let source = Source::new(1);
        let runs = Rc::new(Cell::new(0));

        let (s, counter) = (source.clone(), runs.clone());
        let doubled = Derived::new(move || {
            counter.set(counter.get() + 1);
            s.get() * 2
        });
        assert_eq!(doubled.get(), 2);

        for i in 2..=11 {
            source.set(i).unwrap();
        }
        assert_eq!(runs.get(), 1);
        assert_eq!(doubled.get(), 22);
        assert_eq!(runs.get(), 2);
    }

    #[test]
    fn version_moves_only_when_the_value_changes() {
        let source = Source::new(4);
        let s = source.clone();
        let parity = Derived::new(move || s.get() % 2);

        assert_eq!(parity.get(), 0);
        let version = parity.id.version();

        // 4 -> 6 keeps the parity: the formula re-runs, the version stays.
        source.set(6).unwrap();
        assert_eq!(parity.get(), 0);
        assert_eq!(parity.id.version(), version);

        source.set(7).unwrap();
        assert_eq!(parity.get(), 1);
        assert_eq!(parity.id.version(), version + 1);
    }

    #[test]
    fn global_quiescence_skips_the_scan() {
        let source = Source::new(1);
        let s = source.clone();
        let derived = Derived::new(move || s.get());
        assert_eq!(derived.get(), 1);

        cov_mark::check!(global_quiescence_fast_path);
        assert_eq!(derived.get(), 1);
    }

    #[test]
    fn error_is_captured_and_cleared_on_recovery() {
        let source = Source::new(1);
        let s = source.clone();
        let checked = Derived::fallible(move || {
            let v = s.get();
            if v < 0 {
                Err(Error::msg("negative input"))
            } else {
                Ok(v)
            }
        });

        assert_eq!(checked.try_get().unwrap(), 1);

        source.set(-1).unwrap();
        let error = checked.try_get().unwrap_err();
        assert_eq!(error.to_string(), "negative input");
        // Rethrown from cache without re-running the formula.
        let again = checked.try_get().unwrap_err();
        assert_eq!(again.to_string(), "negative input");

        source.set(5).unwrap();
        assert_eq!(checked.try_get().unwrap(), 5);
    }

    #[test]
    fn self_read_is_a_cycle() {
        let holder: Rc<RefCell<Option<Derived<i32>>>> = Rc::new(RefCell::new(None));
        let inner = holder.clone();
        let derived = Derived::fallible(move || {
            let this = inner.borrow().clone().expect("installed before read");
            this.try_get()
        });
        *holder.borrow_mut() = Some(derived.clone());

        assert!(matches!(derived.try_get(), Err(Error::Cycle)));
        // The cycle is captured like any other formula failure.
        assert!(matches!(derived.try_peek(), Err(Error::Cycle)));

        *holder.borrow_mut() = None;
    }

    #[test]
    fn peek_recomputes_but_get_tracks() {
        let source = Source::new(1);
        let s = source.clone();
        let derived = Derived::new(move || s.get() + 1);

        assert_eq!(derived.peek(), 2);
        source.set(5).unwrap();
        assert_eq!(derived.peek(), 6);
    }
}
