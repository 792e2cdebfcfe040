use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::arena::edge_arena;
use crate::arena::node_arena::{self, HandleRef, NodeId};
use crate::batch;
use crate::context;
use crate::effect::Effect;
use crate::error::Error;

/// A writable reactive value cell.
///
/// The value lives in the handle; the arena keeps only the cell's reactive
/// metadata (version counter and dependents list). Handles are cheap to
/// clone and are typically moved into the closures that read them:
///
/// ```
/// use fluss::{Derived, Source};
///
/// let celsius = Source::new(20.0_f64);
/// let c = celsius.clone();
/// let fahrenheit = Derived::new(move || c.get() * 9.0 / 5.0 + 32.0);
///
/// assert_eq!(fahrenheit.get(), 68.0);
/// celsius.set(25.0).unwrap();
/// assert_eq!(fahrenheit.get(), 77.0);
/// ```
pub struct Source<T> {
    id: NodeId,
    value: Rc<RefCell<T>>,
    handle: Rc<HandleRef>,
}

impl<T: PartialEq + Clone + 'static> Source<T> {
    /// Create a new source holding `value`.
    pub fn new(value: T) -> Self {
        let id = node_arena::alloc_source();
        Source {
            id,
            value: Rc::new(RefCell::new(value)),
            handle: Rc::new(HandleRef::new(id)),
        }
    }

    /// Read the current value.
    ///
    /// Inside a derived formula or effect callback this records a dependency
    /// on the source, so the surrounding computation re-runs when the value
    /// changes.
    pub fn get(&self) -> T {
        if let Some(edge) = context::track_read(self.id) {
            edge.set_version(self.id.version());
        }
        self.value.borrow().clone()
    }

    /// Read the current value without recording a dependency.
    pub fn peek(&self) -> T {
        self.value.borrow().clone()
    }

    /// Store a new value and notify dependents.
    ///
    /// A write of an equal value (by `PartialEq`) is a no-op: no versions
    /// move and nothing is notified. Otherwise dependents are marked and
    /// affected effects run before `set` returns (or when the enclosing
    /// [`batch()`](crate::batch()) exits); the first error raised by such an
    /// effect run is returned here.
    ///
    /// Fails with [`Error::Cycle`] when called from inside a drain that has
    /// already looped [`MAX_BATCH_ITERATIONS`](crate::MAX_BATCH_ITERATIONS)
    /// times, which catches effects that keep rewriting sources they observe.
    pub fn set(&self, value: T) -> Result<(), Error> {
        self.replace(value).map(|_| ())
    }

    /// Like [`set`](Source::set), returning the previous value.
    pub fn replace(&self, value: T) -> Result<T, Error> {
        if *self.value.borrow() == value {
            cov_mark::hit!(equal_write_is_noop);
            return Ok(std::mem::replace(&mut *self.value.borrow_mut(), value));
        }
        if batch::iteration() > batch::MAX_BATCH_ITERATIONS {
            cov_mark::hit!(runaway_drain_write_rejected);
            return Err(Error::Cycle);
        }

        let previous = std::mem::replace(&mut *self.value.borrow_mut(), value);
        self.id.bump_version();
        batch::bump_global_version();

        // Implicit batch around the fan-out: effects notified here run once
        // the outermost scope closes, even for a bare write.
        batch::start_batch();
        for target in edge_arena::dependent_targets(self.id) {
            node_arena::notify(target);
        }
        batch::end_batch().map(|()| previous)
    }

    /// Install an effect that runs `f` with the current value now and after
    /// every change. Dropping the returned [`Effect`] detaches it.
    pub fn subscribe(&self, mut f: impl FnMut(T) + 'static) -> Effect {
        let this = self.clone();
        Effect::new(move || f(this.get()))
    }

    #[cfg(test)]
    pub(crate) fn node_id(&self) -> NodeId {
        self.id
    }
}

impl<T> Clone for Source<T> {
    fn clone(&self) -> Self {
        Source {
            id: self.id,
            value: Rc::clone(&self.value),
            handle: Rc::clone(&self.handle),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Source<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Source").field(&*self.value.borrow()).finish()
    }
}
