use std::fmt;

use crate::arena::node_arena::{self, DISPOSED, NodeId, RUNNING};
use crate::batch;
use crate::context;
use crate::error::Error;

/// A side-effecting reaction to the graph.
///
/// The callback runs once on creation, recording every node it reads as a
/// dependency; afterwards it is re-run whenever one of those dependencies
/// actually changed, at most once per batch. The handle detaches the effect
/// on drop:
///
/// ```
/// use fluss::{Effect, Source};
///
/// let name = Source::new(String::from("world"));
/// let greetings = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
///
/// let (n, log) = (name.clone(), greetings.clone());
/// let effect = Effect::new(move || log.borrow_mut().push(format!("hello {}", n.get())));
/// name.set(String::from("fluss")).unwrap();
///
/// effect.dispose();
/// name.set(String::from("nobody")).unwrap(); // no longer observed
///
/// assert_eq!(*greetings.borrow(), ["hello world", "hello fluss"]);
/// ```
pub struct Effect {
    id: NodeId,
}

impl Effect {
    /// Create an effect from an infallible callback and run it immediately.
    ///
    /// # Panics
    ///
    /// Panics if the initial run surfaces an error from a deferred effect it
    /// triggered; use [`try_new`](Effect::try_new) to handle errors as
    /// values.
    pub fn new(mut callback: impl FnMut() + 'static) -> Effect {
        match Self::create(Box::new(move || {
            callback();
            Ok(())
        })) {
            Ok(effect) => effect,
            Err(error) => panic!("effect creation failed: {error}"),
        }
    }

    /// Create an effect from a fallible callback and run it immediately.
    ///
    /// If the callback's own first run fails, the half-built effect is
    /// disposed and the error returned. An error raised by a *different*
    /// effect woken while the initial run's batch drained is returned too,
    /// but this effect ran clean and stays subscribed; its disposer is lost
    /// with the error. On later runs the first failure per drain pass is
    /// surfaced by the write or [`batch()`](crate::batch()) call that
    /// triggered it.
    pub fn try_new(callback: impl FnMut() -> Result<(), Error> + 'static) -> Result<Effect, Error> {
        Self::create(Box::new(callback))
    }

    fn create(callback: Box<dyn FnMut() -> Result<(), Error>>) -> Result<Effect, Error> {
        let id = node_arena::alloc_effect(callback);
        let run = run_effect(id);
        if let Err(error) = run.callback {
            // Its own first run failed: tear the half-built effect down.
            dispose_node(id);
            id.release();
            return Err(error);
        }
        // An error raised by another effect woken during the drain still
        // surfaces, but this effect ran clean and stays installed.
        run.drained.map(|()| Effect { id })
    }

    /// Detach the effect from the graph: every source edge is unsubscribed
    /// and the callback never runs again. Equivalent to dropping the handle.
    pub fn dispose(self) {
        drop(self);
    }
}

impl Drop for Effect {
    fn drop(&mut self) {
        dispose_node(self.id);
        self.id.release();
    }
}

impl fmt::Debug for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Effect").finish_non_exhaustive()
    }
}

fn dispose_node(id: NodeId) {
    id.add_flags(DISPOSED);
    // Mid-run disposal defers the detach to the end of the run.
    if !id.has(RUNNING) {
        node_arena::detach_sources(id);
    }
}

/// Outcome of one effect run.
///
/// The callback's own result and the result of draining the batch the run
/// closed are kept separate, so callers can tell a failure of this effect
/// from a failure of some other effect woken by its writes.
pub(crate) struct EffectRun {
    pub(crate) callback: Result<(), Error>,
    pub(crate) drained: Result<(), Error>,
}

/// One full run of an effect's callback.
///
/// Re-entry is a cycle. The run opens a batch so writes made by the callback
/// are deferred past the end of the run, installs the effect as the ambient
/// evaluator, and re-tracks its dependencies around the callback.
pub(crate) fn run_effect(id: NodeId) -> EffectRun {
    struct CallbackGuard {
        id: NodeId,
        callback: Option<Box<dyn FnMut() -> Result<(), Error>>>,
    }
    impl Drop for CallbackGuard {
        fn drop(&mut self) {
            if let Some(callback) = self.callback.take() {
                node_arena::put_callback(self.id, callback);
            }
        }
    }

    if id.has(RUNNING) {
        return EffectRun {
            callback: Err(Error::Cycle),
            drained: Ok(()),
        };
    }
    id.add_flags(RUNNING);

    context::prepare_sources(id);
    batch::start_batch();
    let result = {
        let _scope = context::EvalScope::enter(id);
        let mut guard = CallbackGuard {
            id,
            callback: node_arena::take_callback(id),
        };
        match guard.callback.as_mut() {
            Some(callback) => callback(),
            None => Ok(()),
        }
        // `guard` restores the callback, then `_scope` restores the previous
        // evaluator, rebuilds the sources list and clears the running flag.
    };

    if id.has(DISPOSED) {
        node_arena::detach_sources(id);
        id.release_if_dead();
    }

    EffectRun {
        callback: result,
        drained: batch::end_batch(),
    }
}
