#![deny(missing_docs)]

//! Fine-grained reactive value propagation
//!
//! This crate tracks dependencies between computed values so that when
//! inputs change, only the computations actually affected re-run, each at
//! most once per coherent update. It is the substrate a UI framework or an
//! incremental computation layer sits on top of.
//!
//! # Quick Start
//!
//! ```
//! use fluss::{Derived, Effect, Source, batch};
//!
//! let price = Source::new(12.0_f64);
//! let quantity = Source::new(2.0_f64);
//!
//! let (p, q) = (price.clone(), quantity.clone());
//! let total = Derived::new(move || p.get() * q.get());
//!
//! let printed = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
//! let log = printed.clone();
//! let _effect = Effect::new(move || log.borrow_mut().push(total.get()));
//! assert_eq!(*printed.borrow(), [24.0]);
//!
//! // Two writes, one coherent update: the effect sees only the final state.
//! batch(|| {
//!     price.set(10.0).unwrap();
//!     quantity.set(3.0).unwrap();
//! })
//! .unwrap();
//! assert_eq!(*printed.borrow(), [24.0, 30.0]);
//! ```
//!
//! # Core Types
//!
//! - [`Source<T>`] - A writable value cell. Reading it inside a formula or
//!   effect records a dependency; [`set`](Source::set) notifies dependents.
//! - [`Derived<T>`] - A read-only value computed from other nodes. Lazy:
//!   recomputes only when read after a dependency actually changed.
//! - [`Effect`] - A side-effecting callback that re-runs when its
//!   dependencies change. Runs immediately on creation; detached on drop.
//! - [`batch()`](crate::batch()) - Coalesces any number of writes into one update wave.
//!
//! # How propagation works
//!
//! Writes are push, reads are pull. A write bumps version counters and
//! eagerly *marks* the downstream graph stale without computing anything;
//! affected effects are queued. When the outermost batch ends, each queued
//! effect checks whether one of its recorded dependencies really changed
//! (re-running intermediate derived values along the way, versions deciding
//! at each step) and only then re-runs. The discipline is glitch-free: no
//! observer ever sees a half-applied update, and recomputations that
//! produce equal values stop the wave.
//!
//! Dependency tracking is dynamic. Each run of a formula or callback
//! re-records exactly the nodes it read: branches that stopped reading a
//! node stop depending on it, and a source with no transitive observer
//! keeps no subscriber state at all, so writing it is a version bump and
//! nothing more.
//!
//! # Errors
//!
//! All engine failures are values (the panicking accessors
//! [`Derived::get`]/[`Derived::peek`] are opt-in conveniences):
//!
//! - [`Error::Cycle`] - a node re-entered during its own evaluation, or an
//!   effect/write feedback loop exceeded [`MAX_BATCH_ITERATIONS`] drain
//!   waves.
//! - [`Error::Formula`] - a derived formula failed; the error is captured
//!   and returned from every read until a dependency change recomputes the
//!   value successfully.

pub(crate) mod arena;
mod batch;
mod context;
mod derived;
mod effect;
mod error;
mod source;

pub use batch::{MAX_BATCH_ITERATIONS, batch};
pub use context::untracked;
pub use derived::Derived;
pub use effect::Effect;
pub use error::{Error, FormulaError};
pub use source::Source;
