use std::error;
use std::fmt;
use std::rc::Rc;

/// Failure surfaced by a read, write, effect run or batch drain.
///
/// Cloning is cheap: a captured formula error is reference-counted so that a
/// derived value in the error state can return the same failure from every
/// subsequent read until a dependency change recomputes it successfully.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// A node was re-entered while it was already evaluating, or effect
    /// draining exceeded [`MAX_BATCH_ITERATIONS`](crate::MAX_BATCH_ITERATIONS)
    /// waves (a write/notify feedback loop).
    #[error("dependency cycle detected")]
    Cycle,

    /// A derived formula or effect callback failed with a user error.
    #[error(transparent)]
    Formula(#[from] FormulaError),
}

impl Error {
    /// Wrap an arbitrary user error as a formula failure.
    pub fn formula<E>(err: E) -> Self
    where
        E: error::Error + 'static,
    {
        Error::Formula(FormulaError(Rc::new(err)))
    }

    /// Wrap a plain message as a formula failure.
    pub fn msg(msg: impl Into<String>) -> Self {
        Error::Formula(FormulaError(Rc::new(MessageError(msg.into()))))
    }
}

/// A user error captured out of a derived formula or effect callback.
#[derive(Clone)]
pub struct FormulaError(Rc<dyn error::Error + 'static>);

impl FormulaError {
    /// The underlying error.
    pub fn inner(&self) -> &(dyn error::Error + 'static) {
        &*self.0
    }
}

impl fmt::Debug for FormulaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl fmt::Display for FormulaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.0, f)
    }
}

impl error::Error for FormulaError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        self.0.source()
    }
}

/// String-only error for [`Error::msg`].
struct MessageError(String);

impl fmt::Debug for MessageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for MessageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl error::Error for MessageError {}
