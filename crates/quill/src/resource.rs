//! Execution limits and cooperative cancellation.

use std::{cell::Cell, rc::Rc};

/// Default maximum script call depth.
pub const DEFAULT_MAX_RECURSION_DEPTH: usize = 200;

/// Cooperative cancellation flag shared between host and interpreter.
///
/// The VM observes the flag between opcodes at `call`, `loopPoint`, and
/// `ifStmt` dispatch, the points every non-trivial execution passes
/// through. Execution is single-threaded, so a plain `Cell` suffices; a
/// host wanting to cancel from another thread must marshal the request
/// onto the embedding thread.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Rc<Cell<bool>>);

impl CancellationFlag {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.set(true);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.get()
    }

    pub fn reset(&self) {
        self.0.set(false);
    }
}

/// Limits one interpreter instance runs under.
#[derive(Debug, Clone)]
pub struct ResourceLimits {
    /// Maximum script call depth before `StackOverflow` is raised.
    pub max_recursion_depth: usize,
    /// Optional cancellation flag checked at loop and call boundaries.
    pub cancellation: Option<CancellationFlag>,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_recursion_depth: DEFAULT_MAX_RECURSION_DEPTH,
            cancellation: None,
        }
    }
}

impl ResourceLimits {
    #[must_use]
    pub fn with_cancellation(mut self, flag: CancellationFlag) -> Self {
        self.cancellation = Some(flag);
        self
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.as_ref().is_some_and(CancellationFlag::is_cancelled)
    }
}
