//! Promises and operation futures.
//!
//! A [`Promise`] counts outstanding dependencies; its [`OpFuture`] resolves
//! when the count reaches zero. Both sides share one reference-counted core
//! and stay on the thread that created them. Waiting is always a progress
//! spin, never an OS block.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::persona::{Level, Persona};

/// Resolution state of a future core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FutureState {
    /// Dependencies remain.
    Pending,
    /// All dependencies fulfilled; a value is available.
    Ready,
    /// The operation was cancelled; no value will ever arrive.
    Cancelled,
}

#[derive(Debug)]
struct Core<T> {
    deps: Cell<usize>,
    state: Cell<FutureState>,
    finalized: Cell<bool>,
    value: RefCell<Option<T>>,
}

impl<T> Core<T> {
    fn new(deps: usize) -> Self {
        Self {
            deps: Cell::new(deps),
            state: Cell::new(FutureState::Pending),
            finalized: Cell::new(false),
            value: RefCell::new(None),
        }
    }

    fn discharge(&self, n: usize) {
        let deps = self.deps.get();
        assert!(n <= deps, "promise fulfilled more times than required");
        self.deps.set(deps - n);
        if deps == n && self.state.get() == FutureState::Pending {
            self.state.set(FutureState::Ready);
        }
    }
}

/// A dependency-counted promise.
///
/// Created with one construction dependency, dropped by [`finalize`].
/// Completion actions add further dependencies with [`require`] and
/// discharge them as the matching events fire.
///
/// [`finalize`]: Promise::finalize
/// [`require`]: Promise::require
pub struct Promise<T: Clone + Default> {
    core: Rc<Core<T>>,
}

impl<T: Clone + Default> Promise<T> {
    pub fn new() -> Self {
        Self {
            core: Rc::new(Core::new(1)),
        }
    }

    /// Add `n` dependencies. Only valid before [`Promise::finalize`].
    pub fn require(&self, n: usize) {
        assert!(!self.core.finalized.get(), "require after finalize");
        self.core.deps.set(self.core.deps.get() + n);
    }

    /// Discharge one dependency, supplying the produced value.
    pub fn fulfill(&self, value: T) {
        *self.core.value.borrow_mut() = Some(value);
        self.core.discharge(1);
    }

    /// Discharge `n` dependencies without a value.
    pub fn fulfill_anonymous(&self, n: usize) {
        self.core.discharge(n);
    }

    /// Drop the construction dependency and hand out the future.
    pub fn finalize(&self) -> OpFuture<T> {
        assert!(!self.core.finalized.get(), "promise finalized twice");
        self.core.finalized.set(true);
        let fut = OpFuture {
            core: Rc::clone(&self.core),
        };
        self.core.discharge(1);
        fut
    }

    /// The future view without touching the construction dependency.
    /// Backs anonymous future slots, where the slot itself is the one
    /// dependency and firing resolves it.
    pub(crate) fn internal_future(&self) -> OpFuture<T> {
        OpFuture {
            core: Rc::clone(&self.core),
        }
    }

    /// Resolve as cancelled regardless of remaining dependencies.
    pub(crate) fn cancel(&self) {
        if self.core.state.get() == FutureState::Pending {
            self.core.state.set(FutureState::Cancelled);
        }
    }
}

impl<T: Clone + Default> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Default> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            core: Rc::clone(&self.core),
        }
    }
}

/// The consumer side of an asynchronous operation.
///
/// Resolves with the operation's produced value, `T::default()` when the
/// completing event carries none.
#[derive(Debug)]
pub struct OpFuture<T: Clone + Default> {
    core: Rc<Core<T>>,
}

impl<T: Clone + Default> OpFuture<T> {
    /// An already-resolved future. Used when the event was known complete
    /// before the future was requested, skipping the promise allocation.
    pub fn ready(value: T) -> Self {
        let core = Core::new(0);
        core.state.set(FutureState::Ready);
        *core.value.borrow_mut() = Some(value);
        Self { core: Rc::new(core) }
    }

    /// A future resolved as cancelled.
    pub fn cancelled() -> Self {
        let core = Core::new(0);
        core.state.set(FutureState::Cancelled);
        Self { core: Rc::new(core) }
    }

    #[inline]
    pub fn state(&self) -> FutureState {
        self.core.state.get()
    }

    /// True once resolved, whether with a value or by cancellation.
    #[inline]
    pub fn is_resolved(&self) -> bool {
        self.core.state.get() != FutureState::Pending
    }

    #[inline]
    pub fn is_ready(&self) -> bool {
        self.core.state.get() == FutureState::Ready
    }

    /// Non-blocking read. `None` while pending.
    pub fn try_get(&self) -> Option<Result<T>> {
        match self.core.state.get() {
            FutureState::Pending => None,
            FutureState::Cancelled => Some(Err(Error::Cancelled)),
            FutureState::Ready => {
                let value = self
                    .core
                    .value
                    .borrow()
                    .clone()
                    .unwrap_or_default();
                Some(Ok(value))
            }
        }
    }

    /// Spin `persona`'s progress until this future resolves.
    ///
    /// The future must belong to an operation driven by `persona` or by
    /// another thread that keeps calling progress, or this never returns.
    pub fn wait(&self, persona: &mut Persona) -> Result<T> {
        loop {
            if let Some(out) = self.try_get() {
                return out;
            }
            persona.progress_spin(Level::User);
        }
    }
}

impl<T: Clone + Default> Clone for OpFuture<T> {
    fn clone(&self) -> Self {
        Self {
            core: Rc::clone(&self.core),
        }
    }
}
