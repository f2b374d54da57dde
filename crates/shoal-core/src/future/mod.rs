//! # Promise / Future
//!
//! The continuation composition primitive. A [`Promise`] is the exclusive
//! producer handle and a [`Future`] the exclusive consumer handle over one
//! shared value cell. Chaining a continuation onto a future yields a new
//! future for the continuation's result, so asynchronous results compose
//! without blocking the shard.
//!
//! ## Prompt vs deferred resolution
//!
//! - If the cell is already ready when [`Future::then`] is called, the
//!   continuation runs synchronously inside `then`. Prompt paths complete
//!   without growing the pending queue.
//! - Otherwise the continuation is stored in the cell and
//!   [`Promise::set_value`] posts it to the owning shard's pending queue.
//!
//! Callers must not rely on `then` returning before side effects occur: a
//! prompt continuation runs first.
//!
//! ## Ownership
//!
//! Cells are allocated from the shard's slab pool and refcounted
//! non-atomically ([`LocalPtr`]); promises and futures are move-only and
//! must never leave their shard. `set_value` and `then` consume their
//! handle, so satisfying a promise twice or installing two continuations
//! is unrepresentable; retrieving the future twice is a runtime panic.
//!
//! The void case is `T = ()`.

use std::cell::{Cell, RefCell};

use crate::alloc::{make_local, LocalPtr};
use crate::reactor::schedule_local;

/// The shared cell backing one promise/future pair.
///
/// `ready` transitions false to true exactly once; after that the value is
/// present until the single continuation (or a prompt `then`) consumes it.
struct State<T> {
    ready: Cell<bool>,
    value: RefCell<Option<T>>,
    continuation: RefCell<Option<Box<dyn FnOnce(T)>>>,
}

impl<T> State<T> {
    fn fresh() -> Self {
        Self {
            ready: Cell::new(false),
            value: RefCell::new(None),
            continuation: RefCell::new(None),
        }
    }
}

/// Exclusive producer handle to a value cell.
///
/// # Example
///
/// ```rust,no_run
/// use shoal_core::{Promise, Reactor};
///
/// let reactor = Reactor::new().unwrap();
/// let mut promise = Promise::new();
/// let future = promise.get_future();
/// future.then(|n: i32| println!("got {n}"));
/// promise.set_value(7);
/// ```
pub struct Promise<T: 'static> {
    state: LocalPtr<State<T>>,
    future_retrieved: bool,
}

impl<T: 'static> Promise<T> {
    /// Creates a promise over a fresh cell.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: make_local(State::fresh()),
            future_retrieved: false,
        }
    }

    /// Returns the paired consumer handle.
    ///
    /// # Panics
    ///
    /// Panics if called twice on the same promise.
    pub fn get_future(&mut self) -> Future<T> {
        assert!(!self.future_retrieved, "future already retrieved");
        self.future_retrieved = true;
        Future {
            state: self.state.clone(),
        }
    }

    /// Transitions the cell to ready with `value`, consuming the promise.
    ///
    /// If a continuation is installed it is not invoked inline: a task is
    /// posted to the current shard's pending queue and runs by the next
    /// drain.
    ///
    /// # Panics
    ///
    /// Panics if a continuation is installed and the calling thread has no
    /// reactor to post it to.
    pub fn set_value(self, value: T) {
        let state = &self.state;
        *state.value.borrow_mut() = Some(value);
        state.ready.set(true);

        if state.continuation.borrow().is_some() {
            let state = state.clone();
            schedule_local(Box::new(move || {
                let continuation = state
                    .continuation
                    .borrow_mut()
                    .take()
                    .expect("continuation vanished before the posted task ran");
                let value = state
                    .value
                    .borrow_mut()
                    .take()
                    .expect("value vanished before the posted task ran");
                continuation(value);
            }));
        }
    }
}

impl<T: 'static> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive consumer handle to a value cell. Move-only; chaining consumes
/// it.
pub struct Future<T: 'static> {
    state: LocalPtr<State<T>>,
}

impl<T: 'static> Future<T> {
    /// Builds an already-satisfied future.
    #[must_use]
    pub fn ready(value: T) -> Self {
        let state = State::fresh();
        *state.value.borrow_mut() = Some(value);
        state.ready.set(true);
        Self {
            state: make_local(state),
        }
    }

    /// Chains a continuation producing a plain value. Returns the future
    /// for that value.
    ///
    /// If this future is already ready, `f` runs synchronously before
    /// `then` returns; otherwise it runs on the owning shard after
    /// resolution.
    pub fn then<U, F>(self, f: F) -> Future<U>
    where
        U: 'static,
        F: FnOnce(T) -> U + 'static,
    {
        let mut next = Promise::new();
        let future = next.get_future();
        self.chain(move |value| next.set_value(f(value)));
        future
    }

    /// Chains a continuation producing another future; the result of that
    /// inner future resolves the returned one.
    pub fn and_then<U, F>(self, f: F) -> Future<U>
    where
        U: 'static,
        F: FnOnce(T) -> Future<U> + 'static,
    {
        let mut next = Promise::new();
        let future = next.get_future();
        self.chain(move |value| {
            f(value).then(move |inner| next.set_value(inner));
        });
        future
    }

    /// Installs `task` as the cell's continuation, or runs it promptly if
    /// the cell is already ready.
    fn chain(self, task: impl FnOnce(T) + 'static) {
        if self.state.ready.get() {
            let value = self
                .state
                .value
                .borrow_mut()
                .take()
                .expect("ready cell already consumed");
            task(value);
        } else {
            let previous = self.state.continuation.borrow_mut().replace(Box::new(task));
            debug_assert!(previous.is_none(), "continuation installed twice");
        }
    }
}
