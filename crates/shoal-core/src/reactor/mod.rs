//! # Reactor
//!
//! The per-shard event loop. One reactor owns one epoll handle, one
//! wake-up eventfd, one timerfd-backed timer heap, the fd-to-handler map,
//! and the in-shard pending-task queue.
//!
//! ## Loop phases
//!
//! Each iteration:
//! 1. Drain the pending-task queue to a fixpoint (tasks may enqueue more)
//! 2. Block in `epoll_wait` (batch of up to 128 events, no timeout)
//! 3. Dispatch each ready event: wake-up and timer descriptors are handled
//!    internally; everything else goes through the handler map
//!
//! ## Edge-triggered discipline
//!
//! Registration forces `EPOLLET` onto every handler descriptor. A handler
//! must drain its descriptor until would-block or it will stall: the kernel
//! reports each readable/writable transition once. The wake-up and timer
//! descriptors are internal and registered level-triggered.

mod poller;
mod timer;

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::{Duration, Instant};

use fxhash::FxHashMap;

use crate::future::{Future, Promise};
use crate::shard::{Mailbox, RemoteTask};
use poller::Poller;
use timer::TimerQueue;

/// Event-mask bits delivered to registered handlers.
pub mod mask {
    /// Input readable.
    pub const READABLE: u32 = libc::EPOLLIN as u32;
    /// Output writable.
    pub const WRITABLE: u32 = libc::EPOLLOUT as u32;
    /// Error condition on the descriptor.
    pub const ERROR: u32 = libc::EPOLLERR as u32;
    /// Peer hang-up.
    pub const HANGUP: u32 = libc::EPOLLHUP as u32;

    pub(crate) const EDGE_TRIGGERED: u32 = libc::EPOLLET as u32;
}

/// Readiness batch size per `epoll_wait`.
const MAX_EVENTS: usize = 128;

/// In-shard deferred task.
type Task = Box<dyn FnOnce()>;

/// Handler invoked with the delivered event mask.
type EventHandler = Rc<dyn Fn(u32)>;

thread_local! {
    static CURRENT: RefCell<Weak<Reactor>> = RefCell::new(Weak::new());
}

/// Errors that can occur in the reactor. All of them are fatal to the
/// owning shard; transient I/O conditions never surface here.
#[derive(Debug, thiserror::Error)]
pub enum ReactorError {
    /// Failed to create one of the kernel resources backing the loop
    #[error("Failed to initialize reactor: {0}")]
    Init(#[source] io::Error),

    /// A reactor is already installed on this thread
    #[error("A reactor already exists on this thread")]
    AlreadyExists,

    /// Registering or re-registering a descriptor failed
    #[error("Registration failed for fd {fd}: {source}")]
    Registration {
        /// The descriptor being registered
        fd: RawFd,
        /// The underlying epoll error
        #[source]
        source: io::Error,
    },

    /// The readiness wait itself failed
    #[error("Readiness wait failed: {0}")]
    Wait(#[source] io::Error),
}

/// Wake-up channel: an eventfd whose 8-byte token any thread may write.
pub(crate) struct WakeupFd {
    fd: RawFd,
}

impl WakeupFd {
    pub(crate) fn new() -> io::Result<Self> {
        // SAFETY: plain syscall.
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { fd })
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }

    /// Reads the counter to quench the readiness bit.
    fn quench(&self) {
        let mut token: u64 = 0;
        // SAFETY: reading 8 bytes into an owned u64; would-block on a
        // spurious wake is fine to ignore.
        unsafe {
            libc::read(self.fd, (&raw mut token).cast(), 8);
        }
    }
}

impl Drop for WakeupFd {
    fn drop(&mut self) {
        // SAFETY: fd is owned here and closed exactly once.
        unsafe { libc::close(self.fd) };
    }
}

/// The per-shard event loop.
///
/// A reactor is created once per shard thread and reached through
/// [`Reactor::current`]. It is single-threaded by construction: handlers,
/// timer callbacks, and pending tasks all run inline on the owning shard.
///
/// # Example
///
/// ```rust,no_run
/// use std::time::Duration;
/// use shoal_core::Reactor;
///
/// let reactor = Reactor::new().unwrap();
/// reactor.run_after(Duration::from_millis(10), || println!("tick"));
/// reactor.run().unwrap();
/// ```
pub struct Reactor {
    poller: Poller,
    wakeup: WakeupFd,
    timer_fd: RawFd,
    timers: RefCell<TimerQueue>,
    handlers: RefCell<FxHashMap<RawFd, EventHandler>>,
    pending: RefCell<VecDeque<Task>>,
    /// Inbound rings, one per potential producer (see [`crate::shard`]).
    remote: Vec<Arc<Mailbox<RemoteTask>>>,
    stopping: Cell<bool>,
    /// Interest-modification calls issued; diagnostics.
    modify_calls: Cell<u64>,
}

impl Reactor {
    /// Creates a reactor with no cross-shard mailboxes and installs it as
    /// the calling thread's current reactor.
    ///
    /// # Errors
    ///
    /// Fails if a reactor already exists on this thread or a kernel
    /// resource cannot be created.
    pub fn new() -> Result<Rc<Self>, ReactorError> {
        let wakeup = WakeupFd::new().map_err(ReactorError::Init)?;
        Self::with_parts(wakeup, Vec::new())
    }

    /// Creates a reactor around a pre-built wake-up channel, draining the
    /// given inbound rings on wake-up. The shard runtime creates the
    /// channel up front so its descriptor can be published before the
    /// shard thread starts.
    pub(crate) fn with_parts(
        wakeup: WakeupFd,
        remote: Vec<Arc<Mailbox<RemoteTask>>>,
    ) -> Result<Rc<Self>, ReactorError> {
        if CURRENT.with(|cur| cur.borrow().upgrade().is_some()) {
            return Err(ReactorError::AlreadyExists);
        }

        let poller = Poller::new().map_err(ReactorError::Init)?;
        let timers = TimerQueue::new().map_err(ReactorError::Init)?;

        // Internal descriptors stay level-triggered; they never go through
        // the handler map.
        poller
            .add(wakeup.fd, mask::READABLE)
            .map_err(ReactorError::Init)?;
        poller
            .add(timers.fd(), mask::READABLE)
            .map_err(ReactorError::Init)?;

        let reactor = Rc::new(Self {
            poller,
            wakeup,
            timer_fd: timers.fd(),
            timers: RefCell::new(timers),
            handlers: RefCell::new(FxHashMap::default()),
            pending: RefCell::new(VecDeque::new()),
            remote,
            stopping: Cell::new(false),
            modify_calls: Cell::new(0),
        });

        CURRENT.with(|cur| *cur.borrow_mut() = Rc::downgrade(&reactor));
        Ok(reactor)
    }

    /// Returns the calling thread's reactor.
    ///
    /// # Panics
    ///
    /// Panics if no reactor is running on this thread.
    #[must_use]
    pub fn current() -> Rc<Self> {
        Self::try_current().expect("no reactor running on this thread")
    }

    /// Returns the calling thread's reactor, if one exists.
    #[must_use]
    pub fn try_current() -> Option<Rc<Self>> {
        CURRENT.with(|cur| cur.borrow().upgrade())
    }

    /// Registers `handler` for `fd` with the given interest mask.
    /// Edge-triggered mode is forced. If the descriptor is already
    /// registered the interest is modified and the handler replaced.
    ///
    /// # Errors
    ///
    /// Registration failures are fatal to the shard (§ error policy); the
    /// caller decides whether to abort or drop the resource.
    pub fn add(
        &self,
        fd: RawFd,
        interest: u32,
        handler: impl Fn(u32) + 'static,
    ) -> Result<(), ReactorError> {
        self.handlers.borrow_mut().insert(fd, Rc::new(handler));

        match self.poller.add(fd, interest | mask::EDGE_TRIGGERED) {
            Ok(()) => Ok(()),
            Err(err) if err.raw_os_error() == Some(libc::EEXIST) => self
                .poller
                .modify(fd, interest | mask::EDGE_TRIGGERED)
                .map_err(|source| ReactorError::Registration { fd, source }),
            Err(source) => Err(ReactorError::Registration { fd, source }),
        }
    }

    /// Updates the interest mask of a registered descriptor, preserving
    /// its handler and edge-triggered mode.
    ///
    /// # Errors
    ///
    /// Fails if the descriptor is not registered with the multiplexer.
    pub fn modify_events(&self, fd: RawFd, interest: u32) -> Result<(), ReactorError> {
        self.modify_calls.set(self.modify_calls.get() + 1);
        self.poller
            .modify(fd, interest | mask::EDGE_TRIGGERED)
            .map_err(|source| ReactorError::Registration { fd, source })
    }

    /// Removes a descriptor from the multiplexer and drops its handler.
    pub fn remove(&self, fd: RawFd) {
        if let Err(err) = self.poller.delete(fd) {
            tracing::debug!(fd, "epoll delete failed: {err}");
        }
        self.handlers.borrow_mut().remove(&fd);
    }

    /// Appends a task to the in-shard pending queue. Tasks run in FIFO
    /// order before the next readiness wait.
    pub fn schedule(&self, task: impl FnOnce() + 'static) {
        self.pending.borrow_mut().push_back(Box::new(task));
    }

    /// Schedules `callback` to fire at the monotonic instant `at`.
    pub fn run_at(&self, at: Instant, callback: impl FnOnce() + 'static) {
        self.timers.borrow_mut().schedule_at(at, Box::new(callback));
    }

    /// Schedules `callback` to fire after `delay`.
    pub fn run_after(&self, delay: Duration, callback: impl FnOnce() + 'static) {
        self.run_at(Instant::now() + delay, callback);
    }

    /// Returns a future that resolves after `delay`.
    pub fn sleep(&self, delay: Duration) -> Future<()> {
        let mut promise = Promise::new();
        let future = promise.get_future();
        self.run_after(delay, move || promise.set_value(()));
        future
    }

    /// Requests the loop to exit after the current iteration's pending
    /// drain. Safe to call from any task or handler on this shard.
    pub fn stop(&self) {
        self.stopping.set(true);
    }

    /// Runs the event loop until [`Reactor::stop`] is observed.
    ///
    /// # Errors
    ///
    /// Returns an error only on fatal multiplexer failures.
    pub fn run(&self) -> Result<(), ReactorError> {
        tracing::debug!("reactor loop starting");
        loop {
            self.drain_pending();
            if self.stopping.get() {
                break;
            }
            self.poll_once(-1)?;
        }
        tracing::debug!("reactor loop stopped");
        Ok(())
    }

    /// Number of queued pending tasks.
    pub(crate) fn pending_len(&self) -> usize {
        self.pending.borrow().len()
    }

    /// Number of interest-modification calls issued so far.
    pub(crate) fn modify_count(&self) -> u64 {
        self.modify_calls.get()
    }

    /// Runs pending tasks until the queue is empty. Each task may enqueue
    /// more; the drain reaches a fixpoint before returning.
    pub(crate) fn drain_pending(&self) {
        loop {
            let task = self.pending.borrow_mut().pop_front();
            match task {
                Some(task) => task(),
                None => break,
            }
        }
    }

    /// One readiness wait plus dispatch. Returns the number of events
    /// handled.
    pub(crate) fn poll_once(&self, timeout_ms: i32) -> Result<usize, ReactorError> {
        let mut events = [libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
        let n = self
            .poller
            .wait(&mut events, timeout_ms)
            .map_err(ReactorError::Wait)?;

        for event in &events[..n] {
            #[allow(clippy::cast_possible_truncation)]
            let fd = event.u64 as RawFd;
            let delivered = event.events;

            if fd == self.wakeup.fd {
                self.wakeup.quench();
                self.drain_remote();
            } else if fd == self.timer_fd {
                self.handle_timer();
            } else {
                self.dispatch(fd, delivered);
            }
        }
        Ok(n)
    }

    fn dispatch(&self, fd: RawFd, delivered: u32) {
        // Clone the handler out so dispatch holds no map borrow: the
        // handler may register, re-register, or remove descriptors.
        let handler = self.handlers.borrow().get(&fd).cloned();
        if let Some(handler) = handler {
            handler(delivered);
        }
    }

    fn handle_timer(&self) {
        // Callbacks run with the queue unborrowed so they may schedule
        // new timers; the final re-arm picks up whatever the head is then.
        let fired = self.timers.borrow_mut().collect_expired();
        for callback in fired {
            callback();
        }
        self.timers.borrow_mut().rearm();
    }

    fn drain_remote(&self) {
        for ring in &self.remote {
            while let Some(task) = ring.pop() {
                task();
            }
        }
    }
}

/// Posts a task to the current shard's pending queue. Used by promise
/// resolution to defer continuations.
///
/// # Panics
///
/// Panics if the calling thread has no reactor.
pub(crate) fn schedule_local(task: Task) {
    let reactor = Reactor::current();
    reactor.pending.borrow_mut().push_back(task);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell as StdRefCell;

    #[test]
    fn pending_queue_is_fifo() {
        let reactor = Reactor::new().unwrap();
        let log = Rc::new(StdRefCell::new(Vec::new()));

        for i in 0..3 {
            let log = Rc::clone(&log);
            reactor.schedule(move || log.borrow_mut().push(i));
        }
        reactor.drain_pending();
        assert_eq!(*log.borrow(), vec![0, 1, 2]);
    }

    #[test]
    fn drained_to_fixpoint() {
        let reactor = Reactor::new().unwrap();
        let log = Rc::new(StdRefCell::new(Vec::new()));

        {
            let log = Rc::clone(&log);
            let inner_reactor = Rc::clone(&reactor);
            reactor.schedule(move || {
                log.borrow_mut().push("a");
                let log2 = Rc::clone(&log);
                inner_reactor.schedule(move || log2.borrow_mut().push("b"));
            });
        }
        reactor.drain_pending();
        assert_eq!(*log.borrow(), vec!["a", "b"]);
    }

    #[test]
    fn second_reactor_on_thread_is_rejected() {
        let _first = Reactor::new().unwrap();
        assert!(matches!(Reactor::new(), Err(ReactorError::AlreadyExists)));
    }

    #[test]
    fn current_resolves_while_alive() {
        assert!(Reactor::try_current().is_none());
        let reactor = Reactor::new().unwrap();
        assert!(Rc::ptr_eq(&reactor, &Reactor::current()));
        drop(reactor);
        assert!(Reactor::try_current().is_none());
    }

    #[test]
    fn handler_sees_readable_mask() {
        let reactor = Reactor::new().unwrap();

        // SAFETY: plain syscall; fd checked below.
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        assert!(fd >= 0);

        let seen = Rc::new(Cell::new(0u32));
        {
            let seen = Rc::clone(&seen);
            reactor.add(fd, mask::READABLE, move |m| seen.set(m)).unwrap();
        }

        let token: u64 = 1;
        // SAFETY: writing 8 bytes from an owned u64 to our own eventfd.
        unsafe { libc::write(fd, (&raw const token).cast(), 8) };

        reactor.poll_once(100).unwrap();
        assert_ne!(seen.get() & mask::READABLE, 0);

        reactor.remove(fd);
        // SAFETY: fd created above, closed exactly once.
        unsafe { libc::close(fd) };
    }

    #[test]
    fn removed_handler_not_invoked() {
        let reactor = Reactor::new().unwrap();

        // SAFETY: plain syscall.
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        assert!(fd >= 0);

        let hits = Rc::new(Cell::new(0));
        {
            let hits = Rc::clone(&hits);
            reactor
                .add(fd, mask::READABLE, move |_| hits.set(hits.get() + 1))
                .unwrap();
        }
        reactor.remove(fd);

        let token: u64 = 1;
        // SAFETY: writing 8 bytes from an owned u64.
        unsafe { libc::write(fd, (&raw const token).cast(), 8) };
        reactor.poll_once(10).unwrap();
        assert_eq!(hits.get(), 0);

        // SAFETY: fd created above, closed exactly once.
        unsafe { libc::close(fd) };
    }

    #[test]
    fn zero_delay_timer_fires_on_next_iteration_not_inline() {
        let reactor = Reactor::new().unwrap();
        let fired = Rc::new(Cell::new(false));
        {
            let fired = Rc::clone(&fired);
            reactor.run_after(Duration::ZERO, move || fired.set(true));
        }
        // Not inside the caller.
        assert!(!fired.get());
        reactor.poll_once(100).unwrap();
        assert!(fired.get());
    }

    #[test]
    fn timer_tiers_fire_in_order_with_minimal_rearming() {
        let reactor = Reactor::new().unwrap();
        let log = Rc::new(StdRefCell::new(Vec::new()));

        for (delay_ms, tag) in [(10u64, "a"), (10, "b"), (20, "c")] {
            let log = Rc::clone(&log);
            reactor.run_after(Duration::from_millis(delay_ms), move || {
                log.borrow_mut().push(tag);
            });
        }
        // Only the first schedule changed the head.
        assert_eq!(reactor.timers.borrow().arm_count(), 1);

        while reactor.timers.borrow().pending_count() > 0 {
            reactor.poll_once(1000).unwrap();
        }

        let log = log.borrow();
        assert_eq!(log.len(), 3);
        // The two 10ms timers fire before the 20ms one.
        assert_eq!(log[2], "c");
        // One re-arm after the first tier drained; none after the heap
        // emptied.
        assert_eq!(reactor.timers.borrow().arm_count(), 2);
    }

    #[test]
    fn stop_breaks_run_loop() {
        let reactor = Reactor::new().unwrap();
        {
            let r = Rc::clone(&reactor);
            reactor.schedule(move || r.stop());
        }
        reactor.run().unwrap();
    }

    #[test]
    fn sleep_resolves_via_timer() {
        let reactor = Reactor::new().unwrap();
        let done = Rc::new(Cell::new(false));
        {
            let done = Rc::clone(&done);
            reactor
                .sleep(Duration::from_millis(5))
                .then(move |()| done.set(true));
        }
        while !done.get() {
            reactor.poll_once(1000).unwrap();
            reactor.drain_pending();
        }
    }
}
