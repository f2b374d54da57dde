//! # Shard runtime
//!
//! Spawns one pinned reactor thread per CPU and wires the cross-shard
//! mailboxes between them.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                        Engine                           │
//! │  ┌──────────┐  ┌──────────┐            ┌──────────┐     │
//! │  │ Shard 0  │  │ Shard 1  │    ...     │ Shard N  │     │
//! │  │ Reactor  │  │ Reactor  │            │ Reactor  │     │
//! │  └───▲──────┘  └───▲──────┘            └───▲──────┘     │
//! │      │ SPSC rings  │                       │            │
//! │      └──────┬──────┴───────────┬───────────┘            │
//! │             │                  │                        │
//! │        submit_to(shard, task) + eventfd wake-up         │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! Each shard owns one inbound ring per potential producer: one per peer
//! shard, plus a *control ring* whose producer side is serialized by a
//! mutex so threads outside the engine (bootstrap, tests) can post work.
//! Serializing producers preserves each ring's single-producer contract,
//! and cross-shard FIFO-per-producer ordering falls out of the rings
//! themselves.

mod mailbox;

pub use mailbox::{CachePadded, Mailbox};

use std::cell::RefCell;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::{Mutex, RwLock};

use crate::reactor::{Reactor, ReactorError, WakeupFd};

/// A task posted across shards.
pub(crate) type RemoteTask = Box<dyn FnOnce() + Send>;

thread_local! {
    static SHARD_CTX: RefCell<Option<ShardContext>> = const { RefCell::new(None) };
}

struct ShardContext {
    id: usize,
    registry: Arc<Vec<ShardHandle>>,
}

/// Returns the shard id of the calling thread, or `None` outside shard
/// threads.
#[must_use]
pub fn cpu_id() -> Option<usize> {
    SHARD_CTX.with(|ctx| ctx.borrow().as_ref().map(|c| c.id))
}

/// Posts `task` from the calling shard to `target`'s mailbox.
///
/// The task runs on the target shard, in FIFO order relative to other
/// tasks posted by this shard. Spins with a CPU yield while the target's
/// ring is full.
///
/// # Panics
///
/// Panics if the calling thread is not a shard thread; use
/// [`Engine::submit_to`] from outside the engine.
pub fn submit_to(target: usize, task: impl FnOnce() + Send + 'static) {
    SHARD_CTX.with(|ctx| {
        let ctx = ctx.borrow();
        let ctx = ctx.as_ref().expect("submit_to called off a shard thread");
        post(&ctx.registry, target, Some(ctx.id), Box::new(task));
    });
}

/// Errors from the shard runtime.
#[derive(Debug, thiserror::Error)]
pub enum ShardError {
    /// Failed to spawn a shard thread
    #[error("Failed to spawn shard {shard}: {source}")]
    Spawn {
        /// The shard that failed to spawn
        shard: usize,
        /// The underlying error
        #[source]
        source: io::Error,
    },

    /// Failed to create a shard's wake-up channel
    #[error("Failed to create wake-up channel for shard {shard}: {source}")]
    Wakeup {
        /// The shard the channel was for
        shard: usize,
        /// The underlying error
        #[source]
        source: io::Error,
    },

    /// A shard's reactor failed
    #[error("Reactor error on shard {shard}: {source}")]
    Reactor {
        /// The shard the reactor belongs to
        shard: usize,
        /// The underlying reactor error
        #[source]
        source: ReactorError,
    },

    /// A shard thread panicked
    #[error("Shard {shard} panicked")]
    Panicked {
        /// The shard that panicked
        shard: usize,
    },
}

/// Configuration for the engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of shards to run (default: one per available CPU)
    pub shards: usize,
    /// Capacity of each cross-shard ring (default 1024)
    pub mailbox_capacity: usize,
    /// Pin each shard thread to its CPU (default true; a failed pin is
    /// logged and the shard keeps running unpinned)
    pub pin_threads: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            shards: thread::available_parallelism().map_or(1, std::num::NonZero::get),
            mailbox_capacity: 1024,
            pin_threads: true,
        }
    }
}

/// Per-shard communication endpoints published to every producer.
struct ShardHandle {
    /// `rings[p]` is written only by producer shard `p`; the last ring is
    /// the control ring for non-shard threads.
    rings: Vec<Arc<Mailbox<RemoteTask>>>,
    /// The shard reactor's wake-up descriptor.
    wakeup_fd: RawFd,
    /// Serializes external producers on the control ring.
    control: Mutex<()>,
}

/// The process-wide shard runtime.
///
/// [`Engine::run`] spawns one thread per shard, pins it to its CPU,
/// creates the shard's [`Reactor`], runs `user_main` on every shard, and
/// joins the reactor loops. Everything a shard creates stays on that
/// shard.
///
/// # Example
///
/// ```rust,no_run
/// use shoal_core::{cpu_id, Engine, EngineConfig};
///
/// let engine = Engine::new(EngineConfig { shards: 2, ..Default::default() });
/// engine.run(|| {
///     println!("hello from shard {:?}", cpu_id());
/// }).unwrap();
/// ```
pub struct Engine {
    config: EngineConfig,
    registry: RwLock<Option<Arc<Vec<ShardHandle>>>>,
}

impl Engine {
    /// Creates an engine with the given configuration.
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            registry: RwLock::new(None),
        }
    }

    /// Number of shards this engine runs.
    #[must_use]
    pub fn shards(&self) -> usize {
        self.config.shards
    }

    /// Spawns all shards, runs `user_main` on each, then blocks in the
    /// reactor loops until [`Engine::stop`].
    ///
    /// `user_main` runs after every shard's mailboxes are published, so it
    /// may immediately post cross-shard work.
    ///
    /// # Errors
    ///
    /// Fails if a wake-up channel or thread cannot be created, or if any
    /// shard's reactor fails fatally.
    pub fn run<F>(&self, user_main: F) -> Result<(), ShardError>
    where
        F: Fn() + Clone + Send + 'static,
    {
        let shards = self.config.shards;

        let mut wakeups = Vec::with_capacity(shards);
        let mut handles = Vec::with_capacity(shards);
        for shard in 0..shards {
            let wakeup = WakeupFd::new().map_err(|source| ShardError::Wakeup { shard, source })?;
            // One ring per producer shard, plus the control ring.
            let rings = (0..=shards)
                .map(|_| Arc::new(Mailbox::new(self.config.mailbox_capacity)))
                .collect::<Vec<_>>();
            handles.push(ShardHandle {
                rings,
                wakeup_fd: wakeup.fd(),
                control: Mutex::new(()),
            });
            wakeups.push(wakeup);
        }

        let registry = Arc::new(handles);
        *self.registry.write() = Some(Arc::clone(&registry));

        let ready = Arc::new(AtomicUsize::new(0));
        let mut threads = Vec::with_capacity(shards);
        for (shard, wakeup) in wakeups.into_iter().enumerate() {
            let registry = Arc::clone(&registry);
            let ready = Arc::clone(&ready);
            let user_main = user_main.clone();
            let pin = self.config.pin_threads;

            let thread = thread::Builder::new()
                .name(format!("shoal-shard-{shard}"))
                .spawn(move || shard_main(shard, shards, pin, wakeup, &registry, &ready, &user_main))
                .map_err(|source| ShardError::Spawn { shard, source })?;
            threads.push(thread);
        }

        let mut result = Ok(());
        for (shard, thread) in threads.into_iter().enumerate() {
            match thread.join() {
                Ok(Ok(())) => {}
                Ok(Err(err)) => result = Err(err),
                Err(_) => result = Err(ShardError::Panicked { shard }),
            }
        }
        result
    }

    /// Posts `task` to `target`'s mailbox from any thread.
    ///
    /// Out-of-range targets and a not-yet-running engine are logged and
    /// ignored.
    pub fn submit_to(&self, target: usize, task: impl FnOnce() + Send + 'static) {
        let Some(registry) = self.registry.read().clone() else {
            tracing::warn!(target, "submit_to before engine start; task dropped");
            return;
        };
        if target >= registry.len() {
            tracing::warn!(target, "submit_to out of range; task dropped");
            return;
        }
        post(&registry, target, producer_id(&registry), Box::new(task));
    }

    /// Asks every shard's reactor to exit its loop; [`Engine::run`]
    /// returns once all shards have stopped.
    pub fn stop(&self) {
        let Some(registry) = self.registry.read().clone() else {
            return;
        };
        for target in 0..registry.len() {
            post(
                &registry,
                target,
                producer_id(&registry),
                Box::new(|| Reactor::current().stop()),
            );
        }
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

/// Body of one shard thread.
fn shard_main<F: Fn()>(
    shard: usize,
    shards: usize,
    pin: bool,
    wakeup: WakeupFd,
    registry: &Arc<Vec<ShardHandle>>,
    ready: &AtomicUsize,
    user_main: &F,
) -> Result<(), ShardError> {
    if pin {
        if let Err(err) = set_cpu_affinity(shard) {
            tracing::warn!(shard, "could not pin shard thread: {err}");
        }
    }

    SHARD_CTX.with(|ctx| {
        *ctx.borrow_mut() = Some(ShardContext {
            id: shard,
            registry: Arc::clone(registry),
        });
    });

    let rings = registry[shard].rings.clone();
    let reactor =
        Reactor::with_parts(wakeup, rings).map_err(|source| ShardError::Reactor { shard, source })?;

    tracing::info!(shard, "shard ready");

    // All shards observe a fully-populated registry before user code runs.
    ready.fetch_add(1, Ordering::Release);
    while ready.load(Ordering::Acquire) < shards {
        thread::yield_now();
    }

    user_main();
    let result = reactor
        .run()
        .map_err(|source| ShardError::Reactor { shard, source });
    tracing::info!(shard, "shard stopped");
    result
}

/// The calling thread's producer ring index in `registry`, if it is a
/// shard of that same engine. A shard of a different engine must go
/// through the control ring like any external thread, or it would share
/// another shard's single-producer ring.
fn producer_id(registry: &Arc<Vec<ShardHandle>>) -> Option<usize> {
    SHARD_CTX.with(|ctx| {
        ctx.borrow()
            .as_ref()
            .and_then(|c| Arc::ptr_eq(&c.registry, registry).then_some(c.id))
    })
}

/// Pushes a task onto the right ring for (`producer`, `target`) and wakes
/// the target.
fn post(
    registry: &Arc<Vec<ShardHandle>>,
    target: usize,
    producer: Option<usize>,
    task: RemoteTask,
) {
    let handle = &registry[target];
    match producer {
        Some(producer) => push_spin(&handle.rings[producer], task),
        None => {
            let _guard = handle.control.lock();
            push_spin(&handle.rings[handle.rings.len() - 1], task);
        }
    }
    notify(handle.wakeup_fd);
}

/// Spins with a CPU yield until the ring accepts the task.
fn push_spin(ring: &Mailbox<RemoteTask>, mut task: RemoteTask) {
    while let Err(back) = ring.push(task) {
        task = back;
        thread::yield_now();
    }
}

/// Writes one 8-byte token to the target's wake-up descriptor.
fn notify(wakeup_fd: RawFd) {
    let token: u64 = 1;
    // SAFETY: writing 8 bytes from an owned u64 to an eventfd; a short or
    // failed write only costs a wake-up, which the drain tolerates.
    unsafe {
        libc::write(wakeup_fd, (&raw const token).cast(), 8);
    }
}

/// Pins the calling thread to `cpu`.
fn set_cpu_affinity(cpu: usize) -> io::Result<()> {
    // SAFETY: the cpu_set_t is zero-initialized before use and pid 0 means
    // the calling thread.
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &raw const set) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn config_defaults() {
        let config = EngineConfig::default();
        assert!(config.shards >= 1);
        assert_eq!(config.mailbox_capacity, 1024);
        assert!(config.pin_threads);
    }

    #[test]
    fn cpu_id_is_none_off_shard() {
        assert_eq!(cpu_id(), None);
    }

    #[test]
    fn shards_observe_their_ids() {
        let engine = Arc::new(Engine::new(EngineConfig {
            shards: 2,
            pin_threads: false,
            ..Default::default()
        }));
        let (tx, rx) = mpsc::channel();

        let runner = {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                engine.run(move || {
                    tx.send(cpu_id().expect("on a shard")).unwrap();
                })
            })
        };

        let mut ids = vec![rx.recv_timeout(Duration::from_secs(5)).unwrap()];
        ids.push(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        ids.sort_unstable();
        assert_eq!(ids, vec![0, 1]);

        engine.stop();
        runner.join().unwrap().unwrap();
    }

    #[test]
    fn external_submit_runs_on_target_shard() {
        let engine = Arc::new(Engine::new(EngineConfig {
            shards: 2,
            pin_threads: false,
            ..Default::default()
        }));

        let runner = {
            let engine = Arc::clone(&engine);
            thread::spawn(move || engine.run(|| {}))
        };

        // Wait until the registry is published and shards run.
        let (tx, rx) = mpsc::channel();
        loop {
            let tx = tx.clone();
            engine.submit_to(1, move || {
                let _ = tx.send(cpu_id());
            });
            match rx.recv_timeout(Duration::from_millis(200)) {
                Ok(seen) => {
                    assert_eq!(seen, Some(1));
                    break;
                }
                Err(_) => thread::yield_now(),
            }
        }

        engine.stop();
        runner.join().unwrap().unwrap();
    }

    #[test]
    fn shard_to_shard_submit_preserves_producer() {
        let engine = Arc::new(Engine::new(EngineConfig {
            shards: 2,
            pin_threads: false,
            ..Default::default()
        }));
        let (tx, rx) = mpsc::channel();

        let runner = {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                let tx = tx.clone();
                engine.run(move || {
                    if cpu_id() == Some(0) {
                        let tx = tx.clone();
                        submit_to(1, move || {
                            let _ = tx.send(cpu_id());
                        });
                    }
                })
            })
        };

        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            Some(1),
            "task posted by shard 0 must run on shard 1"
        );

        engine.stop();
        runner.join().unwrap().unwrap();
    }
}
