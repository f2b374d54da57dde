//! # Shoal Core
//!
//! A per-core, shared-nothing asynchronous execution runtime for network
//! services on Linux.
//!
//! The runtime is organized as N identical single-threaded *shards*, one
//! pinned to each CPU. A shard owns exactly one [`Reactor`] (epoll event
//! loop, timer heap, wake-up channel) and all connection state created on
//! that CPU. Nothing is shared between shards except fixed-capacity
//! lock-free mailboxes used for cross-shard task injection.
//!
//! ## Design Principles
//!
//! 1. **Shared-nothing** - no locks between shards; cross-shard work goes
//!    through SPSC mailboxes plus an eventfd wake-up
//! 2. **Edge-triggered I/O** - every handler drains its descriptor to
//!    would-block; the kernel is asked once per readiness transition
//! 3. **Non-atomic refcounts on the hot path** - objects in the
//!    continuation graph live and die on a single shard
//! 4. **Bounded memory** - slab pools with chunked backing storage and
//!    fixed-capacity mailboxes
//!
//! ## Example
//!
//! ```rust,no_run
//! use shoal_core::{Engine, Reactor};
//! use shoal_core::net::{Connection, Listener};
//!
//! let engine = Engine::default();
//! engine.run(|| {
//!     let reactor = Reactor::current();
//!     let _listener = Listener::bind(&reactor, 8080, |socket| {
//!         let conn = Connection::open(socket, &Reactor::current()).unwrap();
//!         // chain reads and writes on `conn`...
//!         let _ = conn;
//!     }).unwrap();
//! }).unwrap();
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
// Unsafe is confined to the mailbox ring, the slab pool, the intrusive
// pointer, and the libc FFI surface; every block carries a SAFETY comment.
#![allow(unsafe_code)]

pub mod alloc;
pub mod future;
pub mod net;
pub mod packet;
pub mod reactor;
pub mod shard;

pub use future::{Future, Promise};
pub use packet::Packet;
pub use reactor::Reactor;
pub use shard::{cpu_id, Engine, EngineConfig};

/// Result type for shoal-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for shoal-core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Reactor-related errors
    #[error("Reactor error: {0}")]
    Reactor(#[from] reactor::ReactorError),

    /// Shard runtime errors
    #[error("Shard error: {0}")]
    Shard(#[from] shard::ShardError),

    /// Socket and listener errors
    #[error("Net error: {0}")]
    Net(#[from] net::NetError),
}
