//! # Per-shard memory management
//!
//! Objects in the continuation graph (value cells, connections) are
//! allocated from chunked thread-local slab pools and kept alive by a
//! non-atomic intrusive refcount. Both pieces assume the strict
//! shared-nothing model: a pool and every pointer handed out from it belong
//! to exactly one shard.
//!
//! - [`Pool`] - free-list allocator for one object layout, backed by
//!   256-node chunks that are only returned at thread exit
//! - [`LocalPtr`] / [`make_local`] - owning handle over a pool-allocated,
//!   refcounted value

mod local_ptr;
mod pool;

pub use local_ptr::{make_local, LocalPtr};
pub use pool::{pool_for, Pool};
