//! Chunked thread-local slab pool.
//!
//! A [`Pool`] serves allocations of one fixed layout. Free slots are
//! threaded into a LIFO intrusive list; the link lives in the slot itself,
//! so a free node costs no extra memory. Backing storage is obtained from
//! the global allocator in chunks of [`CHUNK_NODES`] nodes and is never
//! returned until the pool is dropped at thread exit.
//!
//! LIFO keeps the hot path cache-friendly: the most recently freed node is
//! the most likely to still be in L1.

use std::alloc::{alloc, dealloc, handle_alloc_error, Layout};
use std::cell::{Cell, RefCell};
use std::mem;
use std::ptr::NonNull;
use std::rc::Rc;
use std::thread::{self, ThreadId};

use fxhash::FxHashMap;

/// Nodes per backing chunk.
const CHUNK_NODES: usize = 256;

/// Link stored in a free slot. In-use slots hold the object instead; the
/// two occupancies overlap in the same storage.
struct FreeNode {
    next: *mut FreeNode,
}

/// Free-list allocator for a single object layout.
///
/// Allocation and deallocation are O(1) and allocation-free apart from the
/// occasional chunk grab. Misuse from a foreign thread is a programming
/// error caught by an assertion (strict shared-nothing).
///
/// # Example
///
/// ```rust
/// use std::alloc::Layout;
/// use shoal_core::alloc::Pool;
///
/// let pool = Pool::new(Layout::new::<u64>());
/// let slot = pool.allocate();
/// // ... placement-initialize the slot ...
/// unsafe { pool.deallocate(slot) };
/// ```
pub struct Pool {
    /// Layout of one node: the object layout widened to hold a free link.
    node: Layout,
    /// Head of the LIFO free list.
    free: Cell<*mut FreeNode>,
    /// Backing chunks, released only on drop.
    chunks: RefCell<Vec<NonNull<u8>>>,
    /// Layout of one backing chunk.
    chunk_layout: Layout,
    /// Thread that created the pool; the only thread allowed to use it.
    owner: ThreadId,
}

// SAFETY: moving a Pool to another thread is harmless on its own; every
// entry point asserts the calling thread is the owner before touching any
// state, so cross-thread use panics before it can race.
unsafe impl Send for Pool {}

impl Pool {
    /// Creates a pool for objects of `layout`, owned by the calling thread.
    ///
    /// # Panics
    ///
    /// Panics if `layout` has size 0.
    #[must_use]
    pub fn new(layout: Layout) -> Self {
        assert!(layout.size() > 0, "zero-sized layouts are not pooled");

        let size = layout.size().max(mem::size_of::<FreeNode>());
        let align = layout.align().max(mem::align_of::<FreeNode>());
        let node = Layout::from_size_align(size, align)
            .expect("node layout")
            .pad_to_align();
        // node is padded to its alignment, so nodes tile at node.size().
        let chunk_layout =
            Layout::from_size_align(node.size() * CHUNK_NODES, node.align()).expect("chunk layout");

        Self {
            node,
            free: Cell::new(std::ptr::null_mut()),
            chunks: RefCell::new(Vec::new()),
            chunk_layout,
            owner: thread::current().id(),
        }
    }

    /// Returns uninitialized storage for one object.
    ///
    /// The caller is responsible for placement-initializing the slot and
    /// for eventually handing it back via [`Pool::deallocate`].
    ///
    /// # Panics
    ///
    /// Panics if called from a thread other than the owner.
    pub fn allocate(&self) -> NonNull<u8> {
        self.assert_owner();
        if self.free.get().is_null() {
            self.grow();
        }

        let node = self.free.get();
        // SAFETY: the free list only contains pointers into live chunks,
        // and a non-null head is guaranteed by the grow() above.
        unsafe {
            self.free.set((*node).next);
        }
        // SAFETY: chunk pointers are non-null by construction.
        unsafe { NonNull::new_unchecked(node.cast()) }
    }

    /// Returns a slot to the free list.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`Pool::allocate`] on this pool and
    /// the object it held must already have been dropped.
    ///
    /// # Panics
    ///
    /// Panics if called from a thread other than the owner.
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>) {
        self.assert_owner();
        let node: *mut FreeNode = ptr.as_ptr().cast();
        // SAFETY: the slot is unused per the caller contract, so we may
        // repurpose its storage as the free link.
        unsafe {
            (*node).next = self.free.get();
        }
        self.free.set(node);
    }

    /// Size in bytes of one pooled node.
    #[must_use]
    pub fn node_size(&self) -> usize {
        self.node.size()
    }

    fn assert_owner(&self) {
        assert_eq!(
            thread::current().id(),
            self.owner,
            "shared-nothing violation: pool used from a foreign thread"
        );
    }

    /// Grabs one more chunk and threads its nodes onto the free list.
    fn grow(&self) {
        // SAFETY: chunk_layout has non-zero size (node size >= link size).
        let chunk = unsafe { alloc(self.chunk_layout) };
        let Some(chunk) = NonNull::new(chunk) else {
            handle_alloc_error(self.chunk_layout);
        };
        self.chunks.borrow_mut().push(chunk);

        let stride = self.node.size();
        let mut head = self.free.get();
        // Link back to front so the list head ends up at the chunk start.
        for i in (0..CHUNK_NODES).rev() {
            // SAFETY: i * stride stays inside the chunk allocation.
            let node: *mut FreeNode = unsafe { chunk.as_ptr().add(i * stride).cast() };
            // SAFETY: the slot is fresh and unused.
            unsafe {
                (*node).next = head;
            }
            head = node;
        }
        self.free.set(head);
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        for chunk in self.chunks.borrow_mut().drain(..) {
            // SAFETY: each chunk was allocated with chunk_layout in grow().
            unsafe { dealloc(chunk.as_ptr(), self.chunk_layout) };
        }
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("node_size", &self.node.size())
            .field("chunks", &self.chunks.borrow().len())
            .finish()
    }
}

thread_local! {
    /// One pool per object layout, per thread.
    static POOLS: RefCell<FxHashMap<(usize, usize), Rc<Pool>>> =
        RefCell::new(FxHashMap::default());
}

/// Returns the calling thread's pool for `layout`, creating it on first
/// use.
///
/// # Panics
///
/// Panics if `layout` has size 0.
pub fn pool_for(layout: Layout) -> Rc<Pool> {
    POOLS.with(|pools| {
        Rc::clone(
            pools
                .borrow_mut()
                .entry((layout.size(), layout.align()))
                .or_insert_with(|| Rc::new(Pool::new(layout))),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_deallocate_roundtrip() {
        let pool = Pool::new(Layout::new::<u64>());
        let a = pool.allocate();
        let b = pool.allocate();
        assert_ne!(a, b);

        unsafe { pool.deallocate(a) };
        // LIFO: the slot just freed comes back first.
        let c = pool.allocate();
        assert_eq!(a, c);

        unsafe {
            pool.deallocate(b);
            pool.deallocate(c);
        }
    }

    #[test]
    fn node_holds_free_link_for_small_objects() {
        let pool = Pool::new(Layout::new::<u8>());
        assert!(pool.node_size() >= mem::size_of::<usize>());
    }

    #[test]
    fn grows_past_one_chunk() {
        let pool = Pool::new(Layout::new::<u64>());
        let mut slots = Vec::new();
        for _ in 0..(CHUNK_NODES * 2 + 7) {
            slots.push(pool.allocate());
        }
        // All slots are distinct.
        let mut seen: Vec<_> = slots.iter().map(|p| p.as_ptr() as usize).collect();
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), slots.len());

        for slot in slots {
            unsafe { pool.deallocate(slot) };
        }
    }

    #[test]
    fn registry_reuses_pool_per_layout() {
        let a = pool_for(Layout::new::<u64>());
        let b = pool_for(Layout::new::<u64>());
        assert!(Rc::ptr_eq(&a, &b));

        let c = pool_for(Layout::new::<[u64; 4]>());
        assert!(!Rc::ptr_eq(&a, &c));
    }

    #[test]
    #[should_panic(expected = "shared-nothing violation")]
    fn cross_thread_use_asserts() {
        let pool = Pool::new(Layout::new::<u64>());
        let err = std::thread::spawn(move || {
            let _ = pool.allocate();
        })
        .join()
        .unwrap_err();
        std::panic::resume_unwind(err);
    }

    #[test]
    #[should_panic(expected = "zero-sized layouts")]
    fn zero_sized_layout_panics() {
        let _ = Pool::new(Layout::new::<()>());
    }
}
