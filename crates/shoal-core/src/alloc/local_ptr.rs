//! Intrusive non-atomic refcount and its owning handle.
//!
//! The continuation graph (value cells, connections, listener state) forms
//! a DAG that may be cyclic through captured handles; the refcount keeps
//! each node alive until the last handle drops. All manipulations for a
//! given object happen on one shard, so the count is a plain `Cell<u32>`
//! and pays no atomic-op cost.

use std::alloc::Layout;
use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;
use std::ptr::{self, NonNull};
use std::rc::Rc;

use super::pool::{pool_for, Pool};

/// Pool-allocated header: refcount, owning pool, then the value.
struct RcBox<T> {
    refs: Cell<u32>,
    pool: Rc<Pool>,
    value: T,
}

/// Owning handle over a pool-allocated, refcounted value.
///
/// Clone increments the embedded count; drop decrements it and, on zero,
/// destroys the value and returns its slot to the shard's slab pool.
/// The handle is `!Send` and `!Sync`: the count is non-atomic by design
/// and the backing pool is thread-local.
///
/// # Example
///
/// ```rust
/// use shoal_core::alloc::{make_local, LocalPtr};
///
/// let a: LocalPtr<String> = make_local(String::from("hi"));
/// let b = a.clone();
/// assert_eq!(a.use_count(), 2);
/// assert_eq!(&*b, "hi");
/// ```
pub struct LocalPtr<T> {
    ptr: NonNull<RcBox<T>>,
    /// Keeps the handle !Send and !Sync.
    _not_send: PhantomData<*const ()>,
}

/// Allocates `value` from the calling shard's slab pool and returns the
/// first handle to it.
pub fn make_local<T>(value: T) -> LocalPtr<T> {
    let pool = pool_for(Layout::new::<RcBox<T>>());
    let slot = pool.allocate().cast::<RcBox<T>>();
    // SAFETY: the slot is uninitialized storage of RcBox<T>'s layout,
    // exclusively ours until published through the returned handle.
    unsafe {
        slot.as_ptr().write(RcBox {
            refs: Cell::new(1),
            pool,
            value,
        });
    }
    LocalPtr {
        ptr: slot,
        _not_send: PhantomData,
    }
}

impl<T> LocalPtr<T> {
    fn inner(&self) -> &RcBox<T> {
        // SAFETY: the box is alive as long as any handle exists, and this
        // handle holds one reference.
        unsafe { self.ptr.as_ref() }
    }

    /// Current reference count. Only meaningful for diagnostics.
    #[must_use]
    pub fn use_count(&self) -> u32 {
        self.inner().refs.get()
    }

    /// Returns true if both handles point at the same object.
    #[must_use]
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        a.ptr == b.ptr
    }
}

impl<T> Clone for LocalPtr<T> {
    fn clone(&self) -> Self {
        let refs = &self.inner().refs;
        refs.set(refs.get() + 1);
        Self {
            ptr: self.ptr,
            _not_send: PhantomData,
        }
    }
}

impl<T> Drop for LocalPtr<T> {
    fn drop(&mut self) {
        let refs = &self.inner().refs;
        refs.set(refs.get() - 1);
        if refs.get() != 0 {
            return;
        }

        // Keep the pool alive past the in-place drop of the box, which
        // drops the box's own pool handle.
        let pool = Rc::clone(&self.inner().pool);
        // SAFETY: count hit zero, so this is the last handle; nothing can
        // observe the box after this point.
        unsafe {
            ptr::drop_in_place(self.ptr.as_ptr());
            pool.deallocate(self.ptr.cast());
        }
    }
}

impl<T> Deref for LocalPtr<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner().value
    }
}

impl<T: fmt::Debug> fmt::Debug for LocalPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalPtr")
            .field("refs", &self.use_count())
            .field("value", &self.inner().value)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_and_drop_track_count() {
        let a = make_local(7u64);
        assert_eq!(a.use_count(), 1);

        let b = a.clone();
        assert_eq!(a.use_count(), 2);
        assert!(LocalPtr::ptr_eq(&a, &b));

        drop(b);
        assert_eq!(a.use_count(), 1);
        assert_eq!(*a, 7);
    }

    #[test]
    fn value_dropped_on_last_release() {
        struct Flagged(Rc<Cell<bool>>);
        impl Drop for Flagged {
            fn drop(&mut self) {
                self.0.set(true);
            }
        }

        let dropped = Rc::new(Cell::new(false));
        let a = make_local(Flagged(Rc::clone(&dropped)));
        let b = a.clone();
        drop(a);
        assert!(!dropped.get());
        drop(b);
        assert!(dropped.get());
    }

    #[test]
    fn slot_is_reused_after_release() {
        let first = make_local(1u128);
        let addr = first.ptr.as_ptr() as usize;
        drop(first);

        // LIFO free list hands the same slot straight back.
        let second = make_local(2u128);
        assert_eq!(second.ptr.as_ptr() as usize, addr);
    }

    #[test]
    fn interior_mutability_through_shared_handles() {
        let a = make_local(Cell::new(0i32));
        let b = a.clone();
        a.set(41);
        b.set(b.get() + 1);
        assert_eq!(a.get(), 42);
    }
}
