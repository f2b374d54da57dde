//! # Cross-shard mailbox
//!
//! Lock-free single-producer single-consumer bounded ring used to inject
//! tasks into a remote shard.
//!
//! ## Design
//!
//! - Cache-line padded producer/consumer ends prevent false sharing
//! - Power-of-2 capacity for fast modulo via bitmask
//! - Acquire/Release ordering on the published indices
//! - Each end keeps a cached snapshot of the opposite index, so the hot
//!   path touches the remote cache line only when the snapshot says the
//!   ring might be full (producer) or empty (consumer)

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

/// A wrapper that pads a value to a cache line boundary to prevent false
/// sharing.
///
/// False sharing occurs when two threads access different data that happens
/// to reside on the same cache line, causing unnecessary cache
/// invalidations between the producing and consuming shard.
#[repr(C, align(64))]
#[derive(Debug, Default)]
pub struct CachePadded<T> {
    value: T,
}

impl<T> CachePadded<T> {
    /// Creates a new cache-padded value.
    #[must_use]
    pub const fn new(value: T) -> Self {
        Self { value }
    }
}

impl<T> std::ops::Deref for CachePadded<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.value
    }
}

impl<T> std::ops::DerefMut for CachePadded<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.value
    }
}

/// One end of the ring: the index this end publishes, plus a cached
/// snapshot of the opposite end's index.
///
/// The snapshot is only ever read and written by the side that owns this
/// end, so it needs no synchronization of its own.
#[derive(Debug, Default)]
struct RingEnd {
    index: AtomicUsize,
    cached_opposite: UnsafeCell<usize>,
}

/// A lock-free single-producer single-consumer bounded queue.
///
/// One slot is sacrificed to distinguish full from empty, so a mailbox of
/// capacity `N` holds at most `N - 1` items.
///
/// # Safety
///
/// The queue is only safe with exactly one producer thread and one consumer
/// thread. The shard runtime enforces this by handing each remote shard its
/// own ring (see [`crate::shard`]).
///
/// # Example
///
/// ```rust
/// use shoal_core::shard::Mailbox;
///
/// let ring: Mailbox<i32> = Mailbox::new(1024);
/// assert!(ring.push(42).is_ok());
/// assert_eq!(ring.pop(), Some(42));
/// ```
pub struct Mailbox<T> {
    /// Ring buffer storage
    buffer: Box<[UnsafeCell<MaybeUninit<T>>]>,
    /// Capacity mask for fast modulo (capacity - 1)
    mask: usize,
    /// Producer end: tail index, cached head snapshot
    tail: CachePadded<RingEnd>,
    /// Consumer end: head index, cached tail snapshot
    head: CachePadded<RingEnd>,
}

// SAFETY: the ring can be shared between exactly one producer and one
// consumer thread as long as T is Send. Slot handoff is synchronized by the
// Release store / Acquire load on the published indices; the cached
// snapshots are private to their owning side.
unsafe impl<T: Send> Send for Mailbox<T> {}
// SAFETY: see Send impl above.
unsafe impl<T: Send> Sync for Mailbox<T> {}

impl<T> Mailbox<T> {
    /// Creates a new mailbox with the given capacity, rounded up to the
    /// next power of 2.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "capacity must be > 0");
        let capacity = capacity.next_power_of_two();

        let buffer: Vec<UnsafeCell<MaybeUninit<T>>> =
            (0..capacity).map(|_| UnsafeCell::new(MaybeUninit::uninit())).collect();

        Self {
            buffer: buffer.into_boxed_slice(),
            mask: capacity - 1,
            tail: CachePadded::new(RingEnd::default()),
            head: CachePadded::new(RingEnd::default()),
        }
    }

    /// Returns the capacity of the ring.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Returns true if the ring is empty.
    ///
    /// This is a snapshot and may change immediately after returning.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.head.index.load(Ordering::Acquire) == self.tail.index.load(Ordering::Acquire)
    }

    /// Returns the current number of items in the ring.
    ///
    /// This is a snapshot and may change immediately after returning.
    #[must_use]
    pub fn len(&self) -> usize {
        let head = self.head.index.load(Ordering::Acquire);
        let tail = self.tail.index.load(Ordering::Acquire);
        tail.wrapping_sub(head) & self.mask
    }

    /// Push an item onto the ring.
    ///
    /// # Errors
    ///
    /// Returns the item back if the ring is full.
    ///
    /// Must only be called by the single producer thread.
    pub fn push(&self, item: T) -> Result<(), T> {
        let tail = self.tail.index.load(Ordering::Relaxed);
        let next_tail = (tail + 1) & self.mask;

        // SAFETY: the cached head snapshot belongs to the producer side and
        // we are the single producer.
        let cached_head = unsafe { &mut *self.tail.cached_opposite.get() };
        if next_tail == *cached_head {
            *cached_head = self.head.index.load(Ordering::Acquire);
            if next_tail == *cached_head {
                return Err(item);
            }
        }

        // SAFETY: we have exclusive write access to this slot: we are the
        // only producer, the consumer only reads published slots, and the
        // slot is not published until the tail store below.
        unsafe {
            (*self.buffer[tail].get()).write(item);
        }

        self.tail.index.store(next_tail, Ordering::Release);
        Ok(())
    }

    /// Pop an item from the ring, or `None` if it is empty.
    ///
    /// Must only be called by the single consumer thread.
    pub fn pop(&self) -> Option<T> {
        let head = self.head.index.load(Ordering::Relaxed);

        // SAFETY: the cached tail snapshot belongs to the consumer side and
        // we are the single consumer.
        let cached_tail = unsafe { &mut *self.head.cached_opposite.get() };
        if head == *cached_tail {
            *cached_tail = self.tail.index.load(Ordering::Acquire);
            if head == *cached_tail {
                return None;
            }
        }

        // SAFETY: we have exclusive read access to this slot: we are the
        // only consumer and the slot was published by the producer's
        // Release store on the tail index.
        let item = unsafe { (*self.buffer[head].get()).assume_init_read() };

        self.head.index.store((head + 1) & self.mask, Ordering::Release);
        Some(item)
    }
}

impl<T> Drop for Mailbox<T> {
    fn drop(&mut self) {
        // Drop any remaining items in the ring
        while self.pop().is_some() {}
    }
}

impl<T> std::fmt::Debug for Mailbox<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mailbox")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn cache_padded_alignment() {
        assert_eq!(std::mem::align_of::<CachePadded<AtomicUsize>>(), 64);
        assert_eq!(std::mem::align_of::<CachePadded<u8>>(), 64);
    }

    #[test]
    fn new_ring_rounds_capacity() {
        let ring: Mailbox<i32> = Mailbox::new(100);
        assert_eq!(ring.capacity(), 128);
        assert!(ring.is_empty());
        assert_eq!(ring.len(), 0);
    }

    #[test]
    #[should_panic(expected = "capacity must be > 0")]
    fn zero_capacity_panics() {
        let _: Mailbox<i32> = Mailbox::new(0);
    }

    #[test]
    fn push_pop_full_empty() {
        let ring: Mailbox<i32> = Mailbox::new(4);

        assert!(ring.push(1).is_ok());
        assert!(ring.push(2).is_ok());
        assert!(ring.push(3).is_ok());
        // One slot is reserved to distinguish full from empty.
        assert_eq!(ring.push(4), Err(4));

        assert_eq!(ring.pop(), Some(1));
        assert_eq!(ring.pop(), Some(2));
        assert_eq!(ring.pop(), Some(3));
        assert_eq!(ring.pop(), None);
        assert!(ring.is_empty());
    }

    #[test]
    fn fifo_order() {
        let ring: Mailbox<i32> = Mailbox::new(16);
        for i in 0..10 {
            assert!(ring.push(i).is_ok());
        }
        for i in 0..10 {
            assert_eq!(ring.pop(), Some(i));
        }
    }

    #[test]
    fn wrap_around() {
        let ring: Mailbox<i32> = Mailbox::new(4);
        for round in 0..5 {
            for i in 0..3 {
                assert!(ring.push(round * 10 + i).is_ok());
            }
            for i in 0..3 {
                assert_eq!(ring.pop(), Some(round * 10 + i));
            }
        }
    }

    #[test]
    fn concurrent_producer_consumer() {
        const ITEMS: i32 = 10_000;
        let ring = Arc::new(Mailbox::<i32>::new(1024));
        let producer_ring = Arc::clone(&ring);
        let consumer_ring = Arc::clone(&ring);

        let producer = thread::spawn(move || {
            for i in 0..ITEMS {
                let mut item = i;
                while let Err(back) = producer_ring.push(item) {
                    item = back;
                    thread::yield_now();
                }
            }
        });

        let consumer = thread::spawn(move || {
            let mut received = Vec::with_capacity(ITEMS as usize);
            while received.len() < ITEMS as usize {
                if let Some(item) = consumer_ring.pop() {
                    received.push(item);
                } else {
                    thread::yield_now();
                }
            }
            received
        });

        producer.join().unwrap();
        let received = consumer.join().unwrap();

        assert_eq!(received.len(), ITEMS as usize);
        for (i, &item) in received.iter().enumerate() {
            assert_eq!(item, i32::try_from(i).unwrap(), "item out of order at {i}");
        }
    }

    #[derive(Debug)]
    struct DropCounter(Arc<AtomicUsize>);

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn drop_releases_queued_items() {
        let drops = Arc::new(AtomicUsize::new(0));
        {
            let ring: Mailbox<DropCounter> = Mailbox::new(8);
            for _ in 0..5 {
                ring.push(DropCounter(Arc::clone(&drops))).unwrap();
            }
            ring.pop();
            ring.pop();
            // Ring drops with 3 items still queued.
        }
        assert_eq!(drops.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn debug_format() {
        let ring: Mailbox<i32> = Mailbox::new(8);
        ring.push(1).unwrap();
        let s = format!("{ring:?}");
        assert!(s.contains("Mailbox"));
        assert!(s.contains("capacity"));
    }
}
