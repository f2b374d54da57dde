//! Monotonic timer heap driving a single timerfd.
//!
//! All scheduled callbacks live in a min-heap keyed by expiration instant.
//! The kernel timer descriptor is armed one-shot to the heap head; on
//! expiry the head run of due entries is popped and fired, then the
//! descriptor is re-armed to the new head if one remains.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Instant;

use smallvec::SmallVec;

/// Lower bound for arming the descriptor. Arming to zero would quiesce it
/// instead of firing immediately.
const MIN_ARM_NANOS: u64 = 100;

/// Callbacks popped by one expiry; sized to avoid heap allocation for the
/// common small batch.
pub(crate) type FiredCallbacks = SmallVec<[Box<dyn FnOnce()>; 8]>;

struct TimerEntry {
    expire_at: Instant,
    /// Insertion sequence; makes the heap order total. Entries with equal
    /// deadlines fire in unspecified order as far as callers may assume.
    id: u64,
    callback: Box<dyn FnOnce()>,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.expire_at == other.expire_at && self.id == other.id
    }
}

impl Eq for TimerEntry {}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed for min-heap behavior (earliest deadline first).
        other
            .expire_at
            .cmp(&self.expire_at)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// The reactor's timer subsystem: heap plus the kernel descriptor.
pub(crate) struct TimerQueue {
    heap: BinaryHeap<TimerEntry>,
    next_id: u64,
    fd: RawFd,
    /// Number of timerfd_settime calls issued; diagnostics and tests.
    arm_count: u64,
}

impl TimerQueue {
    pub(crate) fn new() -> io::Result<Self> {
        // SAFETY: plain syscall.
        let fd = unsafe {
            libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_NONBLOCK | libc::TFD_CLOEXEC)
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            heap: BinaryHeap::new(),
            next_id: 0,
            fd,
            arm_count: 0,
        })
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }

    /// Pushes a callback to fire at `expire_at`, re-arming the descriptor
    /// if the new entry became the heap head.
    pub(crate) fn schedule_at(&mut self, expire_at: Instant, callback: Box<dyn FnOnce()>) {
        let earliest_changed = self.heap.peek().is_none_or(|head| expire_at < head.expire_at);

        let id = self.next_id;
        self.next_id += 1;
        self.heap.push(TimerEntry {
            expire_at,
            id,
            callback,
        });

        if earliest_changed {
            self.arm(expire_at);
        }
    }

    /// Quenches the descriptor's readiness and pops every entry whose
    /// deadline has passed. Callbacks are returned, not invoked: the caller
    /// runs them with the queue unborrowed so they may schedule new timers.
    pub(crate) fn collect_expired(&mut self) -> FiredCallbacks {
        let mut expiries: u64 = 0;
        // SAFETY: reading 8 bytes from a timerfd into an owned u64; a
        // would-block result just means a spurious wake and is fine to
        // ignore.
        unsafe {
            libc::read(self.fd, (&raw mut expiries).cast(), 8);
        }

        let now = Instant::now();
        let mut fired = FiredCallbacks::new();
        while let Some(head) = self.heap.peek() {
            if head.expire_at > now {
                break;
            }
            // Heap is non-empty, just peeked.
            fired.push(self.heap.pop().expect("heap not empty").callback);
        }
        fired
    }

    /// Re-arms the descriptor to the current head, if any.
    pub(crate) fn rearm(&mut self) {
        if let Some(head) = self.heap.peek() {
            let expire_at = head.expire_at;
            self.arm(expire_at);
        }
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.heap.len()
    }

    #[cfg(test)]
    pub(crate) fn arm_count(&self) -> u64 {
        self.arm_count
    }

    /// Programs a one-shot expiry at `expire_at`, clamped to a 100 ns
    /// floor so the descriptor is never armed to zero.
    fn arm(&mut self, expire_at: Instant) {
        let nanos = u64::try_from(
            expire_at
                .saturating_duration_since(Instant::now())
                .as_nanos(),
        )
        .unwrap_or(u64::MAX)
        .max(MIN_ARM_NANOS);

        #[allow(clippy::cast_possible_wrap)]
        let spec = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: libc::timespec {
                tv_sec: (nanos / 1_000_000_000) as libc::time_t,
                tv_nsec: (nanos % 1_000_000_000) as libc::c_long,
            },
        };
        // SAFETY: spec is a valid itimerspec for the duration of the call.
        let rc = unsafe { libc::timerfd_settime(self.fd, 0, &raw const spec, std::ptr::null_mut()) };
        if rc != 0 {
            tracing::error!(
                "timerfd_settime failed: {}",
                io::Error::last_os_error()
            );
        }
        self.arm_count += 1;
    }
}

impl Drop for TimerQueue {
    fn drop(&mut self) {
        // SAFETY: fd is owned by this queue and closed exactly once.
        unsafe { libc::close(self.fd) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;
    use std::time::Duration;

    fn record(log: &Rc<Cell<u32>>, tag: u32) -> Box<dyn FnOnce()> {
        let log = Rc::clone(log);
        Box::new(move || log.set(log.get() * 10 + tag))
    }

    #[test]
    fn expired_entries_pop_in_deadline_order() {
        let mut q = TimerQueue::new().unwrap();
        let now = Instant::now();
        let log = Rc::new(Cell::new(0));

        q.schedule_at(now + Duration::from_millis(2), record(&log, 2));
        q.schedule_at(now, record(&log, 1));
        q.schedule_at(now + Duration::from_millis(5), record(&log, 3));
        assert_eq!(q.pending_count(), 3);

        std::thread::sleep(Duration::from_millis(10));
        let fired = q.collect_expired();
        assert_eq!(fired.len(), 3);
        for cb in fired {
            cb();
        }
        assert_eq!(log.get(), 123);
        assert_eq!(q.pending_count(), 0);
    }

    #[test]
    fn future_entries_stay_queued() {
        let mut q = TimerQueue::new().unwrap();
        let log = Rc::new(Cell::new(0));

        q.schedule_at(Instant::now() + Duration::from_secs(60), record(&log, 9));
        let fired = q.collect_expired();
        assert!(fired.is_empty());
        assert_eq!(q.pending_count(), 1);
    }

    #[test]
    fn arm_only_when_head_changes() {
        let mut q = TimerQueue::new().unwrap();
        let now = Instant::now();
        let log = Rc::new(Cell::new(0));

        q.schedule_at(now + Duration::from_millis(50), record(&log, 1));
        assert_eq!(q.arm_count(), 1);
        // Later deadline: head unchanged, no re-arm.
        q.schedule_at(now + Duration::from_millis(80), record(&log, 2));
        assert_eq!(q.arm_count(), 1);
        // Earlier deadline: head changed.
        q.schedule_at(now + Duration::from_millis(10), record(&log, 3));
        assert_eq!(q.arm_count(), 2);
    }
}
