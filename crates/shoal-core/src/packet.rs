//! Refcounted byte-slice view.
//!
//! A [`Packet`] is a window into a shared, immutable byte buffer. Sharing
//! and slicing never copy; they bump the buffer's refcount and adjust the
//! view. Unlike everything else in the runtime the backing refcount is
//! atomic (`Arc`), because a packet is allowed to cross shard boundaries -
//! for example a response template built once and written from every shard.

use std::fmt;
use std::sync::Arc;

/// A shared view over a contiguous byte buffer.
///
/// # Example
///
/// ```rust
/// use shoal_core::Packet;
///
/// let p = Packet::from_slice(b"hello world");
/// let hello = p.slice(0, 5);
/// assert_eq!(hello.data(), b"hello");
/// assert_eq!(p.use_count(), 2);
/// ```
#[derive(Clone, Default)]
pub struct Packet {
    buf: Option<Arc<[u8]>>,
    offset: usize,
    len: usize,
}

impl Packet {
    /// The empty packet. Reads on a closed connection resolve with this.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            buf: None,
            offset: 0,
            len: 0,
        }
    }

    /// Builds a packet owning a copy of `bytes`.
    #[must_use]
    pub fn from_slice(bytes: &[u8]) -> Self {
        if bytes.is_empty() {
            return Self::empty();
        }
        Self {
            len: bytes.len(),
            offset: 0,
            buf: Some(Arc::from(bytes)),
        }
    }

    /// Builds a packet taking ownership of `bytes` without copying.
    #[must_use]
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        if bytes.is_empty() {
            return Self::empty();
        }
        Self {
            len: bytes.len(),
            offset: 0,
            buf: Some(Arc::from(bytes)),
        }
    }

    /// Returns a new view over the same storage; refcount +1, zero copy.
    #[must_use]
    pub fn share(&self) -> Self {
        self.clone()
    }

    /// Returns a view of `length` bytes starting at `start`.
    ///
    /// A `start` past the end yields the empty packet; a `length` past the
    /// end is truncated.
    #[must_use]
    pub fn slice(&self, start: usize, length: usize) -> Self {
        if start >= self.len {
            return Self::empty();
        }
        let length = length.min(self.len - start);
        Self {
            buf: self.buf.clone(),
            offset: self.offset + start,
            len: length,
        }
    }

    /// Drops the first `n` bytes of the view.
    #[must_use]
    pub fn drop_front(&self, n: usize) -> Self {
        self.slice(n, self.len.saturating_sub(n))
    }

    /// The bytes visible through this view.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        match &self.buf {
            Some(buf) => &buf[self.offset..self.offset + self.len],
            None => &[],
        }
    }

    /// Length of the view in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if the view is empty (also the close sentinel for reads).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of views sharing the backing buffer. Diagnostics only.
    #[must_use]
    pub fn use_count(&self) -> usize {
        self.buf.as_ref().map_or(0, Arc::strong_count)
    }

    /// The view rendered as a string, invalid UTF-8 replaced.
    #[must_use]
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(self.data()).into_owned()
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .field("shared", &self.use_count())
            .finish()
    }
}

impl From<&str> for Packet {
    fn from(s: &str) -> Self {
        Self::from_slice(s.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_packet() {
        let p = Packet::empty();
        assert!(p.is_empty());
        assert_eq!(p.len(), 0);
        assert_eq!(p.data(), b"");
        assert_eq!(p.use_count(), 0);
    }

    #[test]
    fn share_is_zero_copy() {
        let p = Packet::from_slice(b"abcdef");
        assert_eq!(p.use_count(), 1);

        let q = p.share();
        assert_eq!(p.use_count(), 2);
        assert_eq!(q.data(), b"abcdef");
        // Same backing storage.
        assert_eq!(p.data().as_ptr(), q.data().as_ptr());

        drop(q);
        assert_eq!(p.use_count(), 1);
        assert_eq!(p.data(), b"abcdef");
    }

    #[test]
    fn slice_views_the_middle() {
        let p = Packet::from_slice(b"hello world");
        let s = p.slice(6, 5);
        assert_eq!(s.data(), b"world");
        // data(slice) == data(orig) + start
        assert_eq!(s.data().as_ptr() as usize, p.data().as_ptr() as usize + 6);
    }

    #[test]
    fn slice_out_of_range() {
        let p = Packet::from_slice(b"abc");
        assert!(p.slice(3, 1).is_empty());
        assert!(p.slice(10, 1).is_empty());
        // Over-long slices are truncated.
        assert_eq!(p.slice(1, 100).data(), b"bc");
    }

    #[test]
    fn nested_slices_compose_offsets() {
        let p = Packet::from_slice(b"0123456789");
        let mid = p.slice(2, 6); // "234567"
        let inner = mid.slice(1, 3); // "345"
        assert_eq!(inner.data(), b"345");
    }

    #[test]
    fn drop_front() {
        let p = Packet::from_slice(b"ping: pong");
        assert_eq!(p.drop_front(6).data(), b"pong");
        assert!(p.drop_front(100).is_empty());
    }

    #[test]
    fn from_vec_takes_ownership() {
        let p = Packet::from_vec(vec![1, 2, 3]);
        assert_eq!(p.data(), &[1, 2, 3]);
    }

    #[test]
    fn to_string_lossy() {
        let p = Packet::from("ping");
        assert_eq!(p.to_string_lossy(), "ping");
    }

    #[test]
    fn packet_crosses_threads() {
        let p = Packet::from_slice(b"shared across shards");
        let q = p.share();
        let handle = std::thread::spawn(move || q.data().to_vec());
        assert_eq!(handle.join().unwrap(), p.data());
    }
}
