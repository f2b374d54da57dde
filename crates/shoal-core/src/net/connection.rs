//! # Connection I/O engine
//!
//! Multiplexes one reader and one writer onto a single non-blocking
//! descriptor under edge-triggered readiness.
//!
//! A connection registers with the reactor exactly once, with readable
//! interest; the registered dispatcher never changes for the connection's
//! lifetime and interest changes go through `modify_events`. Reads drain
//! the kernel buffer into the input buffer; writes try the descriptor
//! directly and fall back to a buffered drain driven by writable
//! readiness. The common small-response case therefore costs zero epoll
//! mutations.
//!
//! ## Lifecycle
//!
//! Close is idempotent and terminal: the descriptor is unregistered, the
//! `closed` flag set, and any pending read/write resolved with the close
//! sentinels (empty packet, -1). The connection object itself lives until
//! the last [`LocalPtr`] drops; unregistering breaks the cycle through the
//! handler map and resolving the pending promises breaks the cycle through
//! the continuation graph.

use std::cell::{Cell, RefCell};
use std::io;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use crate::alloc::{make_local, LocalPtr};
use crate::future::{Future, Promise};
use crate::packet::Packet;
use crate::reactor::{mask, Reactor, ReactorError};

use super::Socket;

/// Bytes reserved per read syscall.
const READ_CHUNK: usize = 16 * 1024;

/// One TCP connection owned by one shard.
///
/// At most one read and one write may be pending at any time; a second
/// concurrent `read` is a programming error. Results arrive through
/// futures: a read resolves with the buffered bytes (empty on close), a
/// write with the byte count (-1 on error or close).
///
/// # Example
///
/// ```rust,ignore
/// let conn = Connection::open(socket, &Reactor::current())?;
/// conn.read().and_then({
///     let conn = conn.clone();
///     move |payload| conn.write(payload)
/// });
/// ```
pub struct Connection {
    socket: Socket,
    reactor: Rc<Reactor>,

    // Read state
    input: RefCell<Vec<u8>>,
    pending_read: RefCell<Option<Promise<Packet>>>,

    // Write state
    output: RefCell<Vec<u8>>,
    write_index: Cell<usize>,
    pending_write: RefCell<Option<Promise<isize>>>,
    total_write_size: Cell<isize>,

    // Lifecycle
    closed: Cell<bool>,
    /// Mirror of the currently registered interest mask; checked before
    /// every modify so interest toggles are idempotent.
    interest: Cell<u32>,
}

impl Connection {
    /// Takes ownership of `socket` and registers it with `reactor`
    /// (readable interest, edge-triggered, once for the connection's
    /// lifetime).
    ///
    /// # Errors
    ///
    /// Fails if registration with the multiplexer fails; the socket is
    /// closed on the way out.
    pub fn open(socket: Socket, reactor: &Rc<Reactor>) -> Result<LocalPtr<Self>, ReactorError> {
        let fd = socket.fd();
        let conn = make_local(Self {
            socket,
            reactor: Rc::clone(reactor),
            input: RefCell::new(Vec::with_capacity(8192)),
            pending_read: RefCell::new(None),
            output: RefCell::new(Vec::with_capacity(4096)),
            write_index: Cell::new(0),
            pending_write: RefCell::new(None),
            total_write_size: Cell::new(0),
            closed: Cell::new(false),
            interest: Cell::new(mask::READABLE),
        });

        let dispatcher = conn.clone();
        reactor.add(fd, mask::READABLE, move |events| {
            dispatcher.handle_events(events);
        })?;
        Ok(conn)
    }

    /// The underlying descriptor.
    #[must_use]
    pub fn fd(&self) -> RawFd {
        self.socket.fd()
    }

    /// True once the connection has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.get()
    }

    /// Requests the buffered input, or the next chunk the peer sends.
    ///
    /// Resolution order:
    /// 1. closed connection: immediately, with an empty packet
    /// 2. buffered bytes: immediately, with the buffer's contents
    /// 3. otherwise: by the next read-drain that yields data, or by close
    ///
    /// # Panics
    ///
    /// Panics if a read is already pending: only one concurrent read is
    /// permitted.
    pub fn read(&self) -> Future<Packet> {
        let mut promise = Promise::new();
        let future = promise.get_future();

        if self.closed.get() {
            promise.set_value(Packet::empty());
            return future;
        }

        {
            let mut input = self.input.borrow_mut();
            if !input.is_empty() {
                let packet = Packet::from_slice(&input);
                input.clear();
                drop(input);
                promise.set_value(packet);
                return future;
            }
        }

        let previous = self.pending_read.borrow_mut().replace(promise);
        assert!(previous.is_none(), "a read is already pending on this connection");
        future
    }

    /// Writes `packet`, resolving with the number of bytes written or -1
    /// on error.
    ///
    /// The fast path loops on the descriptor until everything is written
    /// or it would block; a complete write resolves synchronously with no
    /// multiplexer traffic. On would-block the unwritten tail is buffered,
    /// writable interest is enabled, and the write-drain handler finishes
    /// the transfer.
    ///
    /// # Panics
    ///
    /// Panics if a write is already pending: only one concurrent write is
    /// permitted.
    pub fn write(&self, packet: Packet) -> Future<isize> {
        let mut promise = Promise::new();
        let future = promise.get_future();

        if self.closed.get() {
            promise.set_value(-1);
            return future;
        }
        if packet.is_empty() {
            promise.set_value(0);
            return future;
        }

        assert!(
            self.pending_write.borrow().is_none(),
            "a write is already pending on this connection"
        );

        let data = packet.data();
        let total = isize::try_from(data.len()).expect("packet length fits in isize");
        let mut written = 0usize;

        while written < data.len() {
            match self.socket.write(&data[written..]) {
                Ok(0) => break,
                Ok(n) => written += n,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(_) => {
                    promise.set_value(-1);
                    return future;
                }
            }
        }

        if written == data.len() {
            promise.set_value(total);
            return future;
        }

        // Slow path: buffer the unwritten tail and wait for writability.
        self.output.borrow_mut().extend_from_slice(&data[written..]);
        self.write_index.set(0);
        self.total_write_size.set(total);
        *self.pending_write.borrow_mut() = Some(promise);
        self.enable_write();
        future
    }

    /// Closes the connection. Idempotent and terminal: unregisters the
    /// descriptor and resolves any pending read (empty packet) and pending
    /// write (-1).
    pub fn close(&self) {
        if self.closed.get() {
            return;
        }
        self.closed.set(true);

        self.reactor.remove(self.socket.fd());
        tracing::debug!(fd = self.socket.fd(), "connection closed");

        // Move each producer out before resolving: resolution may run user
        // code that touches this connection again.
        let pending_read = self.pending_read.borrow_mut().take();
        if let Some(promise) = pending_read {
            promise.set_value(Packet::empty());
        }
        let pending_write = self.pending_write.borrow_mut().take();
        if let Some(promise) = pending_write {
            promise.set_value(-1);
        }
    }

    /// The single registered dispatcher: routes the delivered event mask.
    fn handle_events(&self, events: u32) {
        // Errors and hang-ups are reported regardless of the registered
        // interest under edge triggering.
        if events & (mask::ERROR | mask::HANGUP) != 0 {
            self.close();
            return;
        }
        if events & mask::READABLE != 0 {
            self.handle_readable();
        }
        if events & mask::WRITABLE != 0 {
            self.flush_output();
        }
    }

    fn handle_readable(&self) {
        self.drain_socket();

        // The producer must be moved out before resolving: the continuation
        // may immediately issue another read that installs a new pending
        // producer, which the cleanup below would otherwise clobber.
        if self.pending_read.borrow().is_some() && !self.input.borrow().is_empty() {
            let promise = self
                .pending_read
                .borrow_mut()
                .take()
                .expect("pending read just observed");
            let packet = {
                let mut input = self.input.borrow_mut();
                let packet = Packet::from_slice(&input);
                input.clear();
                packet
            };
            promise.set_value(packet);
        }
        // With no pending read the bytes stay buffered; the next read()
        // takes them straight from the buffer.
    }

    /// Edge-triggered read loop: drain the kernel buffer until would-block.
    ///
    /// A short read (fewer bytes than requested) means the kernel side is
    /// empty, so the final would-block syscall is elided.
    fn drain_socket(&self) {
        loop {
            let result = {
                let mut input = self.input.borrow_mut();
                let old_len = input.len();
                input.resize(old_len + READ_CHUNK, 0);
                let result = self.socket.read(&mut input[old_len..]);
                let read = result.as_ref().copied().unwrap_or(0);
                input.truncate(old_len + read);
                result
            };

            match result {
                Ok(0) => {
                    // Peer closed.
                    self.close();
                    return;
                }
                Ok(n) if n < READ_CHUNK => return,
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) => {
                    tracing::debug!(fd = self.socket.fd(), "read failed: {err}");
                    self.close();
                    return;
                }
            }
        }
    }

    /// Writable-readiness handler: drain the output buffer until empty or
    /// would-block.
    fn flush_output(&self) {
        loop {
            let result = {
                let output = self.output.borrow();
                if self.write_index.get() >= output.len() {
                    break;
                }
                self.socket.write(&output[self.write_index.get()..])
            };

            match result {
                Ok(n) => self.write_index.set(self.write_index.get() + n),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    // Send buffer full again; interest stays enabled.
                    return;
                }
                Err(err) => {
                    tracing::debug!(fd = self.socket.fd(), "write failed: {err}");
                    self.disable_write();
                    let pending = self.pending_write.borrow_mut().take();
                    if let Some(promise) = pending {
                        promise.set_value(-1);
                    }
                    return;
                }
            }
        }

        // Transfer complete.
        self.output.borrow_mut().clear();
        self.write_index.set(0);
        self.disable_write();

        let pending = self.pending_write.borrow_mut().take();
        if let Some(promise) = pending {
            promise.set_value(self.total_write_size.get());
        }
    }

    /// Enables writable interest. Idempotent against the mask mirror.
    fn enable_write(&self) {
        if self.interest.get() & mask::WRITABLE == 0 {
            self.interest.set(self.interest.get() | mask::WRITABLE);
            self.apply_interest();
        }
    }

    /// Disables writable interest. Idempotent against the mask mirror.
    /// Readable interest is never cleared over the connection's lifetime.
    fn disable_write(&self) {
        if self.interest.get() & mask::WRITABLE != 0 {
            self.interest.set(self.interest.get() & !mask::WRITABLE);
            self.apply_interest();
        }
    }

    fn apply_interest(&self) {
        if let Err(err) = self
            .reactor
            .modify_events(self.socket.fd(), self.interest.get())
        {
            tracing::error!(fd = self.socket.fd(), "interest change failed: {err}");
        }
    }
}
