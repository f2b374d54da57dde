//! # Networking
//!
//! Non-blocking TCP plumbing for the reactor: a thin RAII socket wrapper,
//! an edge-triggered accept loop ([`Listener`]), and the per-connection
//! I/O state machine ([`Connection`]).

mod connection;
mod listener;

pub use connection::Connection;
pub use listener::Listener;

use std::io;
use std::net::Ipv4Addr;
use std::os::unix::io::RawFd;

use crate::reactor::ReactorError;

/// Errors from sockets and listeners.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// A socket syscall failed
    #[error("Socket operation failed: {0}")]
    Socket(#[from] io::Error),

    /// Binding the listening socket failed
    #[error("Bind to port {port} failed: {source}")]
    Bind {
        /// The requested port
        port: u16,
        /// The underlying error
        #[source]
        source: io::Error,
    },

    /// Registering a descriptor with the reactor failed
    #[error("Registration failed: {0}")]
    Registration(#[from] ReactorError),
}

/// An owned non-blocking TCP socket descriptor.
///
/// Every socket is created (or accepted) with `SOCK_NONBLOCK` and
/// `SOCK_CLOEXEC`; the descriptor is closed on drop.
#[derive(Debug)]
pub struct Socket {
    fd: RawFd,
}

impl Socket {
    /// Creates a non-blocking TCP socket.
    ///
    /// # Errors
    ///
    /// Fails if the socket cannot be created.
    pub fn create_tcp() -> io::Result<Self> {
        // SAFETY: plain syscall.
        let fd = unsafe {
            libc::socket(
                libc::AF_INET,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { fd })
    }

    /// Wraps an already-open descriptor (accepted connection, socketpair).
    pub(crate) fn from_fd(fd: RawFd) -> Self {
        Self { fd }
    }

    /// The raw descriptor.
    #[must_use]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Binds to `INADDR_ANY:port`.
    ///
    /// # Errors
    ///
    /// Fails if the address is in use and reuse options are off.
    pub fn bind(&self, port: u16) -> io::Result<()> {
        let addr = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: port.to_be(),
            sin_addr: libc::in_addr { s_addr: 0 },
            sin_zero: [0; 8],
        };
        // SAFETY: addr is a valid sockaddr_in for the duration of the call.
        let rc = unsafe {
            libc::bind(
                self.fd,
                (&raw const addr).cast(),
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Starts listening with the system backlog.
    ///
    /// # Errors
    ///
    /// Fails if the socket is not bound.
    pub fn listen(&self) -> io::Result<()> {
        // SAFETY: plain syscall.
        let rc = unsafe { libc::listen(self.fd, libc::SOMAXCONN) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Accepts one pending connection.
    ///
    /// Returns `Ok(None)` on would-block or a transient condition (EINTR,
    /// and EMFILE after shedding the blocked connection).
    ///
    /// # Errors
    ///
    /// Fails on non-transient accept errors.
    pub fn accept(&self) -> io::Result<Option<Self>> {
        // SAFETY: plain syscall; we pass null for the peer address.
        let fd = unsafe {
            libc::accept4(
                self.fd,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            )
        };
        if fd >= 0 {
            return Ok(Some(Self { fd }));
        }

        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EAGAIN | libc::EINTR) => Ok(None),
            Some(libc::EMFILE) => {
                // Out of descriptors: accept-and-close so the pending
                // connection does not sit in the backlog retriggering us.
                tracing::warn!("accept: descriptor limit reached, shedding connection");
                // SAFETY: plain syscalls; a negative fd makes close a no-op
                // errno-wise.
                unsafe {
                    let shed = libc::accept4(self.fd, std::ptr::null_mut(), std::ptr::null_mut(), 0);
                    if shed >= 0 {
                        libc::close(shed);
                    }
                }
                Ok(None)
            }
            _ => Err(err),
        }
    }

    /// Starts a non-blocking connect.
    ///
    /// Returns `true` if the connection completed immediately and `false`
    /// if it is in progress (wait for writability).
    ///
    /// # Errors
    ///
    /// Fails on immediate connection errors.
    pub fn connect(&self, ip: Ipv4Addr, port: u16) -> io::Result<bool> {
        let addr = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: port.to_be(),
            sin_addr: libc::in_addr {
                s_addr: u32::from(ip).to_be(),
            },
            sin_zero: [0; 8],
        };
        // SAFETY: addr is a valid sockaddr_in for the duration of the call.
        let rc = unsafe {
            libc::connect(
                self.fd,
                (&raw const addr).cast(),
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if rc == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINPROGRESS) {
            return Ok(false);
        }
        Err(err)
    }

    /// Reads into `buf`, surfacing would-block as `ErrorKind::WouldBlock`.
    ///
    /// # Errors
    ///
    /// Any read error, including would-block.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        // SAFETY: buf is valid for writes of buf.len() bytes.
        let n = unsafe { libc::read(self.fd, buf.as_mut_ptr().cast(), buf.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        #[allow(clippy::cast_sign_loss)]
        Ok(n as usize)
    }

    /// Writes from `buf`, surfacing would-block as `ErrorKind::WouldBlock`.
    ///
    /// # Errors
    ///
    /// Any write error, including would-block.
    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        // SAFETY: buf is valid for reads of buf.len() bytes.
        let n = unsafe { libc::write(self.fd, buf.as_ptr().cast(), buf.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        #[allow(clippy::cast_sign_loss)]
        Ok(n as usize)
    }

    /// Toggles `TCP_NODELAY` (Nagle off when `true`).
    pub fn set_no_delay(&self, on: bool) {
        self.set_opt(libc::IPPROTO_TCP, libc::TCP_NODELAY, on);
    }

    /// Toggles `SO_REUSEADDR`.
    pub fn set_reuse_addr(&self, on: bool) {
        self.set_opt(libc::SOL_SOCKET, libc::SO_REUSEADDR, on);
    }

    /// Toggles `SO_REUSEPORT`, letting every shard bind the same port and
    /// the kernel load-balance accepted connections.
    pub fn set_reuse_port(&self, on: bool) {
        self.set_opt(libc::SOL_SOCKET, libc::SO_REUSEPORT, on);
    }

    /// Toggles `SO_KEEPALIVE`.
    pub fn set_keep_alive(&self, on: bool) {
        self.set_opt(libc::SOL_SOCKET, libc::SO_KEEPALIVE, on);
    }

    fn set_opt(&self, level: i32, name: i32, on: bool) {
        let opt: libc::c_int = i32::from(on);
        // SAFETY: opt is a valid int for the duration of the call.
        unsafe {
            libc::setsockopt(
                self.fd,
                level,
                name,
                (&raw const opt).cast(),
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        // SAFETY: fd is owned by this wrapper and closed exactly once.
        unsafe { libc::close(self.fd) };
    }
}

#[cfg(test)]
pub(crate) fn socketpair() -> (Socket, Socket) {
    let mut fds = [0; 2];
    // SAFETY: fds is a valid out-array of two ints.
    let rc = unsafe {
        libc::socketpair(
            libc::AF_UNIX,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
            fds.as_mut_ptr(),
        )
    };
    assert_eq!(rc, 0, "socketpair failed");
    (Socket::from_fd(fds[0]), Socket::from_fd(fds[1]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_bind_listen_ephemeral() {
        let socket = Socket::create_tcp().unwrap();
        socket.set_reuse_addr(true);
        socket.bind(0).unwrap();
        socket.listen().unwrap();
        assert!(socket.fd() >= 0);
    }

    #[test]
    fn accept_on_idle_listener_would_block() {
        let socket = Socket::create_tcp().unwrap();
        socket.set_reuse_addr(true);
        socket.bind(0).unwrap();
        socket.listen().unwrap();
        assert!(socket.accept().unwrap().is_none());
    }

    #[test]
    fn socketpair_roundtrip() {
        let (a, b) = socketpair();
        assert_eq!(a.write(b"ping").unwrap(), 4);

        let mut buf = [0u8; 16];
        assert_eq!(b.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"ping");
    }

    #[test]
    fn read_on_drained_pair_would_blocks() {
        let (a, _b) = socketpair();
        let mut buf = [0u8; 8];
        let err = a.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn read_zero_after_peer_drop() {
        let (a, b) = socketpair();
        drop(b);
        let mut buf = [0u8; 8];
        assert_eq!(a.read(&mut buf).unwrap(), 0);
    }
}
