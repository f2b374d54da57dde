//! Edge-triggered accept loop.

use std::os::unix::io::RawFd;
use std::rc::Rc;

use crate::reactor::{mask, Reactor};

use super::{NetError, Socket};

/// A listening socket registered with a shard's reactor.
///
/// Every shard may bind the same port: the listening socket is created
/// with address- and port-reuse so the kernel load-balances incoming
/// connections across shards. On readable readiness the accept loop
/// drains `accept` to would-block and hands each socket (Nagle disabled,
/// keep-alive on) to the connection callback.
///
/// # Example
///
/// ```rust,no_run
/// use shoal_core::Reactor;
/// use shoal_core::net::{Connection, Listener};
///
/// let reactor = Reactor::new().unwrap();
/// let listener = Listener::bind(&reactor, 8080, |socket| {
///     let conn = Connection::open(socket, &Reactor::current()).unwrap();
///     // drive the connection...
///     let _ = conn;
/// }).unwrap();
/// ```
pub struct Listener {
    fd: RawFd,
}

impl Listener {
    /// Binds `port` on this shard and starts accepting.
    ///
    /// # Errors
    ///
    /// Fails if the socket cannot be created, bound, listened on, or
    /// registered.
    pub fn bind<F>(reactor: &Rc<Reactor>, port: u16, on_accept: F) -> Result<Self, NetError>
    where
        F: Fn(Socket) + 'static,
    {
        let socket = Socket::create_tcp()?;
        socket.set_reuse_addr(true);
        socket.set_reuse_port(true);
        socket.bind(port).map_err(|source| NetError::Bind { port, source })?;
        socket.listen()?;

        let fd = socket.fd();
        reactor.add(fd, mask::READABLE, move |_events| {
            accept_drain(&socket, &on_accept);
        })?;

        tracing::info!(port, fd, "listener ready");
        Ok(Self { fd })
    }

    /// The listening descriptor.
    #[must_use]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Stops accepting: unregisters and closes the listening socket.
    pub fn close(&self, reactor: &Reactor) {
        reactor.remove(self.fd);
    }
}

/// Drains the backlog until would-block; edge triggering delivers one
/// notification per transition, so stopping early would strand
/// connections.
fn accept_drain<F: Fn(Socket)>(socket: &Socket, on_accept: &F) {
    loop {
        match socket.accept() {
            Ok(Some(conn)) => {
                conn.set_no_delay(true);
                conn.set_keep_alive(true);
                on_accept(conn);
            }
            Ok(None) => return,
            Err(err) => {
                tracing::error!(fd = socket.fd(), "accept failed: {err}");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::io::Write;
    use std::net::TcpStream;

    #[test]
    fn accepts_incoming_connections() {
        let reactor = Reactor::new().unwrap();

        let accepted = Rc::new(Cell::new(0));
        let listener = {
            let accepted = Rc::clone(&accepted);
            Listener::bind(&reactor, 0, move |_socket| {
                accepted.set(accepted.get() + 1);
            })
            .unwrap()
        };

        // Recover the ephemeral port the kernel picked.
        let port = local_port(listener.fd());
        let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
        client.write_all(b"hi").unwrap();

        while accepted.get() == 0 {
            reactor.poll_once(1000).unwrap();
        }
        assert_eq!(accepted.get(), 1);

        listener.close(&reactor);
    }

    fn local_port(fd: RawFd) -> u16 {
        let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        // SAFETY: addr/len are valid out-parameters for getsockname.
        let rc = unsafe { libc::getsockname(fd, (&raw mut addr).cast(), &raw mut len) };
        assert_eq!(rc, 0);
        u16::from_be(addr.sin_port)
    }
}
