//! Multi-shard TCP echo server.
//!
//! Every shard binds the same port with port reuse, so the kernel spreads
//! incoming connections across all cores. Each connection then lives and
//! dies on the shard that accepted it.
//!
//! ```text
//! $ shoal-echo [port]        # default 8080
//! $ printf ping | nc localhost 8080
//! ```

use tracing_subscriber::EnvFilter;

use shoal_core::alloc::LocalPtr;
use shoal_core::net::{Connection, Listener};
use shoal_core::{cpu_id, Engine, Reactor};

/// Keep-alive echo loop: read a chunk, write it back, go again. The chain
/// ends when a read resolves empty (peer closed) or a write fails.
fn echo(conn: LocalPtr<Connection>) {
    let writer = conn.clone();
    conn.read().then(move |payload| {
        if payload.is_empty() {
            return;
        }
        let again = writer.clone();
        writer.write(payload).then(move |n| {
            if n >= 0 {
                echo(again);
            }
        });
    });
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let port: u16 = std::env::args()
        .nth(1)
        .and_then(|arg| arg.parse().ok())
        .unwrap_or(8080);

    let engine = Engine::default();
    tracing::info!(port, shards = engine.shards(), "echo server starting");

    let result = engine.run(move || {
        let reactor = Reactor::current();
        let listener = Listener::bind(&reactor, port, |socket| {
            match Connection::open(socket, &Reactor::current()) {
                Ok(conn) => echo(conn),
                Err(err) => tracing::error!("connection registration failed: {err}"),
            }
        });
        match listener {
            Ok(_listener) => tracing::info!(shard = ?cpu_id(), "shard listening"),
            Err(err) => {
                tracing::error!(shard = ?cpu_id(), "listen failed: {err}");
            }
        }
    });

    if let Err(err) = result {
        tracing::error!("engine stopped with error: {err}");
        std::process::exit(1);
    }
}
