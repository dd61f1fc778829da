use std::net::TcpListener;

use crate::error::{errf, Result};
use crate::ws::config::ServerOptions;

use super::client::Client;

/// A synchronous, accept-one-at-a-time WebSocket listener. Each accepted
/// connection completes its handshake on the calling thread before
/// `accept` returns it — callers wanting concurrency spawn a thread per
/// connection themselves, the same one-thread-per-connection model the
/// blocking client uses.
pub struct Server {
    listener: TcpListener,
    options: ServerOptions,
}

impl Server {
    pub fn bind(addr: &str, options: ServerOptions) -> Result<Server> {
        let listener =
            TcpListener::bind(addr).map_err(|e| errf!("failed to bind {addr}: {e}"))?;
        Ok(Server { listener, options })
    }

    /// Blocks until a client connects, runs the server handshake, and
    /// returns the connected [`Client`].
    pub fn accept(&self) -> Result<Client> {
        let (stream, _addr) =
            self.listener.accept().map_err(|e| errf!("accept failed: {e}"))?;
        Client::accept_from(stream, self.options.clone())
    }
}
