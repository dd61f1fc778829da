//! The server-side builder: binds a listening socket and spins up a
//! server-role [`engine::Connection`] for every accepted stream.

use std::sync::{Arc, Mutex, Weak};

use mio::net::TcpStream;

use crate::error::{errf, Result};
use crate::reactor::{Event, EventLoopHandle, EventSocket, EventThread};

use super::client::ClientHandle;
use super::config::ServerOptions;
use super::engine::Connection;

type OnConnection = Box<dyn FnMut(ClientHandle) + Send>;

/// Builds a listening server: set options and an `on_connection` callback,
/// then `listen`.
pub struct ServerBuilder {
    options: ServerOptions,
    on_connection: Option<OnConnection>,
}

impl ServerBuilder {
    pub fn new() -> Self {
        ServerBuilder { options: ServerOptions::default(), on_connection: None }
    }

    pub fn options(mut self, options: ServerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn on_connection(mut self, cb: impl FnMut(ClientHandle) + Send + 'static) -> Self {
        self.on_connection = Some(Box::new(cb));
        self
    }

    /// Binds `addr`, registers it with `loop_handle`, and starts accepting.
    /// Every accepted stream gets its own server-role connection, handed to
    /// `on_connection` once registered. Returns the bound address, useful
    /// when `addr` asked for an OS-assigned ephemeral port (`:0`).
    pub fn listen(
        self,
        addr: &str,
        loop_handle: &EventLoopHandle,
    ) -> Result<std::net::SocketAddr> {
        let on_connection = self
            .on_connection
            .ok_or_else(|| errf!("ServerBuilder::listen called without on_connection"))?;
        let std_listener = std::net::TcpListener::bind(addr)
            .map_err(|e| errf!("failed to bind {addr}: {e}"))?;
        let local_addr = std_listener
            .local_addr()
            .map_err(|e| errf!("failed to read bound address for {addr}: {e}"))?;
        std_listener
            .set_nonblocking(true)
            .map_err(|e| errf!("failed to set {addr} non-blocking: {e}"))?;
        let listener = mio::net::TcpListener::from_std(std_listener);
        let socket = loop_handle.register_listener(listener)?;

        let acceptor = Arc::new_cyclic(|weak| Acceptor {
            self_weak: weak.clone(),
            loop_handle: loop_handle.clone(),
            socket,
            options: self.options,
            on_connection: Mutex::new(on_connection),
        });
        loop_handle.add_thread(acceptor);
        Ok(local_addr)
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        ServerBuilder::new()
    }
}

struct Acceptor {
    self_weak: Weak<Acceptor>,
    loop_handle: EventLoopHandle,
    socket: EventSocket,
    options: ServerOptions,
    on_connection: Mutex<OnConnection>,
}

impl Acceptor {
    fn arm_accept(&self) {
        let handle = self.self_weak.upgrade().expect("acceptor dropped while still listening");
        self.socket.accept(handle);
    }

    fn on_accept(&self, stream: TcpStream) {
        match self.loop_handle.register_stream(stream) {
            Ok(socket) => {
                let conn =
                    Connection::new_server(&self.loop_handle, socket, self.options.clone(), None, None);
                let thread_id = self.loop_handle.add_thread(conn.clone());
                conn.set_thread_id(thread_id);
                (self.on_connection.lock().unwrap())(conn);
            }
            Err(e) => log::warn!("failed to register an accepted connection: {e}"),
        }
    }
}

impl EventThread for Acceptor {
    fn handle(&self, event: Event) -> Result<()> {
        match event {
            Event::Start => self.arm_accept(),
            Event::Accept(stream) => {
                self.on_accept(stream);
                self.arm_accept();
            }
            Event::Error(e) => log::warn!("listener error: {e}"),
            Event::Read(_) | Event::Write(_) | Event::Custom(_) => {}
        }
        Ok(())
    }
}
