//! The client-side builder: resolves a `ws://`/`wss://` URL into a TCP
//! connection and an [`engine::Connection`] playing the client role.
//!
//! `wss://` is not implemented — see `DESIGN.md`'s Open Questions for why
//! TLS stays out of scope here.

use std::net::TcpStream as StdTcpStream;
use std::sync::Arc;

use url::Url;

use crate::error::{errf, Result};
use crate::reactor::EventLoopHandle;

use super::config::ClientOptions;
use super::engine::{Connection, OnConnected, OnDisconnected, OnMessage};
use super::Message;

pub type ClientHandle = Arc<Connection>;

/// Builds a client connection: set callbacks and options, then `connect`
/// against a running event loop.
pub struct ClientBuilder {
    url: Url,
    options: ClientOptions,
    on_connected: Option<OnConnected>,
    on_message: Option<OnMessage>,
    on_disconnected: Option<OnDisconnected>,
}

impl ClientBuilder {
    pub fn new(url: &str) -> Result<Self> {
        let url = Url::parse(url).map_err(|e| errf!("invalid WebSocket URL {url:?}: {e}"))?;
        match url.scheme() {
            "ws" => {}
            "wss" => return Err(errf!("wss:// is not supported")),
            other => return Err(errf!("unsupported URL scheme {other:?}, expected ws://")),
        }
        if url.host_str().is_none() {
            return Err(errf!("WebSocket URL is missing a host"));
        }
        Ok(ClientBuilder {
            url,
            options: ClientOptions::default(),
            on_connected: None,
            on_message: None,
            on_disconnected: None,
        })
    }

    pub fn options(mut self, options: ClientOptions) -> Self {
        self.options = options;
        self
    }

    pub fn on_connected(mut self, cb: impl FnMut() + Send + 'static) -> Self {
        self.on_connected = Some(Box::new(cb));
        self
    }

    pub fn on_message(mut self, cb: impl FnMut(Message) + Send + 'static) -> Self {
        self.on_message = Some(Box::new(cb));
        self
    }

    pub fn on_disconnected(mut self, cb: impl FnMut(crate::error::HumanError) + Send + 'static) -> Self {
        self.on_disconnected = Some(Box::new(cb));
        self
    }

    /// Opens the TCP connection (blocking; the handshake and everything
    /// after runs on `loop_handle`'s event loop) and registers it.
    pub fn connect(self, loop_handle: &EventLoopHandle) -> Result<ClientHandle> {
        let host = self.url.host_str().expect("checked in new()").to_string();
        let port = self.url.port_or_known_default().unwrap_or(80);
        let addr = format!("{host}:{port}");
        let std_stream = StdTcpStream::connect(&addr)
            .map_err(|e| errf!("failed to connect to {addr}: {e}"))?;
        std_stream
            .set_nonblocking(true)
            .map_err(|e| errf!("failed to set {addr} non-blocking: {e}"))?;
        let stream = mio::net::TcpStream::from_std(std_stream);
        let socket = loop_handle.register_stream(stream)?;

        let host_header =
            if let Some(port) = self.url.port() { format!("{host}:{port}") } else { host };
        let path = match self.url.query() {
            Some(q) => format!("{}?{}", self.url.path(), q),
            None => self.url.path().to_string(),
        };

        let conn = Connection::new_client(
            loop_handle,
            socket,
            host_header,
            path,
            self.options,
            self.on_connected,
            self.on_message,
            self.on_disconnected,
        );
        let thread_id = loop_handle.add_thread(conn.clone());
        conn.set_thread_id(thread_id);
        Ok(conn)
    }
}
