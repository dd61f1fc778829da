//! The connection state machine: handshake -> read-messages -> closing.
//! Shared between the client and server builders in `client.rs`/
//! `server.rs`; grounded on `core/src/core/websocket/Server.cpp` (the
//! reactor-based connection — of the source's several server variants,
//! the only one worth treating as a contract).

use std::sync::{Arc, Mutex, Weak};

use crate::error::{errf, HumanError, Result};
use crate::reactor::{Event, EventLoopHandle, EventSocket, EventThread, EventThreadHandle, ThreadId};

use super::config::ConnectionOptions;
use super::frame::{self, Opcode, ParseError};
use super::message::{Message, MessageKind, MessageParser};
use super::{close_code, find_subslice, handshake, is_valid_close_code, Role};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Handshake,
    ReadMessage,
    Closed,
    Failed,
}

pub(crate) type OnMessage = Box<dyn FnMut(Message) + Send>;
pub(crate) type OnConnected = Box<dyn FnMut() + Send>;
pub(crate) type OnDisconnected = Box<dyn FnMut(HumanError) + Send>;

struct Inner {
    role: Role,
    options: ConnectionOptions,
    loop_handle: EventLoopHandle,
    socket: EventSocket,
    state: ConnState,
    handshake_buf: Vec<u8>,
    client_key: Option<String>,
    host: String,
    path: String,
    message_parser: MessageParser,
    pending_write_bytes: u64,
    torn_down: bool,
    thread_id: Option<ThreadId>,
    on_message: Option<OnMessage>,
    on_connected: Option<OnConnected>,
    on_disconnected: Option<OnDisconnected>,
}

/// A single WebSocket connection, playing either a "server connection" or
/// "client connection" role — which one is decided by `role` at
/// construction, since the read-messages/close machinery (and everything
/// but the handshake direction and outbound masking) is identical either
/// way.
pub struct Connection {
    self_weak: Weak<Connection>,
    inner: Mutex<Inner>,
}

#[allow(clippy::too_many_arguments)]
impl Connection {
    pub(crate) fn new_client(
        loop_handle: &EventLoopHandle,
        socket: EventSocket,
        host: String,
        path: String,
        options: ConnectionOptions,
        on_connected: Option<OnConnected>,
        on_message: Option<OnMessage>,
        on_disconnected: Option<OnDisconnected>,
    ) -> Arc<Connection> {
        let max_message_size = options.max_message_size;
        Arc::new_cyclic(|weak| Connection {
            self_weak: weak.clone(),
            inner: Mutex::new(Inner {
                role: Role::Client,
                options,
                loop_handle: loop_handle.clone(),
                socket,
                state: ConnState::Handshake,
                handshake_buf: Vec::new(),
                client_key: None,
                host,
                path,
                message_parser: MessageParser::new(max_message_size),
                pending_write_bytes: 0,
                torn_down: false,
                thread_id: None,
                on_message,
                on_connected,
                on_disconnected,
            }),
        })
    }

    pub(crate) fn new_server(
        loop_handle: &EventLoopHandle,
        socket: EventSocket,
        options: ConnectionOptions,
        on_message: Option<OnMessage>,
        on_disconnected: Option<OnDisconnected>,
    ) -> Arc<Connection> {
        let max_message_size = options.max_message_size;
        Arc::new_cyclic(|weak| Connection {
            self_weak: weak.clone(),
            inner: Mutex::new(Inner {
                role: Role::Server,
                options,
                loop_handle: loop_handle.clone(),
                socket,
                state: ConnState::Handshake,
                handshake_buf: Vec::new(),
                client_key: None,
                host: String::new(),
                path: String::new(),
                message_parser: MessageParser::new(max_message_size),
                pending_write_bytes: 0,
                torn_down: false,
                thread_id: None,
                on_message,
                on_connected: None,
                on_disconnected,
            }),
        })
    }

    pub(crate) fn set_thread_id(&self, id: ThreadId) {
        self.inner.lock().unwrap().thread_id = Some(id);
    }

    /// Registers the message callback after the fact — the only way to
    /// attach one to a server-accepted connection, which doesn't exist yet
    /// at the time `ServerBuilder::on_connection` would otherwise want to
    /// pass one in.
    pub fn set_on_message(&self, cb: impl FnMut(Message) + Send + 'static) {
        self.inner.lock().unwrap().on_message = Some(Box::new(cb));
    }

    pub fn set_on_disconnected(&self, cb: impl FnMut(HumanError) + Send + 'static) {
        self.inner.lock().unwrap().on_disconnected = Some(Box::new(cb));
    }

    fn self_handle(&self) -> EventThreadHandle {
        self.self_weak.upgrade().expect("connection dropped while still receiving events")
    }

    fn write_raw(&self, bytes: Vec<u8>) {
        let mut inner = self.inner.lock().unwrap();
        inner.pending_write_bytes += bytes.len() as u64;
        let handle = self.self_weak.upgrade().expect("connection alive while writing");
        inner.socket.write(handle, bytes);
    }

    fn write_frame(&self, opcode: Opcode, payload: &[u8]) {
        let masked = self.inner.lock().unwrap().role == Role::Client;
        self.write_raw(frame::encode(opcode, payload, masked));
    }

    fn arm_read(&self) {
        let inner = self.inner.lock().unwrap();
        if matches!(inner.state, ConnState::Closed | ConnState::Failed) {
            return;
        }
        inner.socket.read(self.self_handle());
    }

    fn on_start(&self) -> Result<()> {
        let role = self.inner.lock().unwrap().role;
        if role == Role::Client {
            let (host, path) = {
                let inner = self.inner.lock().unwrap();
                (inner.host.clone(), inner.path.clone())
            };
            let key = handshake::generate_key();
            self.inner.lock().unwrap().client_key = Some(key.clone());
            let request = handshake::build_request(&host, &path, &key);
            self.write_raw(request.into_bytes());
        }
        self.arm_read();
        Ok(())
    }

    fn on_read(&self, bytes: Vec<u8>) -> Result<()> {
        if bytes.is_empty() {
            let was_closed = {
                let mut inner = self.inner.lock().unwrap();
                let was_closed = inner.state == ConnState::Closed;
                if !was_closed {
                    inner.state = ConnState::Failed;
                }
                was_closed
            };
            if !was_closed {
                self.notify_disconnected(errf!("connection closed by peer"));
            }
            self.maybe_teardown();
            return Ok(());
        }
        let state = self.inner.lock().unwrap().state;
        match state {
            ConnState::Handshake => self.on_handshake_bytes(bytes),
            ConnState::ReadMessage => self.on_message_bytes(bytes),
            ConnState::Closed | ConnState::Failed => Ok(()),
        }
    }

    fn on_handshake_bytes(&self, bytes: Vec<u8>) -> Result<()> {
        let (role, terminator) = {
            let mut inner = self.inner.lock().unwrap();
            inner.handshake_buf.extend_from_slice(&bytes);
            if inner.handshake_buf.len() > inner.options.max_handshake_size {
                let role = inner.role;
                drop(inner);
                if role == Role::Server {
                    self.write_raw(b"HTTP/1.1 400 Bad Request\r\n\r\n".to_vec());
                }
                self.fail(errf!("handshake exceeded max_handshake_size"));
                return Ok(());
            }
            let terminator = find_subslice(&inner.handshake_buf, b"\r\n\r\n");
            (inner.role, terminator)
        };
        let Some(pos) = terminator else {
            self.arm_read();
            return Ok(());
        };
        let (head, surplus) = {
            let inner = self.inner.lock().unwrap();
            (inner.handshake_buf[..pos].to_vec(), inner.handshake_buf[pos + 4..].to_vec())
        };
        match role {
            Role::Server => self.complete_server_handshake(&head, surplus),
            Role::Client => self.complete_client_handshake(&head, surplus),
        }
    }

    fn complete_server_handshake(&self, head: &[u8], surplus: Vec<u8>) -> Result<()> {
        match handshake::parse_request(head) {
            Ok(request) => {
                self.write_raw(handshake::response_for(&request.key).into_bytes());
                self.inner.lock().unwrap().state = ConnState::ReadMessage;
                self.process_message_bytes_and_rearm(surplus)
            }
            Err(e) => {
                self.write_raw(b"HTTP/1.1 400 Bad Request\r\n\r\n".to_vec());
                self.fail(e);
                Ok(())
            }
        }
    }

    fn complete_client_handshake(&self, head: &[u8], surplus: Vec<u8>) -> Result<()> {
        let key = self
            .inner
            .lock()
            .unwrap()
            .client_key
            .clone()
            .expect("client key is set before the handshake is sent");
        let verified = handshake::parse_response(head)
            .and_then(|resp| handshake::verify_accept(&key, &resp.accept));
        match verified {
            Ok(()) => {
                self.inner.lock().unwrap().state = ConnState::ReadMessage;
                self.notify_connected();
                self.process_message_bytes_and_rearm(surplus)
            }
            Err(e) => {
                self.inner.lock().unwrap().state = ConnState::Failed;
                self.notify_disconnected(e);
                Ok(())
            }
        }
    }

    fn process_message_bytes_and_rearm(&self, bytes: Vec<u8>) -> Result<()> {
        if bytes.is_empty() {
            self.arm_read();
            Ok(())
        } else {
            self.on_message_bytes(bytes)
        }
    }

    fn on_message_bytes(&self, bytes: Vec<u8>) -> Result<()> {
        let feed_result = self.inner.lock().unwrap().message_parser.feed(&bytes);
        match feed_result {
            Ok((_, messages)) => {
                for message in messages {
                    self.dispatch_message(message);
                    if matches!(
                        self.inner.lock().unwrap().state,
                        ConnState::Closed | ConnState::Failed
                    ) {
                        return Ok(());
                    }
                }
                self.arm_read();
            }
            Err(ParseError::TooLarge) => self.close_with(close_code::MESSAGE_TOO_BIG, b""),
            Err(ParseError::Protocol(_)) => self.close_with(close_code::PROTOCOL_ERROR, b""),
        }
        Ok(())
    }

    fn dispatch_message(&self, msg: Message) {
        match msg.kind {
            MessageKind::Text => {
                if std::str::from_utf8(&msg.payload).is_ok() {
                    self.deliver_to_user(msg);
                } else {
                    self.close_with(close_code::INVALID_PAYLOAD, b"");
                }
            }
            MessageKind::Binary => self.deliver_to_user(msg),
            MessageKind::Ping => {
                if self.inner.lock().unwrap().options.handle_ping {
                    self.deliver_to_user(msg);
                } else {
                    self.write_frame(Opcode::Pong, &msg.payload);
                }
            }
            MessageKind::Pong => {
                if self.inner.lock().unwrap().options.handle_pong {
                    self.deliver_to_user(msg);
                }
            }
            MessageKind::Close => {
                if self.inner.lock().unwrap().options.handle_close {
                    self.deliver_to_user(msg);
                } else {
                    self.handle_close_protocol(msg.payload);
                }
            }
        }
    }

    fn deliver_to_user(&self, msg: Message) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(cb) = inner.on_message.as_mut() {
            cb(msg);
        }
    }

    /// The receiver side of the close protocol: decides the reply code
    /// from the inbound close payload's shape and validity.
    fn handle_close_protocol(&self, payload: Vec<u8>) {
        let code = match payload.len() {
            0 => close_code::NORMAL,
            1 => close_code::PROTOCOL_ERROR,
            _ => {
                let inbound = u16::from_be_bytes([payload[0], payload[1]]);
                if !is_valid_close_code(inbound) {
                    close_code::PROTOCOL_ERROR
                } else if payload.len() == 2 {
                    close_code::NORMAL
                } else {
                    match std::str::from_utf8(&payload[2..]) {
                        Ok(_) => close_code::NORMAL,
                        Err(_) => close_code::PROTOCOL_ERROR,
                    }
                }
            }
        };
        self.close_with(code, b"");
    }

    fn close_with(&self, code: u16, reason: &[u8]) {
        let mut payload = code.to_be_bytes().to_vec();
        payload.extend_from_slice(reason);
        payload.truncate(125);
        self.write_frame(Opcode::Close, &payload);
        self.inner.lock().unwrap().state = ConnState::Closed;
        self.maybe_teardown();
    }

    fn on_write(&self, n: usize) -> Result<()> {
        let teardown = {
            let mut inner = self.inner.lock().unwrap();
            inner.pending_write_bytes = inner.pending_write_bytes.saturating_sub(n as u64);
            inner.state == ConnState::Closed && inner.pending_write_bytes == 0
        };
        if teardown {
            self.teardown();
        }
        Ok(())
    }

    fn on_error(&self, e: HumanError) -> Result<()> {
        self.inner.lock().unwrap().state = ConnState::Failed;
        self.notify_disconnected(e);
        self.teardown();
        Ok(())
    }

    fn fail(&self, e: HumanError) {
        self.inner.lock().unwrap().state = ConnState::Failed;
        self.notify_disconnected(e);
        self.maybe_teardown();
    }

    fn notify_connected(&self) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(cb) = inner.on_connected.as_mut() {
            cb();
        }
    }

    fn notify_disconnected(&self, e: HumanError) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(cb) = inner.on_disconnected.as_mut() {
            cb(e);
        }
    }

    /// The teardown gate: only destroy once closed/failed *and* every
    /// outbound byte has actually left the socket.
    fn maybe_teardown(&self) {
        let should = {
            let inner = self.inner.lock().unwrap();
            matches!(inner.state, ConnState::Closed | ConnState::Failed)
                && inner.pending_write_bytes == 0
        };
        if should {
            self.teardown();
        }
    }

    fn teardown(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.torn_down {
            return;
        }
        inner.torn_down = true;
        if let Some(id) = inner.thread_id.take() {
            inner.loop_handle.remove_thread(id);
        }
    }

    pub fn write_text(&self, text: &str) {
        self.write_frame(Opcode::Text, text.as_bytes());
    }

    pub fn write_binary(&self, data: &[u8]) {
        self.write_frame(Opcode::Binary, data);
    }

    pub fn write_ping(&self, payload: &[u8]) {
        self.write_frame(Opcode::Ping, payload);
    }

    pub fn write_pong(&self, payload: &[u8]) {
        self.write_frame(Opcode::Pong, payload);
    }

    pub fn write_close(&self, code: u16, reason: &[u8]) {
        self.close_with(code, reason);
    }
}

impl EventThread for Connection {
    fn handle(&self, event: Event) -> Result<()> {
        match event {
            Event::Start => self.on_start(),
            Event::Read(bytes) => self.on_read(bytes),
            Event::Write(n) => self.on_write(n),
            Event::Error(e) => self.on_error(e),
            Event::Accept(_) | Event::Custom(_) => Ok(()),
        }
    }
}
