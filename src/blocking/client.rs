use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::TcpStream;

use url::Url;

use crate::error::{errf, Result};
use crate::ws::config::ClientOptions;
use crate::ws::frame::{self, Opcode, ParseError};
use crate::ws::message::MessageParser;
use crate::ws::{close_code, find_subslice, handshake, is_valid_close_code, Message, MessageKind};

/// A synchronous WebSocket client: one blocking `TcpStream`, no event loop.
/// Grounded on the same handshake/frame/message machinery the reactor-based
/// client uses, driven by ordinary blocking reads instead of callbacks.
pub struct Client {
    stream: TcpStream,
    options: ClientOptions,
    masked: bool,
    parser: MessageParser,
    pending: VecDeque<Message>,
    leftover: Vec<u8>,
}

impl Client {
    pub fn connect(url: &str, options: ClientOptions) -> Result<Client> {
        let parsed = Url::parse(url).map_err(|e| errf!("invalid WebSocket URL {url:?}: {e}"))?;
        match parsed.scheme() {
            "ws" => {}
            "wss" => return Err(errf!("wss:// is not supported")),
            other => return Err(errf!("unsupported URL scheme {other:?}, expected ws://")),
        }
        let host = parsed
            .host_str()
            .ok_or_else(|| errf!("WebSocket URL is missing a host"))?
            .to_string();
        let port = parsed.port_or_known_default().unwrap_or(80);
        let addr = format!("{host}:{port}");
        let mut stream =
            TcpStream::connect(&addr).map_err(|e| errf!("failed to connect to {addr}: {e}"))?;

        let host_header =
            if let Some(port) = parsed.port() { format!("{host}:{port}") } else { host };
        let path = match parsed.query() {
            Some(q) => format!("{}?{}", parsed.path(), q),
            None => parsed.path().to_string(),
        };
        let key = handshake::generate_key();
        let request = handshake::build_request(&host_header, &path, &key);
        stream
            .write_all(request.as_bytes())
            .map_err(|e| errf!("failed to send handshake request: {e}"))?;

        let mut buf = Vec::new();
        let header_end = loop {
            if let Some(pos) = find_subslice(&buf, b"\r\n\r\n") {
                break pos;
            }
            if buf.len() > options.max_handshake_size {
                return Err(errf!("handshake exceeded max_handshake_size"));
            }
            let mut chunk = [0u8; 4096];
            let n = stream.read(&mut chunk).map_err(|e| errf!("handshake read failed: {e}"))?;
            if n == 0 {
                return Err(errf!("connection closed during handshake"));
            }
            buf.extend_from_slice(&chunk[..n]);
        };
        let head = buf[..header_end].to_vec();
        let leftover = buf[header_end + 4..].to_vec();
        let response = handshake::parse_response(&head)?;
        handshake::verify_accept(&key, &response.accept)?;

        let max_message_size = options.max_message_size;
        Ok(Client {
            stream,
            options,
            masked: true,
            parser: MessageParser::new(max_message_size),
            pending: VecDeque::new(),
            leftover,
        })
    }

    /// Completes a server-side handshake over an already-accepted stream.
    /// Used by [`crate::blocking::Server::accept`]; servers never mask
    /// outgoing frames.
    pub(crate) fn accept_from(mut stream: TcpStream, options: ClientOptions) -> Result<Client> {
        let mut buf = Vec::new();
        let header_end = loop {
            if let Some(pos) = find_subslice(&buf, b"\r\n\r\n") {
                break pos;
            }
            if buf.len() > options.max_handshake_size {
                return Err(errf!("handshake exceeded max_handshake_size"));
            }
            let mut chunk = [0u8; 4096];
            let n = stream.read(&mut chunk).map_err(|e| errf!("handshake read failed: {e}"))?;
            if n == 0 {
                return Err(errf!("connection closed during handshake"));
            }
            buf.extend_from_slice(&chunk[..n]);
        };
        let head = buf[..header_end].to_vec();
        let leftover = buf[header_end + 4..].to_vec();
        let request = match handshake::parse_request(&head) {
            Ok(r) => r,
            Err(e) => {
                let _ = stream.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n");
                return Err(e);
            }
        };
        let response = handshake::response_for(&request.key);
        stream
            .write_all(response.as_bytes())
            .map_err(|e| errf!("failed to send handshake response: {e}"))?;

        let max_message_size = options.max_message_size;
        Ok(Client {
            stream,
            options,
            masked: false,
            parser: MessageParser::new(max_message_size),
            pending: VecDeque::new(),
            leftover,
        })
    }

    /// Blocks until a whole application message is available, handling
    /// (or surfacing, per `options`) ping/pong/close along the way.
    pub fn read_message(&mut self) -> Result<Message> {
        loop {
            if let Some(msg) = self.pending.pop_front() {
                if let Some(msg) = self.auto_handle(msg)? {
                    return Ok(msg);
                }
                continue;
            }
            if !self.leftover.is_empty() {
                let bytes = std::mem::take(&mut self.leftover);
                self.feed(&bytes)?;
                continue;
            }
            let mut chunk = [0u8; 64 * 1024];
            let n = self.stream.read(&mut chunk).map_err(|e| errf!("read failed: {e}"))?;
            if n == 0 {
                return Err(errf!("connection closed by peer"));
            }
            self.feed(&chunk[..n])?;
        }
    }

    fn feed(&mut self, bytes: &[u8]) -> Result<()> {
        match self.parser.feed(bytes) {
            Ok((_, messages)) => {
                self.pending.extend(messages);
                Ok(())
            }
            Err(ParseError::TooLarge) => {
                self.write_frame(Opcode::Close, &close_code::MESSAGE_TOO_BIG.to_be_bytes());
                Err(errf!("message exceeds the configured maximum size"))
            }
            Err(ParseError::Protocol(e)) => {
                self.write_frame(Opcode::Close, &close_code::PROTOCOL_ERROR.to_be_bytes());
                Err(e)
            }
        }
    }

    fn auto_handle(&mut self, msg: Message) -> Result<Option<Message>> {
        match msg.kind {
            MessageKind::Ping => {
                if self.options.handle_ping {
                    Ok(Some(msg))
                } else {
                    self.write_frame(Opcode::Pong, &msg.payload);
                    Ok(None)
                }
            }
            MessageKind::Pong => {
                if self.options.handle_pong {
                    Ok(Some(msg))
                } else {
                    Ok(None)
                }
            }
            MessageKind::Close => {
                if self.options.handle_close {
                    Ok(Some(msg))
                } else {
                    self.reply_close(&msg.payload);
                    Err(errf!("connection closed by peer"))
                }
            }
            MessageKind::Text | MessageKind::Binary => Ok(Some(msg)),
        }
    }

    fn reply_close(&mut self, payload: &[u8]) {
        let code = match payload.len() {
            0 => close_code::NORMAL,
            1 => close_code::PROTOCOL_ERROR,
            _ => {
                let inbound = u16::from_be_bytes([payload[0], payload[1]]);
                if is_valid_close_code(inbound) {
                    close_code::NORMAL
                } else {
                    close_code::PROTOCOL_ERROR
                }
            }
        };
        self.write_frame(Opcode::Close, &code.to_be_bytes());
    }

    fn write_frame(&mut self, opcode: Opcode, payload: &[u8]) {
        let bytes = frame::encode(opcode, payload, self.masked);
        let _ = self.stream.write_all(&bytes);
    }

    pub fn write_text(&mut self, text: &str) {
        self.write_frame(Opcode::Text, text.as_bytes());
    }

    pub fn write_binary(&mut self, data: &[u8]) {
        self.write_frame(Opcode::Binary, data);
    }

    pub fn write_ping(&mut self, payload: &[u8]) {
        self.write_frame(Opcode::Ping, payload);
    }

    pub fn write_pong(&mut self, payload: &[u8]) {
        self.write_frame(Opcode::Pong, payload);
    }

    pub fn write_close(&mut self, code: u16, reason: &[u8]) {
        let mut payload = code.to_be_bytes().to_vec();
        payload.extend_from_slice(reason);
        payload.truncate(125);
        self.write_frame(Opcode::Close, &payload);
    }
}
