//! End-to-end scenarios driving real loopback TCP: a reactor-based
//! `corio::ws::Server` against a reactor-based `corio::ws::Client`, and
//! (for the fragmentation scenario) a hand-built raw client so the test
//! controls frame boundaries directly.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use corio::reactor::EventLoop;
use corio::ws::frame::{self, Opcode};
use corio::ws::{
    close_code, handshake, ClientBuilder, ClientOptions, Message, MessageKind, ServerBuilder,
    ServerOptions,
};

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

#[test]
fn handshake_then_text_echo() {
    let mut event_loop = EventLoop::new().expect("create event loop");
    let handle = event_loop.handle();

    let addr = ServerBuilder::new()
        .on_connection(|client| {
            let echo = client.clone();
            client.set_on_message(move |msg| {
                if msg.kind == MessageKind::Text {
                    let text = String::from_utf8(msg.payload).expect("valid utf8");
                    echo.write_text(&text);
                }
            });
        })
        .listen("127.0.0.1:0", &handle)
        .expect("listen");

    let received: Arc<Mutex<Vec<Message>>> = Arc::new(Mutex::new(Vec::new()));
    let received_in_callback = received.clone();
    let stop_handle = handle.clone();
    let client = ClientBuilder::new(&format!("ws://{addr}/"))
        .expect("valid url")
        .on_message(move |msg| {
            received_in_callback.lock().unwrap().push(msg);
            stop_handle.stop();
        })
        .connect(&handle)
        .expect("connect");

    client.write_text("hello");

    event_loop.run_for(Duration::from_secs(5)).expect("run loop");

    let received = received.lock().unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].kind, MessageKind::Text);
    assert_eq!(received[0].payload, b"hello");
}

#[test]
fn oversize_message_closes_with_message_too_big() {
    let mut event_loop = EventLoop::new().expect("create event loop");
    let handle = event_loop.handle();

    let server_options = ServerOptions { max_message_size: 16, ..ServerOptions::default() };
    let addr = ServerBuilder::new()
        .options(server_options)
        .on_connection(|_client| {})
        .listen("127.0.0.1:0", &handle)
        .expect("listen");

    let close_message: Arc<Mutex<Option<Message>>> = Arc::new(Mutex::new(None));
    let close_message_in_callback = close_message.clone();
    let stop_handle = handle.clone();
    let client_options = ClientOptions { handle_close: true, ..ClientOptions::default() };
    let client = ClientBuilder::new(&format!("ws://{addr}/"))
        .expect("valid url")
        .options(client_options)
        .on_message(move |msg| {
            if msg.kind == MessageKind::Close {
                *close_message_in_callback.lock().unwrap() = Some(msg);
                stop_handle.stop();
            }
        })
        .connect(&handle)
        .expect("connect");

    client.write_binary(&[0u8; 100]);

    event_loop.run_for(Duration::from_secs(5)).expect("run loop");

    let close_message = close_message.lock().unwrap();
    let msg = close_message.as_ref().expect("a close message should have arrived");
    assert!(msg.payload.len() >= 2);
    let code = u16::from_be_bytes([msg.payload[0], msg.payload[1]]);
    assert_eq!(code, close_code::MESSAGE_TOO_BIG);
}

#[test]
fn fragmented_text_with_interleaved_ping_reassembles_and_auto_pongs() {
    let mut event_loop = EventLoop::new().expect("create event loop");
    let handle = event_loop.handle();

    let received: Arc<Mutex<Vec<Message>>> = Arc::new(Mutex::new(Vec::new()));
    let received_in_callback = received.clone();
    let stop_handle = handle.clone();
    let addr = ServerBuilder::new()
        .on_connection(move |client| {
            let received = received_in_callback.clone();
            let stop_handle = stop_handle.clone();
            client.set_on_message(move |msg| {
                let is_text = msg.kind == MessageKind::Text;
                received.lock().unwrap().push(msg);
                if is_text {
                    stop_handle.stop();
                }
            });
        })
        .listen("127.0.0.1:0", &handle)
        .expect("listen");

    let raw_client = std::thread::spawn(move || -> Vec<u8> {
        let mut stream = TcpStream::connect(addr).expect("raw connect");
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

        let key = handshake::generate_key();
        let request = handshake::build_request(&addr.to_string(), "/", &key);
        stream.write_all(request.as_bytes()).expect("write handshake request");

        let mut buf = Vec::new();
        let header_end = loop {
            if let Some(pos) = find_header_end(&buf) {
                break pos;
            }
            let mut chunk = [0u8; 4096];
            let n = stream.read(&mut chunk).expect("read handshake response");
            assert!(n > 0, "connection closed during handshake");
            buf.extend_from_slice(&chunk[..n]);
        };
        let response = handshake::parse_response(&buf[..header_end]).expect("parse response");
        handshake::verify_accept(&key, &response.accept).expect("accept matches");

        let mut first_fragment = frame::encode(Opcode::Text, b"Hel", true);
        first_fragment[0] &= 0x7F; // clear FIN: more fragments follow
        stream.write_all(&first_fragment).expect("write first fragment");

        stream.write_all(&frame::encode(Opcode::Ping, b"x", true)).expect("write ping");

        let last_fragment = frame::encode(Opcode::Continuation, b"lo", true);
        stream.write_all(&last_fragment).expect("write last fragment");

        // Drain whatever trails the handshake response (there shouldn't be
        // any) then read the server's auto-pong reply.
        let mut pong_bytes = buf[header_end + 4..].to_vec();
        let mut parser = frame::FrameParser::new(1 << 20);
        loop {
            let consumed = parser.consume(&pong_bytes).expect("parse pong");
            pong_bytes.drain(..consumed);
            if let Some(frame) = parser.frame() {
                if frame.opcode == Opcode::Pong {
                    return frame.payload;
                }
                continue;
            }
            let mut chunk = [0u8; 4096];
            let n = stream.read(&mut chunk).expect("read pong");
            assert!(n > 0, "connection closed before a pong arrived");
            pong_bytes.extend_from_slice(&chunk[..n]);
        }
    });

    event_loop.run_for(Duration::from_secs(5)).expect("run loop");
    let pong_payload = raw_client.join().expect("raw client thread panicked");
    assert_eq!(pong_payload, b"x");

    // The interleaved ping is auto-answered by the engine (default
    // `handle_ping: false`) rather than surfaced to `on_message`; only the
    // reassembled text message reaches the callback.
    let received = received.lock().unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].kind, MessageKind::Text);
    assert_eq!(received[0].payload, b"Hello");
}
