//! HTTP upgrade handshake: request/response parsing and the
//! `Sec-WebSocket-Accept` key derivation.
//!
//! Grounded on `core/src/core/websocket/Handshake.cpp`. SHA-1 and Base64
//! are ordinary infrastructure supplied by the `sha1`/`base64` crates
//! rather than hand-rolled.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use sha1::{Digest, Sha1};

use crate::error::{errf, Result};

const GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// `base64(SHA1(client_key ++ GUID))`, per RFC 6455 §1.3.
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// A freshly-drawn 16 random bytes, base64-encoded, for `Sec-WebSocket-Key`.
pub fn generate_key() -> String {
    use rand::Rng;
    let mut bytes = [0u8; 16];
    rand::rng().fill(&mut bytes);
    BASE64.encode(bytes)
}

pub struct Request {
    pub key: String,
}

/// Parses a server-side handshake request out of the bytes received up to
/// and including the terminating `\r\n\r\n` (not included in `buf`).
pub fn parse_request(buf: &[u8]) -> Result<Request> {
    let text = std::str::from_utf8(buf)?;
    let mut lines = text.split("\r\n");
    let first = lines.next().ok_or_else(|| errf!("empty handshake request"))?;
    if !first.to_ascii_uppercase().ends_with("HTTP/1.1") {
        return Err(errf!("handshake request line must end with HTTP/1.1: {first:?}"));
    }

    let mut upgrade_ok = false;
    let mut version_ok = false;
    let mut connection_ok = false;
    let mut key = None;
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) =
            line.split_once(':').ok_or_else(|| errf!("malformed header line: {line:?}"))?;
        let (name, value) = (name.trim(), value.trim());
        match name.to_ascii_lowercase().as_str() {
            "upgrade" => upgrade_ok = value.eq_ignore_ascii_case("websocket"),
            "sec-websocket-version" => version_ok = value == "13",
            "connection" => connection_ok = value.to_ascii_lowercase().contains("upgrade"),
            "sec-websocket-key" => key = Some(value.to_string()),
            _ => {}
        }
    }

    if !upgrade_ok {
        return Err(errf!("missing or invalid Upgrade header"));
    }
    if !version_ok {
        return Err(errf!("missing or unsupported Sec-WebSocket-Version (must be 13)"));
    }
    if !connection_ok {
        return Err(errf!("missing Connection: upgrade header"));
    }
    let key = key.ok_or_else(|| errf!("missing Sec-WebSocket-Key header"))?;
    Ok(Request { key })
}

/// Builds the server's `101 Switching Protocols` reply.
pub fn response_for(client_key: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        accept_key(client_key)
    )
}

/// Builds the client's upgrade request.
pub fn build_request(host: &str, path: &str, key: &str) -> String {
    format!(
        "GET {path} HTTP/1.1\r\n\
         Host: {host}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         Sec-WebSocket-Version: 13\r\n\r\n"
    )
}

pub struct Response {
    pub accept: String,
}

/// Parses the server's handshake response.
pub fn parse_response(buf: &[u8]) -> Result<Response> {
    let text = std::str::from_utf8(buf)?;
    let mut lines = text.split("\r\n");
    let status = lines.next().ok_or_else(|| errf!("empty handshake response"))?;
    if !status.starts_with("HTTP/1.1 101 ") {
        return Err(errf!("expected \"HTTP/1.1 101 ...\" status line, got {status:?}"));
    }

    let mut upgrade_ok = false;
    let mut connection_ok = false;
    let mut accept = None;
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) =
            line.split_once(':').ok_or_else(|| errf!("malformed header line: {line:?}"))?;
        let (name, value) = (name.trim(), value.trim());
        match name.to_ascii_lowercase().as_str() {
            "upgrade" => upgrade_ok = value.eq_ignore_ascii_case("websocket"),
            "connection" => connection_ok = value.eq_ignore_ascii_case("upgrade"),
            "sec-websocket-accept" => accept = Some(value.to_string()),
            _ => {}
        }
    }

    if !upgrade_ok {
        return Err(errf!("missing or invalid Upgrade header"));
    }
    if !connection_ok {
        return Err(errf!("missing Connection: upgrade header"));
    }
    let accept = accept.ok_or_else(|| errf!("missing Sec-WebSocket-Accept header"))?;
    Ok(Response { accept })
}

/// Recomputes the expected accept value and compares it against what the
/// server sent.
pub fn verify_accept(client_key: &str, accept: &str) -> Result<()> {
    let expected = accept_key(client_key);
    if expected != accept {
        return Err(errf!("Sec-WebSocket-Accept mismatch: expected {expected}, got {accept}"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc6455_test_vector() {
        assert_eq!(accept_key("dGhlIHNhbXBsZSBub25jZQ=="), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn parses_a_well_formed_request() {
        let req = b"GET /chat HTTP/1.1\r\n\
Host: example.com\r\n\
Upgrade: websocket\r\n\
Connection: Upgrade\r\n\
Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
Sec-WebSocket-Version: 13\r\n";
        let request = parse_request(req).unwrap();
        assert_eq!(request.key, "dGhlIHNhbXBsZSBub25jZQ==");
    }

    #[test]
    fn rejects_missing_version() {
        let req = b"GET / HTTP/1.1\r\n\
Upgrade: websocket\r\n\
Connection: Upgrade\r\n\
Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n";
        assert!(parse_request(req).is_err());
    }

    #[test]
    fn response_round_trips_with_verify() {
        let key = generate_key();
        let response_text = response_for(&key);
        let headers_only = response_text.trim_end_matches("\r\n\r\n");
        let response = parse_response(headers_only.as_bytes()).unwrap();
        verify_accept(&key, &response.accept).unwrap();
    }

    #[test]
    fn verify_rejects_mismatched_accept() {
        assert!(verify_accept("dGhlIHNhbXBsZSBub25jZQ==", "not-the-right-value").is_err());
    }
}
