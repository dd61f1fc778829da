//! Frame stream -> whole application message reassembly. Grounded on
//! `core/src/core/websocket/MessageParser.cpp`.

use super::frame::{FrameParser, Opcode, ParseError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

#[derive(Debug)]
pub struct Message {
    pub kind: MessageKind,
    pub payload: Vec<u8>,
}

struct Fragment {
    kind: MessageKind,
    payload: Vec<u8>,
}

/// Holds a [`FrameParser`] plus the in-progress fragmented-message
/// accumulator. Control frames may interleave with a fragmented data
/// message without disturbing it; a non-continuation data opcode while
/// fragmenting is a protocol error.
pub struct MessageParser {
    frame_parser: FrameParser,
    max_message_size: u64,
    fragment: Option<Fragment>,
}

impl MessageParser {
    pub fn new(max_message_size: u64) -> Self {
        MessageParser {
            frame_parser: FrameParser::new(max_message_size),
            max_message_size,
            fragment: None,
        }
    }

    /// Feeds `bytes` to the frame parser, draining every frame that
    /// completes and folding each into a message. Returns the total bytes
    /// consumed (always `bytes.len()` unless a parse error short-circuits
    /// the feed) and any messages that completed along the way.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<(usize, Vec<Message>), ParseError> {
        let mut total = 0;
        let mut messages = Vec::new();
        loop {
            let n = self.frame_parser.consume(&bytes[total..])?;
            total += n;
            match self.frame_parser.frame() {
                Some(frame) => {
                    if let Some(message) = self.accept_frame(frame)? {
                        messages.push(message);
                    }
                }
                None => break,
            }
            if total >= bytes.len() {
                break;
            }
        }
        Ok((total, messages))
    }

    fn accept_frame(&mut self, frame: super::frame::Frame) -> Result<Option<Message>, ParseError> {
        let super::frame::Frame { opcode, fin, payload, .. } = frame;

        if opcode.is_control() {
            let kind = match opcode {
                Opcode::Close => MessageKind::Close,
                Opcode::Ping => MessageKind::Ping,
                Opcode::Pong => MessageKind::Pong,
                _ => unreachable!("non-control opcode classified as control"),
            };
            return Ok(Some(Message { kind, payload }));
        }

        if self.fragment.is_none() {
            let kind = match opcode {
                Opcode::Text => MessageKind::Text,
                Opcode::Binary => MessageKind::Binary,
                _ => {
                    return Err(ParseError::Protocol(crate::error::HumanError::new(format!(
                        "expected a data frame to start a message, got {opcode:?}"
                    ))))
                }
            };
            if fin {
                return Ok(Some(Message { kind, payload }));
            }
            self.fragment = Some(Fragment { kind, payload });
            return Ok(None);
        }

        if opcode != Opcode::Continuation {
            return Err(ParseError::Protocol(crate::error::HumanError::new(format!(
                "expected a continuation frame during fragmentation, got {opcode:?}"
            ))));
        }
        let fragment = self.fragment.as_mut().expect("checked above");
        fragment.payload.extend_from_slice(&payload);
        if fragment.payload.len() as u64 > self.max_message_size {
            self.fragment = None;
            return Err(ParseError::TooLarge);
        }
        if fin {
            let Fragment { kind, payload } = self.fragment.take().expect("checked above");
            Ok(Some(Message { kind, payload }))
        } else {
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::frame::encode;

    #[test]
    fn single_frame_text_message() {
        let mut parser = MessageParser::new(1 << 20);
        let bytes = encode(Opcode::Text, b"hello", false);
        let (n, messages) = parser.feed(&bytes).unwrap();
        assert_eq!(n, bytes.len());
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].kind, MessageKind::Text);
        assert_eq!(messages[0].payload, b"hello");
    }

    #[test]
    fn fragmented_text_with_interleaved_ping() {
        let mut parser = MessageParser::new(1 << 20);
        let mut bytes = Vec::new();
        bytes.extend(frame_bytes(Opcode::Text, b"Hel", false, false));
        bytes.extend(encode(Opcode::Ping, b"x", false));
        bytes.extend(frame_bytes(Opcode::Continuation, b"lo", true, false));
        let (n, messages) = parser.feed(&bytes).unwrap();
        assert_eq!(n, bytes.len());
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].kind, MessageKind::Ping);
        assert_eq!(messages[0].payload, b"x");
        assert_eq!(messages[1].kind, MessageKind::Text);
        assert_eq!(messages[1].payload, b"Hello");
    }

    #[test]
    fn continuation_without_start_is_protocol_error() {
        let mut parser = MessageParser::new(1 << 20);
        let bytes = frame_bytes(Opcode::Continuation, b"lo", true, false);
        match parser.feed(&bytes) {
            Err(ParseError::Protocol(_)) => {}
            other => panic!("expected protocol error, got {other:?}"),
        }
    }

    #[test]
    fn aggregate_fragment_size_enforced() {
        let mut parser = MessageParser::new(4);
        let mut bytes = Vec::new();
        bytes.extend(frame_bytes(Opcode::Text, b"abc", false, false));
        bytes.extend(frame_bytes(Opcode::Continuation, b"de", true, false));
        match parser.feed(&bytes) {
            Err(ParseError::TooLarge) => {}
            other => panic!("expected TooLarge, got {other:?}"),
        }
    }

    /// Like `encode` but lets the test set FIN explicitly for fragments.
    fn frame_bytes(opcode: Opcode, payload: &[u8], fin: bool, masked: bool) -> Vec<u8> {
        let mut bytes = encode(opcode, payload, masked);
        if fin {
            bytes[0] |= 0x80;
        } else {
            bytes[0] &= 0x7F;
        }
        bytes
    }
}
