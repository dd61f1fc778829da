//! The five configuration knobs, with their documented defaults.
//! `ServerOptions` and `ClientOptions` carry identical fields — kept as
//! two names (rather than one generic struct) so call sites read naturally,
//! but sharing one implementation since there is nothing server- or
//! client-specific about any of them.

/// `max_handshake_size` default: 1 KiB.
pub const DEFAULT_MAX_HANDSHAKE_SIZE: usize = 1024;
/// `max_message_size` default: 64 MiB.
pub const DEFAULT_MAX_MESSAGE_SIZE: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub max_handshake_size: usize,
    pub max_message_size: u64,
    pub handle_ping: bool,
    pub handle_pong: bool,
    pub handle_close: bool,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        ConnectionOptions {
            max_handshake_size: DEFAULT_MAX_HANDSHAKE_SIZE,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            handle_ping: false,
            handle_pong: false,
            handle_close: false,
        }
    }
}

pub type ServerOptions = ConnectionOptions;
pub type ClientOptions = ConnectionOptions;
