//! The synchronous, one-thread-per-connection façade, supplementing the
//! reactor-based engine with the simple "just call read/write" surface the
//! original's `BlockingClient`/`BlockingServer` offer for callers that
//! don't want an event loop at all.

mod client;
mod server;

pub use client::Client;
pub use server::Server;
