//! `corio`: a CSP-style channel/select/thread-pool runtime, an asynchronous
//! single-threaded reactor built on `mio`, and an RFC 6455 WebSocket engine
//! (asynchronous and blocking) layered on top of it.
//!
//! See each module's docs for the part of the stack it covers:
//! [`chan`] (channels + select), [`pool`] (thread pool + execution
//! queues), [`reactor`] (the event loop), [`ws`] (the WebSocket protocol
//! engine), [`blocking`] (the synchronous client/server façade).

pub mod blocking;
pub mod chan;
pub mod error;
pub mod pool;
pub mod reactor;
pub mod ws;
