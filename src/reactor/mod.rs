//! The asynchronous reactor: a single-OS-thread event loop owning
//! non-blocking sockets, dispatching accept/read/write completions to
//! per-source reactors, and delivering cross-thread events to logical
//! [`EventThread`]s pinned to the loop.
//!
//! Grounded on `core/include/core/EventLoop.h` (`EventLoop`/`EventSource`/
//! `Event`) and the `EventThread` type defined in
//! `core/src/core/linux/EventLoop.cpp`, realized on top of `mio`'s
//! `Poll`/`Registry`/`Token` (see `DESIGN.md` for why `mio` plays the role
//! of the concrete per-OS socket wrapper here).

mod threaded;

pub use threaded::ThreadedEventLoop;

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Registry, Token, Waker};

use crate::chan::Chan;
use crate::error::{errf, HumanError, Result};

pub type SourceId = usize;
pub type ThreadId = usize;

const WAKE_TOKEN: Token = Token(usize::MAX);

/// The event variants an [`EventThread`] can receive. `Custom` stands in
/// for a protocol-specific subclass (`NewConnection`, `MessageEvent`, ...);
/// concrete protocol layers define their own payload types and carry them
/// through this variant rather than growing this enum.
pub enum Event {
    Start,
    Read(Vec<u8>),
    Write(usize),
    Accept(TcpStream),
    Error(HumanError),
    Custom(Box<dyn Any + Send>),
}

/// A logical, cooperatively-scheduled thread pinned to one [`EventLoop`].
///
/// Every `handle` call for a given loop happens on that loop's single OS
/// thread, never concurrently with another `handle` call on the same loop
/// (a single-threaded cooperative scheduling model). `&self` plus interior
/// mutability (rather than `&mut self`) lets `Arc<dyn EventThread>` stand
/// in for a shared-ownership `EventThread` handle without fighting `Arc`'s
/// unsized-coercion rules around `Mutex`.
pub trait EventThread: Send + Sync {
    fn handle(&self, event: Event) -> Result<()>;
}

pub type EventThreadHandle = Arc<dyn EventThread>;

enum Socket {
    Listener(TcpListener),
    Stream(TcpStream),
}

struct WriteEntry {
    buf: Vec<u8>,
    offset: usize,
    reactor: EventThreadHandle,
}

struct SourceState {
    socket: Socket,
    write_queue: VecDeque<WriteEntry>,
    pending_read: Option<EventThreadHandle>,
    pending_accept: Option<EventThreadHandle>,
}

enum ControlMsg {
    Send { thread: ThreadId, event: Event },
    Stop,
}

struct Shared {
    registry: Registry,
    waker: Waker,
    control: Chan<ControlMsg>,
    sources: Mutex<HashMap<SourceId, SourceState>>,
    threads: Mutex<HashMap<ThreadId, EventThreadHandle>>,
    next_source_id: AtomicUsize,
    next_thread_id: AtomicUsize,
    stopped: AtomicBool,
}

/// A cheap, `Send + Sync` handle to an [`EventLoop`] that registration,
/// read/write/accept requests and cross-thread `send`s go through.
#[derive(Clone)]
pub struct EventLoopHandle {
    shared: Arc<Shared>,
}

/// A registered OS resource (an `EventSource`). The loop is the only thing
/// allowed to touch the raw socket; everything else goes through these
/// methods.
pub struct EventSocket {
    id: SourceId,
    loop_handle: EventLoopHandle,
}

impl EventSocket {
    pub fn id(&self) -> SourceId {
        self.id
    }

    /// Schedules a single pending read. The result arrives as `Event::Read`
    /// (or `Event::Error`) on `reactor`; reads on one source are serialised
    /// by construction — call this again after each completion to keep
    /// receiving.
    pub fn read(&self, reactor: EventThreadHandle) {
        self.loop_handle.arm_read(self.id, reactor);
    }

    /// Appends `bytes` to this source's outbound FIFO. Entries are written
    /// in submission order; `reactor` is notified with `Event::Write(n)`
    /// once each transfer (partial or full) completes.
    pub fn write(&self, reactor: EventThreadHandle, bytes: Vec<u8>) {
        self.loop_handle.enqueue_write(self.id, reactor, bytes);
    }

    /// Schedules a single pending accept on a listening source.
    pub fn accept(&self, reactor: EventThreadHandle) {
        self.loop_handle.arm_accept(self.id, reactor);
    }
}

impl Drop for EventSocket {
    fn drop(&mut self) {
        self.loop_handle.drop_source(self.id);
    }
}

impl EventLoopHandle {
    fn alloc_source_id(&self) -> SourceId {
        self.shared.next_source_id.fetch_add(1, Ordering::Relaxed)
    }

    fn register(&self, mut socket: Socket, interest: Interest) -> Result<EventSocket> {
        let id = self.alloc_source_id();
        let result = match &mut socket {
            Socket::Listener(l) => self.shared.registry.register(l, Token(id), interest),
            Socket::Stream(s) => self.shared.registry.register(s, Token(id), interest),
        };
        result.map_err(|e| errf!("failed to register socket with reactor: {e}"))?;
        let state = SourceState {
            socket,
            write_queue: VecDeque::new(),
            pending_read: None,
            pending_accept: None,
        };
        self.shared.sources.lock().unwrap().insert(id, state);
        Ok(EventSocket { id, loop_handle: self.clone() })
    }

    /// Registers a listening socket. Only readable (accept) readiness is
    /// relevant for a listener.
    pub fn register_listener(&self, listener: TcpListener) -> Result<EventSocket> {
        self.register(Socket::Listener(listener), Interest::READABLE)
    }

    /// Registers a connected stream for both read and write readiness.
    /// Sets `TCP_NODELAY`: a WebSocket connection sends many small frames
    /// and Nagle's algorithm would otherwise stall them.
    pub fn register_stream(&self, stream: TcpStream) -> Result<EventSocket> {
        if let Err(e) = stream.set_nodelay(true) {
            log::warn!("failed to set TCP_NODELAY: {e}");
        }
        self.register(Socket::Stream(stream), Interest::READABLE.add(Interest::WRITABLE))
    }

    fn arm_read(&self, id: SourceId, reactor: EventThreadHandle) {
        {
            let mut sources = self.shared.sources.lock().unwrap();
            match sources.get_mut(&id) {
                Some(state) => state.pending_read = Some(reactor),
                None => return,
            }
        }
        self.try_read(id);
    }

    fn arm_accept(&self, id: SourceId, reactor: EventThreadHandle) {
        {
            let mut sources = self.shared.sources.lock().unwrap();
            match sources.get_mut(&id) {
                Some(state) => state.pending_accept = Some(reactor),
                None => return,
            }
        }
        self.try_accept(id);
    }

    fn enqueue_write(&self, id: SourceId, reactor: EventThreadHandle, bytes: Vec<u8>) {
        let was_empty = {
            let mut sources = self.shared.sources.lock().unwrap();
            match sources.get_mut(&id) {
                Some(state) => {
                    let was_empty = state.write_queue.is_empty();
                    state.write_queue.push_back(WriteEntry { buf: bytes, offset: 0, reactor });
                    was_empty
                }
                None => return,
            }
        };
        if was_empty {
            self.try_write(id);
        }
    }

    fn deliver(reactor: &EventThreadHandle, event: Event) {
        if let Err(e) = reactor.handle(event) {
            log::warn!("event handler returned an error: {e}");
        }
    }

    fn try_read(&self, id: SourceId) {
        let reactor = match self.shared.sources.lock().unwrap().get(&id) {
            Some(state) => match &state.pending_read {
                Some(r) => r.clone(),
                None => return,
            },
            None => return,
        };
        let mut buf = [0u8; 64 * 1024];
        let outcome = {
            let mut sources = self.shared.sources.lock().unwrap();
            let state = match sources.get_mut(&id) {
                Some(s) => s,
                None => return,
            };
            match &mut state.socket {
                Socket::Stream(stream) => stream.read(&mut buf),
                Socket::Listener(_) => return,
            }
        };
        match outcome {
            Ok(n) => {
                if let Some(state) = self.shared.sources.lock().unwrap().get_mut(&id) {
                    state.pending_read = None;
                }
                Self::deliver(&reactor, Event::Read(buf[..n].to_vec()));
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                if let Some(state) = self.shared.sources.lock().unwrap().get_mut(&id) {
                    state.pending_read = None;
                }
                Self::deliver(&reactor, Event::Error(e.into()));
            }
        }
    }

    fn try_accept(&self, id: SourceId) {
        let reactor = match self.shared.sources.lock().unwrap().get(&id) {
            Some(state) => match &state.pending_accept {
                Some(r) => r.clone(),
                None => return,
            },
            None => return,
        };
        let outcome = {
            let sources = self.shared.sources.lock().unwrap();
            match sources.get(&id) {
                Some(state) => match &state.socket {
                    Socket::Listener(listener) => listener.accept(),
                    Socket::Stream(_) => return,
                },
                None => return,
            }
        };
        match outcome {
            Ok((stream, _addr)) => {
                if let Some(state) = self.shared.sources.lock().unwrap().get_mut(&id) {
                    state.pending_accept = None;
                }
                Self::deliver(&reactor, Event::Accept(stream));
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                if let Some(state) = self.shared.sources.lock().unwrap().get_mut(&id) {
                    state.pending_accept = None;
                }
                Self::deliver(&reactor, Event::Error(e.into()));
            }
        }
    }

    fn try_write(&self, id: SourceId) {
        let (reactor, outcome) = {
            let mut sources = self.shared.sources.lock().unwrap();
            let state = match sources.get_mut(&id) {
                Some(s) => s,
                None => return,
            };
            let entry = match state.write_queue.front_mut() {
                Some(e) => e,
                None => return,
            };
            let stream = match &mut state.socket {
                Socket::Stream(s) => s,
                Socket::Listener(_) => return,
            };
            let result = stream.write(&entry.buf[entry.offset..]);
            if let Ok(n) = result {
                entry.offset += n;
            }
            (entry.reactor.clone(), result)
        };
        match outcome {
            Ok(n) => {
                Self::deliver(&reactor, Event::Write(n));
                let drained = {
                    let sources = self.shared.sources.lock().unwrap();
                    sources
                        .get(&id)
                        .and_then(|s| s.write_queue.front())
                        .map(|e| e.offset >= e.buf.len())
                        .unwrap_or(false)
                };
                if drained {
                    if let Some(state) = self.shared.sources.lock().unwrap().get_mut(&id) {
                        state.write_queue.pop_front();
                    }
                    self.try_write(id);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                if let Some(state) = self.shared.sources.lock().unwrap().get_mut(&id) {
                    state.write_queue.pop_front();
                }
                Self::deliver(&reactor, Event::Error(e.into()));
            }
        }
    }

    fn drop_source(&self, id: SourceId) {
        let mut sources = self.shared.sources.lock().unwrap();
        if let Some(mut state) = sources.remove(&id) {
            let _ = match &mut state.socket {
                Socket::Stream(s) => {
                    let _ = self.shared.registry.deregister(s);
                    s.shutdown(Shutdown::Both)
                }
                Socket::Listener(l) => {
                    let _ = self.shared.registry.deregister(l);
                    Ok(())
                }
            };
        }
    }

    /// Registers a logical thread with the loop, then synthesises its
    /// `Start` event. Safe to call from any thread, including from inside
    /// another thread's `handle`.
    pub fn add_thread(&self, thread: EventThreadHandle) -> ThreadId {
        let id = self.shared.next_thread_id.fetch_add(1, Ordering::Relaxed);
        self.shared.threads.lock().unwrap().insert(id, thread.clone());
        Self::deliver(&thread, Event::Start);
        id
    }

    /// Stops receiving further cross-thread events for `id`; events already
    /// queued before the call still run.
    pub fn remove_thread(&self, id: ThreadId) {
        self.shared.threads.lock().unwrap().remove(&id);
    }

    /// Enqueues `event` for delivery to `thread` on the loop's own OS
    /// thread, FIFO per sender. Unlike register/read/write/accept (which
    /// are safe to call synchronously because in practice they only ever
    /// run already-on-the-loop-thread or before `run()` starts), `send`
    /// must work from genuinely foreign threads (e.g. a thread-pool
    /// worker posting a result back), so it is funnelled through the
    /// control channel and a `Waker` rather than touched directly.
    pub fn send(&self, thread: ThreadId, event: Event) {
        let _ = self.shared.control.send(ControlMsg::Send { thread, event });
        let _ = self.shared.waker.wake();
    }

    /// Requests the loop to stop; cancels all scheduled ops and drains.
    pub fn stop(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        let _ = self.shared.control.send(ControlMsg::Stop);
        let _ = self.shared.waker.wake();
    }
}

/// Owns the `mio::Poll` and drives the reactor loop on a single OS thread.
pub struct EventLoop {
    poll: Poll,
    shared: Arc<Shared>,
}

impl EventLoop {
    pub fn new() -> Result<Self> {
        let poll = Poll::new().map_err(|e| errf!("failed to create reactor: {e}"))?;
        let registry =
            poll.registry().try_clone().map_err(|e| errf!("failed to clone registry: {e}"))?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)
            .map_err(|e| errf!("failed to create reactor waker: {e}"))?;
        let shared = Arc::new(Shared {
            registry,
            waker,
            control: Chan::new(1024),
            sources: Mutex::new(HashMap::new()),
            threads: Mutex::new(HashMap::new()),
            next_source_id: AtomicUsize::new(0),
            next_thread_id: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
        });
        Ok(EventLoop { poll, shared })
    }

    pub fn handle(&self) -> EventLoopHandle {
        EventLoopHandle { shared: self.shared.clone() }
    }

    fn drain_control(&self) {
        while let Ok(msg) = self.shared.control.try_recv() {
            match msg {
                ControlMsg::Send { thread, event } => {
                    let reactor = self.shared.threads.lock().unwrap().get(&thread).cloned();
                    if let Some(reactor) = reactor {
                        EventLoopHandle::deliver(&reactor, event);
                    }
                }
                ControlMsg::Stop => {
                    self.shared.stopped.store(true, Ordering::SeqCst);
                }
            }
        }
    }

    /// Runs the reactor until [`EventLoopHandle::stop`] is called.
    pub fn run(&mut self) -> Result<()> {
        let handle = self.handle();
        let mut events = Events::with_capacity(1024);
        loop {
            self.poll.poll(&mut events, None).map_err(|e| errf!("reactor poll failed: {e}"))?;
            for event in events.iter() {
                if event.token() == WAKE_TOKEN {
                    self.drain_control();
                    continue;
                }
                let id = event.token().0;
                if event.is_readable() {
                    handle.try_read(id);
                    handle.try_accept(id);
                }
                if event.is_writable() {
                    handle.try_write(id);
                }
            }
            if self.shared.stopped.load(Ordering::SeqCst) {
                self.shared.sources.lock().unwrap().clear();
                self.shared.threads.lock().unwrap().clear();
                return Ok(());
            }
        }
    }

    /// Runs until `stop()` or `timeout` elapses without work, whichever
    /// comes first. Mainly useful for tests that want a bounded run.
    pub fn run_for(&mut self, timeout: Duration) -> Result<()> {
        let handle = self.handle();
        let mut events = Events::with_capacity(1024);
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return Ok(());
            }
            self.poll
                .poll(&mut events, Some(remaining))
                .map_err(|e| errf!("reactor poll failed: {e}"))?;
            for event in events.iter() {
                if event.token() == WAKE_TOKEN {
                    self.drain_control();
                    continue;
                }
                let id = event.token().0;
                if event.is_readable() {
                    handle.try_read(id);
                    handle.try_accept(id);
                }
                if event.is_writable() {
                    handle.try_write(id);
                }
            }
            if self.shared.stopped.load(Ordering::SeqCst) {
                self.shared.sources.lock().unwrap().clear();
                self.shared.threads.lock().unwrap().clear();
                return Ok(());
            }
        }
    }
}
