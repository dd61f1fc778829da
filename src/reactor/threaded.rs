//! `ThreadedEventLoop`: a parent multi-loop dispatcher — one OS thread per
//! child [`EventLoop`], round-robin distribution of new sources across
//! them via [`next_loop`].

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};

use crate::error::Result;

use super::{EventLoop, EventLoopHandle};

pub struct ThreadedEventLoop {
    loops: Vec<EventLoopHandle>,
    join_handles: Vec<JoinHandle<Result<()>>>,
    next: AtomicUsize,
}

impl ThreadedEventLoop {
    /// Spawns `count` event loops, each on its own OS thread.
    pub fn new(count: usize) -> Result<Self> {
        let count = count.max(1);
        let mut loops = Vec::with_capacity(count);
        let mut join_handles = Vec::with_capacity(count);
        for _ in 0..count {
            let mut event_loop = EventLoop::new()?;
            loops.push(event_loop.handle());
            join_handles.push(thread::spawn(move || event_loop.run()));
        }
        Ok(ThreadedEventLoop { loops, join_handles, next: AtomicUsize::new(0) })
    }

    /// Picks the next loop in round-robin order, balancing newly
    /// registered sockets across every child loop.
    pub fn next_loop(&self) -> &EventLoopHandle {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        &self.loops[n % self.loops.len()]
    }

    pub fn loops(&self) -> &[EventLoopHandle] {
        &self.loops
    }

    /// Forwards to every child loop's `stop()`.
    pub fn stop_all(&self) {
        for l in &self.loops {
            l.stop();
        }
    }
}

impl Drop for ThreadedEventLoop {
    fn drop(&mut self) {
        self.stop_all();
        for handle in self.join_handles.drain(..) {
            let _ = handle.join();
        }
    }
}
