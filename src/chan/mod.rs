//! A CSP-style channel: buffered (ring) or unbuffered (rendezvous),
//! closable, with a paired [`select`](select::select) mechanism.
//!
//! Grounded on `core/include/core/Chan.h`. Unlike `std::sync::mpsc` this is
//! a single cloneable handle (send/recv/close all live on one `Chan<T>`)
//! rather than a split `Sender`/`Receiver` pair, matching the Go-style API
//! the original exposes.

mod cond;
pub mod select;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};

use cond::SelectCond;

/// Returned when an operation targets a channel with no open peer left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Closed;

/// `send` failed because the channel is closed; the value is handed back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendError<T>(pub T);

/// `try_send` outcomes: the buffer was full (or no receiver was ready for
/// an unbuffered handoff), or the channel is closed.
#[derive(Debug)]
pub enum TrySendError<T> {
    Full(T),
    Closed(T),
}

/// `try_recv` outcomes: nothing was available, or the channel is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryRecvError {
    Empty,
    Closed,
}

type SelectMap = HashMap<usize, (Arc<SelectCond>, usize)>;

struct State<T> {
    closed: bool,
    buffer: VecDeque<T>,
    /// Unbuffered handoff slot: `Some` while a writer is parked waiting for
    /// a matching reader to take the value.
    slot: Option<T>,
    read_waiting: usize,
    write_waiting: usize,
    read_selects: SelectMap,
    write_selects: SelectMap,
}

struct Inner<T> {
    capacity: usize,
    state: Mutex<State<T>>,
    read_cond: Condvar,
    write_cond: Condvar,
    /// Serializes concurrent receivers on the unbuffered path so exactly
    /// one recv call claims the handoff slot at a time.
    read_mutex: Mutex<()>,
    /// Serializes concurrent senders on the unbuffered path the same way.
    write_mutex: Mutex<()>,
}

/// A shared channel handle. Cloning shares the same underlying channel
/// (cheap `Arc` bump), matching the original's `Shared<Chan<T>>` handles.
pub struct Chan<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Chan<T> {
    fn clone(&self) -> Self {
        Chan { inner: self.inner.clone() }
    }
}

fn insert_select(map: &mut SelectMap, cond: &Arc<SelectCond>, index: usize) {
    map.insert(Arc::as_ptr(cond) as usize, (cond.clone(), index));
}

/// Picks one registered `SelectCond` and signals it ready, removing it from
/// `map`. Tries every registration once without blocking (in random order);
/// if none accept immediately, falls back to blocking delivery, dropping
/// any registration that turns out to be stale (already closed) along the
/// way until one accepts or the map empties.
fn signal_select_and_remove(map: &mut SelectMap) {
    if map.is_empty() {
        return;
    }
    let keys: Vec<usize> = map.keys().copied().collect();
    let n = keys.len();
    let offset = rand::random_range(0..n);
    for i in 0..n {
        let key = keys[(i + offset) % n];
        let (cond, index) = map.get(&key).unwrap().clone();
        if cond.try_signal_ready(index) {
            map.remove(&key);
            return;
        }
    }
    loop {
        let key = match map.keys().next().copied() {
            Some(key) => key,
            None => return,
        };
        let (cond, index) = map.get(&key).unwrap().clone();
        map.remove(&key);
        if cond.signal_ready(index) {
            return;
        }
    }
}

fn close_select_map(map: &mut SelectMap) {
    for (_, (cond, index)) in map.drain() {
        cond.signal_close(index);
    }
}

impl<T> Chan<T> {
    /// `capacity == 0` creates an unbuffered (rendezvous) channel; any
    /// positive capacity creates a ring-buffered channel of that size.
    pub fn new(capacity: usize) -> Self {
        Chan {
            inner: Arc::new(Inner {
                capacity,
                state: Mutex::new(State {
                    closed: false,
                    buffer: VecDeque::with_capacity(capacity),
                    slot: None,
                    read_waiting: 0,
                    write_waiting: 0,
                    read_selects: HashMap::new(),
                    write_selects: HashMap::new(),
                }),
                read_cond: Condvar::new(),
                write_cond: Condvar::new(),
                read_mutex: Mutex::new(()),
                write_mutex: Mutex::new(()),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Number of buffered values (always 0 for an unbuffered channel).
    pub fn count(&self) -> usize {
        self.inner.state.lock().unwrap().buffer.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().unwrap().closed
    }

    /// Closes the channel, waking every blocked and registered party.
    /// Returns `false` if the channel was already closed.
    pub fn close(&self) -> bool {
        let mut state = self.inner.state.lock().unwrap();
        if state.closed {
            return false;
        }
        state.closed = true;
        self.inner.read_cond.notify_all();
        self.inner.write_cond.notify_all();
        close_select_map(&mut state.read_selects);
        close_select_map(&mut state.write_selects);
        true
    }

    pub fn send(&self, value: T) -> Result<(), SendError<T>> {
        if self.inner.capacity > 0 {
            self.send_buffered(value)
        } else {
            self.send_unbuffered(value)
        }
    }

    pub fn recv(&self) -> Result<T, Closed> {
        if self.inner.capacity > 0 {
            self.recv_buffered()
        } else {
            self.recv_unbuffered()
        }
    }

    pub fn try_send(&self, value: T) -> Result<(), TrySendError<T>> {
        self.try_send_with_cond(value, None)
    }

    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        self.try_recv_with_cond(None)
    }

    fn send_buffered(&self, value: T) -> Result<(), SendError<T>> {
        let mut state = self.inner.state.lock().unwrap();
        loop {
            if state.closed {
                return Err(SendError(value));
            }
            if state.buffer.len() < self.inner.capacity {
                break;
            }
            state.write_waiting += 1;
            state = self.inner.write_cond.wait(state).unwrap();
            state.write_waiting -= 1;
        }
        state.buffer.push_back(value);
        if state.read_waiting > 0 {
            self.inner.read_cond.notify_one();
        } else if !state.read_selects.is_empty() {
            signal_select_and_remove(&mut state.read_selects);
        }
        Ok(())
    }

    fn recv_buffered(&self) -> Result<T, Closed> {
        let mut state = self.inner.state.lock().unwrap();
        loop {
            if let Some(value) = state.buffer.pop_front() {
                if state.write_waiting > 0 {
                    self.inner.write_cond.notify_one();
                } else if !state.write_selects.is_empty() {
                    signal_select_and_remove(&mut state.write_selects);
                }
                return Ok(value);
            }
            if state.closed {
                return Err(Closed);
            }
            state.read_waiting += 1;
            state = self.inner.read_cond.wait(state).unwrap();
            state.read_waiting -= 1;
        }
    }

    fn send_unbuffered(&self, value: T) -> Result<(), SendError<T>> {
        let _write_guard = self.inner.write_mutex.lock().unwrap();
        let mut state = self.inner.state.lock().unwrap();
        if state.closed {
            return Err(SendError(value));
        }
        state.slot = Some(value);
        if state.read_waiting > 0 {
            self.inner.read_cond.notify_one();
        } else if !state.read_selects.is_empty() {
            signal_select_and_remove(&mut state.read_selects);
        }
        while state.slot.is_some() && !state.closed {
            state = self.inner.write_cond.wait(state).unwrap();
        }
        match state.slot.take() {
            // the channel closed before any reader claimed the handoff
            Some(value) => Err(SendError(value)),
            None => Ok(()),
        }
    }

    fn recv_unbuffered(&self) -> Result<T, Closed> {
        let _read_guard = self.inner.read_mutex.lock().unwrap();
        let mut state = self.inner.state.lock().unwrap();
        while state.slot.is_none() && !state.closed {
            state.read_waiting += 1;
            state = self.inner.read_cond.wait(state).unwrap();
            state.read_waiting -= 1;
        }
        match state.slot.take() {
            Some(value) => {
                self.inner.write_cond.notify_one();
                if !state.write_selects.is_empty() {
                    signal_select_and_remove(&mut state.write_selects);
                }
                Ok(value)
            }
            None => Err(Closed),
        }
    }

    pub(crate) fn try_send_with_cond(
        &self,
        value: T,
        reg: Option<(&Arc<SelectCond>, usize)>,
    ) -> Result<(), TrySendError<T>> {
        if self.inner.capacity > 0 {
            self.try_send_buffered(value, reg)
        } else {
            self.try_send_unbuffered(value, reg)
        }
    }

    fn try_send_buffered(
        &self,
        value: T,
        reg: Option<(&Arc<SelectCond>, usize)>,
    ) -> Result<(), TrySendError<T>> {
        let mut state = self.inner.state.lock().unwrap();
        if state.closed {
            return Err(TrySendError::Closed(value));
        }
        if state.buffer.len() == self.inner.capacity {
            if let Some((cond, index)) = reg {
                insert_select(&mut state.write_selects, cond, index);
            }
            return Err(TrySendError::Full(value));
        }
        state.buffer.push_back(value);
        if state.read_waiting > 0 {
            self.inner.read_cond.notify_one();
        } else if !state.read_selects.is_empty() {
            signal_select_and_remove(&mut state.read_selects);
        }
        if let Some((cond, index)) = reg {
            insert_select(&mut state.write_selects, cond, index);
        }
        Ok(())
    }

    /// Unbuffered try-send. The source blocks unconditionally here even
    /// though the call is documented as non-blocking; that is a known bug
    /// in the original (see DESIGN.md). This instead only completes the
    /// handoff when a receiver is already parked waiting for one — if none
    /// is, it registers a writer-side select cond and returns immediately.
    fn try_send_unbuffered(
        &self,
        value: T,
        reg: Option<(&Arc<SelectCond>, usize)>,
    ) -> Result<(), TrySendError<T>> {
        let guard = match self.inner.write_mutex.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                if let Some((cond, index)) = reg {
                    let mut state = self.inner.state.lock().unwrap();
                    insert_select(&mut state.write_selects, cond, index);
                }
                return Err(TrySendError::Full(value));
            }
        };
        let mut state = self.inner.state.lock().unwrap();
        if state.closed {
            return Err(TrySendError::Closed(value));
        }
        // A registered select reader is just as "already parked" as a
        // blocking recv() — both committed to waiting before this call
        // arrived, so either counts as an immediate pairing.
        if state.read_waiting == 0 && state.read_selects.is_empty() {
            if let Some((cond, index)) = reg {
                insert_select(&mut state.write_selects, cond, index);
            }
            return Err(TrySendError::Full(value));
        }
        state.slot = Some(value);
        if state.read_waiting > 0 {
            self.inner.read_cond.notify_one();
        } else {
            signal_select_and_remove(&mut state.read_selects);
        }
        while state.slot.is_some() && !state.closed {
            state = self.inner.write_cond.wait(state).unwrap();
        }
        if let Some((cond, index)) = reg {
            insert_select(&mut state.write_selects, cond, index);
        }
        let outcome = match state.slot.take() {
            Some(value) => Err(TrySendError::Closed(value)),
            None => Ok(()),
        };
        drop(state);
        drop(guard);
        outcome
    }

    pub(crate) fn try_recv_with_cond(
        &self,
        reg: Option<(&Arc<SelectCond>, usize)>,
    ) -> Result<T, TryRecvError> {
        if self.inner.capacity > 0 {
            self.try_recv_buffered(reg)
        } else {
            self.try_recv_unbuffered(reg)
        }
    }

    fn try_recv_buffered(
        &self,
        reg: Option<(&Arc<SelectCond>, usize)>,
    ) -> Result<T, TryRecvError> {
        let mut state = self.inner.state.lock().unwrap();
        let value = match state.buffer.pop_front() {
            Some(value) => value,
            None => {
                let err = if state.closed { TryRecvError::Closed } else { TryRecvError::Empty };
                if !state.closed {
                    if let Some((cond, index)) = reg {
                        insert_select(&mut state.read_selects, cond, index);
                    }
                }
                return Err(err);
            }
        };
        if state.write_waiting > 0 {
            self.inner.write_cond.notify_one();
        } else if !state.write_selects.is_empty() {
            signal_select_and_remove(&mut state.write_selects);
        }
        if let Some((cond, index)) = reg {
            insert_select(&mut state.read_selects, cond, index);
        }
        Ok(value)
    }

    fn try_recv_unbuffered(
        &self,
        reg: Option<(&Arc<SelectCond>, usize)>,
    ) -> Result<T, TryRecvError> {
        let _read_guard = self.inner.read_mutex.lock().unwrap();
        let mut state = self.inner.state.lock().unwrap();
        if state.closed {
            return Err(TryRecvError::Closed);
        }
        if state.slot.is_none() {
            if let Some((cond, index)) = reg {
                insert_select(&mut state.read_selects, cond, index);
            }
            return Err(TryRecvError::Empty);
        }
        let value = state.slot.take().unwrap();
        self.inner.write_cond.notify_one();
        if !state.write_selects.is_empty() {
            signal_select_and_remove(&mut state.write_selects);
        }
        if let Some((cond, index)) = reg {
            insert_select(&mut state.read_selects, cond, index);
        }
        Ok(value)
    }

    pub(crate) fn remove_read_select(&self, cond: &Arc<SelectCond>) {
        let mut state = self.inner.state.lock().unwrap();
        state.read_selects.remove(&(Arc::as_ptr(cond) as usize));
    }

    pub(crate) fn remove_write_select(&self, cond: &Arc<SelectCond>) {
        let mut state = self.inner.state.lock().unwrap();
        state.write_selects.remove(&(Arc::as_ptr(cond) as usize));
    }
}

/// Consumes the channel into a blocking iterator over received values,
/// ending when the channel closes and drains.
impl<T> Iterator for Chan<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.recv().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn buffered_fifo_order() {
        let chan = Chan::new(4);
        chan.send(1).unwrap();
        chan.send(2).unwrap();
        chan.send(3).unwrap();
        assert_eq!(chan.recv(), Ok(1));
        assert_eq!(chan.recv(), Ok(2));
        assert_eq!(chan.recv(), Ok(3));
    }

    #[test]
    fn buffered_try_send_full() {
        let chan = Chan::new(1);
        chan.send(1).unwrap();
        match chan.try_send(2) {
            Err(TrySendError::Full(2)) => {}
            other => panic!("expected Full(2), got {other:?}"),
        }
    }

    #[test]
    fn close_drains_then_errors() {
        let chan = Chan::new(2);
        chan.send(10).unwrap();
        chan.close();
        assert_eq!(chan.recv(), Ok(10));
        assert_eq!(chan.recv(), Err(Closed));
    }

    #[test]
    fn send_after_close_fails() {
        let chan = Chan::new(1);
        chan.close();
        match chan.send(5) {
            Err(SendError(5)) => {}
            other => panic!("expected SendError(5), got {other:?}"),
        }
    }

    #[test]
    fn unbuffered_rendezvous() {
        let chan = Chan::new(0);
        let sender = chan.clone();
        let handle = thread::spawn(move || sender.send(42).unwrap());
        thread::sleep(Duration::from_millis(20));
        assert_eq!(chan.recv(), Ok(42));
        handle.join().unwrap();
    }

    #[test]
    fn unbuffered_try_send_without_receiver_is_empty() {
        let chan = Chan::new(0);
        match chan.try_send(1) {
            Err(TrySendError::Full(1)) => {}
            other => panic!("expected Full(1), got {other:?}"),
        }
    }

    #[test]
    fn try_recv_empty_on_fresh_buffered_channel() {
        let chan: Chan<i32> = Chan::new(2);
        assert_eq!(chan.try_recv(), Err(TryRecvError::Empty));
    }

    #[test]
    fn unbuffered_try_send_pairs_with_a_parked_select_reader() {
        use super::select::{recv, select};
        use std::sync::atomic::{AtomicBool, Ordering};

        let chan: Chan<i32> = Chan::new(0);
        let reader_ready = Arc::new(AtomicBool::new(false));
        let got = Arc::new(Mutex::new(None));

        let reader_chan = chan.clone();
        let reader_ready2 = reader_ready.clone();
        let got2 = got.clone();
        let handle = thread::spawn(move || {
            reader_ready2.store(true, Ordering::SeqCst);
            select(vec![recv(&reader_chan, |v| *got2.lock().unwrap() = Some(v))]);
        });

        while !reader_ready.load(Ordering::SeqCst) {
            thread::yield_now();
        }
        // Give the reader a chance to register its SelectCond before the
        // non-blocking send is attempted.
        thread::sleep(Duration::from_millis(20));

        let mut sent = false;
        for _ in 0..200 {
            match chan.try_send(7) {
                Ok(()) => {
                    sent = true;
                    break;
                }
                Err(TrySendError::Full(_)) => thread::sleep(Duration::from_millis(5)),
                other => panic!("unexpected try_send result: {other:?}"),
            }
        }
        assert!(sent, "try_send never paired with the parked select reader");
        handle.join().unwrap();
        assert_eq!(*got.lock().unwrap(), Some(7));
    }
}
