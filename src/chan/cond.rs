//! The one-shot synchronisation primitive a [`select`](super::select) call
//! registers with every channel it touches.

use std::sync::{Condvar, Mutex};

#[derive(Clone, Copy)]
pub(crate) struct CondEvent {
    pub index: usize,
    pub closed: bool,
}

struct State {
    event: Option<CondEvent>,
    closed: bool,
}

/// A `SelectCond` accepts at most one real "ready" signal; once a select
/// call has drained it, the cond goes sticky-closed and rejects further
/// producers so that no two channels believe they won the same select.
pub(crate) struct SelectCond {
    state: Mutex<State>,
    wait_cond: Condvar,
    deliver_cond: Condvar,
}

impl SelectCond {
    pub fn new() -> Self {
        SelectCond {
            state: Mutex::new(State { event: None, closed: false }),
            wait_cond: Condvar::new(),
            deliver_cond: Condvar::new(),
        }
    }

    /// Non-blocking: signals `index` as ready unless the cond is already
    /// carrying an undelivered event or has closed.
    pub fn try_signal_ready(&self, index: usize) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.event.is_some() || state.closed {
            return false;
        }
        state.event = Some(CondEvent { index, closed: false });
        self.wait_cond.notify_one();
        true
    }

    /// Blocking: waits for any previously-delivered event to drain before
    /// installing this one. Returns false if the cond closed first.
    pub fn signal_ready(&self, index: usize) -> bool {
        let mut state = self.state.lock().unwrap();
        while state.event.is_some() && !state.closed {
            state = self.deliver_cond.wait(state).unwrap();
        }
        if state.closed {
            return false;
        }
        state.event = Some(CondEvent { index, closed: false });
        self.wait_cond.notify_one();
        true
    }

    /// Signals that the channel holding this registration closed.
    pub fn signal_close(&self, index: usize) -> bool {
        let mut state = self.state.lock().unwrap();
        while state.event.is_some() && !state.closed {
            state = self.deliver_cond.wait(state).unwrap();
        }
        if state.closed {
            return false;
        }
        state.event = Some(CondEvent { index, closed: true });
        self.wait_cond.notify_one();
        true
    }

    /// Blocks the select caller until an event arrives, then closes the
    /// cond if the event was a real (non-close) signal: a `SelectCond`
    /// only ever delivers one real event in its lifetime.
    pub fn wait_for_event_and_close(&self) -> CondEvent {
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(event) = state.event.take() {
                if !event.closed {
                    state.closed = true;
                }
                self.deliver_cond.notify_all();
                return event;
            }
            state = self.wait_cond.wait(state).unwrap();
        }
    }

    /// Closes the cond outright (used once `select` has already picked a
    /// winner via the immediate-readiness fast path and wants to reject
    /// any late producers without waiting for one).
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        self.deliver_cond.notify_all();
    }
}
