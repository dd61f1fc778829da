//! Randomized multi-way `select` over channel sends/receives, with an
//! optional non-blocking `default` case.
//!
//! Grounded on `core/include/core/Chan.h`'s `ReadCase`/`WriteCase`/
//! `DefaultCase`/`Select` classes. The original dispatches over those three
//! concrete case types through a `SelectCaseDesc` of function pointers;
//! here a `SelectCase` trait plus `dyn` dispatch plays the same role.

use std::sync::Arc;

use super::cond::SelectCond;
use super::{Chan, TryRecvError, TrySendError};

enum CaseOutcome {
    Ready,
    Empty,
    Closed,
}

/// One arm of a `select` call.
pub trait SelectCase {
    fn is_default(&self) -> bool {
        false
    }

    /// Attempts this case once without blocking. When `reg` is given and
    /// the case can't complete immediately, registers for a later wake.
    fn try_once(&mut self, reg: Option<(&Arc<SelectCond>, usize)>) -> CaseOutcome;

    /// Runs the full blocking form of this case. Only called after a
    /// `SelectCond` has already signalled this case ready, so it cannot
    /// observe `Empty` — the channel guarantees forward progress once it
    /// removes a registration and signals it.
    fn commit(&mut self) -> CaseOutcome;

    fn remove_cond(&mut self, cond: &Arc<SelectCond>);
}

struct RecvCase<'a, T, F> {
    chan: &'a Chan<T>,
    handler: Option<F>,
}

impl<'a, T, F: FnOnce(T)> SelectCase for RecvCase<'a, T, F> {
    fn try_once(&mut self, reg: Option<(&Arc<SelectCond>, usize)>) -> CaseOutcome {
        match self.chan.try_recv_with_cond(reg) {
            Ok(value) => {
                (self.handler.take().expect("case handler already consumed"))(value);
                CaseOutcome::Ready
            }
            Err(TryRecvError::Empty) => CaseOutcome::Empty,
            Err(TryRecvError::Closed) => CaseOutcome::Closed,
        }
    }

    fn commit(&mut self) -> CaseOutcome {
        match self.chan.recv() {
            Ok(value) => {
                (self.handler.take().expect("case handler already consumed"))(value);
                CaseOutcome::Ready
            }
            Err(super::Closed) => CaseOutcome::Closed,
        }
    }

    fn remove_cond(&mut self, cond: &Arc<SelectCond>) {
        self.chan.remove_read_select(cond);
    }
}

struct SendCase<'a, T, F> {
    chan: &'a Chan<T>,
    value: Option<T>,
    handler: Option<F>,
}

impl<'a, T, F: FnOnce()> SelectCase for SendCase<'a, T, F> {
    fn try_once(&mut self, reg: Option<(&Arc<SelectCond>, usize)>) -> CaseOutcome {
        let value = self.value.take().expect("case value already consumed");
        match self.chan.try_send_with_cond(value, reg) {
            Ok(()) => {
                (self.handler.take().expect("case handler already consumed"))();
                CaseOutcome::Ready
            }
            Err(TrySendError::Full(value)) => {
                self.value = Some(value);
                CaseOutcome::Empty
            }
            Err(TrySendError::Closed(_)) => CaseOutcome::Closed,
        }
    }

    fn commit(&mut self) -> CaseOutcome {
        let value = self.value.take().expect("case value already consumed");
        match self.chan.send(value) {
            Ok(()) => {
                (self.handler.take().expect("case handler already consumed"))();
                CaseOutcome::Ready
            }
            Err(super::SendError(_)) => CaseOutcome::Closed,
        }
    }

    fn remove_cond(&mut self, cond: &Arc<SelectCond>) {
        self.chan.remove_write_select(cond);
    }
}

struct DefaultCase<F> {
    handler: Option<F>,
}

impl<F: FnOnce()> SelectCase for DefaultCase<F> {
    fn is_default(&self) -> bool {
        true
    }

    fn try_once(&mut self, _reg: Option<(&Arc<SelectCond>, usize)>) -> CaseOutcome {
        (self.handler.take().expect("default handler already consumed"))();
        CaseOutcome::Ready
    }

    fn commit(&mut self) -> CaseOutcome {
        unreachable!("default case never participates in the blocking phase")
    }

    fn remove_cond(&mut self, _cond: &Arc<SelectCond>) {}
}

/// Builds a receive case: `handler` runs with the received value once this
/// case wins.
pub fn recv<'a, T, F: FnOnce(T) + 'a>(chan: &'a Chan<T>, handler: F) -> Box<dyn SelectCase + 'a> {
    Box::new(RecvCase { chan, handler: Some(handler) })
}

/// Builds a send case: `value` is sent and `handler` runs once this case
/// wins.
pub fn send<'a, T: 'a, F: FnOnce() + 'a>(
    chan: &'a Chan<T>,
    value: T,
    handler: F,
) -> Box<dyn SelectCase + 'a> {
    Box::new(SendCase { chan, value: Some(value), handler: Some(handler) })
}

/// Builds the default case: runs immediately if no other case is ready
/// without blocking. A `select` call may have at most one of these.
pub fn default<'a, F: FnOnce() + 'a>(handler: F) -> Box<dyn SelectCase + 'a> {
    Box::new(DefaultCase { handler: Some(handler) })
}

/// Evaluates `cases` and runs exactly one winning handler, per the ready
/// set picked uniformly at random when more than one case is immediately
/// ready. Blocks until a case becomes ready unless a `default` case is
/// present, in which case it runs immediately when nothing else is ready.
/// Returns without running any handler if every non-default case closes.
/// A uniformly random permutation of `0..n` (Fisher-Yates). A single random
/// rotation offset is not enough: when only some cases are ready, the first
/// one a rotation hits is biased toward whichever ready case sits right
/// after the biggest gap, not drawn uniformly from the ready set. A full
/// shuffle is what Go's `runtime.selectgo` does to its `pollorder` for the
/// same reason — with a uniformly random permutation, the first-occurring
/// element of any fixed subset is itself uniform over that subset.
fn shuffled_order(n: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..n).collect();
    for i in (1..n).rev() {
        let j = rand::random_range(0..=i);
        order.swap(i, j);
    }
    order
}

pub fn select(mut cases: Vec<Box<dyn SelectCase + '_>>) {
    let n = cases.len();
    if n == 0 {
        return;
    }
    let default_index = cases.iter().position(|case| case.is_default());
    let order = shuffled_order(n);

    if let Some(default_index) = default_index {
        for &idx in &order {
            if idx == default_index {
                continue;
            }
            if matches!(cases[idx].try_once(None), CaseOutcome::Ready) {
                return;
            }
        }
        cases[default_index].try_once(None);
        return;
    }

    let mut cond = Arc::new(SelectCond::new());
    let mut registered = vec![false; n];
    let mut alive = n;
    for &idx in &order {
        match cases[idx].try_once(Some((&cond, idx))) {
            CaseOutcome::Ready => {
                cond.close();
                for (idx2, &reg) in registered.iter().enumerate() {
                    if reg {
                        cases[idx2].remove_cond(&cond);
                    }
                }
                return;
            }
            CaseOutcome::Closed => alive -= 1,
            CaseOutcome::Empty => registered[idx] = true,
        }
    }

    while alive > 0 {
        let event = cond.wait_for_event_and_close();
        if event.closed {
            registered[event.index] = false;
            alive -= 1;
            continue;
        }
        registered[event.index] = false;
        match cases[event.index].commit() {
            CaseOutcome::Ready => {
                for (idx, &reg) in registered.iter().enumerate() {
                    if reg {
                        cases[idx].remove_cond(&cond);
                    }
                }
                return;
            }
            CaseOutcome::Closed => {
                alive -= 1;
                // `cond` just went sticky-closed from draining a real event,
                // even though that event's value turned out to be stolen by
                // someone else before `commit` ran. Every other case still
                // in `registered` is now parked on a cond that can never
                // signal again, so move them all to a fresh one.
                if alive > 0 {
                    let new_cond = Arc::new(SelectCond::new());
                    let stale: Vec<usize> = (0..n).filter(|&i| registered[i]).collect();
                    for &idx in &stale {
                        cases[idx].remove_cond(&cond);
                        registered[idx] = false;
                    }
                    for &idx in &stale {
                        match cases[idx].try_once(Some((&new_cond, idx))) {
                            CaseOutcome::Ready => {
                                new_cond.close();
                                for &idx2 in &stale {
                                    if registered[idx2] {
                                        cases[idx2].remove_cond(&new_cond);
                                    }
                                }
                                return;
                            }
                            CaseOutcome::Closed => alive -= 1,
                            CaseOutcome::Empty => registered[idx] = true,
                        }
                    }
                    cond = new_cond;
                }
            }
            CaseOutcome::Empty => unreachable!("a signalled case cannot be empty on commit"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn default_runs_when_nothing_ready() {
        let chan: Chan<i32> = Chan::new(1);
        let ran = Cell::new(false);
        select(vec![recv(&chan, |_| unreachable!()), default(|| ran.set(true))]);
        assert!(ran.get());
    }

    #[test]
    fn ready_case_is_picked_uniformly_even_with_an_unready_case_present() {
        // Regression test for a bias where a single random rotation offset
        // (rather than a full shuffle) favored whichever ready case sat
        // right after the biggest gap in the scan order. With three cases
        // and only the first two ready, a biased scan skews heavily toward
        // one of them; a uniform shuffle keeps both close to 50/50.
        let mut counts = [0u32; 2];
        for _ in 0..4000 {
            let a = Chan::new(1);
            let b = Chan::new(1);
            let unready: Chan<i32> = Chan::new(1);
            a.send(1).unwrap();
            b.send(2).unwrap();
            let winner = Cell::new(0);
            select(vec![
                recv(&a, |_| winner.set(0)),
                recv(&b, |_| winner.set(1)),
                recv(&unready, |_| unreachable!()),
            ]);
            counts[winner.get()] += 1;
        }
        let total = (counts[0] + counts[1]) as f64;
        let frac0 = counts[0] as f64 / total;
        assert!((0.40..0.60).contains(&frac0), "case 0 picked {frac0:.3} of the time: {counts:?}");
    }

    #[test]
    fn recv_case_wins_over_default_when_ready() {
        let chan = Chan::new(1);
        chan.send(7).unwrap();
        let got = Cell::new(0);
        select(vec![recv(&chan, |v| got.set(v)), default(|| unreachable!())]);
        assert_eq!(got.get(), 7);
    }

    #[test]
    fn blocks_until_a_case_becomes_ready() {
        let chan = Chan::new(0);
        let sender = chan.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            sender.send(99).unwrap();
        });
        let got = Cell::new(0);
        select(vec![recv(&chan, |v| got.set(v))]);
        assert_eq!(got.get(), 99);
        handle.join().unwrap();
    }

    #[test]
    fn all_cases_closed_returns_without_running_a_handler() {
        let chan: Chan<i32> = Chan::new(1);
        chan.close();
        let ran = Cell::new(false);
        select(vec![recv(&chan, |_| ran.set(true))]);
        assert!(!ran.get());
    }

    #[test]
    fn survives_a_value_being_stolen_after_it_signals_the_select() {
        // Regression test: chan_a delivers and signals the waiting select,
        // but another party drains that value and closes chan_a before the
        // select's own commit() runs. The select must not be stuck waiting
        // on the now-dead cond for chan_b and should still pick it up.
        use std::sync::mpsc;
        use std::sync::Mutex;

        let chan_a: Chan<i32> = Chan::new(1);
        let chan_b: Chan<i32> = Chan::new(1);
        let sel_a = chan_a.clone();
        let sel_b = chan_b.clone();
        let winner = Arc::new(Mutex::new(0));
        let winner_in_thread = winner.clone();

        let (done_tx, done_rx) = mpsc::channel();
        thread::spawn(move || {
            select(vec![
                recv(&sel_a, |_| *winner_in_thread.lock().unwrap() = 1),
                recv(&sel_b, |_| *winner_in_thread.lock().unwrap() = 2),
            ]);
            done_tx.send(()).unwrap();
        });

        thread::sleep(Duration::from_millis(20));
        chan_a.send(1).unwrap();
        assert_eq!(chan_a.recv(), Ok(1));
        chan_a.close();

        thread::sleep(Duration::from_millis(20));
        chan_b.send(7).unwrap();

        done_rx
            .recv_timeout(Duration::from_secs(2))
            .expect("select() deadlocked after losing the race on chan_a");
        assert_eq!(*winner.lock().unwrap(), 2);
    }
}
