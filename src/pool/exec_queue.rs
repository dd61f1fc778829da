//! A serial queue of closures layered on top of a [`ThreadPool`]: jobs
//! pushed to the same `ExecutionQueue` run one at a time and in order,
//! while different queues still run in parallel on the pool.
//!
//! Grounded on `infrastructure/core/include/core/ExecutionQueue.h`.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use super::ThreadPool;

type Job = Box<dyn FnOnce() + Send>;

struct State {
    queue: VecDeque<Job>,
    scheduled: bool,
}

/// Serial-within-a-queue, parallel-across-queues execution order.
///
/// Holds only a weak back-reference to nothing: the pool itself never
/// holds a strong reference to an `ExecutionQueue` beyond the one in-flight
/// job, so a queue with no more pending work and no outstanding scheduling
/// is dropped as soon as its owner drops it.
pub struct ExecutionQueue {
    state: Mutex<State>,
}

impl ExecutionQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(ExecutionQueue { state: Mutex::new(State { queue: VecDeque::new(), scheduled: false }) })
    }

    /// Enqueues `func`. If this queue has no job in flight, `func` is
    /// submitted to `pool` immediately; otherwise it waits behind whatever
    /// is already scheduled.
    pub fn push(self: &Arc<Self>, pool: &ThreadPool, func: impl FnOnce() + Send + 'static) {
        let mut state = self.state.lock().unwrap();
        if state.scheduled {
            state.queue.push_back(Box::new(func));
            return;
        }
        state.scheduled = true;
        drop(state);
        pool.run_from_execution_queue(Box::new(func), Arc::downgrade(self));
    }

    /// Called by the pool's worker loop once the in-flight job for this
    /// queue has finished. Returns the next queued job, if any, and clears
    /// `scheduled` when the queue has drained.
    pub(crate) fn signal_finished_and_try_pop(&self) -> Option<Job> {
        let mut state = self.state.lock().unwrap();
        debug_assert!(state.scheduled, "execution queue signalled without a scheduled job");
        match state.queue.pop_front() {
            Some(next) => Some(next),
            None => {
                state.scheduled = false;
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn jobs_on_one_queue_run_in_order() {
        let pool = ThreadPool::new(Some(4));
        let queue = ExecutionQueue::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..20 {
            let order = order.clone();
            queue.push(&pool, move || order.lock().unwrap().push(i));
        }
        pool.flush();
        assert_eq!(*order.lock().unwrap(), (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn independent_queues_all_complete() {
        let pool = ThreadPool::new(Some(4));
        let a = ExecutionQueue::new();
        let b = ExecutionQueue::new();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let c1 = counter.clone();
            a.push(&pool, move || { c1.fetch_add(1, Ordering::SeqCst); });
            let c2 = counter.clone();
            b.push(&pool, move || { c2.fetch_add(1, Ordering::SeqCst); });
        }
        pool.flush();
        assert_eq!(counter.load(Ordering::SeqCst), 20);
    }
}
