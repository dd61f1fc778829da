//! A work-stealing thread pool: one `NotificationQueue` per worker, a
//! round-robin-then-blocking push, and steal-from-siblings pop.
//!
//! Grounded on `core/include/core/ThreadPool.h`,
//! `core/include/core/NotificationQueue.h` and the chaining worker loop in
//! `infrastructure/core/src/core/ThreadPool.cpp`.

pub mod exec_queue;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, JoinHandle};

use exec_queue::ExecutionQueue;

type Job = Box<dyn FnOnce() + Send>;

struct Entry {
    func: Job,
    exec_queue: Option<Weak<ExecutionQueue>>,
}

struct QueueState {
    jobs: VecDeque<Entry>,
    done: bool,
}

struct NotificationQueue {
    state: Mutex<QueueState>,
    cond: Condvar,
}

impl NotificationQueue {
    fn new() -> Self {
        NotificationQueue {
            state: Mutex::new(QueueState { jobs: VecDeque::new(), done: false }),
            cond: Condvar::new(),
        }
    }

    fn signal_done(&self) {
        let mut state = self.state.lock().unwrap();
        state.done = true;
        self.cond.notify_all();
    }

    /// Blocks until a job is available or the queue is shut down.
    fn pop(&self) -> Option<Entry> {
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(entry) = state.jobs.pop_front() {
                return Some(entry);
            }
            if state.done {
                return None;
            }
            state = self.cond.wait(state).unwrap();
        }
    }

    fn try_pop(&self) -> Option<Entry> {
        let mut state = self.state.try_lock().ok()?;
        state.jobs.pop_front()
    }

    fn try_push(&self, entry: Entry) -> Result<(), Entry> {
        match self.state.try_lock() {
            Ok(mut state) => {
                state.jobs.push_back(entry);
                self.cond.notify_one();
                Ok(())
            }
            Err(_) => Err(entry),
        }
    }

    fn push(&self, entry: Entry) {
        let mut state = self.state.lock().unwrap();
        state.jobs.push_back(entry);
        self.cond.notify_one();
    }
}

/// Tracks in-flight work so [`ThreadPool::flush`] can block until every
/// job submitted so far has run.
struct WaitGroup {
    remaining: Mutex<usize>,
    cond: Condvar,
}

impl WaitGroup {
    fn new() -> Self {
        WaitGroup { remaining: Mutex::new(0), cond: Condvar::new() }
    }

    fn add(&self, n: usize) {
        let mut remaining = self.remaining.lock().unwrap();
        *remaining += n;
    }

    fn done(&self) {
        let mut remaining = self.remaining.lock().unwrap();
        *remaining -= 1;
        if *remaining == 0 {
            self.cond.notify_all();
        }
    }

    fn wait(&self) {
        let mut remaining = self.remaining.lock().unwrap();
        while *remaining != 0 {
            remaining = self.cond.wait(remaining).unwrap();
        }
    }
}

/// The round-robin-then-blocking-push and steal-on-pop machinery, split
/// out from `ThreadPool` so worker threads can hold a cheap `Arc` to it
/// without closing over the pool (and its own `JoinHandle`s) directly.
struct Scheduler {
    queues: Vec<NotificationQueue>,
    next_queue: AtomicUsize,
    wait_group: WaitGroup,
}

/// How many extra round-robin attempts `push` makes before falling back to
/// a blocking push on the target queue.
const ROUND_ROBIN_ATTEMPTS: usize = 4;

impl Scheduler {
    fn push(&self, func: Job, exec_queue: Option<Weak<ExecutionQueue>>) {
        self.wait_group.add(1);
        let count = self.queues.len();
        let n = self.next_queue.fetch_add(1, Ordering::Relaxed);
        let mut entry = Entry { func, exec_queue };
        for i in 0..count * ROUND_ROBIN_ATTEMPTS {
            match self.queues[(i + n) % count].try_push(entry) {
                Ok(()) => return,
                Err(returned) => entry = returned,
            }
        }
        self.queues[n % count].push(entry);
    }
}

/// A fixed pool of OS threads draining per-thread work queues, stealing
/// from siblings when their own queue runs dry.
pub struct ThreadPool {
    scheduler: Arc<Scheduler>,
    threads: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    /// Spawns `threads_count` worker threads, defaulting to the available
    /// parallelism when `threads_count` is `None`.
    pub fn new(threads_count: Option<usize>) -> Self {
        let threads_count = threads_count
            .or_else(|| thread::available_parallelism().ok().map(|n| n.get()))
            .unwrap_or(1)
            .max(1);

        let queues = (0..threads_count).map(|_| NotificationQueue::new()).collect();
        let scheduler = Arc::new(Scheduler {
            queues,
            next_queue: AtomicUsize::new(0),
            wait_group: WaitGroup::new(),
        });

        let threads = (0..threads_count)
            .map(|n| {
                let scheduler = scheduler.clone();
                thread::spawn(move || worker_loop(scheduler, n))
            })
            .collect();

        ThreadPool { scheduler, threads }
    }

    /// Schedules `func` to run on any worker.
    pub fn run(&self, func: impl FnOnce() + Send + 'static) {
        self.scheduler.push(Box::new(func), None);
    }

    /// Schedules `func` as part of an [`ExecutionQueue`]'s serial order.
    pub(crate) fn run_from_execution_queue(
        &self,
        func: Job,
        exec_queue: Weak<ExecutionQueue>,
    ) {
        self.scheduler.push(func, Some(exec_queue));
    }

    /// Blocks the calling thread until every job submitted so far (directly
    /// or via an `ExecutionQueue`) has completed.
    pub fn flush(&self) {
        self.scheduler.wait_group.wait();
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        for queue in &self.scheduler.queues {
            queue.signal_done();
        }
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
    }
}

fn worker_loop(scheduler: Arc<Scheduler>, n: usize) {
    let count = scheduler.queues.len();
    loop {
        let mut entry = None;
        for i in 0..count {
            if let Some(found) = scheduler.queues[(i + n) % count].try_pop() {
                entry = Some(found);
                break;
            }
        }
        let entry = match entry {
            Some(entry) => entry,
            None => match scheduler.queues[n].pop() {
                Some(entry) => entry,
                None => break,
            },
        };

        (entry.func)();

        if let Some(exec_queue) = entry.exec_queue.and_then(|weak| weak.upgrade()) {
            if let Some(next) = exec_queue.signal_finished_and_try_pop() {
                scheduler.push(next, Some(Arc::downgrade(&exec_queue)));
            }
        }

        scheduler.wait_group.done();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;
    use std::sync::mpsc;

    #[test]
    fn runs_every_submitted_job() {
        let pool = ThreadPool::new(Some(4));
        let (tx, rx) = mpsc::channel();
        for i in 0..100 {
            let tx = tx.clone();
            pool.run(move || tx.send(i).unwrap());
        }
        drop(tx);
        pool.flush();
        let mut got: Vec<i32> = rx.try_iter().collect();
        got.sort_unstable();
        assert_eq!(got, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn flush_waits_for_all_work() {
        let pool = ThreadPool::new(Some(2));
        let counter = Arc::new(StdAtomicUsize::new(0));
        for _ in 0..50 {
            let counter = counter.clone();
            pool.run(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.flush();
        assert_eq!(counter.load(Ordering::SeqCst), 50);
    }
}
