//! Scheduler, clock and cancellation primitives
//!
//! Delayed work (awaiting-candidates watchdog, reconnect backoff, echo ticks)
//! goes through [`Scheduler`] and wall-clock reads through [`Clock`], so the
//! negotiation engine can be driven deterministically in tests.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// A one-shot delayed task
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs tasks after a delay
pub trait Scheduler: Send + Sync {
    /// Schedule `task` to run once after `delay`
    ///
    /// Tasks never run inline on the calling thread.
    fn schedule(&self, delay: Duration, task: Task);
}

/// Millisecond wall clock
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> u64;
}

/// Lock a mutex, recovering the data if a holder panicked
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// System Clock
// ============================================================================

/// Milliseconds since the Unix epoch
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

// ============================================================================
// Thread Scheduler
// ============================================================================

struct Entry {
    deadline: Instant,
    seq: u64,
    task: Task,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Reversed: BinaryHeap is a max-heap, earliest deadline must pop first
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct Queue {
    entries: BinaryHeap<Entry>,
    next_seq: u64,
    shutdown: bool,
}

struct Shared {
    queue: Mutex<Queue>,
    wakeup: Condvar,
}

/// Worker threads of a default scheduler
pub const DEFAULT_SCHEDULER_WORKERS: usize = 4;

/// Fixed pool of worker threads draining one deadline heap
///
/// A task that blocks (ICE gathering, agent teardown) holds up a single
/// worker; the others keep serving due timers.
pub struct ThreadScheduler {
    shared: Arc<Shared>,
}

impl ThreadScheduler {
    pub fn new() -> Self {
        Self::with_workers(DEFAULT_SCHEDULER_WORKERS)
    }

    pub fn with_workers(workers: usize) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue::default()),
            wakeup: Condvar::new(),
        });

        for index in 0..workers.max(1) {
            let worker = Arc::clone(&shared);
            let spawned = thread::Builder::new()
                .name(format!("scheduler-{}", index))
                .spawn(move || run_worker(worker));
            if let Err(e) = spawned {
                log::error!("Failed to start scheduler thread: {}", e);
            }
        }

        Self { shared }
    }

    /// Stop the worker threads, dropping pending tasks
    pub fn shutdown(&self) {
        let mut queue = lock(&self.shared.queue);
        queue.shutdown = true;
        queue.entries.clear();
        self.shared.wakeup.notify_all();
    }
}

impl Default for ThreadScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ThreadScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Scheduler for ThreadScheduler {
    fn schedule(&self, delay: Duration, task: Task) {
        let mut queue = lock(&self.shared.queue);
        if queue.shutdown {
            return;
        }
        let seq = queue.next_seq;
        queue.next_seq += 1;
        queue.entries.push(Entry {
            deadline: Instant::now() + delay,
            seq,
            task,
        });
        self.shared.wakeup.notify_one();
    }
}

fn run_worker(shared: Arc<Shared>) {
    let mut queue = lock(&shared.queue);
    loop {
        if queue.shutdown {
            return;
        }

        let now = Instant::now();
        let next_deadline = queue.entries.peek().map(|e| e.deadline);

        match next_deadline {
            Some(deadline) if deadline <= now => {
                if let Some(entry) = queue.entries.pop() {
                    // Another worker may be due as well
                    shared.wakeup.notify_one();
                    drop(queue);
                    if panic::catch_unwind(AssertUnwindSafe(entry.task)).is_err() {
                        log::error!("Scheduled task panicked");
                    }
                    queue = lock(&shared.queue);
                }
            }
            Some(deadline) => {
                queue = shared
                    .wakeup
                    .wait_timeout(queue, deadline - now)
                    .map(|(guard, _)| guard)
                    .unwrap_or_else(|poisoned| poisoned.into_inner().0);
            }
            None => {
                queue = shared
                    .wakeup
                    .wait(queue)
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
            }
        }
    }
}

// ============================================================================
// Cancellation
// ============================================================================

/// One-shot cancellation signal that wakes sleepers immediately
#[derive(Debug, Default)]
pub struct CancelToken {
    cancelled: Mutex<bool>,
    signal: Condvar,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let mut cancelled = lock(&self.cancelled);
        *cancelled = true;
        self.signal.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *lock(&self.cancelled)
    }

    /// Sleep for `timeout` or until cancelled
    ///
    /// Returns `true` if the token was cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut cancelled = lock(&self.cancelled);
        while !*cancelled {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            cancelled = self
                .signal
                .wait_timeout(cancelled, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
        true
    }
}

// ============================================================================
// Tests
// ============================================================================
