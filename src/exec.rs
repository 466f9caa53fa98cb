//! Synchronization surface between an inflate driver and the worker pool of
//! a scheduled archiver.
//!
//! The driver and the workers share exactly three structures: a bounded
//! [`TaskQueue`] the driver feeds (blocking on capacity as backpressure), a
//! [`CompletionQueue`] the workers fill with finished tasks in priority
//! order, and an [`ErrorMap`] for failed tasks. Workers never touch tree
//! nodes; all attachment happens on the driver thread.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};

/// Worker-pool handle returned by `ScheduledArchiver::pull_schedule`.
///
/// `is_active` must be true for as long as the scheduler may still deposit
/// work into the completion queue or the error map. `close` releases the
/// pool and is idempotent.
pub trait Scheduler: Send + Sync {
    fn is_active(&self) -> bool;
    fn close(&self);
}

/// Optional progress reporting for archivers that support it.
///
/// The bulk inflater reports every pull it submits and every completed
/// attach, keyed by the node range being fetched.
pub trait ProgressTracker: Send + Sync {
    fn pull_queued(&self, subject: &str);
    fn pull_done(&self, subject: &str);
}

struct TaskQueueState<T> {
    items: VecDeque<T>,
    in_flight: usize,
    closed: bool,
}

/// Bounded handoff queue between a driver and scheduler workers.
///
/// `put` blocks while the queue is full. `poll` marks the returned item as
/// in flight; the consumer must call [`TaskQueue::task_done`] after it has
/// deposited the outcome, so that `in_flight` only drops to zero once the
/// result is visible elsewhere.
pub struct TaskQueue<T> {
    state: Mutex<TaskQueueState<T>>,
    capacity: usize,
    not_full: Condvar,
    not_empty: Condvar,
}

impl<T> TaskQueue<T> {
    pub fn bounded(capacity: usize) -> TaskQueue<T> {
        TaskQueue {
            state: Mutex::new(TaskQueueState {
                items: VecDeque::with_capacity(capacity),
                in_flight: 0,
                closed: false,
            }),
            capacity,
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
        }
    }

    /// Enqueue a task, blocking while the queue is at capacity.
    pub fn put(&self, item: T) -> Result<()> {
        let mut state = self.state.lock();
        while state.items.len() >= self.capacity && !state.closed {
            self.not_full.wait(&mut state);
        }
        if state.closed {
            return Err(Error::IllegalState("task queue is closed".into()));
        }
        state.items.push_back(item);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Take a task, waiting up to `timeout`. The returned task counts as in
    /// flight until `task_done` is called.
    pub fn poll(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                state.in_flight += 1;
                self.not_full.notify_one();
                return Some(item);
            }
            if state.closed {
                return None;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            self.not_empty.wait_for(&mut state, remaining);
        }
    }

    /// Mark one previously polled task as fully handled.
    pub fn task_done(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.in_flight > 0);
        state.in_flight = state.in_flight.saturating_sub(1);
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight
    }

    /// Close the queue and wake every blocked producer and consumer.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.not_full.notify_all();
        self.not_empty.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

/// Priority queue of completed tasks, drained by the driver.
///
/// Ordering follows `T`'s natural order; for pull tasks that is the left
/// boundary of the fetched node, which turns out-of-order fetch completions
/// back into an in-order traversal.
pub struct CompletionQueue<T> {
    heap: Mutex<BinaryHeap<Reverse<T>>>,
    available: Condvar,
}

impl<T: Ord> CompletionQueue<T> {
    pub fn new() -> CompletionQueue<T> {
        CompletionQueue {
            heap: Mutex::new(BinaryHeap::new()),
            available: Condvar::new(),
        }
    }

    pub fn put(&self, item: T) {
        self.heap.lock().push(Reverse(item));
        self.available.notify_one();
    }

    /// Pop the smallest completed task, waiting up to `timeout` for one to
    /// arrive.
    pub fn poll(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut heap = self.heap.lock();
        loop {
            if let Some(Reverse(item)) = heap.pop() {
                return Some(item);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            self.available.wait_for(&mut heap, remaining);
        }
    }

    /// Pop without waiting.
    pub fn try_poll(&self) -> Option<T> {
        self.heap.lock().pop().map(|Reverse(item)| item)
    }

    pub fn is_empty(&self) -> bool {
        self.heap.lock().is_empty()
    }
}

impl<T: Ord> Default for CompletionQueue<T> {
    fn default() -> Self {
        CompletionQueue::new()
    }
}

/// Failed tasks with their abort causes, drained by the driver every loop
/// iteration.
pub struct ErrorMap<T> {
    failed: Mutex<Vec<(T, Error)>>,
}

impl<T> ErrorMap<T> {
    pub fn new() -> ErrorMap<T> {
        ErrorMap {
            failed: Mutex::new(Vec::new()),
        }
    }

    pub fn put(&self, task: T, cause: Error) {
        self.failed.lock().push((task, cause));
    }

    pub fn drain(&self) -> Vec<(T, Error)> {
        std::mem::take(&mut *self.failed.lock())
    }

    pub fn is_empty(&self) -> bool {
        self.failed.lock().is_empty()
    }
}

impl<T> Default for ErrorMap<T> {
    fn default() -> Self {
        ErrorMap::new()
    }
}
