// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Priority worker pool shared by all prefetch pipelines.
//!
//! A fixed number of workers pull tasks from one heap ordered by
//! `(priority, submission order)`; a lower priority value runs first.
//!
//! Priorities change after submission, so a task is never mutated in place
//! inside the heap. [`WorkerPool::reprioritize`] bumps the task's generation
//! and pushes a fresh entry; the stale entry is skipped when popped.
//!
//! Each task runs at most once: starting, cancelling and re-prioritizing all
//! race on one atomic state, and only the `Queued → Running` transition hands
//! out the action. Cancelling a running task is a no-op.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Once};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{error, info_span, trace, Instrument};

/// Boxed task body.
pub type TaskFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Runs ahead of everything else.
pub const URGENT: i64 = i64::MIN;
/// Runs after everything else.
pub const LOWEST: i64 = i64::MAX;

const QUEUED: u8 = 0;
const RUNNING: u8 = 1;
const DONE: u8 = 2;
const CANCELLED: u8 = 3;

/// Shared handle to a submitted task.
pub struct TaskHandle {
    id: u64,
    priority: AtomicI64,
    generation: AtomicU64,
    state: AtomicU8,
    action: Mutex<Option<TaskFuture>>,
}

impl TaskHandle {
    fn new(id: u64, priority: i64, action: TaskFuture) -> Self {
        Self {
            id,
            priority: AtomicI64::new(priority),
            generation: AtomicU64::new(0),
            state: AtomicU8::new(QUEUED),
            action: Mutex::new(Some(action)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn priority(&self) -> i64 {
        self.priority.load(Ordering::Acquire)
    }

    /// Submitted but not yet started or cancelled.
    pub fn is_pending(&self) -> bool {
        self.state.load(Ordering::Acquire) == QUEUED
    }

    pub fn is_running(&self) -> bool {
        self.state.load(Ordering::Acquire) == RUNNING
    }

    /// Finished or cancelled.
    pub fn is_finished(&self) -> bool {
        matches!(self.state.load(Ordering::Acquire), DONE | CANCELLED)
    }

    /// Cancel the task if it has not started. Dropping the action releases
    /// whatever it captured (e.g. a requester's reply channel).
    pub fn cancel(&self) -> bool {
        let cancelled = self
            .state
            .compare_exchange(QUEUED, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if cancelled {
            self.action.lock().take();
        }
        cancelled
    }

    fn try_start(&self) -> Option<TaskFuture> {
        self.state
            .compare_exchange(QUEUED, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        self.action.lock().take()
    }

    fn finish(&self) {
        self.state.store(DONE, Ordering::Release);
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &self.id)
            .field("priority", &self.priority())
            .field("state", &self.state.load(Ordering::Acquire))
            .finish()
    }
}

struct Entry {
    priority: i64,
    sequence: u64,
    generation: u64,
    task: Arc<TaskHandle>,
}

impl Entry {
    fn is_current(&self) -> bool {
        self.task.is_pending() && self.task.generation.load(Ordering::Acquire) == self.generation
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // BinaryHeap is a max-heap: the smallest (priority, sequence) must compare greatest
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

struct PoolShared {
    queue: Mutex<BinaryHeap<Entry>>,
    available: Notify,
    idle: Notify,
    running: AtomicUsize,
    next_sequence: AtomicU64,
    next_id: AtomicU64,
    shutdown: AtomicBool,
}

impl PoolShared {
    fn pop_runnable(&self) -> Option<(Arc<TaskHandle>, TaskFuture)> {
        let mut queue = self.queue.lock();
        while let Some(entry) = queue.pop() {
            if !entry.is_current() {
                continue;
            }
            if let Some(action) = entry.task.try_start() {
                // Counted under the queue lock so is_idle never sees a gap
                self.running.fetch_add(1, Ordering::AcqRel);
                return Some((entry.task, action));
            }
        }
        None
    }

    fn is_idle(&self) -> bool {
        let queue = self.queue.lock();
        self.running.load(Ordering::Acquire) == 0 && !queue.iter().any(Entry::is_current)
    }

    fn push(&self, task: &Arc<TaskHandle>, priority: i64, generation: u64) {
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        self.queue.lock().push(Entry {
            priority,
            sequence,
            generation,
            task: Arc::clone(task),
        });
        self.available.notify_one();
    }
}

/// Fixed-size pool of tokio workers with a mutable-priority queue.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    concurrency: usize,
    name_prefix: String,
    started: Once,
}

impl WorkerPool {
    pub fn new(concurrency: usize, name_prefix: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                queue: Mutex::new(BinaryHeap::new()),
                available: Notify::new(),
                idle: Notify::new(),
                running: AtomicUsize::new(0),
                next_sequence: AtomicU64::new(0),
                next_id: AtomicU64::new(1),
                shutdown: AtomicBool::new(false),
            }),
            concurrency: concurrency.max(1),
            name_prefix: name_prefix.into(),
            started: Once::new(),
        }
    }

    /// Queue a task. `make` receives the task id so the body can find its
    /// own bookkeeping entry when it completes.
    ///
    /// Workers are spawned on the current tokio runtime on first use.
    pub fn submit<F, Fut>(&self, priority: i64, make: F) -> Arc<TaskHandle>
    where
        F: FnOnce(u64) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.start_workers();
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let task = Arc::new(TaskHandle::new(id, priority, Box::pin(make(id))));
        if self.shared.shutdown.load(Ordering::Acquire) {
            task.cancel();
            return task;
        }
        trace!(task = id, priority, "Task submitted");
        self.shared.push(&task, priority, 0);
        task
    }

    /// Move a not-yet-started task to a new priority by re-insertion.
    /// Returns false if the task already started, was cancelled, or already
    /// has that priority.
    pub fn reprioritize(&self, task: &Arc<TaskHandle>, priority: i64) -> bool {
        if !task.is_pending() || task.priority() == priority {
            return false;
        }
        task.priority.store(priority, Ordering::Release);
        let generation = task.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.shared.push(task, priority, generation);
        trace!(task = task.id, priority, generation, "Task re-prioritized");
        true
    }

    /// Number of tasks currently executing.
    pub fn running(&self) -> usize {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Number of tasks waiting to start.
    pub fn pending(&self) -> usize {
        self.shared.queue.lock().iter().filter(|e| e.is_current()).count()
    }

    pub fn is_idle(&self) -> bool {
        self.shared.is_idle()
    }

    /// Resolve once nothing is queued and nothing is running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.shared.is_idle() {
                return;
            }
            notified.await;
        }
    }

    /// Wake idle-waiters after tasks were cancelled outside the pool.
    pub fn notify_if_idle(&self) {
        if self.shared.is_idle() {
            self.shared.idle.notify_waiters();
        }
    }

    /// Stop the workers and cancel everything that has not started.
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        let drained: Vec<Entry> = self.shared.queue.lock().drain().collect();
        for entry in drained {
            entry.task.cancel();
        }
        self.shared.available.notify_waiters();
        self.shared.idle.notify_waiters();
    }

    fn start_workers(&self) {
        self.started.call_once(|| {
            for n in 0..self.concurrency {
                let name = format!("{}-{}", self.name_prefix, n + 1);
                let span = info_span!("prefetch_worker", worker = %name);
                tokio::spawn(worker_loop(Arc::clone(&self.shared)).instrument(span));
            }
        });
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn worker_loop(shared: Arc<PoolShared>) {
    loop {
        let (task, action) = loop {
            let notified = shared.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if shared.shutdown.load(Ordering::Acquire) {
                trace!("Worker stopping");
                return;
            }
            if let Some(next) = shared.pop_runnable() {
                break next;
            }
            notified.await;
        };

        trace!(task = task.id, priority = task.priority(), "Task started");
        // A panicking task must not take the worker down with it
        if let Err(e) = tokio::spawn(action).await {
            error!(task = task.id, error = %e, "Prefetch task panicked");
        }
        task.finish();
        shared.running.fetch_sub(1, Ordering::AcqRel);
        if shared.is_idle() {
            shared.idle.notify_waiters();
        }
    }
}
