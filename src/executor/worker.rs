// worker thread stuff
use super::panic_handler::{BoxError, ExceptionSink, PanicHandler};
use super::spawner::Spawner;
use super::task::{Task, TaskHandle, Work};
use crate::config::{Config, ShutdownMode};
use crate::error::{Error, Result};
use crate::scheduler::DelayQueue;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

pub type WorkerId = usize;

/// `Idle -> Running -> Draining -> Stopped`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    /// Created, thread not started. Work posted now waits for `start`.
    Idle,
    Running,
    /// Stop requested; still executing whatever is queued.
    Draining,
    Stopped,
}

// stats for each worker
#[derive(Debug, Default)]
struct WorkerStats {
    executed: AtomicU64,
    cancelled: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSnapshot {
    pub id: WorkerId,
    pub status: WorkerStatus,
    /// Queued tasks plus the one executing right now.
    pub load: usize,
    pub queued: usize,
    /// Tasks whose work ran, including the ones that failed.
    pub executed: u64,
    /// Tasks dequeued after being cancelled.
    pub cancelled: u64,
    pub failed: u64,
}

struct Queue {
    schedule: DelayQueue,
    status: WorkerStatus,
    // thread currently inside `run`, for self-join detection
    runner: Option<ThreadId>,
}

struct Shared {
    id: WorkerId,
    queue: Mutex<Queue>,
    condvar: Condvar,
    /// Signalled when the status reaches `Stopped`.
    exited: Condvar,
    epoch: Instant,
    load: AtomicUsize,
    poll_interval: Duration,
    handler: PanicHandler,
    stats: WorkerStats,
}

impl Shared {
    // main loop
    fn run(&self) {
        tracing::debug!(worker = self.id, "worker started");

        let mut queue = self.queue.lock();
        queue.runner = Some(thread::current().id());
        loop {
            let now = self.epoch.elapsed();

            if let Some(handle) = queue.schedule.pop_ready(now) {
                MutexGuard::unlocked(&mut queue, || self.process(handle));
                continue;
            }

            if queue.status != WorkerStatus::Running && queue.schedule.is_empty() {
                break;
            }

            let timeout = match queue.schedule.next_due() {
                Some(due) => due.saturating_sub(now).min(self.poll_interval),
                None => self.poll_interval,
            };
            self.condvar.wait_for(&mut queue, timeout);
        }
        queue.status = WorkerStatus::Stopped;
        drop(queue);
        self.exited.notify_all();

        tracing::debug!(worker = self.id, "worker stopped");
    }

    fn process(&self, handle: TaskHandle) {
        if let Some(task) = handle.task() {
            tracing::trace!(worker = self.id, task = %task.id(), "dequeued");
            match task.run(&self.handler, self.id) {
                Some(Ok(())) => {
                    self.stats.executed.fetch_add(1, Ordering::Relaxed);
                }
                Some(Err(_)) => {
                    self.stats.executed.fetch_add(1, Ordering::Relaxed);
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                }
                None => {
                    tracing::trace!(worker = self.id, task = %task.id(), "skipping cancelled task");
                    self.stats.cancelled.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        self.load.fetch_sub(1, Ordering::AcqRel);
    }
}

/// One execution thread and its time-ordered schedule.
///
/// Tasks run one at a time, earliest due time first and in submission order
/// within the same due time.
pub struct Worker {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_name: String,
    stack_size: Option<usize>,
    shutdown_mode: ShutdownMode,
}

impl Worker {
    pub fn new(id: WorkerId, config: &Config, sink: Arc<dyn ExceptionSink>) -> Self {
        Self {
            shared: Arc::new(Shared {
                id,
                queue: Mutex::new(Queue {
                    schedule: DelayQueue::new(),
                    status: WorkerStatus::Idle,
                    runner: None,
                }),
                condvar: Condvar::new(),
                exited: Condvar::new(),
                epoch: Instant::now(),
                load: AtomicUsize::new(0),
                poll_interval: config.poll_interval,
                handler: PanicHandler::new(sink),
                stats: WorkerStats::default(),
            }),
            thread: Mutex::new(None),
            thread_name: format!("{}-{}", config.thread_name_prefix, id),
            stack_size: config.stack_size,
            shutdown_mode: config.shutdown_mode,
        }
    }

    pub fn id(&self) -> WorkerId {
        self.shared.id
    }

    pub fn status(&self) -> WorkerStatus {
        self.shared.queue.lock().status
    }

    pub fn is_running(&self) -> bool {
        is_active(self.status())
    }

    pub fn start(&self, spawner: &dyn Spawner) -> Result<()> {
        let mut slot = self.thread.lock();

        if slot.as_ref().map_or(false, |t| !t.is_finished()) {
            return Err(Error::AlreadyRunning);
        }
        if let Some(finished) = slot.take() {
            reap(self.id(), finished);
        }

        self.shared.queue.lock().status = WorkerStatus::Running;

        let mut builder = thread::Builder::new().name(self.thread_name.clone());
        if let Some(stack_size) = self.stack_size {
            builder = builder.stack_size(stack_size);
        }

        let shared = self.shared.clone();
        match spawner.spawn(builder, Box::new(move || shared.run())) {
            Ok(handle) => {
                *slot = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.shared.queue.lock().status = WorkerStatus::Idle;
                self.shared.exited.notify_all();
                Err(Error::startup(self.id(), e))
            }
        }
    }

    /// Ask the worker to finish.
    ///
    /// With `ShutdownMode::Drain` the thread keeps going until every queued
    /// task has run, however far in the future it is due. With
    /// `ShutdownMode::CancelPending` queued tasks are cancelled first. The
    /// task executing right now always runs to completion. Does not block;
    /// see `join`.
    ///
    /// Stopping a worker that was never started cancels whatever was posted
    /// to it. A `CancelPending` stop also cuts short a drain already under
    /// way.
    pub fn stop(&self, mode: ShutdownMode) {
        let mut queue = self.shared.queue.lock();
        match queue.status {
            WorkerStatus::Running | WorkerStatus::Draining => {
                queue.status = WorkerStatus::Draining;
                if mode == ShutdownMode::CancelPending {
                    let cancelled = queue.schedule.cancel_all();
                    tracing::debug!(worker = self.id(), cancelled, "cancelled queued tasks");
                }
            }
            WorkerStatus::Idle => {
                queue.status = WorkerStatus::Stopped;
                queue.schedule.cancel_all();
                while let Some(handle) = queue.schedule.pop_ready(Duration::MAX) {
                    MutexGuard::unlocked(&mut queue, || self.shared.process(handle));
                }
                self.shared.exited.notify_all();
            }
            WorkerStatus::Stopped => {}
        }
        drop(queue);

        self.shared.condvar.notify_all();
    }

    /// Blocks until the worker thread exits. Any number of threads may join
    /// the same worker. A no-op when called from the worker's own thread.
    pub fn join(&self) {
        self.wait_exit(None);
    }

    /// Like `join`, giving up after `timeout`. Returns `false` if the worker
    /// is still running by then, or when called from the worker's own thread.
    pub fn join_timeout(&self, timeout: Duration) -> bool {
        self.wait_exit(Instant::now().checked_add(timeout))
    }

    pub(crate) fn wait_exit(&self, deadline: Option<Instant>) -> bool {
        let mut queue = self.shared.queue.lock();
        if is_active(queue.status) && queue.runner == Some(thread::current().id()) {
            tracing::warn!(worker = self.id(), "worker asked to join itself");
            return false;
        }

        while is_active(queue.status) {
            match deadline {
                Some(deadline) => {
                    if self.shared.exited.wait_until(&mut queue, deadline).timed_out() {
                        if is_active(queue.status) {
                            return false;
                        }
                        break;
                    }
                }
                None => self.shared.exited.wait(&mut queue),
            }
        }
        drop(queue);

        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            reap(self.id(), handle);
        }
        true
    }

    pub fn post<F>(&self, f: F) -> TaskHandle
    where
        F: FnOnce() + Send + 'static,
    {
        self.enqueue(Duration::ZERO, unit_work(f))
    }

    /// Runs `f` no earlier than `delay` from now.
    pub fn schedule<F>(&self, delay: Duration, f: F) -> TaskHandle
    where
        F: FnOnce() + Send + 'static,
    {
        self.enqueue(delay, unit_work(f))
    }

    pub fn try_post<F, E>(&self, f: F) -> TaskHandle
    where
        F: FnOnce() -> std::result::Result<(), E> + Send + 'static,
        E: Into<BoxError>,
    {
        self.enqueue(Duration::ZERO, fallible_work(f))
    }

    pub fn try_schedule<F, E>(&self, delay: Duration, f: F) -> TaskHandle
    where
        F: FnOnce() -> std::result::Result<(), E> + Send + 'static,
        E: Into<BoxError>,
    {
        self.enqueue(delay, fallible_work(f))
    }

    fn enqueue(&self, delay: Duration, work: Work) -> TaskHandle {
        let handle = TaskHandle::new(Arc::new(Task::new(work)));

        {
            let mut queue = self.shared.queue.lock();
            if queue.status == WorkerStatus::Stopped {
                return TaskHandle::empty();
            }

            let compacted = queue.schedule.compact();
            if compacted > 0 {
                self.shared.load.fetch_sub(compacted, Ordering::AcqRel);
                self.shared
                    .stats
                    .cancelled
                    .fetch_add(compacted as u64, Ordering::Relaxed);
                tracing::trace!(worker = self.id(), compacted, "dropped cancelled tasks");
            }

            let due = self
                .shared
                .epoch
                .elapsed()
                .checked_add(delay)
                .unwrap_or(Duration::MAX);
            queue.schedule.push(due, handle.clone());
            self.shared.load.fetch_add(1, Ordering::AcqRel);

            tracing::trace!(worker = self.id(), task = ?handle.id(), ?due, "enqueued");
        }

        self.shared.condvar.notify_one();
        handle
    }

    /// Queued tasks plus the one executing right now.
    pub fn load(&self) -> usize {
        self.shared.load.load(Ordering::Acquire)
    }

    /// Tasks still waiting in the schedule, due or not.
    pub fn queued(&self) -> usize {
        self.shared.queue.lock().schedule.len()
    }

    /// `Greater` when this worker is the better place for new work, i.e. it
    /// carries less load than `other`.
    pub fn compare_priority(&self, other: &Worker) -> CmpOrdering {
        other.load().cmp(&self.load())
    }

    pub fn failure_count(&self) -> usize {
        self.shared.handler.failure_count()
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        let (status, queued) = {
            let queue = self.shared.queue.lock();
            (queue.status, queue.schedule.len())
        };
        let stats = &self.shared.stats;

        WorkerSnapshot {
            id: self.id(),
            status,
            load: self.load(),
            queued,
            executed: stats.executed.load(Ordering::Relaxed),
            cancelled: stats.cancelled.load(Ordering::Relaxed),
            failed: stats.failed.load(Ordering::Relaxed),
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop(self.shutdown_mode);
        self.join();
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id())
            .field("status", &self.status())
            .field("load", &self.load())
            .finish()
    }
}

fn is_active(status: WorkerStatus) -> bool {
    matches!(status, WorkerStatus::Running | WorkerStatus::Draining)
}

fn reap(id: WorkerId, handle: JoinHandle<()>) {
    if handle.join().is_err() {
        tracing::warn!(worker = id, "worker thread panicked");
    }
}

fn unit_work<F>(f: F) -> Work
where
    F: FnOnce() + Send + 'static,
{
    Box::new(move || -> std::result::Result<(), BoxError> {
        f();
        Ok(())
    })
}

fn fallible_work<F, E>(f: F) -> Work
where
    F: FnOnce() -> std::result::Result<(), E> + Send + 'static,
    E: Into<BoxError>,
{
    Box::new(move || -> std::result::Result<(), BoxError> { f().map_err(Into::into) })
}
