//! Task representation, cancellation and the handles given back to callers.

use super::panic_handler::{BoxError, PanicHandler, WorkFailure};
use super::worker::WorkerId;
use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

/// Global task ID counter
static TASK_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u64);

impl TaskId {
    pub(crate) fn next() -> Self {
        TaskId(TASK_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle of a task.
///
/// `Pending` moves to exactly one of `Running` or `Cancelled`. `Running`
/// ends in `Completed` or `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    Pending = 0,
    Running = 1,
    Completed = 2,
    Failed = 3,
    Cancelled = 4,
}

impl TaskState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => TaskState::Pending,
            1 => TaskState::Running,
            2 => TaskState::Completed,
            3 => TaskState::Failed,
            _ => TaskState::Cancelled,
        }
    }
}

pub(crate) type Work = Box<dyn FnOnce() -> Result<(), BoxError> + Send + 'static>;

/// Internal task representation
pub(crate) struct Task {
    id: TaskId,
    state: AtomicU8,
    work: Mutex<Option<Work>>,
    lock: ReentrantMutex<()>,
}

impl Task {
    pub(crate) fn new(work: Work) -> Self {
        Task {
            id: TaskId::next(),
            state: AtomicU8::new(TaskState::Pending as u8),
            work: Mutex::new(Some(work)),
            lock: ReentrantMutex::new(()),
        }
    }

    pub(crate) fn id(&self) -> TaskId {
        self.id
    }

    pub(crate) fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: TaskState, to: TaskState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Returns true if this call is what cancelled the task.
    pub(crate) fn cancel(&self) -> bool {
        if !self.transition(TaskState::Pending, TaskState::Cancelled) {
            return false;
        }

        // captured values are released now, not when the worker reaches the entry
        let work = self.work.lock().take();
        drop(work);
        true
    }

    /// Takes the task lock and runs the work if nobody cancelled it first.
    ///
    /// Returns `None` when the task was skipped.
    pub(crate) fn run(
        &self,
        handler: &PanicHandler,
        worker: WorkerId,
    ) -> Option<Result<(), WorkFailure>> {
        let _guard = self.lock.lock();

        if !self.transition(TaskState::Pending, TaskState::Running) {
            return None;
        }

        let work = self.work.lock().take();
        let result = match work {
            Some(work) => handler.execute(worker, self.id, work),
            None => Ok(()),
        };

        let end = if result.is_ok() {
            TaskState::Completed
        } else {
            TaskState::Failed
        };
        self.state.store(end as u8, Ordering::Release);

        Some(result)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

/// Shared reference to a submitted task.
///
/// Cloning is cheap and every clone refers to the same task. An empty handle
/// (returned when there was no worker to take the work) answers every query
/// with a default and ignores `cancel`.
#[derive(Clone, Default)]
pub struct TaskHandle {
    task: Option<Arc<Task>>,
}

impl TaskHandle {
    pub(crate) fn new(task: Arc<Task>) -> Self {
        Self { task: Some(task) }
    }

    pub fn empty() -> Self {
        Self { task: None }
    }

    /// True if the handle refers to a task.
    pub fn is_valid(&self) -> bool {
        self.task.is_some()
    }

    pub fn id(&self) -> Option<TaskId> {
        self.task.as_ref().map(|t| t.id())
    }

    pub fn state(&self) -> Option<TaskState> {
        self.task.as_ref().map(|t| t.state())
    }

    /// True until the work has finished running or the task was cancelled.
    pub fn is_pending(&self) -> bool {
        matches!(self.state(), Some(TaskState::Pending | TaskState::Running))
    }

    pub fn is_cancelled(&self) -> bool {
        self.state() == Some(TaskState::Cancelled)
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state(), Some(TaskState::Completed | TaskState::Failed))
    }

    /// Cancels the task if it has not started yet.
    ///
    /// Returns false when the task is already running, finished, cancelled or
    /// the handle is empty. Never blocks.
    pub fn cancel(&self) -> bool {
        self.task.as_ref().map_or(false, |t| t.cancel())
    }

    /// Locks the task's mutex, the same one its worker holds while deciding
    /// whether to run it and while running it.
    ///
    /// While the guard is alive the task cannot start. Locking from inside
    /// the task's own work is allowed; the mutex is reentrant.
    pub fn lock(&self) -> Option<TaskGuard<'_>> {
        self.task.as_deref().map(|task| TaskGuard {
            _guard: task.lock.lock(),
            task,
        })
    }

    /// Drops this handle's reference, leaving it empty.
    pub fn release(&mut self) {
        self.task = None;
    }

    /// Number of live references to the task, including the worker's own
    /// while the task is queued. Zero for an empty handle.
    pub fn reference_count(&self) -> usize {
        self.task.as_ref().map_or(0, Arc::strong_count)
    }

    pub(crate) fn task(&self) -> Option<&Arc<Task>> {
        self.task.as_ref()
    }
}

impl PartialEq for TaskHandle {
    fn eq(&self, other: &Self) -> bool {
        match (&self.task, &other.task) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }
}

impl Eq for TaskHandle {}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.task {
            Some(task) => f
                .debug_struct("TaskHandle")
                .field("id", &task.id())
                .field("state", &task.state())
                .finish(),
            None => f.write_str("TaskHandle(empty)"),
        }
    }
}

/// Held lock on a task; released on drop.
pub struct TaskGuard<'a> {
    _guard: ReentrantMutexGuard<'a, ()>,
    task: &'a Task,
}

impl TaskGuard<'_> {
    pub fn state(&self) -> TaskState {
        self.task.state()
    }

    /// Cancel while holding the lock. If the task is `Pending` here, the
    /// worker has not started it and now never will.
    pub fn cancel(&self) -> bool {
        self.task.cancel()
    }
}

impl fmt::Debug for TaskGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskGuard").field("task", &self.task).finish()
    }
}
