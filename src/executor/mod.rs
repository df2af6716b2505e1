//! Task execution infrastructure.
//!
//! This module provides the core task execution primitives: tasks and their
//! handles, worker threads with their delayed schedules, and the thread pool
//! that places work on them.

pub mod panic_handler;
pub mod spawner;
pub mod task;
pub mod thread_pool;
pub mod worker;

pub use panic_handler::{
    BoxError, ExceptionSink, FailureReport, LogSink, PanicHandler, PanicInfo, WorkFailure,
};
pub use spawner::{Spawner, ThreadSpawner};
pub use task::{TaskGuard, TaskHandle, TaskId, TaskState};
pub use thread_pool::ThreadPool;
pub use worker::{Worker, WorkerId, WorkerSnapshot, WorkerStatus};
