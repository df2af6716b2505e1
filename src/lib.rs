//! delay-pool - a fixed-size worker thread pool with delayed scheduling
//!
//! Work is posted for immediate execution or scheduled after a delay. Each
//! submission lands on the least-loaded worker and comes back as a
//! [`TaskHandle`] that can cancel it, inspect its state or hold it off while
//! locked.
//!
//! # Quick Start
//!
//! ```no_run
//! use delay_pool::prelude::*;
//! use std::time::Duration;
//!
//! let pool = ThreadPool::new(Config::default()).unwrap();
//! pool.start(4).unwrap();
//!
//! pool.post(|| println!("now"));
//! let later = pool.schedule(Duration::from_millis(200), || println!("later"));
//! later.cancel();
//!
//! // blocks until everything that wasn't cancelled has run
//! pool.stop();
//! ```
//!
//! # Guarantees
//!
//! - A task's work runs at most once, on exactly one worker thread.
//! - Scheduled work never runs before its delay has elapsed; it may run later.
//! - Within a worker, earlier due times run first and equal due times run in
//!   submission order. Nothing is ordered across workers.
//! - Cancellation is cooperative: it wins only if the worker has not started
//!   the task yet.
//! - Panics and `Err`s from work are reported to an [`ExceptionSink`] and never
//!   take the worker down.

#![warn(missing_debug_implementations)]

pub mod config;
pub mod error;
pub mod executor;
pub mod prelude;
pub mod scheduler;

pub use config::{Config, ConfigBuilder, ShutdownMode};
pub use error::{Error, Result};
pub use executor::{
    ExceptionSink, FailureReport, LogSink, TaskGuard, TaskHandle, TaskId, TaskState, ThreadPool,
    WorkFailure, Worker, WorkerSnapshot, WorkerStatus,
};

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_post_and_stop() {
        let pool = ThreadPool::new(Config::builder().num_threads(2).build().unwrap()).unwrap();
        pool.start(2).unwrap();

        let counter = Arc::new(Mutex::new(0));
        for _ in 0..10 {
            let counter = counter.clone();
            pool.post(move || {
                *counter.lock() += 1;
            });
        }

        pool.stop();
        assert_eq!(*counter.lock(), 10);
    }

    #[test]
    fn test_schedule_and_cancel() {
        let pool = ThreadPool::new(Config::default()).unwrap();
        pool.start(1).unwrap();

        let hit = Arc::new(Mutex::new(false));
        let h = hit.clone();
        let handle = pool.schedule(Duration::from_millis(50), move || *h.lock() = true);
        assert!(handle.cancel());

        pool.stop();
        assert!(!*hit.lock());
        assert!(handle.is_cancelled());
    }
}
