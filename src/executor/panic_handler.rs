use super::task::TaskId;
use super::worker::WorkerId;
use std::error::Error as StdError;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Error type returned by fallible work submitted with `try_post`/`try_schedule`.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Why a task's work did not finish normally.
#[derive(Debug)]
pub enum WorkFailure {
    Panicked(PanicInfo),
    Errored(BoxError),
}

impl WorkFailure {
    /// Outermost message first, then every `source()` below it.
    pub fn chain(&self) -> Vec<String> {
        match self {
            WorkFailure::Panicked(info) => vec![format!("panicked: {}", info.message)],
            WorkFailure::Errored(err) => {
                let mut out = vec![err.to_string()];
                let mut source = err.source();
                while let Some(cause) = source {
                    out.push(cause.to_string());
                    source = cause.source();
                }
                out
            }
        }
    }
}

impl fmt::Display for WorkFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkFailure::Panicked(info) => write!(f, "panicked: {}", info.message),
            WorkFailure::Errored(err) => write!(f, "{}", err),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PanicInfo {
    pub message: String,
}

impl PanicInfo {
    fn from_payload(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "Unknown panic".to_string()
        };

        Self { message }
    }
}

/// Everything a sink is told about one failed task.
#[derive(Debug)]
pub struct FailureReport<'a> {
    pub worker: WorkerId,
    pub task: TaskId,
    pub failure: &'a WorkFailure,
}

/// Receives every failure that escapes a task's work.
///
/// Called on the worker thread that ran the task. A sink that panics is
/// contained and the worker keeps going.
pub trait ExceptionSink: Send + Sync {
    fn report(&self, report: &FailureReport<'_>);
}

impl<F> ExceptionSink for F
where
    F: Fn(&FailureReport<'_>) + Send + Sync,
{
    fn report(&self, report: &FailureReport<'_>) {
        self(report)
    }
}

/// Default sink: one `error!` event per link of the cause chain.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl ExceptionSink for LogSink {
    fn report(&self, report: &FailureReport<'_>) {
        let mut chain = report.failure.chain().into_iter();
        if let Some(head) = chain.next() {
            tracing::error!(worker = report.worker, task = %report.task, "task failed: {}", head);
        }
        for cause in chain {
            tracing::error!(worker = report.worker, task = %report.task, "  caused by: {}", cause);
        }
    }
}

/// Runs work under `catch_unwind` and forwards failures to the sink.
pub struct PanicHandler {
    sink: Arc<dyn ExceptionSink>,
    failure_count: AtomicUsize,
}

impl PanicHandler {
    pub fn new(sink: Arc<dyn ExceptionSink>) -> Self {
        Self {
            sink,
            failure_count: AtomicUsize::new(0),
        }
    }

    pub fn execute<F>(&self, worker: WorkerId, task: TaskId, f: F) -> Result<(), WorkFailure>
    where
        F: FnOnce() -> Result<(), BoxError>,
    {
        let failure = match catch_unwind(AssertUnwindSafe(f)) {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(err)) => WorkFailure::Errored(err),
            Err(payload) => WorkFailure::Panicked(PanicInfo::from_payload(payload)),
        };

        self.failure_count.fetch_add(1, Ordering::Relaxed);

        let report = FailureReport {
            worker,
            task,
            failure: &failure,
        };
        if catch_unwind(AssertUnwindSafe(|| self.sink.report(&report))).is_err() {
            tracing::error!(worker, task = %task, "exception sink panicked while reporting: {}", failure);
        }

        Err(failure)
    }

    pub fn failure_count(&self) -> usize {
        self.failure_count.load(Ordering::Relaxed)
    }
}

impl Default for PanicHandler {
    fn default() -> Self {
        Self::new(Arc::new(LogSink))
    }
}

impl fmt::Debug for PanicHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PanicHandler")
            .field("failure_count", &self.failure_count())
            .finish()
    }
}
