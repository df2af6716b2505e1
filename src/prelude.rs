pub use crate::config::{Config, ConfigBuilder, ShutdownMode};
pub use crate::error::{Error, Result};
pub use crate::executor::{
    ExceptionSink, FailureReport, TaskHandle, TaskState, ThreadPool, WorkFailure,
};
