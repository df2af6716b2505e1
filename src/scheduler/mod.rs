//! Where and when tasks run.
//!
//! Each worker keeps its own `DelayQueue`; `placement` decides which worker
//! receives a new submission.

pub(crate) mod delay_queue;
pub mod placement;

pub(crate) use delay_queue::DelayQueue;
pub use placement::least_loaded;
