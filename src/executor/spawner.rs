use std::io;
use std::thread::{self, JoinHandle};

/// Starts a worker's OS thread.
///
/// The builder already carries the worker's thread name and stack size.
pub trait Spawner: Send + Sync {
    fn spawn(
        &self,
        builder: thread::Builder,
        entry: Box<dyn FnOnce() + Send + 'static>,
    ) -> io::Result<JoinHandle<()>>;
}

/// Spawns plain `std::thread`s.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSpawner;

impl Spawner for ThreadSpawner {
    fn spawn(
        &self,
        builder: thread::Builder,
        entry: Box<dyn FnOnce() + Send + 'static>,
    ) -> io::Result<JoinHandle<()>> {
        builder.spawn(entry)
    }
}
