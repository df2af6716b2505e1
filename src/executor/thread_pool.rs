use super::panic_handler::{BoxError, ExceptionSink, LogSink};
use super::spawner::{Spawner, ThreadSpawner};
use super::task::TaskHandle;
use super::worker::{Worker, WorkerSnapshot};
use crate::config::{Config, ShutdownMode};
use crate::error::{Error, Result};
use crate::scheduler::least_loaded;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

type WorkerSet = Arc<Vec<Worker>>;

/// A fixed set of workers with least-loaded placement.
///
/// Every submission goes to the worker with the smallest load (queued tasks
/// plus the one executing), earliest worker on a tie. Submitting while the
/// pool is not running returns an empty `TaskHandle`.
///
/// # Shutdown
///
/// With the default `ShutdownMode::Drain`, [`ThreadPool::stop`] blocks until
/// every task that was not cancelled has executed, including tasks scheduled
/// far in the future: a pool holding a task due in an hour takes an hour to
/// stop. Use `ShutdownMode::CancelPending` (in `Config` or through
/// [`ThreadPool::stop_with`]) to cancel queued work instead.
///
/// The pool reports `is_running() == true` until the drain has finished. A
/// `stop` arriving while another is draining joins the same workers and
/// returns no earlier than the first one.
pub struct ThreadPool {
    workers: RwLock<WorkerSet>,
    // workers taken out by a stop that is still draining them
    draining: Mutex<Option<WorkerSet>>,
    running: AtomicBool,
    config: Config,
    sink: Arc<dyn ExceptionSink>,
    spawner: Arc<dyn Spawner>,
}

impl ThreadPool {
    /// Creates a stopped pool.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            workers: RwLock::new(Arc::new(Vec::new())),
            draining: Mutex::new(None),
            running: AtomicBool::new(false),
            config,
            sink: Arc::new(LogSink),
            spawner: Arc::new(ThreadSpawner),
        })
    }

    /// Creates a pool and starts `config.worker_threads()` workers.
    pub fn launch(config: Config) -> Result<Self> {
        let pool = Self::new(config)?;
        pool.start(pool.config.worker_threads())?;
        Ok(pool)
    }

    /// Where failures escaping task work are reported. Applies to workers
    /// created by the next `start`.
    pub fn with_exception_sink(mut self, sink: Arc<dyn ExceptionSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn Spawner>) -> Self {
        self.spawner = spawner;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.read().len()
    }

    /// Starts `worker_count` workers.
    ///
    /// If any worker fails to start, the ones already started by this call
    /// are stopped and joined, the pool stays stopped and the error is
    /// returned.
    pub fn start(&self, worker_count: usize) -> Result<()> {
        let mut workers = self.workers.write();
        if self.is_running() {
            return Err(Error::AlreadyRunning);
        }

        let mut started: Vec<Worker> = Vec::with_capacity(worker_count);
        for id in 0..worker_count {
            let worker = Worker::new(id, &self.config, self.sink.clone());

            if let Err(e) = worker.start(self.spawner.as_ref()) {
                tracing::warn!(
                    worker = id,
                    error = %e,
                    "worker failed to start, rolling back {} started workers",
                    started.len()
                );

                for worker in started.iter().rev() {
                    worker.stop(ShutdownMode::Drain);
                    worker.join();
                }
                return Err(e);
            }

            started.push(worker);
        }

        *workers = Arc::new(started);
        self.running.store(true, Ordering::Release);

        tracing::debug!(workers = worker_count, "thread pool started");
        Ok(())
    }

    /// Stops every worker using the configured `ShutdownMode` and blocks until
    /// all of them have exited. See the type-level docs on how long this can
    /// take.
    pub fn stop(&self) {
        self.stop_with(self.config.shutdown_mode);
    }

    pub fn stop_with(&self, mode: ShutdownMode) {
        let workers = {
            let mut workers = self.workers.write();
            let mut draining = self.draining.lock();
            match draining.as_ref() {
                Some(active) => active.clone(),
                None if self.is_running() => {
                    let taken = std::mem::replace(&mut *workers, Arc::new(Vec::new()));
                    *draining = Some(taken.clone());
                    taken
                }
                None => return,
            }
        };

        for worker in workers.iter() {
            worker.stop(mode);
        }
        for worker in workers.iter() {
            worker.join();
        }

        self.finish_stop(&workers, mode);
    }

    /// Waits up to `timeout` for every worker to exit. Returns `false` if any
    /// is still running by then. Workers only exit once the pool is stopped.
    pub fn join_timeout(&self, timeout: Duration) -> bool {
        let workers = match self.draining.lock().clone() {
            Some(draining) => draining,
            None => self.workers.read().clone(),
        };
        let deadline = Instant::now().checked_add(timeout);

        if !workers.iter().all(|worker| worker.wait_exit(deadline)) {
            return false;
        }
        self.finish_stop(&workers, self.config.shutdown_mode);
        true
    }

    // First caller to see the drain complete clears it.
    fn finish_stop(&self, workers: &WorkerSet, mode: ShutdownMode) {
        let mut draining = self.draining.lock();
        if draining.as_ref().map_or(false, |d| Arc::ptr_eq(d, workers)) {
            *draining = None;
            self.running.store(false, Ordering::Release);
            tracing::debug!(workers = workers.len(), ?mode, "thread pool stopped");
        }
    }

    pub fn post<F>(&self, f: F) -> TaskHandle
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(|worker| worker.post(f))
    }

    /// Runs `f` no earlier than `delay` from now.
    pub fn schedule<F>(&self, delay: Duration, f: F) -> TaskHandle
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(|worker| worker.schedule(delay, f))
    }

    /// Like `post`, for work that can fail. An `Err` goes to the exception
    /// sink with its whole source chain.
    pub fn try_post<F, E>(&self, f: F) -> TaskHandle
    where
        F: FnOnce() -> std::result::Result<(), E> + Send + 'static,
        E: Into<BoxError>,
    {
        self.submit(|worker| worker.try_post(f))
    }

    pub fn try_schedule<F, E>(&self, delay: Duration, f: F) -> TaskHandle
    where
        F: FnOnce() -> std::result::Result<(), E> + Send + 'static,
        E: Into<BoxError>,
    {
        self.submit(|worker| worker.try_schedule(delay, f))
    }

    fn submit<S>(&self, submit: S) -> TaskHandle
    where
        S: FnOnce(&Worker) -> TaskHandle,
    {
        let workers = self.workers.read();
        match least_loaded(&workers) {
            Some(worker) => submit(worker),
            None => TaskHandle::empty(),
        }
    }

    pub fn worker_loads(&self) -> Vec<usize> {
        self.workers.read().iter().map(Worker::load).collect()
    }

    /// Tasks held by all workers, queued or executing.
    pub fn pending_tasks(&self) -> usize {
        self.worker_loads().iter().sum()
    }

    pub fn stats(&self) -> Vec<WorkerSnapshot> {
        self.workers.read().iter().map(Worker::snapshot).collect()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPool")
            .field("running", &self.is_running())
            .field("workers", &*self.workers.read())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::atomic::AtomicUsize;
    use std::thread::{self, JoinHandle};

    fn config() -> Config {
        Config::builder()
            .poll_interval(Duration::from_millis(10))
            .build()
            .unwrap()
    }

    /// Spawns real threads until `fail_at`, then refuses. Counts exited threads.
    struct FlakySpawner {
        fail_at: usize,
        spawned: AtomicUsize,
        exited: Arc<AtomicUsize>,
    }

    impl Spawner for FlakySpawner {
        fn spawn(
            &self,
            builder: thread::Builder,
            entry: Box<dyn FnOnce() + Send + 'static>,
        ) -> io::Result<JoinHandle<()>> {
            if self.spawned.fetch_add(1, Ordering::SeqCst) == self.fail_at {
                return Err(io::Error::new(io::ErrorKind::Other, "no more threads"));
            }
            let exited = self.exited.clone();
            builder.spawn(move || {
                entry();
                exited.fetch_add(1, Ordering::SeqCst);
            })
        }
    }

    #[test]
    fn test_start_and_stop() {
        let pool = ThreadPool::new(config()).unwrap();
        assert!(!pool.is_running());

        pool.start(3).unwrap();
        assert!(pool.is_running());
        assert_eq!(pool.worker_count(), 3);
        assert!(matches!(pool.start(1), Err(Error::AlreadyRunning)));

        pool.stop();
        assert!(!pool.is_running());
        assert_eq!(pool.worker_count(), 0);
    }

    #[test]
    fn test_post_when_stopped_returns_empty_handle() {
        let pool = ThreadPool::new(config()).unwrap();
        assert!(!pool.post(|| {}).is_valid());
        assert!(!pool.schedule(Duration::from_millis(1), || {}).is_valid());
    }

    #[test]
    fn test_zero_workers_returns_empty_handle() {
        let pool = ThreadPool::new(config()).unwrap();
        pool.start(0).unwrap();

        assert!(pool.is_running());
        assert!(!pool.post(|| {}).is_valid());
    }

    #[test]
    fn test_startup_failure_rolls_back() {
        let exited = Arc::new(AtomicUsize::new(0));
        let spawner = Arc::new(FlakySpawner {
            fail_at: 2,
            spawned: AtomicUsize::new(0),
            exited: exited.clone(),
        });
        let pool = ThreadPool::new(config()).unwrap().with_spawner(spawner);

        let err = pool.start(4).unwrap_err();

        assert!(matches!(err, Error::Startup { worker: 2, .. }));
        assert!(!pool.is_running());
        assert_eq!(pool.worker_count(), 0);
        assert_eq!(exited.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_restart_after_stop() {
        let pool = ThreadPool::new(config()).unwrap();
        pool.start(2).unwrap();
        pool.stop();
        pool.start(2).unwrap();

        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        pool.post(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        pool.stop();

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_launch_uses_configured_threads() {
        let config = Config::builder().num_threads(2).build().unwrap();
        let pool = ThreadPool::launch(config).unwrap();

        assert_eq!(pool.worker_count(), 2);
    }

    #[test]
    fn test_drop_drains() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let pool = ThreadPool::new(config()).unwrap();
            pool.start(2).unwrap();
            for _ in 0..10 {
                let c = counter.clone();
                pool.schedule(Duration::from_millis(5), move || {
                    c.fetch_add(1, Ordering::SeqCst);
                });
            }
        }
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_join_timeout_before_and_during_stop() {
        let pool = Arc::new(ThreadPool::new(config()).unwrap());
        pool.start(2).unwrap();
        pool.schedule(Duration::from_millis(150), || {});

        assert!(!pool.join_timeout(Duration::from_millis(20)));

        let stopper = {
            let pool = pool.clone();
            thread::spawn(move || pool.stop())
        };
        thread::sleep(Duration::from_millis(20));
        assert!(pool.is_running());
        assert!(!pool.join_timeout(Duration::from_millis(10)));

        assert!(pool.join_timeout(Duration::from_secs(5)));
        assert!(!pool.is_running());
        stopper.join().unwrap();
    }

    #[test]
    fn test_join_timeout_on_stopped_pool() {
        let pool = ThreadPool::new(config()).unwrap();
        assert!(pool.join_timeout(Duration::ZERO));
    }

    #[test]
    fn test_start_rejected_while_draining() {
        let pool = Arc::new(ThreadPool::new(config()).unwrap());
        pool.start(1).unwrap();
        pool.schedule(Duration::from_millis(100), || {});

        let stopper = {
            let pool = pool.clone();
            thread::spawn(move || pool.stop())
        };
        thread::sleep(Duration::from_millis(20));

        assert!(matches!(pool.start(1), Err(Error::AlreadyRunning)));
        assert!(!pool.post(|| {}).is_valid());

        stopper.join().unwrap();
        pool.start(1).unwrap();
        assert!(pool.post(|| {}).is_valid());
    }
}
