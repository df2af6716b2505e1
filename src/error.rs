pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A worker thread could not be spawned. Workers started earlier in the
    /// same call have already been stopped and joined.
    #[error("failed to start worker {worker}: {source}")]
    Startup {
        worker: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("already running")]
    AlreadyRunning,

    #[error("config error: {0}")]
    Config(String),
}

impl Error {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    pub fn startup(worker: usize, source: std::io::Error) -> Self {
        Error::Startup { worker, source }
    }
}
