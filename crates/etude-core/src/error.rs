use std::io;

use crate::config::ConfigError;
use crate::pool::PoolError;
use crate::worker::WorkerError;

/// Central error type for the etude core engine.
#[derive(Debug, thiserror::Error)]
pub enum EtudeError {
    /// Underlying I/O error from the OS or network.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration could not be loaded or failed validation.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The backend connection pool failed.
    #[error("resource pool error: {0}")]
    Pool(#[from] PoolError),

    /// The worker pool could not be started.
    #[error("worker pool error: {0}")]
    Worker(#[from] WorkerError),

    /// Generic or miscellaneous error.
    #[error("{0}")]
    Other(String),
}

pub type EtudeResult<T> = Result<T, EtudeError>;
