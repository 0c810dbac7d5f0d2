use thiserror::Error;

/// Top-level error type for every fallible engine operation.
///
/// Admission rejections (high water, concurrency, rate limit) are *not*
/// errors and never show up here: the broker signals refusal by returning
/// `Ok(None)`. Storage failures always propagate to the caller of the
/// enclosing operation.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// Task name has no entry in the task map. Fatal configuration error.
    #[error("unknown task {0}. It is missing from the workflow task map")]
    UnknownTask(String),

    /// Invalid engine or policy configuration, detected synchronously.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The persistence collaborator failed. Never swallowed by the core.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// A flow controller enqueue was refused by the broker's admission
    /// control.
    #[error("can not enqueue {0}: broker refused to take task")]
    EnqueueRefused(String),

    /// `Worker::stop` gave up waiting for the in-flight batch. The handler
    /// keeps running in the background.
    #[error("couldn't stop worker {0} in time")]
    WorkerStopTimeout(String),
}

/// Error raised by a `Storage` implementation.
#[derive(Debug, Error)]
#[error("storage error: {0}")]
pub struct StorageError(pub String);

impl StorageError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

pub type Result<T> = std::result::Result<T, WorkflowError>;

/// Result type returned by `Storage` implementations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;
