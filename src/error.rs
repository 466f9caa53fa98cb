use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the skeleton B-tree and its archiver contracts.
///
/// `NotLoaded` is the only retryable variant: inflate the reported range
/// and repeat the operation. `TaskComplete` is a notification that a
/// duplicate unit of work was eliminated; it travels through the error
/// channel of a scheduler but is not a failure.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("node not loaded: {range}")]
    NotLoaded { range: String },
    #[error("data format mismatch: {0}")]
    DataFormat(String),
    #[error("task aborted: {context}")]
    TaskAbort {
        context: String,
        #[source]
        cause: Option<Box<Error>>,
    },
    #[error("task already completed elsewhere")]
    TaskComplete,
    #[error("illegal state: {0}")]
    IllegalState(String),
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
    #[error("node_min {0} is too small, the minimum fan-out is 2")]
    NodeMinTooSmall(usize),
    #[error(transparent)]
    IntConversion(#[from] std::num::TryFromIntError),
    #[error(transparent)]
    IO(#[from] std::io::Error),
    #[error(transparent)]
    Encoding(#[from] bincode::Error),
}

impl Error {
    /// Wrap a failure in a `TaskAbort` carrying the range it happened in.
    pub fn abort(context: impl Into<String>, cause: Error) -> Error {
        Error::TaskAbort {
            context: context.into(),
            cause: Some(Box::new(cause)),
        }
    }

    /// A `TaskAbort` without an underlying cause.
    pub fn abort_msg(context: impl Into<String>) -> Error {
        Error::TaskAbort {
            context: context.into(),
            cause: None,
        }
    }

    /// True for the duplicate-work notification.
    pub fn is_task_complete(&self) -> bool {
        matches!(self, Error::TaskComplete)
    }
}
