//! Error types for the dispatch queue core.

use std::fmt;

/// The error type for queue operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// Submission was attempted on a queue that has already been disposed.
    Disposed,
    /// `verify_on_queue` was called from a thread that is not currently
    /// executing a work item belonging to this queue.
    WrongQueue,
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disposed => write!(f, "queue has been disposed"),
            Self::WrongQueue => write!(f, "not executing on the expected queue"),
        }
    }
}

impl std::error::Error for QueueError {}

/// A specialized `Result` type for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;

/// The panic payload captured from a work item that escaped `execution_lock`.
///
/// Delivered verbatim to an `on_unhandled_error` sink; never re-thrown from a
/// pool worker.
pub type PanicPayload = Box<dyn std::any::Any + Send + 'static>;
