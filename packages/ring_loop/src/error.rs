use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// A type-erased error raised by user code.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Why a [`Promise`][crate::Promise] did not complete with a value.
///
/// Causes are cheap to clone so that every continuation and every joiner can observe the same
/// cause.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum FutureError {
    /// The task or promise was cancelled before it produced a value.
    #[error("cancelled")]
    Cancelled,

    /// A time-sharing task exhausted its timeout policy without reaching a terminal result.
    #[error("time-sharing task timed out: {bound}")]
    TimeSharingTimeout {
        /// The bound that was exceeded.
        bound: TimeoutBound,
    },

    /// User code panicked while producing the value.
    #[error("panicked: {message}")]
    Panicked {
        /// The panic message, if the payload was a string.
        message: String,
    },

    /// User code reported a failure.
    #[error("failed: {0}")]
    Failed(#[source] Arc<dyn StdError + Send + Sync + 'static>),

    /// The event loop no longer accepts work.
    #[error("rejected: the event loop is shut down")]
    Rejected,

    /// The event loop hit an unrecoverable error and terminated.
    #[error("event loop terminated by a fatal error: {0}")]
    Fatal(#[source] Arc<dyn StdError + Send + Sync + 'static>),
}

impl FutureError {
    /// Wraps a user error as [`FutureError::Failed`].
    pub fn failed(error: impl Into<BoxError>) -> Self {
        Self::Failed(Arc::from(error.into()))
    }

    pub(crate) fn fatal(error: impl Into<BoxError>) -> Self {
        Self::Fatal(Arc::from(error.into()))
    }

    pub(crate) fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        Self::Panicked {
            message: panic_message(payload),
        }
    }

    /// Whether this cause is [`FutureError::Cancelled`].
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Whether this cause is [`FutureError::TimeSharingTimeout`].
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimeSharingTimeout { .. })
    }
}

/// The limit a time-sharing task exceeded.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum TimeoutBound {
    /// The task was invoked this many times without a terminal result.
    Count(u32),

    /// This much time passed since the first invocation without a terminal result.
    Duration(Duration),
}

impl fmt::Display for TimeoutBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Count(count) => write!(f, "{count} invocations without a result"),
            Self::Duration(duration) => write!(f, "{duration:?} without a result"),
        }
    }
}

/// Why a bounded wait on a promise ended without a value.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum JoinError {
    /// The wait timed out; the promise is still pending.
    #[error("timed out waiting for completion")]
    TimedOut,

    /// The promise completed without a value.
    #[error(transparent)]
    Completed(#[from] FutureError),
}

/// Error returned by [`Agent`][crate::Agent] callbacks.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AgentError {
    /// Processing one event failed. The failure is logged and the loop moves on.
    #[error("agent failed to process an event: {0}")]
    Failed(#[source] BoxError),

    /// The agent cannot continue. The loop terminates and its termination future fails.
    #[error("agent hit an unrecoverable error: {0}")]
    Fatal(#[source] BoxError),
}

impl AgentError {
    /// Creates a recoverable [`AgentError::Failed`].
    pub fn failed(error: impl Into<BoxError>) -> Self {
        Self::Failed(error.into())
    }

    /// Creates an unrecoverable [`AgentError::Fatal`].
    pub fn fatal(error: impl Into<BoxError>) -> Self {
        Self::Fatal(error.into())
    }
}

/// Invalid configuration passed to a builder.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[non_exhaustive]
pub enum ConfigError {
    /// Ring buffer capacity must be a power of two, at least 2 and at most `i32::MAX`.
    #[error("ring buffer capacity must be a power of two of at least 2, got {capacity}")]
    InvalidCapacity {
        /// The rejected capacity.
        capacity: usize,
    },

    /// The batch size must be at least 1.
    #[error("batch size must be at least 1")]
    InvalidBatchSize,
}

/// A claim was refused because the event loop is shutting down or terminated.
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
#[error("the event loop is shut down and accepts no new events")]
pub struct Rejected;

/// Extracts a human-readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
