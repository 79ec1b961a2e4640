//! Error types for kyrorx.
//!
//! All errors in kyrorx are strongly typed using thiserror.
//! Observer-side failures are reported through error channels and use
//! [`ObserverError`](crate::reactive::ObserverError) instead; everything that
//! is returned to a caller or a waiter is an [`RxError`].

use thiserror::Error;

/// Validation errors raised while configuring subscriptions, streams or pools.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Illegal combination of subscription options: {reason}")]
    IllegalCombination {
        reason: String,
    },

    #[error("Capacity for '{field}' must be at least 1")]
    ZeroCapacity {
        field: String,
    },
}

/// Execution errors raised by the async executor and its handles.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("Work queue '{path}' is full (capacity {capacity})")]
    QueueFull {
        path: String,
        capacity: usize,
    },

    #[error("Channel '{path}' disconnected")]
    Disconnected {
        path: String,
    },

    #[error("Operation timed out after {duration_ms}ms")]
    Timeout {
        duration_ms: u64,
    },

    #[error("Waiter was cancelled before the work completed")]
    Cancelled,

    #[error("Work failed: {message}")]
    WorkFailed {
        message: String,
    },

    #[error("Work panicked: {message}")]
    WorkPanicked {
        message: String,
    },

    #[error("Write attempted inside a read transaction")]
    ReadOnlyTransaction,

    #[error("Transaction error: {message}")]
    Transaction {
        message: String,
    },

    #[error("Failed to spawn thread '{name}': {message}")]
    SpawnFailed {
        name: String,
        message: String,
    },
}

/// Terminal states of a buffered stream.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StreamError {
    /// The stream was closed gracefully.
    #[error("Stream closed")]
    Closed,

    /// The `Error` backpressure policy overflowed.
    #[error("Stream buffer overflowed (capacity {capacity})")]
    Overflow {
        capacity: usize,
    },

    /// The `Missing` policy overflowed. This is a consumer misconfiguration.
    #[error("Missing backpressure: producer outpaced a consumer that declared no buffering strategy (capacity {capacity})")]
    MissingBackpressure {
        capacity: usize,
    },

    /// The upstream subscription failed terminally.
    #[error("Upstream failed: {message}")]
    Upstream {
        message: String,
    },
}

/// Top-level error type for kyrorx.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RxError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl RxError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Creates a work failure, the usual way for work closures to fail.
    #[must_use]
    pub fn work(message: impl Into<String>) -> Self {
        Self::Execution(ExecutionError::WorkFailed {
            message: message.into(),
        })
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is an execution error.
    #[must_use]
    pub const fn is_execution(&self) -> bool {
        matches!(self, Self::Execution(_))
    }

    /// Returns true if this is a stream error.
    #[must_use]
    pub const fn is_stream(&self) -> bool {
        matches!(self, Self::Stream(_))
    }

    /// Returns true if this is an internal error.
    #[must_use]
    pub const fn is_internal(&self) -> bool {
        matches!(self, Self::Internal { .. })
    }

    /// Returns true if the waiter was cancelled.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Execution(ExecutionError::Cancelled))
    }

    /// Returns true for stream terminations caused by an error rather than a
    /// graceful close.
    #[must_use]
    pub const fn is_terminal_stream_error(&self) -> bool {
        matches!(
            self,
            Self::Stream(
                StreamError::Overflow { .. }
                    | StreamError::MissingBackpressure { .. }
                    | StreamError::Upstream { .. }
            )
        )
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Execution(e) => matches!(e, ExecutionError::QueueFull { .. } | ExecutionError::Timeout { .. }),
            Self::Validation(_) | Self::Stream(_) | Self::Internal { .. } => false,
        }
    }
}

/// Result type alias for kyrorx operations.
pub type RxResult<T> = Result<T, RxError>;
