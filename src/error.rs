//! Error types for Riffle.

use thiserror::Error;

/// Result type alias using Riffle's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Riffle operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A blocked ring-buffer operation was woken by `abort()`.
    ///
    /// This is part of the normal shutdown path: the woken side should
    /// stop, not retry.
    #[error("ring buffer operation aborted")]
    Aborted,

    /// A ring-buffer operation made no progress within its timeout.
    ///
    /// Recoverable: the caller may retry or treat it as a soft stall.
    #[error("ring buffer operation timed out")]
    Timeout,

    /// Write attempted after the producer marked the buffer done.
    #[error("ring buffer already marked done")]
    Done,

    /// The event bus has shut down.
    #[error("event bus closed")]
    BusClosed,

    /// An element tag is already registered in the pipeline.
    #[error("tag '{0}' is already registered")]
    DuplicateTag(String),

    /// A link or lookup referenced a tag that was never registered.
    #[error("tag '{0}' is not registered")]
    UnknownTag(String),

    /// A link tried to bind an endpoint that is already bound.
    #[error("element '{tag}' already has its {endpoint} endpoint bound")]
    EndpointBound {
        /// Tag of the element whose endpoint is taken.
        tag: String,
        /// Which endpoint ("input" or "output").
        endpoint: &'static str,
    },

    /// Linked elements disagree on the connecting buffer capacity.
    #[error(
        "capacity contract mismatch linking '{upstream}' -> '{downstream}': \
         upstream produces {produced} bytes, downstream requires {required}"
    )]
    CapacityMismatch {
        /// Tag of the producing element.
        upstream: String,
        /// Tag of the consuming element.
        downstream: String,
        /// Capacity of the upstream output buffer.
        produced: usize,
        /// Capacity the downstream element was configured to expect.
        required: usize,
    },

    /// An element or pipeline was used outside its legal state range.
    #[error("invalid state: expected {expected}, found {actual}")]
    InvalidState {
        /// The state(s) the operation requires.
        expected: &'static str,
        /// The state actually observed.
        actual: &'static str,
    },

    /// An operation violated lifecycle ordering (e.g. linking after run).
    #[error("lifecycle violation: {0}")]
    Lifecycle(String),

    /// A stage's own processing callback failed.
    #[error("stage error: {0}")]
    Stage(String),

    /// A stage received a control command it does not implement.
    #[error("unsupported command: {0}")]
    UnsupportedCommand(&'static str),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error is part of the normal shutdown path.
    ///
    /// Aborts are raised to unblock workers during stop/terminate and
    /// must never be retried or reported as faults.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Error::Aborted)
    }
}
