//! Error types for dmabuf-capture.

use thiserror::Error;

/// Result type alias using the crate's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for capture operations.
///
/// A wait that times out is not an error; it is reported as
/// [`DequeueOutcome::Timeout`](crate::session::DequeueOutcome::Timeout).
#[derive(Error, Debug)]
pub enum Error {
    /// None of the known DMA heap nodes could be opened.
    #[error("no DMA heap available (tried {0})")]
    NoHeapAvailable(String),

    /// Region allocation failed.
    #[error("buffer allocation failed: {0}")]
    AllocationFailed(String),

    /// Mapping a region for CPU access failed.
    #[error("buffer mapping failed: {0}")]
    MappingFailed(String),

    /// A CPU access window could not be opened or closed.
    #[error("dmabuf sync failed: {0}")]
    SyncFailed(String),

    /// The device could not report or accept a format.
    #[error("format rejected by device: {0}")]
    FormatRejected(String),

    /// The device does not support video capture.
    #[error("unsupported device: {0}")]
    UnsupportedDevice(String),

    /// The device refused the buffer pool.
    #[error("buffer registration rejected: {0}")]
    RegistrationRejected(String),

    /// The device refused to start streaming.
    #[error("stream start rejected: {0}")]
    DeviceStartRejected(String),

    /// Dequeuing a buffer failed.
    #[error("dequeue failed: {0}")]
    DequeueFailed(String),

    /// Handing a buffer back to the device failed.
    #[error("requeue failed: {0}")]
    RequeueFailed(String),

    /// Operation not allowed in the session's current state.
    #[error("{operation} not allowed while session is {state}")]
    InvalidState {
        /// The operation that was attempted.
        operation: &'static str,
        /// The state the session was in.
        state: &'static str,
    },

    /// Buffer index outside the pool.
    #[error("buffer index {0} out of range")]
    InvalidIndex(usize),

    /// Malformed pixel format code.
    #[error("invalid fourcc: {0:?}")]
    InvalidFourCc(String),

    /// Writing a frame to the sink failed.
    #[error("frame sink error: {0}")]
    Sink(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// System call error (via rustix).
    #[error("system error: {0}")]
    System(#[from] rustix::io::Errno),
}
