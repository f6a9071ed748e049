//! Subscriber installation and span helpers.

use tracing::{Level, Span, span};
use tracing_subscriber::EnvFilter;

/// Install a `fmt` subscriber filtered by `RUST_LOG`, falling back to
/// `default_filter` (e.g. `"dmabuf_capture=info"`).
///
/// Returns `false` if a global subscriber was already installed.
pub fn init_tracing(default_filter: &str) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .is_ok()
}

/// Create a span for a capture run on `device`.
///
/// # Example
///
/// ```rust,ignore
/// use dmabuf_capture::observability::span_session;
///
/// let span = span_session("/dev/video0");
/// let _guard = span.enter();
/// // Negotiate, register and capture here...
/// ```
#[inline]
pub fn span_session(device: &str) -> Span {
    span!(Level::INFO, "session", device = %device)
}

/// Create a span for handling one dequeued frame.
#[inline]
pub fn span_frame(index: usize, sequence: u32) -> Span {
    span!(Level::DEBUG, "frame", index, sequence)
}

/// Enter a session span and return the guard.
pub fn instrument_session(device: &str) -> tracing::span::EnteredSpan {
    span_session(device).entered()
}
