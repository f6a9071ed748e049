//! Logging and tracing setup.
//!
//! All diagnostics go through `tracing`. Binaries install a `fmt`
//! subscriber with [`init_tracing`]; `RUST_LOG` overrides the default
//! filter:
//!
//! ```bash
//! RUST_LOG=dmabuf_capture=debug dmabuf-capture --simulate -l 5
//! ```
//!
//! Spans:
//! - `session` around a whole capture run (device, format)
//! - `frame` around the handling of one dequeued frame

mod tracing_support;

pub use tracing_support::{init_tracing, instrument_session, span_frame, span_session};
