//! # dmabuf-capture
//!
//! Zero-copy video capture into DMA-heap buffers.
//!
//! Buffers are allocated from a kernel DMA heap, mapped into this process,
//! and handed to a V4L2 capture device as dmabuf file descriptors. The
//! device writes frames straight into them; the CPU reads them only inside
//! explicit sync windows, and every buffer is owned by exactly one side at
//! a time.
//!
//! ## Features
//!
//! - **DMA heap allocation**: `/dev/dma_heap/*` with a memfd fallback
//! - **Explicit cache coherency**: `DMA_BUF_IOCTL_SYNC` begin/end windows
//! - **Ownership tracking**: each pool index is device- or application-owned
//! - **Single- and multi-planar V4L2**: chosen from device capabilities
//! - **Hardware-free testing**: a simulated capture device
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use dmabuf_capture::prelude::*;
//! use std::time::Duration;
//!
//! let mut session = CaptureSession::open(V4l2Device::open("/dev/video0")?)?;
//! let format = session.negotiate(FormatRequest::new(1920, 1080, FourCc::YUYV))?;
//! session.allocate_and_register(&DmaHeap::open()?, 3)?;
//! session.start()?;
//!
//! let summary = session.run(10, Duration::from_secs(5), |frame, planes| {
//!     println!("frame {} ({} bytes)", frame.sequence, planes[0].len());
//!     Ok(())
//! })?;
//! session.stop()?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod config;
pub mod device;
pub mod error;
pub mod format;
pub mod memory;
pub mod observability;
pub mod session;
pub mod sink;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::config::{CaptureConfig, HeapSource};
    pub use crate::device::{CaptureDevice, SimulatedDevice, V4l2Device};
    pub use crate::error::{Error, Result};
    pub use crate::format::{ApiMode, FormatRequest, FourCc, FrameDescriptor};
    pub use crate::memory::{BufferPool, DmaHeap, HeapAllocator, MemfdHeap, Ownership};
    pub use crate::session::{
        CaptureSession, CapturedFrame, DequeueOutcome, RunSummary, StreamState,
    };
    pub use crate::sink::RawFrameSink;
}

pub use error::{Error, Result};
