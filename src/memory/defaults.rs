//! Default sizes, counts and device paths.
//!
//! These mirror what a small capture tool needs out of the box: a
//! three-buffer ring, a five-second readiness timeout, and the DMA heap
//! nodes a CMA-backed system usually exposes.
//!
//! # Usage
//!
//! ```rust,ignore
//! use dmabuf_capture::memory::{defaults, DmaHeap};
//!
//! let heap = DmaHeap::open_any(defaults::DMA_HEAP_PATHS)?;
//! ```

use std::time::Duration;

// =============================================================================
// Buffer ring
// =============================================================================

/// Buffers in a capture ring. The device must grant at least this many.
pub const DEFAULT_BUFFER_COUNT: usize = 3;

// =============================================================================
// Heaps
// =============================================================================

/// DMA heap nodes, in the order they are tried.
///
/// A CMA area configured from a device tree node shows up as `linux,cma`;
/// otherwise the node is `reserved`.
pub const DMA_HEAP_PATHS: &[&str] = &["/dev/dma_heap/linux,cma", "/dev/dma_heap/reserved"];

// =============================================================================
// Timing
// =============================================================================

/// How long to wait for a frame before giving up.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000);

/// Attempts for a dmabuf sync ioctl interrupted by EINTR/EAGAIN.
pub const SYNC_MAX_RETRIES: u32 = 64;

// =============================================================================
// Run
// =============================================================================

/// Default capture device node.
pub const DEFAULT_DEVICE: &str = "/dev/video0";

/// Frames captured per run.
pub const DEFAULT_FRAME_COUNT: u32 = 10;

/// Directory frame dumps are written to.
pub const DEFAULT_OUTPUT_DIR: &str = "/tmp";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heap_order() {
        assert_eq!(DMA_HEAP_PATHS[0], "/dev/dma_heap/linux,cma");
        assert_eq!(DMA_HEAP_PATHS[1], "/dev/dma_heap/reserved");
    }
}
