//! Capture run configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::format::{FourCc, FormatRequest};
use crate::memory::defaults::{
    DEFAULT_BUFFER_COUNT, DEFAULT_DEVICE, DEFAULT_FRAME_COUNT, DEFAULT_OUTPUT_DIR, DEFAULT_TIMEOUT,
    DMA_HEAP_PATHS,
};
use crate::memory::{DmaHeap, HeapAllocator, MemfdHeap};

/// Where capture buffers are allocated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeapSource {
    /// The first DMA heap node that opens, from the given list.
    DmaHeap(Vec<PathBuf>),
    /// Anonymous memfd regions.
    Memfd,
}

impl HeapSource {
    /// The default DMA heap node list.
    pub fn default_dma_heap() -> Self {
        HeapSource::DmaHeap(DMA_HEAP_PATHS.iter().map(PathBuf::from).collect())
    }

    /// Open the allocator.
    pub fn open(&self) -> Result<Box<dyn HeapAllocator>> {
        match self {
            HeapSource::DmaHeap(paths) => Ok(Box::new(DmaHeap::open_any(paths.as_slice())?)),
            HeapSource::Memfd => Ok(Box::new(MemfdHeap::new())),
        }
    }
}

/// Settings for one capture run.
///
/// Zero width, height or fourcc keep the device's current value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConfig {
    /// Capture device node.
    pub device: PathBuf,
    /// Requested width (0 = keep).
    pub width: u32,
    /// Requested height (0 = keep).
    pub height: u32,
    /// Requested pixel encoding ([`FourCc::NONE`] = keep).
    pub fourcc: FourCc,
    /// Frames to capture.
    pub frames: u32,
    /// How long to wait for each frame.
    pub timeout: Duration,
    /// Directory frame dumps go to.
    pub output_dir: PathBuf,
    /// Buffers in the capture ring.
    pub buffer_count: usize,
    /// Buffer allocator.
    pub heap: HeapSource,
    /// Use the simulated device instead of `device`.
    pub simulate: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: PathBuf::from(DEFAULT_DEVICE),
            width: 0,
            height: 0,
            fourcc: FourCc::NONE,
            frames: DEFAULT_FRAME_COUNT,
            timeout: DEFAULT_TIMEOUT,
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            buffer_count: DEFAULT_BUFFER_COUNT,
            heap: HeapSource::default_dma_heap(),
            simulate: false,
        }
    }
}

impl CaptureConfig {
    /// The format request these settings describe.
    pub fn format_request(&self) -> FormatRequest {
        FormatRequest::new(self.width, self.height, self.fourcc)
    }

    /// Check the settings before any device is touched.
    pub fn validate(&self) -> Result<()> {
        if self.buffer_count == 0 {
            return Err(Error::AllocationFailed("buffer count must be at least 1".into()));
        }
        if !self.output_dir.is_dir() {
            return Err(Error::Sink(format!(
                "output directory {} does not exist",
                self.output_dir.display()
            )));
        }
        Ok(())
    }
}
