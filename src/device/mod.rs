//! Capture devices.
//!
//! The capture session talks to hardware only through [`CaptureDevice`].
//! Two implementations are provided:
//!
//! - [`V4l2Device`]: a `/dev/videoN` node opened through the `v4l` crate,
//!   streaming with `V4L2_MEMORY_DMABUF` buffers
//! - [`SimulatedDevice`]: an in-process device that writes a deterministic
//!   pattern into queued buffers, for tests and hardware-less runs
//!
//! Every method reports failures as [`std::io::Error`]; the session maps
//! them into [`crate::Error`] according to the operation that failed.

mod sim;
mod v4l2;

pub use sim::SimulatedDevice;
pub use v4l2::V4l2Device;

use crate::format::{ApiMode, FrameDescriptor, Planes};
use std::io;
use std::os::fd::BorrowedFd;
use std::time::Duration;

/// `V4L2_CAP_VIDEO_CAPTURE`: single-planar capture.
pub const CAP_VIDEO_CAPTURE: u32 = 0x0000_0001;
/// `V4L2_CAP_VIDEO_CAPTURE_MPLANE`: multi-planar capture.
pub const CAP_VIDEO_CAPTURE_MPLANE: u32 = 0x0000_1000;
/// `V4L2_CAP_STREAMING`: streaming I/O ioctls.
pub const CAP_STREAMING: u32 = 0x0400_0000;

/// What a device reports about itself.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeviceCapabilities {
    /// Driver name.
    pub driver: String,
    /// Device name.
    pub card: String,
    /// Bus location.
    pub bus_info: String,
    /// `V4L2_CAP_*` flags of the opened node.
    pub flags: u32,
}

impl DeviceCapabilities {
    /// Whether single-planar capture is supported.
    pub fn supports_single_plane(&self) -> bool {
        self.flags & CAP_VIDEO_CAPTURE != 0
    }

    /// Whether multi-planar capture is supported.
    pub fn supports_multi_plane(&self) -> bool {
        self.flags & CAP_VIDEO_CAPTURE_MPLANE != 0
    }

    /// The API mode a session should use, preferring single-planar.
    /// `None` if the device cannot capture at all.
    pub fn api_mode(&self) -> Option<ApiMode> {
        if self.supports_single_plane() {
            Some(ApiMode::SinglePlane)
        } else if self.supports_multi_plane() {
            Some(ApiMode::MultiPlane)
        } else {
            None
        }
    }
}

/// Memory descriptor for one plane of a queued buffer.
#[derive(Debug, Clone, Copy)]
pub struct PlaneAttachment<'a> {
    /// The buffer region the device writes into.
    pub fd: BorrowedFd<'a>,
    /// Usable length of the region in bytes.
    pub length: u32,
}

/// Per-plane actuals of a dequeued buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlaneUsage {
    /// Bytes the device wrote.
    pub bytes_used: u32,
    /// Offset of the payload in the region.
    pub data_offset: u32,
}

/// A buffer handed back by the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DequeuedBuffer {
    /// Pool index of the buffer.
    pub index: u32,
    /// Frame sequence number.
    pub sequence: u32,
    /// One entry per plane. Single-planar buffers report one plane at
    /// offset 0.
    pub planes: Planes<PlaneUsage>,
}

/// Result of waiting for the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// A filled buffer can be dequeued.
    Ready,
    /// Nothing arrived before the timeout.
    TimedOut,
}

/// A video capture device using externally allocated (DMABUF) buffers.
///
/// The calls mirror the V4L2 streaming-I/O sequence:
///
/// 1. [`capabilities`](Self::capabilities), [`get_format`](Self::get_format)
///    and [`set_format`](Self::set_format) to negotiate
/// 2. [`request_buffers`](Self::request_buffers) and
///    [`queue_buffer`](Self::queue_buffer) to register the pool
/// 3. [`stream_on`](Self::stream_on), then [`wait_ready`](Self::wait_ready),
///    [`dequeue_buffer`](Self::dequeue_buffer) and `queue_buffer` in a loop
/// 4. [`stream_off`](Self::stream_off) and `request_buffers(mode, 0)` to
///    release
pub trait CaptureDevice {
    /// Query driver identity and capability flags.
    fn capabilities(&self) -> io::Result<DeviceCapabilities>;

    /// Read the current format.
    fn get_format(&self, mode: ApiMode) -> io::Result<FrameDescriptor>;

    /// Apply a format. The device may adjust it; read it back with
    /// [`get_format`](Self::get_format).
    fn set_format(&mut self, desc: &FrameDescriptor) -> io::Result<()>;

    /// Ask for `count` DMABUF buffer slots and return how many were granted.
    /// A count of 0 releases all slots.
    fn request_buffers(&mut self, mode: ApiMode, count: u32) -> io::Result<u32>;

    /// Hand buffer `index` to the device with one descriptor per plane.
    fn queue_buffer(
        &mut self,
        mode: ApiMode,
        index: u32,
        planes: &[PlaneAttachment<'_>],
    ) -> io::Result<()>;

    /// Take the next filled buffer from the device.
    fn dequeue_buffer(&mut self, mode: ApiMode, num_planes: usize) -> io::Result<DequeuedBuffer>;

    /// Start streaming.
    fn stream_on(&mut self, mode: ApiMode) -> io::Result<()>;

    /// Stop streaming. All queued buffers return to the application.
    fn stream_off(&mut self, mode: ApiMode) -> io::Result<()>;

    /// Block until a buffer is ready or `timeout` elapses.
    fn wait_ready(&mut self, timeout: Duration) -> io::Result<Readiness>;
}

impl<D: CaptureDevice + ?Sized> CaptureDevice for &mut D {
    fn capabilities(&self) -> io::Result<DeviceCapabilities> {
        (**self).capabilities()
    }

    fn get_format(&self, mode: ApiMode) -> io::Result<FrameDescriptor> {
        (**self).get_format(mode)
    }

    fn set_format(&mut self, desc: &FrameDescriptor) -> io::Result<()> {
        (**self).set_format(desc)
    }

    fn request_buffers(&mut self, mode: ApiMode, count: u32) -> io::Result<u32> {
        (**self).request_buffers(mode, count)
    }

    fn queue_buffer(
        &mut self,
        mode: ApiMode,
        index: u32,
        planes: &[PlaneAttachment<'_>],
    ) -> io::Result<()> {
        (**self).queue_buffer(mode, index, planes)
    }

    fn dequeue_buffer(&mut self, mode: ApiMode, num_planes: usize) -> io::Result<DequeuedBuffer> {
        (**self).dequeue_buffer(mode, num_planes)
    }

    fn stream_on(&mut self, mode: ApiMode) -> io::Result<()> {
        (**self).stream_on(mode)
    }

    fn stream_off(&mut self, mode: ApiMode) -> io::Result<()> {
        (**self).stream_off(mode)
    }

    fn wait_ready(&mut self, timeout: Duration) -> io::Result<Readiness> {
        (**self).wait_ready(timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(flags: u32) -> DeviceCapabilities {
        DeviceCapabilities {
            flags,
            ..Default::default()
        }
    }

    #[test]
    fn test_single_plane_preferred() {
        let both = caps(CAP_VIDEO_CAPTURE | CAP_VIDEO_CAPTURE_MPLANE | CAP_STREAMING);
        assert_eq!(both.api_mode(), Some(ApiMode::SinglePlane));
    }

    #[test]
    fn test_multi_plane_fallback() {
        let mplane = caps(CAP_VIDEO_CAPTURE_MPLANE);
        assert_eq!(mplane.api_mode(), Some(ApiMode::MultiPlane));
    }

    #[test]
    fn test_no_capture_capability() {
        assert_eq!(caps(CAP_STREAMING).api_mode(), None);
        assert_eq!(caps(0).api_mode(), None);
    }
}
