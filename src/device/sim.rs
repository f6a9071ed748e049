//! In-process capture device.
//!
//! `SimulatedDevice` behaves like a DMABUF-importing V4L2 driver: it keeps
//! registered buffers in a FIFO, fills them on dequeue, and clamps formats
//! to its limits. Each dequeue maps every queued plane region, writes a
//! pattern derived from the frame sequence number at the start of each, and
//! unmaps them again, so the session sees exactly what a hardware writer
//! would leave behind.
//!
//! # Example
//!
//! ```rust
//! use dmabuf_capture::device::SimulatedDevice;
//! use dmabuf_capture::format::FourCc;
//!
//! let device = SimulatedDevice::new()
//!     .with_format(1280, 720, FourCc::YUYV)
//!     .grant_at_most(2);
//! ```

use std::collections::VecDeque;
use std::io;
use std::os::fd::OwnedFd;
use std::time::Duration;

use rustix::mm::{MapFlags, ProtFlags};
use tracing::{debug, trace};

use super::{
    CAP_STREAMING, CAP_VIDEO_CAPTURE, CAP_VIDEO_CAPTURE_MPLANE, CaptureDevice, DequeuedBuffer,
    DeviceCapabilities, PlaneAttachment, PlaneUsage, Readiness,
};
use crate::format::{ApiMode, FourCc, FrameDescriptor, PlaneLayout, Planes};

/// Most buffer slots the device grants.
const MAX_SLOTS: u32 = 32;

/// Smallest frame dimension.
const MIN_DIMENSION: u32 = 16;

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, msg.to_string())
}

/// A buffer the device currently holds, one region per plane.
struct QueuedBuffer {
    index: u32,
    planes: Planes<(OwnedFd, usize)>,
}

/// A software capture device for tests and `--simulate` runs.
pub struct SimulatedDevice {
    mode: ApiMode,
    capture_flags: u32,
    format: FrameDescriptor,
    supported: Vec<FourCc>,
    max_width: u32,
    max_height: u32,
    grant_limit: u32,
    reject_queue: bool,
    fail_stream_on: bool,
    stream_off_failures: u32,
    slots: u32,
    queue: VecDeque<QueuedBuffer>,
    streaming: bool,
    sequence: u32,
    stream_off_calls: u32,
    frame_delay: Option<Duration>,
}

impl SimulatedDevice {
    /// A single-planar device producing 640x480 YUYV.
    pub fn new() -> Self {
        Self::with_mode(ApiMode::SinglePlane)
    }

    /// A multi-planar-only device producing 640x480 NV12 in two planes.
    pub fn multi_plane() -> Self {
        Self::with_mode(ApiMode::MultiPlane).with_format(640, 480, FourCc::NV12)
    }

    fn with_mode(mode: ApiMode) -> Self {
        let capture_flags = match mode {
            ApiMode::SinglePlane => CAP_VIDEO_CAPTURE,
            ApiMode::MultiPlane => CAP_VIDEO_CAPTURE_MPLANE,
        };
        Self {
            mode,
            capture_flags,
            format: layout(mode, 640, 480, FourCc::YUYV),
            supported: vec![FourCc::YUYV, FourCc::UYVY, FourCc::NV12, FourCc::RGB24, FourCc::GREY],
            max_width: 4096,
            max_height: 2160,
            grant_limit: MAX_SLOTS,
            reject_queue: false,
            fail_stream_on: false,
            stream_off_failures: 0,
            slots: 0,
            queue: VecDeque::new(),
            streaming: false,
            sequence: 0,
            stream_off_calls: 0,
            frame_delay: None,
        }
    }

    /// Set the current format directly (clamped like `set_format`).
    pub fn with_format(mut self, width: u32, height: u32, fourcc: FourCc) -> Self {
        self.format = self.clamp(width, height, fourcc);
        self
    }

    /// Limit the largest frame the device produces.
    pub fn with_limits(mut self, max_width: u32, max_height: u32) -> Self {
        self.max_width = max_width.max(MIN_DIMENSION);
        self.max_height = max_height.max(MIN_DIMENSION);
        let current = self.format.clone();
        self.format = self.clamp(current.width, current.height, current.fourcc);
        self
    }

    /// Restrict the encodings the device accepts. Others fall back to the
    /// current encoding, as V4L2 drivers do.
    pub fn with_formats(mut self, formats: &[FourCc]) -> Self {
        self.supported = formats.to_vec();
        self
    }

    /// Report both single- and multi-planar capture.
    pub fn with_both_apis(mut self) -> Self {
        self.capture_flags = CAP_VIDEO_CAPTURE | CAP_VIDEO_CAPTURE_MPLANE;
        self
    }

    /// Report no capture capability at all.
    pub fn without_capture(mut self) -> Self {
        self.capture_flags = 0;
        self
    }

    /// Grant at most `count` buffer slots.
    pub fn grant_at_most(mut self, count: u32) -> Self {
        self.grant_limit = count;
        self
    }

    /// Reject every queued buffer.
    pub fn reject_queue(mut self) -> Self {
        self.reject_queue = true;
        self
    }

    /// Fail stream-on.
    pub fn fail_stream_on(mut self) -> Self {
        self.fail_stream_on = true;
        self
    }

    /// Fail the next `times` stream-off calls, leaving the device streaming.
    pub fn fail_stream_off(mut self, times: u32) -> Self {
        self.stream_off_failures = times;
        self
    }

    /// Sleep this long before each frame becomes ready.
    pub fn with_frame_delay(mut self, delay: Duration) -> Self {
        self.frame_delay = Some(delay);
        self
    }

    /// The byte the device writes at `offset` of frame `sequence`.
    #[inline]
    pub fn pattern_byte(sequence: u32, offset: usize) -> u8 {
        (offset as u32).wrapping_add(sequence.wrapping_mul(31)) as u8
    }

    /// Buffer slots currently granted.
    pub fn granted(&self) -> u32 {
        self.slots
    }

    /// Buffers currently queued to the device.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Whether the device is streaming.
    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Frames produced so far.
    pub fn frames_produced(&self) -> u32 {
        self.sequence
    }

    /// How many times stream-off was issued.
    pub fn stream_off_calls(&self) -> u32 {
        self.stream_off_calls
    }

    fn clamp(&self, width: u32, height: u32, fourcc: FourCc) -> FrameDescriptor {
        // Dimensions are rounded down to even values.
        let width = (width.clamp(MIN_DIMENSION, self.max_width)) & !1;
        let height = (height.clamp(MIN_DIMENSION, self.max_height)) & !1;
        let fourcc = if self.supported.contains(&fourcc) {
            fourcc
        } else {
            self.format.fourcc
        };
        layout(self.mode, width, height, fourcc)
    }

    fn check_mode(&self, mode: ApiMode) -> io::Result<()> {
        if mode != self.mode {
            return Err(invalid("buffer type not supported"));
        }
        Ok(())
    }

    /// Bytes the device writes into each plane region per frame.
    fn plane_payloads(&self) -> Planes<usize> {
        match self.mode {
            ApiMode::SinglePlane => std::iter::once(self.format.frame_size).collect(),
            ApiMode::MultiPlane => self
                .format
                .planes
                .iter()
                .map(|p| p.size_image as usize)
                .collect(),
        }
    }

    /// Write one frame into the buffer's regions. Each plane starts at
    /// offset 0 of its own region; the pattern offset runs across planes as
    /// if they were one contiguous frame.
    fn fill(&self, buffer: &QueuedBuffer) -> io::Result<Planes<PlaneUsage>> {
        let sequence = self.sequence;
        let mut usage = Planes::new();
        let mut frame_offset = 0usize;
        for ((fd, length), payload) in buffer.planes.iter().zip(self.plane_payloads()) {
            if payload > *length {
                return Err(invalid("buffer smaller than frame"));
            }

            // SAFETY: the region is at least `length` bytes and stays open
            // for the duration of the mapping, which is undone below.
            let ptr = unsafe {
                rustix::mm::mmap(
                    std::ptr::null_mut(),
                    *length,
                    ProtFlags::READ | ProtFlags::WRITE,
                    MapFlags::SHARED,
                    fd,
                    0,
                )?
            };

            // SAFETY: ptr is a fresh mapping of `length` bytes owned by this
            // call.
            let bytes = unsafe { std::slice::from_raw_parts_mut(ptr.cast::<u8>(), *length) };
            for (i, byte) in bytes[..payload].iter_mut().enumerate() {
                *byte = Self::pattern_byte(sequence, frame_offset + i);
            }

            // SAFETY: unmapping the mapping created above; `bytes` is not
            // used past this point.
            unsafe { rustix::mm::munmap(ptr, *length)? };

            usage.push(PlaneUsage {
                bytes_used: payload as u32,
                data_offset: 0,
            });
            frame_offset += payload;
        }
        Ok(usage)
    }
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SimulatedDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedDevice")
            .field("mode", &self.mode)
            .field("format", &self.format)
            .field("slots", &self.slots)
            .field("queued", &self.queue.len())
            .field("streaming", &self.streaming)
            .finish()
    }
}

/// The planes a format occupies.
fn layout(mode: ApiMode, width: u32, height: u32, fourcc: FourCc) -> FrameDescriptor {
    let bpp = fourcc.bits_per_pixel().unwrap_or(16);
    if mode == ApiMode::MultiPlane && fourcc == FourCc::NV12 {
        let luma = PlaneLayout::new(width * height, width);
        let chroma = PlaneLayout::new(width * height / 2, width);
        return FrameDescriptor::with_planes(mode, width, height, fourcc, &[luma, chroma]);
    }
    let bytes_per_line = if bpp % 8 == 0 { width * bpp / 8 } else { width };
    let size = width * height * bpp / 8;
    let plane = PlaneLayout::new(size, bytes_per_line);
    FrameDescriptor::with_planes(mode, width, height, fourcc, &[plane])
}

impl CaptureDevice for SimulatedDevice {
    fn capabilities(&self) -> io::Result<DeviceCapabilities> {
        Ok(DeviceCapabilities {
            driver: "simulated".into(),
            card: "Simulated Capture".into(),
            bus_info: "platform:simulated".into(),
            flags: self.capture_flags | CAP_STREAMING,
        })
    }

    fn get_format(&self, mode: ApiMode) -> io::Result<FrameDescriptor> {
        self.check_mode(mode)?;
        Ok(self.format.clone())
    }

    fn set_format(&mut self, desc: &FrameDescriptor) -> io::Result<()> {
        self.check_mode(desc.api_mode)?;
        if self.slots > 0 {
            return Err(io::Error::from_raw_os_error(libc::EBUSY));
        }
        self.format = self.clamp(desc.width, desc.height, desc.fourcc);
        debug!(format = %self.format, "Simulated device format set");
        Ok(())
    }

    fn request_buffers(&mut self, mode: ApiMode, count: u32) -> io::Result<u32> {
        self.check_mode(mode)?;
        if self.streaming {
            return Err(io::Error::from_raw_os_error(libc::EBUSY));
        }
        self.queue.clear();
        self.slots = count.min(self.grant_limit).min(MAX_SLOTS);
        Ok(self.slots)
    }

    fn queue_buffer(
        &mut self,
        mode: ApiMode,
        index: u32,
        planes: &[PlaneAttachment<'_>],
    ) -> io::Result<()> {
        self.check_mode(mode)?;
        if self.reject_queue {
            return Err(invalid("buffer rejected"));
        }
        if index >= self.slots {
            return Err(invalid("buffer index out of range"));
        }
        let payloads = self.plane_payloads();
        if planes.len() != payloads.len() {
            return Err(invalid("wrong number of planes"));
        }
        if self.queue.iter().any(|b| b.index == index) {
            return Err(invalid("buffer already queued"));
        }
        if planes.iter().zip(&payloads).any(|(p, &need)| (p.length as usize) < need) {
            return Err(invalid("plane region smaller than plane"));
        }

        let planes = planes
            .iter()
            .map(|p| Ok((p.fd.try_clone_to_owned()?, p.length as usize)))
            .collect::<io::Result<_>>()?;
        self.queue.push_back(QueuedBuffer { index, planes });
        trace!(index, queued = self.queue.len(), "Simulated queue");
        Ok(())
    }

    fn dequeue_buffer(&mut self, mode: ApiMode, num_planes: usize) -> io::Result<DequeuedBuffer> {
        self.check_mode(mode)?;
        if !self.streaming {
            return Err(invalid("not streaming"));
        }
        if num_planes != self.plane_payloads().len() {
            return Err(invalid("wrong number of planes"));
        }
        let buffer = self
            .queue
            .pop_front()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EAGAIN))?;

        let planes = self.fill(&buffer)?;
        let dequeued = DequeuedBuffer {
            index: buffer.index,
            sequence: self.sequence,
            planes,
        };
        self.sequence = self.sequence.wrapping_add(1);
        Ok(dequeued)
    }

    fn stream_on(&mut self, mode: ApiMode) -> io::Result<()> {
        self.check_mode(mode)?;
        if self.fail_stream_on {
            return Err(io::Error::from_raw_os_error(libc::EIO));
        }
        if self.slots == 0 {
            return Err(invalid("no buffers requested"));
        }
        self.streaming = true;
        Ok(())
    }

    fn stream_off(&mut self, mode: ApiMode) -> io::Result<()> {
        self.check_mode(mode)?;
        self.stream_off_calls += 1;
        if self.stream_off_failures > 0 {
            self.stream_off_failures -= 1;
            return Err(io::Error::from_raw_os_error(libc::EIO));
        }
        self.streaming = false;
        self.queue.clear();
        Ok(())
    }

    fn wait_ready(&mut self, timeout: Duration) -> io::Result<Readiness> {
        if self.streaming && !self.queue.is_empty() {
            if let Some(delay) = self.frame_delay {
                if delay > timeout {
                    std::thread::sleep(timeout);
                    return Ok(Readiness::TimedOut);
                }
                std::thread::sleep(delay);
            }
            return Ok(Readiness::Ready);
        }
        std::thread::sleep(timeout);
        Ok(Readiness::TimedOut)
    }
}
