//! The capture session: format negotiation, buffer registration and the
//! dequeue/requeue loop.
//!
//! A [`CaptureSession`] owns one [`CaptureDevice`] and, once registered,
//! the [`BufferPool`] the device writes into. It moves through a fixed
//! state machine:
//!
//! ```text
//! Idle --register--> Registered --start--> Streaming --stop--> Stopped
//!                        |                                        ^
//!                        +-----------------stop-------------------+
//! ```
//!
//! Calling an operation from the wrong state fails with
//! [`Error::InvalidState`].
//!
//! # Buffer ownership
//!
//! Every pool index is either with the device or with the application. A
//! successful [`wait_and_dequeue`](CaptureSession::wait_and_dequeue) hands
//! an index to the application, and [`requeue`](CaptureSession::requeue)
//! hands it back. CPU reads in between go through
//! [`access`](CaptureSession::access), which brackets them with dmabuf sync
//! directives; the returned guard borrows the session, so a buffer cannot be
//! requeued while it is being read.
//!
//! # Example
//!
//! ```rust
//! use dmabuf_capture::device::SimulatedDevice;
//! use dmabuf_capture::format::FormatRequest;
//! use dmabuf_capture::memory::MemfdHeap;
//! use dmabuf_capture::session::{CaptureSession, DequeueOutcome};
//! use std::time::Duration;
//!
//! let mut session = CaptureSession::open(SimulatedDevice::new()).unwrap();
//! session.negotiate(FormatRequest::default()).unwrap();
//! session.allocate_and_register(&MemfdHeap::new(), 3).unwrap();
//! session.start().unwrap();
//!
//! let outcome = session.wait_and_dequeue(Duration::from_millis(100)).unwrap();
//! if let DequeueOutcome::Frame(frame) = outcome {
//!     let access = session.access(frame.index).unwrap();
//!     let first = access.plane_data(0).unwrap()[0];
//!     assert_eq!(first, SimulatedDevice::pattern_byte(frame.sequence, 0));
//!     access.finish().unwrap();
//!     session.requeue(frame.index).unwrap();
//! }
//! session.stop().unwrap();
//! ```

use std::fmt;
use std::io;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::device::{CaptureDevice, DeviceCapabilities, PlaneAttachment, Readiness};
use crate::error::{Error, Result};
use crate::format::{ApiMode, FormatRequest, FrameDescriptor, PlaneLayout, Planes};
use crate::memory::{AccessWindow, BufferPool, HeapAllocator, Ownership};
use crate::observability::span_frame;

// ============================================================================
// State and outcomes
// ============================================================================

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Opened, no buffers registered.
    Idle,
    /// Buffers handed to the device, not streaming.
    Registered,
    /// Device producing frames.
    Streaming,
    /// Streaming ended. Terminal.
    Stopped,
}

impl StreamState {
    /// Lowercase name, for errors and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamState::Idle => "idle",
            StreamState::Registered => "registered",
            StreamState::Streaming => "streaming",
            StreamState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A dequeued frame, owned by the application until requeued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedFrame {
    /// Pool index of the buffer holding the frame.
    pub index: usize,
    /// Device sequence number.
    pub sequence: u32,
    /// The negotiated format with this capture's per-plane actuals.
    pub descriptor: FrameDescriptor,
}

impl CapturedFrame {
    /// Bytes of payload across all planes.
    pub fn payload_len(&self) -> usize {
        self.descriptor.bytes_used()
    }
}

/// Result of [`CaptureSession::wait_and_dequeue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DequeueOutcome {
    /// A frame is ready.
    Frame(CapturedFrame),
    /// Nothing arrived in time. Not an error.
    Timeout,
}

/// What [`CaptureSession::run`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunSummary {
    /// Frames consumed and requeued.
    pub frames: u64,
    /// Whether the run ended on a timeout.
    pub timed_out: bool,
}

// ============================================================================
// FrameAccess
// ============================================================================

/// An open CPU access window on a dequeued frame.
///
/// Obtained from [`CaptureSession::access`]. Call [`finish`](Self::finish)
/// to close the window and see the result; dropping the guard closes it on
/// a best-effort basis.
pub struct FrameAccess<'a> {
    windows: Planes<AccessWindow<'a>>,
    planes: Planes<PlaneLayout>,
    index: usize,
}

impl FrameAccess<'_> {
    /// Pool index being accessed.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Per-plane layout of this capture.
    pub fn planes(&self) -> &[PlaneLayout] {
        &self.planes
    }

    /// Payload bytes of plane `plane`.
    pub fn plane_data(&self, plane: usize) -> Result<&[u8]> {
        let layout = self.planes.get(plane).ok_or(Error::InvalidIndex(plane))?;
        let window = self.windows.get(plane).ok_or(Error::InvalidIndex(plane))?;
        let bytes = window.as_slice()?;
        bytes.get(layout.payload_range()).ok_or_else(|| {
            Error::DequeueFailed(format!(
                "plane {} payload {:?} outside {}-byte region",
                plane,
                layout.payload_range(),
                bytes.len()
            ))
        })
    }

    /// Payload bytes of every plane, in order.
    pub fn plane_slices(&self) -> Result<Planes<&[u8]>> {
        (0..self.planes.len()).map(|i| self.plane_data(i)).collect()
    }

    /// Close the access window on every plane. Every plane is attempted;
    /// the first failure is returned.
    pub fn finish(self) -> Result<()> {
        let mut result = Ok(());
        for window in self.windows {
            let closed = window.close();
            if result.is_ok() {
                result = closed;
            }
        }
        result
    }
}

// ============================================================================
// CaptureSession
// ============================================================================

/// A capture session over one device.
pub struct CaptureSession<D: CaptureDevice> {
    device: D,
    capabilities: DeviceCapabilities,
    api_mode: ApiMode,
    descriptor: FrameDescriptor,
    pool: Option<BufferPool>,
    /// Per-index actuals of the most recent capture.
    captured: Vec<Option<Planes<PlaneLayout>>>,
    state: StreamState,
    frames_consumed: u64,
}

impl<D: CaptureDevice> CaptureSession<D> {
    /// Open a session on `device`.
    ///
    /// Single-planar capture is used when the device supports it, otherwise
    /// multi-planar. The device's current format becomes the session's
    /// descriptor until [`negotiate`](Self::negotiate) is called.
    ///
    /// # Errors
    ///
    /// [`Error::UnsupportedDevice`] if the device cannot report capabilities
    /// or cannot capture; [`Error::FormatRejected`] if its format cannot be
    /// read.
    pub fn open(device: D) -> Result<Self> {
        let capabilities = device
            .capabilities()
            .map_err(|e| Error::UnsupportedDevice(format!("querying capabilities: {e}")))?;
        let api_mode = capabilities.api_mode().ok_or_else(|| {
            Error::UnsupportedDevice(format!(
                "{} ({}) has no video capture capability",
                capabilities.card, capabilities.driver
            ))
        })?;
        let descriptor = device
            .get_format(api_mode)
            .map_err(|e| Error::FormatRejected(format!("reading format: {e}")))?;

        info!(
            driver = %capabilities.driver,
            card = %capabilities.card,
            api = %api_mode,
            format = %descriptor,
            "Opened capture session"
        );

        Ok(Self {
            device,
            capabilities,
            api_mode,
            descriptor,
            pool: None,
            captured: Vec::new(),
            state: StreamState::Idle,
            frames_consumed: 0,
        })
    }

    fn require(&self, operation: &'static str, expected: StreamState) -> Result<()> {
        if self.state != expected {
            return Err(Error::InvalidState {
                operation,
                state: self.state.as_str(),
            });
        }
        Ok(())
    }

    /// Negotiate the frame format.
    ///
    /// Zero fields of `request` keep the device's current values. The
    /// returned descriptor is what the device reports after the change,
    /// which may differ from the request.
    pub fn negotiate(&mut self, request: FormatRequest) -> Result<FrameDescriptor> {
        self.require("negotiate", StreamState::Idle)?;

        let current = self
            .device
            .get_format(self.api_mode)
            .map_err(|e| Error::FormatRejected(format!("reading format: {e}")))?;

        if request.is_noop() {
            debug!(format = %current, "Keeping current format");
            self.descriptor = current;
            return Ok(self.descriptor.clone());
        }

        let desired = request.overlay(&current);
        self.device
            .set_format(&desired)
            .map_err(|e| Error::FormatRejected(format!("setting {desired}: {e}")))?;
        let effective = self
            .device
            .get_format(self.api_mode)
            .map_err(|e| Error::FormatRejected(format!("reading back format: {e}")))?;

        if effective.width != desired.width
            || effective.height != desired.height
            || effective.fourcc != desired.fourcc
        {
            warn!(requested = %desired, effective = %effective, "Device adjusted format");
        } else {
            info!(format = %effective, "Negotiated format");
        }

        self.descriptor = effective;
        Ok(self.descriptor.clone())
    }

    /// Register `pool` with the device and queue every buffer.
    ///
    /// On failure the device's slots are released and the pool is dropped
    /// before the error is returned.
    pub fn register_pool(&mut self, mut pool: BufferPool) -> Result<()> {
        self.require("register_pool", StreamState::Idle)?;

        let count = pool.len();
        let required = self.plane_sizes();
        if pool.num_planes() != required.len() {
            return Err(Error::RegistrationRejected(format!(
                "pool has {} planes per buffer, {} capture needs {}",
                pool.num_planes(),
                self.api_mode,
                required.len()
            )));
        }
        for (plane, (&have, &need)) in pool.plane_sizes().iter().zip(&required).enumerate() {
            if have < need {
                return Err(Error::RegistrationRejected(format!(
                    "plane {plane}: {have}-byte regions cannot hold {need} bytes"
                )));
            }
        }

        let granted = self
            .device
            .request_buffers(self.api_mode, count as u32)
            .map_err(|e| Error::RegistrationRejected(format!("requesting {count} buffers: {e}")))?;
        if (granted as usize) < count {
            self.release_slots();
            return Err(Error::RegistrationRejected(format!(
                "device granted {granted} of {count} buffers"
            )));
        }

        for index in 0..count {
            if let Err(e) = queue_index(&mut self.device, &pool, self.api_mode, index) {
                self.release_slots();
                return Err(Error::RegistrationRejected(format!("queueing buffer {index}: {e}")));
            }
        }

        pool.mark_all_with_device();
        self.captured = vec![None; count];
        self.pool = Some(pool);
        self.state = StreamState::Registered;
        info!(count, size = self.descriptor.frame_size, "Registered buffer pool");
        Ok(())
    }

    /// Allocate `count` buffers sized for the negotiated format from `heap`
    /// and register them.
    ///
    /// Single-planar buffers get one region of `frame_size` bytes.
    /// Multi-planar buffers get one region per plane, so the device writes
    /// each plane at the start of its own dmabuf.
    pub fn allocate_and_register<H>(&mut self, heap: &H, count: usize) -> Result<()>
    where
        H: HeapAllocator + ?Sized,
    {
        self.require("allocate_and_register", StreamState::Idle)?;
        let sizes = self.plane_sizes();
        let pool = BufferPool::create_planar(heap, Some("capture"), count, &sizes)?;
        self.register_pool(pool)
    }

    /// Region size needed for each plane of the negotiated format.
    fn plane_sizes(&self) -> Planes<usize> {
        match self.api_mode {
            ApiMode::SinglePlane => std::iter::once(self.descriptor.frame_size).collect(),
            ApiMode::MultiPlane => self
                .descriptor
                .planes
                .iter()
                .map(|p| p.size_image as usize)
                .collect(),
        }
    }

    /// Start streaming.
    pub fn start(&mut self) -> Result<()> {
        self.require("start", StreamState::Registered)?;
        self.device
            .stream_on(self.api_mode)
            .map_err(|e| Error::DeviceStartRejected(e.to_string()))?;
        self.state = StreamState::Streaming;
        info!("Streaming started");
        Ok(())
    }

    /// Wait up to `timeout` for a frame and dequeue it.
    ///
    /// Returns [`DequeueOutcome::Timeout`] if nothing arrives, and always
    /// after [`stop`](Self::stop).
    pub fn wait_and_dequeue(&mut self, timeout: Duration) -> Result<DequeueOutcome> {
        match self.state {
            StreamState::Stopped => return Ok(DequeueOutcome::Timeout),
            StreamState::Streaming => {}
            state => {
                return Err(Error::InvalidState {
                    operation: "wait_and_dequeue",
                    state: state.as_str(),
                });
            }
        }

        let readiness = self
            .device
            .wait_ready(timeout)
            .map_err(|e| Error::DequeueFailed(format!("waiting for frame: {e}")))?;
        if readiness == Readiness::TimedOut {
            debug!(?timeout, "No frame before timeout");
            return Ok(DequeueOutcome::Timeout);
        }

        let num_planes = self.descriptor.num_planes();
        let buffer = self
            .device
            .dequeue_buffer(self.api_mode, num_planes)
            .map_err(|e| Error::DequeueFailed(e.to_string()))?;

        let pool = self.pool.as_mut().ok_or(Error::InvalidState {
            operation: "wait_and_dequeue",
            state: "unregistered",
        })?;
        let index = buffer.index as usize;
        match pool.ownership(index) {
            Ok(Ownership::WithDevice) => {}
            Ok(Ownership::WithApplication) => {
                return Err(Error::DequeueFailed(format!(
                    "buffer {index} dequeued while owned by the application"
                )));
            }
            Err(_) => {
                return Err(Error::DequeueFailed(format!(
                    "device returned buffer {index} outside pool of {}",
                    pool.len()
                )));
            }
        }

        if buffer.planes.len() != num_planes {
            return Err(Error::DequeueFailed(format!(
                "buffer {index} reported {} planes, expected {num_planes}",
                buffer.planes.len()
            )));
        }

        let regions = pool.plane_sizes();
        let mut planes = self.descriptor.planes.clone();
        for (plane, (layout, usage)) in planes.iter_mut().zip(&buffer.planes).enumerate() {
            let region = regions.get(plane).copied().unwrap_or(0);
            layout.bytes_used = usage.bytes_used;
            layout.data_offset = match self.api_mode {
                ApiMode::SinglePlane => 0,
                ApiMode::MultiPlane => usage.data_offset,
            };
            let end = layout.data_offset as usize + layout.bytes_used as usize;
            if end > region {
                return Err(Error::DequeueFailed(format!(
                    "buffer {index} plane {plane} ends at {end}, past {region}-byte region"
                )));
            }
        }

        let mut descriptor = self.descriptor.clone();
        descriptor.planes = planes.clone();
        if descriptor.bytes_used() > descriptor.frame_size {
            return Err(Error::DequeueFailed(format!(
                "buffer {index} holds {} bytes, frame size is {}",
                descriptor.bytes_used(),
                descriptor.frame_size
            )));
        }

        pool.mark_with_application(index)?;
        self.captured[index] = Some(planes);
        self.frames_consumed += 1;

        debug!(
            index,
            sequence = buffer.sequence,
            bytes = descriptor.bytes_used(),
            "Dequeued frame"
        );

        Ok(DequeueOutcome::Frame(CapturedFrame {
            index,
            sequence: buffer.sequence,
            descriptor,
        }))
    }

    /// Open a CPU access window on dequeued buffer `index`.
    pub fn access(&mut self, index: usize) -> Result<FrameAccess<'_>> {
        let state = self.state;
        let pool = self.pool.as_mut().ok_or(Error::InvalidState {
            operation: "access",
            state: state.as_str(),
        })?;
        if pool.ownership(index)? != Ownership::WithApplication {
            return Err(Error::SyncFailed(format!(
                "buffer {index} is owned by the device"
            )));
        }
        let planes = self
            .captured
            .get(index)
            .cloned()
            .flatten()
            .ok_or(Error::InvalidIndex(index))?;

        let windows = pool
            .get_mut(index)?
            .iter_mut()
            .map(AccessWindow::open)
            .collect::<Result<Planes<_>>>()?;
        Ok(FrameAccess {
            windows,
            planes,
            index,
        })
    }

    /// Hand dequeued buffer `index` back to the device.
    ///
    /// # Errors
    ///
    /// [`Error::RequeueFailed`] if the buffer is not owned by the
    /// application, its access window is still open, or the device rejects
    /// it.
    pub fn requeue(&mut self, index: usize) -> Result<()> {
        self.require("requeue", StreamState::Streaming)?;
        let pool = self.pool.as_mut().ok_or(Error::InvalidState {
            operation: "requeue",
            state: "unregistered",
        })?;

        match pool.ownership(index)? {
            Ownership::WithApplication => {}
            Ownership::WithDevice => {
                return Err(Error::RequeueFailed(format!(
                    "buffer {index} is already owned by the device"
                )));
            }
        }
        if pool.is_accessing(index)? {
            return Err(Error::RequeueFailed(format!(
                "buffer {index} still has an open access window"
            )));
        }

        queue_index(&mut self.device, pool, self.api_mode, index)
            .map_err(|e| Error::RequeueFailed(format!("buffer {index}: {e}")))?;
        pool.mark_with_device(index)?;
        Ok(())
    }

    /// Stop streaming. Every buffer is considered device-owned afterwards.
    ///
    /// Stopping a registered session that never started is allowed, and
    /// stopping twice is a no-op. If stream-off fails the session stays
    /// `Streaming`, so `stop` can be called again and drop retries it.
    pub fn stop(&mut self) -> Result<()> {
        match self.state {
            StreamState::Stopped => return Ok(()),
            StreamState::Idle => {
                return Err(Error::InvalidState {
                    operation: "stop",
                    state: self.state.as_str(),
                });
            }
            StreamState::Registered => {}
            StreamState::Streaming => {
                if let Err(e) = self.device.stream_off(self.api_mode) {
                    warn!(error = %e, "Stream-off failed, session still streaming");
                    return Err(e.into());
                }
                self.finish_stop();
                info!(frames = self.frames_consumed, "Streaming stopped");
                return Ok(());
            }
        }
        self.finish_stop();
        Ok(())
    }

    fn finish_stop(&mut self) {
        if let Some(pool) = self.pool.as_mut() {
            pool.mark_all_with_device();
        }
        self.state = StreamState::Stopped;
    }

    /// Capture until `frames` frames have been consumed or a wait times out.
    ///
    /// Each frame's plane payloads are passed to `consumer` inside an access
    /// window, and the buffer is requeued afterwards. A consumer error ends
    /// the run after the window is closed.
    pub fn run<F>(&mut self, frames: u64, timeout: Duration, mut consumer: F) -> Result<RunSummary>
    where
        F: FnMut(&CapturedFrame, &[&[u8]]) -> Result<()>,
    {
        let mut summary = RunSummary::default();
        while summary.frames < frames {
            let frame = match self.wait_and_dequeue(timeout)? {
                DequeueOutcome::Frame(frame) => frame,
                DequeueOutcome::Timeout => {
                    info!(frames = summary.frames, ?timeout, "Capture timed out");
                    summary.timed_out = true;
                    break;
                }
            };

            let _span = span_frame(frame.index, frame.sequence).entered();
            let access = self.access(frame.index)?;
            let consumed = access
                .plane_slices()
                .and_then(|slices| consumer(&frame, &slices[..]));
            let closed = access.finish();
            consumed?;
            closed?;

            self.requeue(frame.index)?;
            summary.frames += 1;
        }
        Ok(summary)
    }

    /// Current state.
    pub fn state(&self) -> StreamState {
        self.state
    }

    /// The effective frame format.
    pub fn descriptor(&self) -> &FrameDescriptor {
        &self.descriptor
    }

    /// Addressing mode in use.
    pub fn api_mode(&self) -> ApiMode {
        self.api_mode
    }

    /// What the device reported when opened.
    pub fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    /// The registered pool, if any.
    pub fn pool(&self) -> Option<&BufferPool> {
        self.pool.as_ref()
    }

    /// Frames dequeued so far.
    pub fn frames_consumed(&self) -> u64 {
        self.frames_consumed
    }

    /// The underlying device.
    pub fn device(&self) -> &D {
        &self.device
    }

    fn release_slots(&mut self) {
        if let Err(e) = self.device.request_buffers(self.api_mode, 0) {
            warn!(error = %e, "Failed to release device buffers");
        }
    }
}

impl<D: CaptureDevice> Drop for CaptureSession<D> {
    fn drop(&mut self) {
        if self.state == StreamState::Streaming {
            if let Err(e) = self.device.stream_off(self.api_mode) {
                warn!(error = %e, "Failed to stop streaming on drop");
            }
        }
        if self.pool.is_some() {
            self.release_slots();
        }
        // The pool unmaps and closes its regions when dropped.
        debug!(state = %self.state, frames = self.frames_consumed, "Closed capture session");
    }
}

impl<D: CaptureDevice> fmt::Debug for CaptureSession<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureSession")
            .field("state", &self.state)
            .field("api_mode", &self.api_mode)
            .field("descriptor", &self.descriptor)
            .field("pool", &self.pool)
            .field("frames_consumed", &self.frames_consumed)
            .finish()
    }
}

/// Queue pool buffer `index` with one descriptor per plane region.
fn queue_index<D: CaptureDevice>(
    device: &mut D,
    pool: &BufferPool,
    mode: ApiMode,
    index: usize,
) -> io::Result<()> {
    let invalid = |msg: String| io::Error::new(io::ErrorKind::InvalidInput, msg);
    let handles = pool.get(index).map_err(|e| invalid(e.to_string()))?;
    let planes = handles
        .iter()
        .map(|handle| {
            let fd = handle
                .as_fd()
                .ok_or_else(|| invalid(format!("buffer {index} released")))?;
            let length = u32::try_from(handle.size())
                .map_err(|_| invalid(format!("buffer {index} exceeds 4 GiB")))?;
            Ok(PlaneAttachment { fd, length })
        })
        .collect::<io::Result<Planes<_>>>()?;
    device.queue_buffer(mode, index as u32, &planes)
}
