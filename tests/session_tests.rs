//! End-to-end capture session tests against the simulated device.
//!
//! These run the full negotiate/register/stream/dequeue/requeue cycle with
//! memfd-backed buffers, so they need no video hardware or DMA heap.

use dmabuf_capture::device::{
    CaptureDevice, DequeuedBuffer, DeviceCapabilities, PlaneAttachment, PlaneUsage, Readiness,
    SimulatedDevice,
};
use dmabuf_capture::format::{ApiMode, FormatRequest, FourCc, FrameDescriptor};
use dmabuf_capture::memory::{BufferPool, MemfdHeap, Ownership};
use dmabuf_capture::session::{CaptureSession, CapturedFrame, DequeueOutcome, StreamState};
use dmabuf_capture::sink::RawFrameSink;
use dmabuf_capture::Error;
use std::io;
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_millis(100);

fn streaming_session(device: SimulatedDevice, count: usize) -> CaptureSession<SimulatedDevice> {
    let mut session = CaptureSession::open(device).unwrap();
    session.negotiate(FormatRequest::default()).unwrap();
    session.allocate_and_register(&MemfdHeap::new(), count).unwrap();
    session.start().unwrap();
    session
}

fn next_frame<D: CaptureDevice>(session: &mut CaptureSession<D>) -> CapturedFrame {
    match session.wait_and_dequeue(WAIT).unwrap() {
        DequeueOutcome::Frame(frame) => frame,
        DequeueOutcome::Timeout => panic!("expected a frame"),
    }
}

// ============================================================================
// Full Lifecycle Tests
// ============================================================================

/// 1080p YUYV through a pool of three, then a wait after stop.
#[test]
fn test_1080p_lifecycle_and_wait_after_stop() {
    let mut session = CaptureSession::open(SimulatedDevice::new()).unwrap();
    let format = session
        .negotiate(FormatRequest::new(1920, 1080, FourCc::YUYV))
        .unwrap();
    assert_eq!((format.width, format.height), (1920, 1080));
    assert_eq!(format.frame_size, 1920 * 1080 * 2);

    session.allocate_and_register(&MemfdHeap::new(), 3).unwrap();
    assert_eq!(session.state(), StreamState::Registered);
    assert_eq!(session.pool().unwrap().buffer_size(), 4_147_200);

    session.start().unwrap();
    let frame = next_frame(&mut session);
    assert_eq!(frame.payload_len(), 4_147_200);
    session.requeue(frame.index).unwrap();

    session.stop().unwrap();
    assert_eq!(session.state(), StreamState::Stopped);

    let started = Instant::now();
    let outcome = session.wait_and_dequeue(Duration::from_millis(5000)).unwrap();
    assert_eq!(outcome, DequeueOutcome::Timeout);
    assert!(started.elapsed() < Duration::from_millis(1000));
}

#[test]
fn test_buffers_cycle_through_ring() {
    let mut session = streaming_session(SimulatedDevice::new(), 3);

    let mut indices = Vec::new();
    for _ in 0..6 {
        let frame = next_frame(&mut session);
        indices.push(frame.index);
        session.requeue(frame.index).unwrap();
    }

    assert_eq!(indices, vec![0, 1, 2, 0, 1, 2]);
    assert_eq!(session.frames_consumed(), 6);
}

#[test]
fn test_ownership_counts_stay_consistent() {
    let mut session = streaming_session(SimulatedDevice::new(), 3);

    let a = next_frame(&mut session);
    let b = next_frame(&mut session);
    let stats = session.pool().unwrap().stats();
    assert_eq!(stats.with_application, 2);
    assert_eq!(stats.with_device, 1);
    assert_eq!(stats.with_device + stats.with_application, stats.capacity);

    session.requeue(a.index).unwrap();
    session.requeue(b.index).unwrap();
    assert_eq!(session.pool().unwrap().with_device_count(), 3);
}

#[test]
fn test_all_buffers_dequeued_then_timeout() {
    let mut session = streaming_session(SimulatedDevice::new(), 2);

    let _a = next_frame(&mut session);
    let _b = next_frame(&mut session);

    // Nothing left with the device.
    let outcome = session.wait_and_dequeue(Duration::from_millis(10)).unwrap();
    assert_eq!(outcome, DequeueOutcome::Timeout);
}

// ============================================================================
// Payload Tests
// ============================================================================

#[test]
fn test_payload_matches_device_pattern() {
    let device = SimulatedDevice::new().with_format(64, 16, FourCc::YUYV);
    let mut session = streaming_session(device, 3);

    for _ in 0..4 {
        let frame = next_frame(&mut session);
        {
            let access = session.access(frame.index).unwrap();
            let data = access.plane_data(0).unwrap();
            assert_eq!(data.len(), 64 * 16 * 2);
            for (offset, byte) in data.iter().enumerate().step_by(97) {
                assert_eq!(*byte, SimulatedDevice::pattern_byte(frame.sequence, offset));
            }
            access.finish().unwrap();
        }
        session.requeue(frame.index).unwrap();
    }
}

#[test]
fn test_multi_plane_offsets_and_sizes() {
    let mut session = streaming_session(SimulatedDevice::multi_plane(), 3);
    assert_eq!(session.api_mode(), ApiMode::MultiPlane);

    assert_eq!(session.pool().unwrap().plane_sizes(), &[640 * 480, 640 * 480 / 2]);

    let frame = next_frame(&mut session);
    let planes = &frame.descriptor.planes;
    assert_eq!(planes.len(), 2);
    // Every plane sits at the start of its own region.
    assert!(planes.iter().all(|p| p.data_offset == 0));
    assert_eq!(frame.payload_len(), frame.descriptor.frame_size);

    let luma_len = planes[0].bytes_used as usize;
    {
        let access = session.access(frame.index).unwrap();
        let luma = access.plane_data(0).unwrap();
        let chroma = access.plane_data(1).unwrap();
        assert_eq!(luma.len(), luma_len);
        assert_eq!(chroma.len(), 640 * 480 / 2);
        assert_eq!(luma[1], SimulatedDevice::pattern_byte(frame.sequence, 1));
        assert_eq!(chroma[0], SimulatedDevice::pattern_byte(frame.sequence, luma_len));
        access.finish().unwrap();
    }
    session.requeue(frame.index).unwrap();
}

#[test]
fn test_both_apis_uses_single_plane() {
    let session = CaptureSession::open(SimulatedDevice::new().with_both_apis()).unwrap();
    assert_eq!(session.api_mode(), ApiMode::SinglePlane);
}

// ============================================================================
// Negotiation Tests
// ============================================================================

#[test]
fn test_negotiate_is_idempotent() {
    let device = SimulatedDevice::new().with_limits(1280, 720);
    let mut session = CaptureSession::open(device).unwrap();

    // The device adjusts this request; asking again for what it granted
    // must not change anything.
    let first = session
        .negotiate(FormatRequest::new(1920, 1080, FourCc::UYVY))
        .unwrap();
    assert_eq!((first.width, first.height), (1280, 720));

    let second = session.negotiate(FormatRequest::from_descriptor(&first)).unwrap();
    assert_eq!(first, second);
}

#[test]
fn test_negotiate_clamps_to_device_limits() {
    let device = SimulatedDevice::new().with_limits(1280, 720);
    let mut session = CaptureSession::open(device).unwrap();

    let effective = session
        .negotiate(FormatRequest::new(3840, 2160, FourCc::YUYV))
        .unwrap();
    assert_eq!((effective.width, effective.height), (1280, 720));
    assert_eq!(session.descriptor(), &effective);
}

#[test]
fn test_unsupported_fourcc_keeps_current() {
    let device = SimulatedDevice::new().with_formats(&[FourCc::YUYV]);
    let mut session = CaptureSession::open(device).unwrap();

    let effective = session.negotiate(FormatRequest::new(0, 0, FourCc::MJPG)).unwrap();
    assert_eq!(effective.fourcc, FourCc::YUYV);
}

// ============================================================================
// Failure Tests
// ============================================================================

#[test]
fn test_requeue_device_owned_buffer_rejected() {
    let mut session = streaming_session(SimulatedDevice::new(), 3);
    assert_eq!(session.pool().unwrap().ownership(1).unwrap(), Ownership::WithDevice);
    assert!(matches!(session.requeue(1), Err(Error::RequeueFailed(_))));
}

#[test]
fn test_requeue_twice_rejected() {
    let mut session = streaming_session(SimulatedDevice::new(), 3);
    let frame = next_frame(&mut session);

    session.requeue(frame.index).unwrap();
    assert!(matches!(session.requeue(frame.index), Err(Error::RequeueFailed(_))));
}

#[test]
fn test_fewer_granted_buffers_fails() {
    let mut session = CaptureSession::open(SimulatedDevice::new().grant_at_most(2)).unwrap();
    session.negotiate(FormatRequest::default()).unwrap();

    let result = session.allocate_and_register(&MemfdHeap::new(), 3);
    assert!(matches!(result, Err(Error::RegistrationRejected(_))));
    assert_eq!(session.state(), StreamState::Idle);
    assert!(session.pool().is_none());
    assert_eq!(session.device().granted(), 0);
}

#[test]
fn test_queue_rejection_fails_registration() {
    let mut session = CaptureSession::open(SimulatedDevice::new().reject_queue()).unwrap();
    let result = session.allocate_and_register(&MemfdHeap::new(), 3);
    assert!(matches!(result, Err(Error::RegistrationRejected(_))));
    assert_eq!(session.state(), StreamState::Idle);
}

#[test]
fn test_undersized_pool_rejected() {
    let mut session = CaptureSession::open(SimulatedDevice::new()).unwrap();
    let frame_size = session.descriptor().frame_size;
    let pool = BufferPool::create(&MemfdHeap::new(), 3, frame_size / 2).unwrap();

    assert!(matches!(session.register_pool(pool), Err(Error::RegistrationRejected(_))));
}

#[test]
fn test_failed_stop_leaves_device_recoverable() {
    let mut device = SimulatedDevice::new().fail_stream_off(1);
    {
        let mut session = CaptureSession::open(&mut device).unwrap();
        session.allocate_and_register(&MemfdHeap::new(), 3).unwrap();
        session.start().unwrap();
        let _frame = next_frame(&mut session);

        assert!(session.stop().is_err());
        assert_eq!(session.state(), StreamState::Streaming);
    }

    assert!(!device.is_streaming());
    assert_eq!(device.granted(), 0);
    assert_eq!(device.queued(), 0);
}

#[test]
fn test_stream_on_rejected() {
    let mut session = CaptureSession::open(SimulatedDevice::new().fail_stream_on()).unwrap();
    session.allocate_and_register(&MemfdHeap::new(), 3).unwrap();

    assert!(matches!(session.start(), Err(Error::DeviceStartRejected(_))));
    assert_eq!(session.state(), StreamState::Registered);
}

#[test]
fn test_operations_in_wrong_state() {
    let mut session = CaptureSession::open(SimulatedDevice::new()).unwrap();

    assert!(matches!(session.start(), Err(Error::InvalidState { .. })));
    assert!(matches!(session.stop(), Err(Error::InvalidState { .. })));
    assert!(matches!(session.requeue(0), Err(Error::InvalidState { .. })));
    assert!(matches!(
        session.wait_and_dequeue(WAIT),
        Err(Error::InvalidState { .. })
    ));

    session.allocate_and_register(&MemfdHeap::new(), 3).unwrap();
    assert!(matches!(
        session.negotiate(FormatRequest::default()),
        Err(Error::InvalidState { .. })
    ));
    assert!(matches!(
        session.allocate_and_register(&MemfdHeap::new(), 3),
        Err(Error::InvalidState { .. })
    ));
}

// ============================================================================
// Run Loop Tests
// ============================================================================

#[test]
fn test_run_dumps_frames_to_sink() {
    let dir = tempfile::tempdir().unwrap();
    let mut sink = RawFrameSink::new(dir.path()).unwrap();
    let device = SimulatedDevice::new().with_format(32, 16, FourCc::GREY);
    let mut session = streaming_session(device, 3);

    let mut n = 0u64;
    let summary = session
        .run(5, WAIT, |_frame, planes| {
            sink.write_frame(n, planes)?;
            n += 1;
            Ok(())
        })
        .unwrap();
    session.stop().unwrap();

    assert_eq!(summary.frames, 5);
    assert!(!summary.timed_out);
    assert_eq!(sink.frames_written(), 5);
    for n in 0..5 {
        let bytes = std::fs::read(dir.path().join(format!("image_{n}.raw"))).unwrap();
        assert_eq!(bytes.len(), 32 * 16);
        assert_eq!(bytes[1], SimulatedDevice::pattern_byte(n as u32, 1));
    }
}

#[test]
fn test_run_after_stop_times_out() {
    let mut session = streaming_session(SimulatedDevice::new(), 3);
    session.stop().unwrap();

    let summary = session.run(3, WAIT, |_, _| Ok(())).unwrap();
    assert_eq!(summary.frames, 0);
    assert!(summary.timed_out);
}

#[test]
fn test_slow_device_times_out() {
    let device = SimulatedDevice::new().with_frame_delay(Duration::from_millis(200));
    let mut session = streaming_session(device, 3);

    let outcome = session.wait_and_dequeue(Duration::from_millis(20)).unwrap();
    assert_eq!(outcome, DequeueOutcome::Timeout);
}

// ============================================================================
// Device Misbehaviour Tests
// ============================================================================

/// Passes everything through to a simulated device, but lets a test rewrite
/// what the device reports for each dequeued buffer.
struct Tampering<F> {
    inner: SimulatedDevice,
    tamper: F,
}

impl<F: FnMut(&mut DequeuedBuffer)> Tampering<F> {
    fn new(inner: SimulatedDevice, tamper: F) -> Self {
        Self { inner, tamper }
    }
}

impl<F: FnMut(&mut DequeuedBuffer)> CaptureDevice for Tampering<F> {
    fn capabilities(&self) -> io::Result<DeviceCapabilities> {
        self.inner.capabilities()
    }

    fn get_format(&self, mode: ApiMode) -> io::Result<FrameDescriptor> {
        self.inner.get_format(mode)
    }

    fn set_format(&mut self, desc: &FrameDescriptor) -> io::Result<()> {
        self.inner.set_format(desc)
    }

    fn request_buffers(&mut self, mode: ApiMode, count: u32) -> io::Result<u32> {
        self.inner.request_buffers(mode, count)
    }

    fn queue_buffer(
        &mut self,
        mode: ApiMode,
        index: u32,
        planes: &[PlaneAttachment<'_>],
    ) -> io::Result<()> {
        self.inner.queue_buffer(mode, index, planes)
    }

    fn dequeue_buffer(&mut self, mode: ApiMode, num_planes: usize) -> io::Result<DequeuedBuffer> {
        let mut buffer = self.inner.dequeue_buffer(mode, num_planes)?;
        (self.tamper)(&mut buffer);
        Ok(buffer)
    }

    fn stream_on(&mut self, mode: ApiMode) -> io::Result<()> {
        self.inner.stream_on(mode)
    }

    fn stream_off(&mut self, mode: ApiMode) -> io::Result<()> {
        self.inner.stream_off(mode)
    }

    fn wait_ready(&mut self, timeout: Duration) -> io::Result<Readiness> {
        self.inner.wait_ready(timeout)
    }
}

fn ownership_of<D: CaptureDevice>(session: &CaptureSession<D>) -> Vec<Ownership> {
    let pool = session.pool().unwrap();
    (0..pool.len()).map(|i| pool.ownership(i).unwrap()).collect()
}

/// The next dequeue fails with `DequeueFailed` and leaves the pool as it was.
fn assert_dequeue_rejected<D: CaptureDevice>(session: &mut CaptureSession<D>) {
    let before = ownership_of(session);
    let consumed = session.frames_consumed();

    let result = session.wait_and_dequeue(WAIT);
    assert!(matches!(result, Err(Error::DequeueFailed(_))), "{result:?}");
    assert_eq!(ownership_of(session), before);
    assert_eq!(session.frames_consumed(), consumed);
}

fn tampered_session<F>(device: SimulatedDevice, tamper: F) -> CaptureSession<Tampering<F>>
where
    F: FnMut(&mut DequeuedBuffer),
{
    let mut session = CaptureSession::open(Tampering::new(device, tamper)).unwrap();
    session.allocate_and_register(&MemfdHeap::new(), 3).unwrap();
    session.start().unwrap();
    session
}

#[test]
fn test_index_outside_pool_rejected() {
    let mut session = tampered_session(SimulatedDevice::new(), |buf| buf.index = 7);
    assert_dequeue_rejected(&mut session);
}

#[test]
fn test_index_owned_by_application_rejected() {
    // The second dequeue reports buffer 0 again while the application holds it.
    let mut session = tampered_session(SimulatedDevice::new(), |buf| buf.index = 0);
    let frame = next_frame(&mut session);
    assert_eq!(frame.index, 0);

    assert_dequeue_rejected(&mut session);
    assert_eq!(session.pool().unwrap().ownership(0).unwrap(), Ownership::WithApplication);
}

#[test]
fn test_plane_count_mismatch_rejected() {
    let mut session = tampered_session(SimulatedDevice::new(), |buf| {
        buf.planes.push(PlaneUsage::default());
    });
    assert_dequeue_rejected(&mut session);
}

#[test]
fn test_plane_past_region_rejected() {
    let device = SimulatedDevice::multi_plane().with_format(64, 32, FourCc::NV12);
    let chroma_region = 64 * 16;
    let mut session = tampered_session(device, move |buf| {
        buf.planes[1].data_offset = chroma_region;
    });
    assert_dequeue_rejected(&mut session);
}

#[test]
fn test_payload_larger_than_frame_rejected() {
    let device = SimulatedDevice::new().with_format(64, 32, FourCc::YUYV);
    let frame_size = 64 * 32 * 2;
    let mut session =
        CaptureSession::open(Tampering::new(device, move |buf: &mut DequeuedBuffer| {
            buf.planes[0].bytes_used = frame_size + 1;
        }))
        .unwrap();

    // Oversized regions, so only the frame-size check can catch it.
    let pool = BufferPool::create(&MemfdHeap::new(), 3, 2 * frame_size as usize).unwrap();
    session.register_pool(pool).unwrap();
    session.start().unwrap();

    assert_dequeue_rejected(&mut session);
}
