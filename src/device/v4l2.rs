//! V4L2 capture through the `v4l` crate.
//!
//! Buffers are never allocated by the driver: the pool's regions are
//! registered with `V4L2_MEMORY_DMABUF` and the device writes straight into
//! them. `v4l` covers opening the node, capability queries and single-planar
//! formats. Its stream types only know MMAP and USERPTR memory, so buffer
//! requests, queueing and multi-planar formats go through its raw ioctl
//! wrapper with the `v4l_sys` structures.
//!
//! ## Example
//!
//! ```rust,ignore
//! use dmabuf_capture::device::{CaptureDevice, V4l2Device};
//!
//! let device = V4l2Device::open("/dev/video0")?;
//! let caps = device.capabilities()?;
//! println!("{} on {}", caps.card, caps.bus_info);
//! ```

use std::io;
use std::mem;
use std::os::fd::AsRawFd;
use std::os::raw::{c_int, c_void};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::{debug, trace};
use v4l::buffer::Type;
use v4l::memory::Memory;
use v4l::v4l2::vidioc;
use v4l::v4l_sys::{v4l2_buffer, v4l2_format, v4l2_plane, v4l2_requestbuffers};
use v4l::video::Capture;
use v4l::{Device, FourCC};

use super::{
    CaptureDevice, DequeuedBuffer, DeviceCapabilities, PlaneAttachment, PlaneUsage, Readiness,
};
use crate::error::Result;
use crate::format::{ApiMode, FourCc, FrameDescriptor, MAX_PLANES, PlaneLayout, Planes};

fn buf_type(mode: ApiMode) -> Type {
    match mode {
        ApiMode::SinglePlane => Type::VideoCapture,
        ApiMode::MultiPlane => Type::VideoCaptureMplane,
    }
}

/// Issue a raw V4L2 ioctl on `fd`, retrying on `EINTR`.
///
/// # Safety
///
/// `arg` must be the structure `request` expects, initialised as the kernel
/// requires (pointers inside it valid for the call).
unsafe fn xioctl<T>(fd: c_int, request: vidioc::_IOC_TYPE, arg: &mut T) -> io::Result<()> {
    loop {
        // SAFETY: upheld by the caller.
        match unsafe { v4l::v4l2::ioctl(fd, request, arg as *mut T as *mut c_void) } {
            Err(e) if e.raw_os_error() == Some(libc::EINTR) => continue,
            result => return result,
        }
    }
}

// ============================================================================
// V4l2Device
// ============================================================================

/// A V4L2 video capture node.
pub struct V4l2Device {
    device: Device,
    path: PathBuf,
}

impl V4l2Device {
    /// Open a device node.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let device = Device::with_path(path)?;
        debug!(path = %path.display(), "Opened V4L2 device");
        Ok(Self {
            device,
            path: path.to_path_buf(),
        })
    }

    /// Device node path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn fd(&self) -> c_int {
        self.device.handle().fd()
    }

    fn read_format_mplane(&self) -> io::Result<v4l2_format> {
        // SAFETY: v4l2_format is plain data; zero is valid.
        let mut fmt: v4l2_format = unsafe { mem::zeroed() };
        fmt.type_ = Type::VideoCaptureMplane as u32;
        // SAFETY: G_FMT takes a v4l2_format with its type set.
        unsafe { xioctl(self.fd(), vidioc::VIDIOC_G_FMT, &mut fmt)? };
        Ok(fmt)
    }
}

impl std::fmt::Debug for V4l2Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("V4l2Device")
            .field("path", &self.path)
            .field("fd", &self.fd())
            .finish()
    }
}

impl AsRawFd for V4l2Device {
    fn as_raw_fd(&self) -> c_int {
        self.fd()
    }
}

fn fourcc_from(fourcc: FourCC) -> FourCc {
    FourCc::from_bytes(fourcc.repr)
}

/// Single-planar format as reported by `v4l`.
fn descriptor_from_format(fmt: &v4l::Format) -> FrameDescriptor {
    FrameDescriptor::with_planes(
        ApiMode::SinglePlane,
        fmt.width,
        fmt.height,
        fourcc_from(fmt.fourcc),
        &[PlaneLayout::new(fmt.size, fmt.stride)],
    )
}

fn descriptor_from_mplane(fmt: &v4l2_format) -> io::Result<FrameDescriptor> {
    // SAFETY: the driver filled `pix_mp` for a multi-planar type.
    let pix = unsafe { fmt.fmt.pix_mp };
    let count = pix.num_planes as usize;
    if count == 0 || count > MAX_PLANES {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("driver reported {count} planes"),
        ));
    }
    let plane_fmt = pix.plane_fmt;
    let planes: Planes<PlaneLayout> = plane_fmt[..count]
        .iter()
        .map(|p| PlaneLayout::new(p.sizeimage, p.bytesperline))
        .collect();
    Ok(FrameDescriptor::with_planes(
        ApiMode::MultiPlane,
        pix.width,
        pix.height,
        FourCc::from_u32(pix.pixelformat),
        &planes,
    ))
}

impl CaptureDevice for V4l2Device {
    fn capabilities(&self) -> io::Result<DeviceCapabilities> {
        let caps = self.device.query_caps()?;
        Ok(DeviceCapabilities {
            driver: caps.driver,
            card: caps.card,
            bus_info: caps.bus,
            flags: caps.capabilities.bits(),
        })
    }

    fn get_format(&self, mode: ApiMode) -> io::Result<FrameDescriptor> {
        match mode {
            ApiMode::SinglePlane => Ok(descriptor_from_format(&self.device.format()?)),
            ApiMode::MultiPlane => descriptor_from_mplane(&self.read_format_mplane()?),
        }
    }

    fn set_format(&mut self, desc: &FrameDescriptor) -> io::Result<()> {
        match desc.api_mode {
            ApiMode::SinglePlane => {
                // Field order and colorimetry stay as the driver has them.
                let mut fmt = self.device.format()?;
                fmt.width = desc.width;
                fmt.height = desc.height;
                fmt.fourcc = FourCC::new(&desc.fourcc.to_bytes());
                fmt.stride = 0;
                fmt.size = 0;
                self.device.set_format(&fmt)?;
            }
            ApiMode::MultiPlane => {
                let mut fmt = self.read_format_mplane()?;
                // SAFETY: `pix_mp` is the active member for a multi-planar type.
                let mut pix = unsafe { fmt.fmt.pix_mp };
                pix.width = desc.width;
                pix.height = desc.height;
                pix.pixelformat = desc.fourcc.as_u32();
                let mut plane_fmt = pix.plane_fmt;
                for plane in &mut plane_fmt {
                    plane.bytesperline = 0;
                    plane.sizeimage = 0;
                }
                pix.plane_fmt = plane_fmt;
                fmt.fmt.pix_mp = pix;
                // SAFETY: S_FMT takes the v4l2_format read back above.
                unsafe { xioctl(self.fd(), vidioc::VIDIOC_S_FMT, &mut fmt)? };
            }
        }
        Ok(())
    }

    fn request_buffers(&mut self, mode: ApiMode, count: u32) -> io::Result<u32> {
        // SAFETY: v4l2_requestbuffers is plain data; zero is valid.
        let mut req: v4l2_requestbuffers = unsafe { mem::zeroed() };
        req.count = count;
        req.type_ = buf_type(mode) as u32;
        req.memory = Memory::DmaBuf as u32;
        // SAFETY: REQBUFS takes a v4l2_requestbuffers.
        unsafe { xioctl(self.fd(), vidioc::VIDIOC_REQBUFS, &mut req)? };
        debug!(requested = count, granted = req.count, "VIDIOC_REQBUFS");
        Ok(req.count)
    }

    fn queue_buffer(
        &mut self,
        mode: ApiMode,
        index: u32,
        planes: &[PlaneAttachment<'_>],
    ) -> io::Result<()> {
        let first = planes
            .first()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no plane descriptors"))?;
        if planes.len() > MAX_PLANES {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "too many planes"));
        }

        // SAFETY: v4l2_buffer and v4l2_plane are plain data; zero is valid.
        let mut buf: v4l2_buffer = unsafe { mem::zeroed() };
        let mut mplanes: [v4l2_plane; MAX_PLANES] = unsafe { mem::zeroed() };
        buf.index = index;
        buf.type_ = buf_type(mode) as u32;
        buf.memory = Memory::DmaBuf as u32;

        match mode {
            ApiMode::SinglePlane => {
                buf.m.fd = first.fd.as_raw_fd();
                buf.length = first.length;
            }
            ApiMode::MultiPlane => {
                // Each plane is its own dmabuf; the driver writes at its start.
                for (slot, plane) in mplanes.iter_mut().zip(planes) {
                    slot.m.fd = plane.fd.as_raw_fd();
                    slot.length = plane.length;
                }
                buf.m.planes = mplanes.as_mut_ptr();
                buf.length = planes.len() as u32;
            }
        }

        // SAFETY: QBUF takes a v4l2_buffer; `mplanes` outlives the call.
        unsafe { xioctl(self.fd(), vidioc::VIDIOC_QBUF, &mut buf)? };
        trace!(index, planes = planes.len(), "VIDIOC_QBUF");
        Ok(())
    }

    fn dequeue_buffer(&mut self, mode: ApiMode, num_planes: usize) -> io::Result<DequeuedBuffer> {
        let num_planes = num_planes.clamp(1, MAX_PLANES);

        // SAFETY: v4l2_buffer and v4l2_plane are plain data; zero is valid.
        let mut buf: v4l2_buffer = unsafe { mem::zeroed() };
        let mut mplanes: [v4l2_plane; MAX_PLANES] = unsafe { mem::zeroed() };
        buf.type_ = buf_type(mode) as u32;
        buf.memory = Memory::DmaBuf as u32;
        if mode == ApiMode::MultiPlane {
            buf.m.planes = mplanes.as_mut_ptr();
            buf.length = num_planes as u32;
        }

        // SAFETY: DQBUF takes a v4l2_buffer; `mplanes` outlives the call.
        unsafe { xioctl(self.fd(), vidioc::VIDIOC_DQBUF, &mut buf)? };

        let planes: Planes<PlaneUsage> = match mode {
            ApiMode::SinglePlane => std::iter::once(PlaneUsage {
                bytes_used: buf.bytesused,
                data_offset: 0,
            })
            .collect(),
            ApiMode::MultiPlane => {
                let reported = (buf.length as usize).min(num_planes);
                mplanes[..reported]
                    .iter()
                    .map(|p| PlaneUsage {
                        bytes_used: p.bytesused,
                        data_offset: p.data_offset,
                    })
                    .collect()
            }
        };

        trace!(index = buf.index, sequence = buf.sequence, "VIDIOC_DQBUF");
        Ok(DequeuedBuffer {
            index: buf.index,
            sequence: buf.sequence,
            planes,
        })
    }

    fn stream_on(&mut self, mode: ApiMode) -> io::Result<()> {
        let mut typ = buf_type(mode) as c_int;
        // SAFETY: STREAMON takes a pointer to the buffer type.
        unsafe { xioctl(self.fd(), vidioc::VIDIOC_STREAMON, &mut typ) }
    }

    fn stream_off(&mut self, mode: ApiMode) -> io::Result<()> {
        let mut typ = buf_type(mode) as c_int;
        // SAFETY: STREAMOFF takes a pointer to the buffer type.
        unsafe { xioctl(self.fd(), vidioc::VIDIOC_STREAMOFF, &mut typ) }
    }

    fn wait_ready(&mut self, timeout: Duration) -> io::Result<Readiness> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let millis = remaining.as_millis().min(c_int::MAX as u128) as c_int;
            let mut pfd = libc::pollfd {
                fd: self.fd(),
                events: libc::POLLIN,
                revents: 0,
            };

            // SAFETY: one valid pollfd for the duration of the call.
            let ret = unsafe { libc::poll(&mut pfd, 1, millis) };
            if ret < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return Err(err);
            }
            if ret == 0 {
                return Ok(Readiness::TimedOut);
            }
            if pfd.revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
                return Err(io::Error::other(format!(
                    "poll reported error condition (revents {:#x})",
                    pfd.revents
                )));
            }
            if pfd.revents & libc::POLLIN != 0 {
                return Ok(Readiness::Ready);
            }
        }
    }
}
