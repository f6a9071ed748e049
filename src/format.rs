//! Frame format types.
//!
//! This module describes what the capture device agreed to produce:
//!
//! - [`FourCc`]: Pixel encoding, a 4-character code packed little-endian
//! - [`ApiMode`]: Single-planar or multi-planar buffer addressing
//! - [`PlaneLayout`]: Per-plane sizes plus the actuals of the last capture
//! - [`FrameDescriptor`]: The effective (read-back) format of a session
//!
//! # Effective vs. requested formats
//!
//! Devices are free to clamp or adjust whatever was requested. A
//! [`FrameDescriptor`] always holds what the device reports *after* a set,
//! and buffer sizes are derived from it:
//!
//! ```rust
//! use dmabuf_capture::format::{ApiMode, FourCc, FrameDescriptor};
//!
//! let desc = FrameDescriptor::packed(ApiMode::SinglePlane, 1920, 1080, FourCc::YUYV, 1920 * 2);
//! assert_eq!(desc.frame_size, 1920 * 1080 * 2);
//! assert_eq!(desc.fourcc.to_string(), "YUYV");
//! ```

use crate::error::{Error, Result};
use smallvec::SmallVec;
use std::fmt;

/// Maximum number of planes per buffer (the kernel's `VIDEO_MAX_PLANES`).
pub const MAX_PLANES: usize = 8;

/// Per-plane storage sized to the kernel's plane-array limit.
pub type Planes<T> = SmallVec<[T; MAX_PLANES]>;

// ============================================================================
// FourCc
// ============================================================================

/// A pixel encoding identifier.
///
/// Four ASCII characters packed little-endian into a `u32`, so `"YUYV"`
/// becomes `b'Y' | b'U' << 8 | b'Y' << 16 | b'V' << 24`. The zero value
/// means "unspecified" and is used by negotiation requests to keep the
/// device's current encoding.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FourCc(u32);

impl FourCc {
    /// Unspecified encoding.
    pub const NONE: FourCc = FourCc(0);
    /// YUV 4:2:2 packed, 2 bytes per pixel.
    pub const YUYV: FourCc = FourCc::from_bytes(*b"YUYV");
    /// YUV 4:2:2 packed (UYVY order).
    pub const UYVY: FourCc = FourCc::from_bytes(*b"UYVY");
    /// YUV 4:2:0, Y plane followed by interleaved CbCr.
    pub const NV12: FourCc = FourCc::from_bytes(*b"NV12");
    /// RGB 8:8:8.
    pub const RGB24: FourCc = FourCc::from_bytes(*b"RGB3");
    /// 8-bit greyscale.
    pub const GREY: FourCc = FourCc::from_bytes(*b"GREY");
    /// Motion JPEG.
    pub const MJPG: FourCc = FourCc::from_bytes(*b"MJPG");

    /// Pack four bytes little-endian.
    pub const fn from_bytes(bytes: [u8; 4]) -> Self {
        FourCc(u32::from_le_bytes(bytes))
    }

    /// Wrap an already packed value.
    pub const fn from_u32(value: u32) -> Self {
        FourCc(value)
    }

    /// Parse a 4-character code such as `"YUYV"`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidFourCc`] unless the input is exactly four
    /// ASCII bytes.
    pub fn parse(code: &str) -> Result<Self> {
        let bytes = code.as_bytes();
        if bytes.len() != 4 || !code.is_ascii() {
            return Err(Error::InvalidFourCc(code.to_string()));
        }
        Ok(Self::from_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// The packed value.
    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// The four characters in order.
    #[inline]
    pub const fn to_bytes(self) -> [u8; 4] {
        self.0.to_le_bytes()
    }

    /// Whether this is the "unspecified" code.
    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }

    /// Bits per pixel for formats with a fixed packing. Compressed and
    /// unknown formats return `None`.
    pub fn bits_per_pixel(self) -> Option<u32> {
        match &self.to_bytes() {
            b"YUYV" | b"UYVY" => Some(16),
            b"NV12" | b"NV21" | b"YU12" => Some(12),
            b"RGB3" | b"BGR3" => Some(24),
            b"RGB4" | b"BA24" => Some(32),
            b"GREY" => Some(8),
            _ => None,
        }
    }
}

impl fmt::Display for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.to_bytes() {
            let c = if b.is_ascii_graphic() || b == b' ' { b as char } else { '?' };
            write!(f, "{c}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FourCc({self})")
    }
}

impl std::str::FromStr for FourCc {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

// ============================================================================
// ApiMode
// ============================================================================

/// How the device addresses pixel data in a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiMode {
    /// One contiguous memory descriptor per buffer.
    SinglePlane,
    /// An array of per-plane memory descriptors per buffer.
    MultiPlane,
}

impl ApiMode {
    /// Human-readable name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiMode::SinglePlane => "single-planar",
            ApiMode::MultiPlane => "multi-planar",
        }
    }
}

impl fmt::Display for ApiMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// PlaneLayout
// ============================================================================

/// Layout of one plane.
///
/// `size_image` and `bytes_per_line` come from negotiation. `data_offset`
/// and `bytes_used` are zero until a buffer is dequeued, and then describe
/// where that capture's payload lives in the plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlaneLayout {
    /// Bytes the device needs for this plane.
    pub size_image: u32,
    /// Line stride in bytes.
    pub bytes_per_line: u32,
    /// Byte offset of the payload within the buffer region.
    pub data_offset: u32,
    /// Bytes of payload written by the device.
    pub bytes_used: u32,
}

impl PlaneLayout {
    /// A negotiated plane with no capture actuals yet.
    pub fn new(size_image: u32, bytes_per_line: u32) -> Self {
        Self {
            size_image,
            bytes_per_line,
            data_offset: 0,
            bytes_used: 0,
        }
    }

    /// Byte range of the captured payload within the region.
    pub fn payload_range(&self) -> std::ops::Range<usize> {
        let start = self.data_offset as usize;
        start..start + self.bytes_used as usize
    }
}

// ============================================================================
// FrameDescriptor
// ============================================================================

/// The negotiated frame format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameDescriptor {
    /// Addressing convention for buffers of this format.
    pub api_mode: ApiMode,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Pixel encoding.
    pub fourcc: FourCc,
    /// Total bytes per frame across all planes.
    pub frame_size: usize,
    /// Plane layout. Exactly one entry in single-plane mode.
    pub planes: Planes<PlaneLayout>,
}

impl FrameDescriptor {
    /// A single-plane style descriptor whose frame size is
    /// `bytes_per_line * height`.
    pub fn packed(
        api_mode: ApiMode,
        width: u32,
        height: u32,
        fourcc: FourCc,
        bytes_per_line: u32,
    ) -> Self {
        let size = bytes_per_line * height;
        let mut planes = Planes::new();
        planes.push(PlaneLayout::new(size, bytes_per_line));
        Self {
            api_mode,
            width,
            height,
            fourcc,
            frame_size: size as usize,
            planes,
        }
    }

    /// Build a descriptor from explicit planes. The frame size is the sum
    /// of the planes' `size_image`.
    ///
    /// # Panics
    ///
    /// Panics if `planes` is empty or holds more than [`MAX_PLANES`].
    pub fn with_planes(
        api_mode: ApiMode,
        width: u32,
        height: u32,
        fourcc: FourCc,
        planes: &[PlaneLayout],
    ) -> Self {
        assert!(
            !planes.is_empty() && planes.len() <= MAX_PLANES,
            "plane count must be within 1..={MAX_PLANES}"
        );
        Self {
            api_mode,
            width,
            height,
            fourcc,
            frame_size: planes.iter().map(|p| p.size_image as usize).sum(),
            planes: planes.iter().copied().collect(),
        }
    }

    /// Number of planes.
    #[inline]
    pub fn num_planes(&self) -> usize {
        self.planes.len()
    }

    /// Bytes of payload reported by the last capture, summed over planes.
    pub fn bytes_used(&self) -> usize {
        self.planes.iter().map(|p| p.bytes_used as usize).sum()
    }

    /// Copy of this descriptor with per-plane capture actuals cleared.
    pub fn without_actuals(&self) -> Self {
        let mut desc = self.clone();
        for plane in &mut desc.planes {
            plane.data_offset = 0;
            plane.bytes_used = 0;
        }
        desc
    }
}

impl fmt::Display for FrameDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{} {} ({} bytes, {} plane(s), {})",
            self.width,
            self.height,
            self.fourcc,
            self.frame_size,
            self.planes.len(),
            self.api_mode
        )
    }
}

// ============================================================================
// FormatRequest
// ============================================================================

/// What the caller would like to negotiate.
///
/// Zero fields (and [`FourCc::NONE`]) keep the device's current value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FormatRequest {
    /// Requested width, or 0 to keep.
    pub width: u32,
    /// Requested height, or 0 to keep.
    pub height: u32,
    /// Requested encoding, or [`FourCc::NONE`] to keep.
    pub fourcc: FourCc,
}

impl FormatRequest {
    /// A request for specific values.
    pub fn new(width: u32, height: u32, fourcc: FourCc) -> Self {
        Self {
            width,
            height,
            fourcc,
        }
    }

    /// A request that matches an effective descriptor exactly.
    pub fn from_descriptor(desc: &FrameDescriptor) -> Self {
        Self::new(desc.width, desc.height, desc.fourcc)
    }

    /// Whether this request changes nothing.
    pub fn is_noop(&self) -> bool {
        self.width == 0 && self.height == 0 && self.fourcc.is_none()
    }

    /// Overlay the specified fields onto `current`.
    pub fn overlay(&self, current: &FrameDescriptor) -> FrameDescriptor {
        let mut desc = current.without_actuals();
        if self.width > 0 {
            desc.width = self.width;
        }
        if self.height > 0 {
            desc.height = self.height;
        }
        if !self.fourcc.is_none() {
            desc.fourcc = self.fourcc;
        }
        desc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fourcc_packs_little_endian() {
        let fcc = FourCc::parse("YUYV").unwrap();
        assert_eq!(
            fcc.as_u32(),
            (b'Y' as u32) | (b'U' as u32) << 8 | (b'Y' as u32) << 16 | (b'V' as u32) << 24
        );
        assert_eq!(fcc, FourCc::YUYV);
        assert_eq!(fcc.to_bytes(), *b"YUYV");
        assert_eq!(fcc.to_string(), "YUYV");
    }

    #[test]
    fn test_fourcc_rejects_wrong_length() {
        assert!(matches!(FourCc::parse("YUV"), Err(Error::InvalidFourCc(_))));
        assert!(matches!(FourCc::parse("YUYVX"), Err(Error::InvalidFourCc(_))));
        assert!("NV12".parse::<FourCc>().is_ok());
    }

    #[test]
    fn test_fourcc_none() {
        assert!(FourCc::NONE.is_none());
        assert!(!FourCc::GREY.is_none());
        assert_eq!(FourCc::default(), FourCc::NONE);
    }

    #[test]
    fn test_descriptor_frame_size_sums_planes() {
        let desc = FrameDescriptor::with_planes(
            ApiMode::MultiPlane,
            640,
            480,
            FourCc::NV12,
            &[PlaneLayout::new(640 * 480, 640), PlaneLayout::new(640 * 240, 640)],
        );
        assert_eq!(desc.frame_size, 640 * 480 * 3 / 2);
        assert_eq!(desc.num_planes(), 2);
        assert_eq!(desc.bytes_used(), 0);
    }

    #[test]
    fn test_request_overlay_keeps_unspecified_fields() {
        let current = FrameDescriptor::packed(ApiMode::SinglePlane, 640, 480, FourCc::YUYV, 1280);

        let noop = FormatRequest::default();
        assert!(noop.is_noop());
        assert_eq!(noop.overlay(&current), current);

        let width_only = FormatRequest::new(1280, 0, FourCc::NONE);
        let desc = width_only.overlay(&current);
        assert_eq!(desc.width, 1280);
        assert_eq!(desc.height, 480);
        assert_eq!(desc.fourcc, FourCc::YUYV);
    }

    #[test]
    fn test_payload_range() {
        let plane = PlaneLayout {
            size_image: 100,
            bytes_per_line: 10,
            data_offset: 16,
            bytes_used: 50,
        };
        assert_eq!(plane.payload_range(), 16..66);
    }
}
