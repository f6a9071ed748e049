//! Kernel heap allocators for buffer regions.
//!
//! A [`HeapAllocator`] hands out [`Region`]s: anonymous, fd-backed memory
//! that can be mapped by the CPU and attached to a capture device without
//! copying.
//!
//! - [`DmaHeap`]: dmabufs from `/dev/dma_heap/*` (the real thing)
//! - [`MemfdHeap`]: memfd regions, CPU-coherent, for tests and simulation
//!
//! # Example
//!
//! ```rust,ignore
//! use dmabuf_capture::memory::{DmaHeap, HeapAllocator};
//!
//! let heap = DmaHeap::open()?;
//! let region = heap.allocate(1920 * 1080 * 2, Some("frame-0"))?;
//! assert_eq!(region.size(), 1920 * 1080 * 2);
//! ```

use crate::error::{Error, Result};
use crate::memory::defaults;
use rustix::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use rustix::fs::{MemfdFlags, Mode, OFlags};
use std::ffi::CString;
use std::os::fd::FromRawFd;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// `DMA_HEAP_IOCTL_ALLOC`: `_IOWR('H', 0, struct dma_heap_allocation_data)`.
const DMA_HEAP_IOCTL_ALLOC: libc::c_ulong = 0xc018_4800;

/// `DMA_BUF_SET_NAME_B`: `_IOW('b', 1, __u64)`.
const DMA_BUF_SET_NAME: libc::c_ulong = 0x4008_6201;

/// Longest name the kernel stores for a dmabuf (`DMA_BUF_NAME_LEN` - 1).
const DMA_BUF_NAME_MAX: usize = 31;

/// `struct dma_heap_allocation_data` from `<linux/dma-heap.h>`.
#[repr(C)]
#[derive(Default)]
struct DmaHeapAllocationData {
    /// Size of the allocation in bytes.
    len: u64,
    /// OUTPUT: dmabuf file descriptor.
    fd: u32,
    /// Flags for the returned fd (O_CLOEXEC, O_RDWR).
    fd_flags: u32,
    /// Heap-specific flags (none defined).
    heap_flags: u64,
}

/// Where a region's memory came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    /// A dmabuf exported by a DMA heap. CPU access needs sync barriers.
    DmaBuf,
    /// A memfd. Ordinary cached memory, coherent without barriers.
    Memfd,
}

/// An allocated, not-yet-mapped memory region.
///
/// Owns the region's file descriptor; dropping it releases the memory
/// unless something else (a mapping, the device) still references it.
#[derive(Debug)]
pub struct Region {
    fd: OwnedFd,
    size: usize,
    kind: RegionKind,
    name: Option<String>,
}

impl Region {
    /// Wrap an existing fd-backed region.
    pub fn from_fd(fd: OwnedFd, size: usize, kind: RegionKind, name: Option<String>) -> Self {
        Self {
            fd,
            size,
            kind,
            name,
        }
    }

    /// Size in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Backing kind.
    #[inline]
    pub fn kind(&self) -> RegionKind {
        self.kind
    }

    /// Debug name, if one was requested.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Split into parts.
    pub fn into_parts(self) -> (OwnedFd, usize, RegionKind, Option<String>) {
        (self.fd, self.size, self.kind, self.name)
    }
}

impl AsFd for Region {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// A source of shareable memory regions.
pub trait HeapAllocator {
    /// Allocate a region of `size` bytes.
    ///
    /// `name` is a debugging label; failing to apply it is not an error.
    fn allocate(&self, size: usize, name: Option<&str>) -> Result<Region>;

    /// Short description for logs.
    fn describe(&self) -> String;
}

// ============================================================================
// DmaHeap
// ============================================================================

/// An open DMA heap device node.
pub struct DmaHeap {
    fd: OwnedFd,
    path: PathBuf,
}

impl DmaHeap {
    /// Open the first available heap from [`defaults::DMA_HEAP_PATHS`].
    ///
    /// The node name depends on how the CMA area was configured
    /// (`linux,cma` from a device tree, `reserved` otherwise), so both are
    /// tried in order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoHeapAvailable`] if none of them can be opened.
    pub fn open() -> Result<Self> {
        Self::open_any(defaults::DMA_HEAP_PATHS)
    }

    /// Open the first heap in `paths` that opens successfully.
    pub fn open_any<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        for path in paths {
            let path = path.as_ref();
            match rustix::fs::open(path, OFlags::RDWR | OFlags::CLOEXEC, Mode::empty()) {
                Ok(fd) => {
                    info!(heap = %path.display(), "Opened DMA heap");
                    return Ok(Self {
                        fd,
                        path: path.to_path_buf(),
                    });
                }
                Err(e) => debug!(heap = %path.display(), error = %e, "DMA heap not usable"),
            }
        }

        let tried = paths
            .iter()
            .map(|p| p.as_ref().display().to_string())
            .collect::<Vec<_>>()
            .join(", ");
        Err(Error::NoHeapAvailable(tried))
    }

    /// Path of the opened heap node.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Label a dmabuf for `/sys/kernel/debug/dma_buf/bufinfo`.
    fn set_name(fd: &OwnedFd, name: &str) {
        let Ok(cname) = CString::new(truncate_name(name, DMA_BUF_NAME_MAX)) else {
            debug!(name, "dmabuf name contains NUL, not applied");
            return;
        };

        // SAFETY: DMA_BUF_SET_NAME reads a NUL-terminated string from the
        // pointer argument; `cname` outlives the call.
        let ret = unsafe { libc::ioctl(fd.as_raw_fd(), DMA_BUF_SET_NAME, cname.as_ptr()) };
        if ret < 0 {
            debug!(
                name,
                error = %std::io::Error::last_os_error(),
                "Could not name dmabuf"
            );
        }
    }
}

/// The longest prefix of `name` that fits in `max` bytes without splitting
/// a character.
fn truncate_name(name: &str, max: usize) -> &str {
    if name.len() <= max {
        return name;
    }
    let mut end = max;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

impl HeapAllocator for DmaHeap {
    fn allocate(&self, size: usize, name: Option<&str>) -> Result<Region> {
        if size == 0 {
            return Err(Error::AllocationFailed("size must be greater than 0".into()));
        }

        let mut alloc = DmaHeapAllocationData {
            len: size as u64,
            fd_flags: (libc::O_CLOEXEC | libc::O_RDWR) as u32,
            ..Default::default()
        };

        // SAFETY: DMA_HEAP_IOCTL_ALLOC reads len/fd_flags and writes fd in a
        // properly initialized dma_heap_allocation_data.
        let ret = unsafe { libc::ioctl(self.fd.as_raw_fd(), DMA_HEAP_IOCTL_ALLOC, &mut alloc) };
        if ret < 0 {
            let err = std::io::Error::last_os_error();
            return Err(Error::AllocationFailed(format!(
                "{} bytes from {}: {}",
                size,
                self.path.display(),
                err
            )));
        }

        // SAFETY: on success the kernel installed a new dmabuf fd that we now own.
        let fd = unsafe { OwnedFd::from_raw_fd(alloc.fd as i32) };

        if let Some(name) = name {
            Self::set_name(&fd, name);
        }

        debug!(size, fd = fd.as_raw_fd(), name, "Allocated dmabuf");
        Ok(Region::from_fd(fd, size, RegionKind::DmaBuf, name.map(str::to_owned)))
    }

    fn describe(&self) -> String {
        format!("dma-heap:{}", self.path.display())
    }
}

impl std::fmt::Debug for DmaHeap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmaHeap")
            .field("fd", &self.fd.as_raw_fd())
            .field("path", &self.path)
            .finish()
    }
}

// ============================================================================
// MemfdHeap
// ============================================================================

/// Allocates memfd regions.
///
/// memfds can be mapped and passed around exactly like dmabufs, but they
/// live in ordinary page-cache memory. Real capture hardware cannot import
/// them; the simulated device and the tests can.
#[derive(Debug, Default, Clone, Copy)]
pub struct MemfdHeap;

impl MemfdHeap {
    /// Create the allocator.
    pub fn new() -> Self {
        Self
    }
}

impl HeapAllocator for MemfdHeap {
    fn allocate(&self, size: usize, name: Option<&str>) -> Result<Region> {
        if size == 0 {
            return Err(Error::AllocationFailed("size must be greater than 0".into()));
        }

        let label = name.unwrap_or("dmabuf-capture");
        let fd = rustix::fs::memfd_create(label, MemfdFlags::CLOEXEC)
            .map_err(|e| Error::AllocationFailed(format!("memfd_create: {e}")))?;
        rustix::fs::ftruncate(&fd, size as u64)
            .map_err(|e| Error::AllocationFailed(format!("ftruncate to {size}: {e}")))?;

        debug!(size, fd = fd.as_raw_fd(), name, "Allocated memfd region");
        Ok(Region::from_fd(fd, size, RegionKind::Memfd, name.map(str::to_owned)))
    }

    fn describe(&self) -> String {
        "memfd".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_name_on_char_boundary() {
        assert_eq!(truncate_name("capture-0", DMA_BUF_NAME_MAX), "capture-0");

        // 16 two-byte characters is 32 bytes; the cut must not split one.
        let name = "\u{e9}".repeat(16);
        let truncated = truncate_name(&name, DMA_BUF_NAME_MAX);
        assert!(truncated.len() <= DMA_BUF_NAME_MAX);
        assert_eq!(truncated.chars().count(), 15);

        let ascii = "x".repeat(40);
        assert_eq!(truncate_name(&ascii, DMA_BUF_NAME_MAX).len(), DMA_BUF_NAME_MAX);
    }

    #[test]
    fn test_memfd_allocate() {
        let region = MemfdHeap::new().allocate(4096, Some("test-region")).unwrap();

        assert_eq!(region.size(), 4096);
        assert_eq!(region.kind(), RegionKind::Memfd);
        assert_eq!(region.name(), Some("test-region"));

        let (fd, ..) = region.into_parts();
        let stat = rustix::fs::fstat(&fd).unwrap();
        assert_eq!(stat.st_size, 4096);
    }

    #[test]
    fn test_memfd_zero_size_fails() {
        let result = MemfdHeap::new().allocate(0, None);
        assert!(matches!(result, Err(Error::AllocationFailed(_))));
    }

    #[test]
    fn test_open_any_reports_every_path() {
        let result = DmaHeap::open_any(&["/nonexistent/heap-a", "/nonexistent/heap-b"]);

        match result {
            Err(Error::NoHeapAvailable(tried)) => {
                assert!(tried.contains("heap-a"));
                assert!(tried.contains("heap-b"));
            }
            other => panic!("expected NoHeapAvailable, got {:?}", other),
        }
    }

    #[test]
    fn test_open_any_takes_first_openable() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let heap = DmaHeap::open_any(&[Path::new("/nonexistent/heap"), file.path()]).unwrap();
        assert_eq!(heap.path(), file.path());
    }

    #[test]
    fn test_allocate_from_non_heap_fails() {
        // A regular file opens fine but rejects the heap ioctl.
        let file = tempfile::NamedTempFile::new().unwrap();
        let heap = DmaHeap::open_any(&[file.path()]).unwrap();

        let result = heap.allocate(4096, None);
        assert!(matches!(result, Err(Error::AllocationFailed(_))));
    }

    #[test]
    fn test_dma_heap_zero_size_fails() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let heap = DmaHeap::open_any(&[file.path()]).unwrap();
        assert!(matches!(heap.allocate(0, None), Err(Error::AllocationFailed(_))));
    }
}
