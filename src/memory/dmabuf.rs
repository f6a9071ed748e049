//! CPU-mapped buffer handles.
//!
//! A [`BufferHandle`] owns one allocated region (dmabuf or memfd), its
//! `mmap` for CPU access, and the state of its CPU access window. The
//! capture device only ever sees the handle's file descriptor; the mapping
//! stays in this process.
//!
//! # Example
//!
//! ```rust,ignore
//! use dmabuf_capture::memory::{BufferHandle, DmaHeap, HeapAllocator, sync};
//!
//! let heap = DmaHeap::open()?;
//! let mut handle = BufferHandle::map_region(heap.allocate(4096, None)?)?;
//!
//! sync::begin_access(&mut handle)?;
//! let first = handle.as_slice()?[0];
//! sync::end_access(&mut handle)?;
//! ```

use crate::error::{Error, Result};
use crate::memory::{Region, RegionKind};
use rustix::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use rustix::mm::{MapFlags, ProtFlags};
use std::ptr::NonNull;
use tracing::{debug, warn};

/// Whether a handle currently has a CPU mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingState {
    /// No mapping; the region may still be open.
    Unmapped,
    /// Mapped read/write and shared with the device.
    Mapped,
}

/// One buffer of a pool: region fd, CPU mapping and sync state.
///
/// # Invariants
///
/// - `ptr` is `Some` iff the mapping state is [`MappingState::Mapped`]
/// - a mapping never outlives the fd it was created from
/// - the byte slices are only handed out inside an open access window
///   (see [`crate::memory::sync`])
///
/// # Thread Safety
///
/// `BufferHandle` is `Send` but not `Sync`: the mapped memory has exactly
/// one owner at a time, and the queue/dequeue protocol decides who.
pub struct BufferHandle {
    /// Region file descriptor. `None` once released.
    fd: Option<OwnedFd>,
    /// CPU mapping. `None` while unmapped.
    ptr: Option<NonNull<u8>>,
    /// Size in bytes.
    size: usize,
    /// Backing kind, decides whether sync barriers hit the kernel.
    kind: RegionKind,
    /// Debug label.
    name: Option<String>,
    /// An access window is open.
    accessing: bool,
}

impl BufferHandle {
    /// Take ownership of a region without mapping it.
    pub fn from_region(region: Region) -> Self {
        let (fd, size, kind, name) = region.into_parts();
        Self {
            fd: Some(fd),
            ptr: None,
            size,
            kind,
            name,
            accessing: false,
        }
    }

    /// Take ownership of a region and map it for read/write CPU access.
    ///
    /// On failure the region is closed before the error is returned.
    pub fn map_region(region: Region) -> Result<Self> {
        let mut handle = Self::from_region(region);
        handle.map()?;
        Ok(handle)
    }

    /// Map the region `MAP_SHARED` with `PROT_READ | PROT_WRITE`.
    ///
    /// Mapping an already-mapped handle is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MappingFailed`] if the handle was released or mmap
    /// fails.
    pub fn map(&mut self) -> Result<()> {
        if self.ptr.is_some() {
            return Ok(());
        }
        let fd = self
            .fd
            .as_ref()
            .ok_or_else(|| Error::MappingFailed("handle already released".into()))?;

        // SAFETY: mapping a fresh region of `size` bytes at a kernel-chosen
        // address; the fd stays open for as long as the mapping exists.
        let ptr = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                self.size,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                fd,
                0,
            )
            .map_err(|e| Error::MappingFailed(format!("mmap {} bytes: {}", self.size, e)))?
        };

        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| Error::MappingFailed("mmap returned null".into()))?;
        self.ptr = Some(ptr);
        Ok(())
    }

    /// Drop the CPU mapping, keeping the region open.
    pub fn unmap(&mut self) {
        if self.accessing {
            warn!(name = ?self.name, "Unmapping buffer with an open access window");
            self.accessing = false;
        }
        if let Some(ptr) = self.ptr.take() {
            // SAFETY: ptr/size describe a mapping created by `map()` that no
            // slice outlives (slices borrow `self`).
            if let Err(e) = unsafe { rustix::mm::munmap(ptr.as_ptr().cast(), self.size) } {
                warn!(error = %e, "munmap failed");
            }
        }
    }

    /// Unmap and close the region. Safe to call more than once.
    pub fn release(&mut self) {
        self.unmap();
        if let Some(fd) = self.fd.take() {
            debug!(fd = fd.as_raw_fd(), size = self.size, "Released buffer region");
        }
    }

    /// Whether the region has been released.
    #[inline]
    pub fn is_released(&self) -> bool {
        self.fd.is_none()
    }

    /// Current mapping state.
    #[inline]
    pub fn mapping_state(&self) -> MappingState {
        if self.ptr.is_some() {
            MappingState::Mapped
        } else {
            MappingState::Unmapped
        }
    }

    /// Borrow the region's fd, for handing to a device.
    #[inline]
    pub fn as_fd(&self) -> Option<BorrowedFd<'_>> {
        self.fd.as_ref().map(|fd| fd.as_fd())
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

    /// Debug label.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Whether an access window is currently open.
    #[inline]
    pub fn is_accessing(&self) -> bool {
        self.accessing
    }

    pub(crate) fn set_accessing(&mut self, accessing: bool) {
        self.accessing = accessing;
    }

    /// The mapped bytes. Only available inside an access window.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SyncFailed`] if no access window is open, or
    /// [`Error::MappingFailed`] if the handle is not mapped.
    pub fn as_slice(&self) -> Result<&[u8]> {
        let ptr = self.checked_ptr()?;
        // SAFETY: ptr is valid for `size` bytes while mapped; the slice
        // borrows self, so the mapping cannot go away underneath it.
        Ok(unsafe { std::slice::from_raw_parts(ptr.as_ptr(), self.size) })
    }

    /// The mapped bytes, mutably. Only available inside an access window.
    pub fn as_mut_slice(&mut self) -> Result<&mut [u8]> {
        let ptr = self.checked_ptr()?;
        // SAFETY: as above, and &mut self guarantees exclusivity.
        Ok(unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), self.size) })
    }

    fn checked_ptr(&self) -> Result<NonNull<u8>> {
        let ptr = self
            .ptr
            .ok_or_else(|| Error::MappingFailed("buffer is not mapped".into()))?;
        if !self.accessing {
            return Err(Error::SyncFailed(
                "CPU access outside of a begin/end access window".into(),
            ));
        }
        Ok(ptr)
    }
}

impl Drop for BufferHandle {
    fn drop(&mut self) {
        // Unmap before the fd is closed
        self.release();
    }
}

// SAFETY: the fd and mapping can move between threads; there is no shared
// interior state, and all access goes through &self/&mut self.
unsafe impl Send for BufferHandle {}

impl std::fmt::Debug for BufferHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferHandle")
            .field("fd", &self.fd.as_ref().map(|fd| fd.as_raw_fd()))
            .field("size", &self.size)
            .field("kind", &self.kind)
            .field("state", &self.mapping_state())
            .field("accessing", &self.accessing)
            .finish()
    }
}
