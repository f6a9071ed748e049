//! CPU access windows for dmabufs.
//!
//! Capture hardware writes behind the CPU caches. Before reading a buffer
//! the CPU must issue `DMA_BUF_IOCTL_SYNC` with `SYNC_START`, and before the
//! buffer goes back to the device it must issue `SYNC_END`. Skipping either
//! can expose stale cache lines on non-coherent systems.
//!
//! ```rust,ignore
//! use dmabuf_capture::memory::sync::AccessWindow;
//!
//! let window = AccessWindow::open(&mut handle)?;
//! consume(window.as_slice()?);
//! window.close()?;
//! ```
//!
//! Both directives are retried on `EINTR` and `EAGAIN` only, up to
//! [`SYNC_MAX_RETRIES`] attempts; any other errno fails immediately.

use crate::error::{Error, Result};
use crate::memory::defaults::SYNC_MAX_RETRIES;
use crate::memory::{BufferHandle, MappingState, RegionKind};
use rustix::fd::AsRawFd;
use std::io;
use tracing::{trace, warn};

/// `DMA_BUF_IOCTL_SYNC`: `_IOW('b', 0, struct dma_buf_sync)`.
const DMA_BUF_IOCTL_SYNC: libc::c_ulong = 0x4008_6200;

const DMA_BUF_SYNC_READ: u64 = 1 << 0;
const DMA_BUF_SYNC_WRITE: u64 = 1 << 1;
const DMA_BUF_SYNC_RW: u64 = DMA_BUF_SYNC_READ | DMA_BUF_SYNC_WRITE;
const DMA_BUF_SYNC_START: u64 = 0;
const DMA_BUF_SYNC_END: u64 = 1 << 2;

/// `struct dma_buf_sync` from `<linux/dma-buf.h>`.
#[repr(C)]
struct DmaBufSync {
    flags: u64,
}

/// Which end of an access window a directive marks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncPhase {
    Start,
    End,
}

impl SyncPhase {
    fn flags(self) -> u64 {
        match self {
            SyncPhase::Start => DMA_BUF_SYNC_START | DMA_BUF_SYNC_RW,
            SyncPhase::End => DMA_BUF_SYNC_END | DMA_BUF_SYNC_RW,
        }
    }
}

/// Whether an error is worth retrying the sync ioctl for.
fn is_transient(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(libc::EINTR) | Some(libc::EAGAIN))
}

/// Run `op` until it succeeds, retrying only transient failures.
///
/// Returns the last error once `max_attempts` attempts have been used, or
/// the first non-transient error immediately.
pub(crate) fn retry_transient<F>(max_attempts: u32, mut op: F) -> io::Result<()>
where
    F: FnMut() -> io::Result<()>,
{
    let mut attempt = 1;
    loop {
        match op() {
            Ok(()) => return Ok(()),
            Err(e) if is_transient(&e) && attempt < max_attempts => {
                trace!(attempt, error = %e, "Retrying dmabuf sync");
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

fn issue_sync(handle: &BufferHandle, phase: SyncPhase) -> Result<()> {
    if handle.mapping_state() != MappingState::Mapped {
        return Err(Error::SyncFailed("buffer is not mapped".into()));
    }

    // memfd pages are ordinary cached memory; there is nothing to flush.
    if handle.kind() == RegionKind::Memfd {
        return Ok(());
    }

    let fd = handle
        .as_fd()
        .ok_or_else(|| Error::SyncFailed("buffer already released".into()))?
        .as_raw_fd();
    let sync = DmaBufSync {
        flags: phase.flags(),
    };

    retry_transient(SYNC_MAX_RETRIES, || {
        // SAFETY: DMA_BUF_IOCTL_SYNC only reads the dma_buf_sync struct.
        let ret = unsafe { libc::ioctl(fd, DMA_BUF_IOCTL_SYNC, &sync) };
        if ret < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    })
    .map_err(|e| Error::SyncFailed(format!("{:?} on fd {}: {}", phase, fd, e)))
}

/// Open a CPU access window on `handle`.
///
/// Calling it again on an already-open window re-issues the directive,
/// which is harmless.
pub fn begin_access(handle: &mut BufferHandle) -> Result<()> {
    issue_sync(handle, SyncPhase::Start)?;
    handle.set_accessing(true);
    Ok(())
}

/// Close the CPU access window on `handle`.
///
/// # Errors
///
/// Returns [`Error::SyncFailed`] if no window is open or the directive
/// fails. On failure the window stays open so the call can be retried.
pub fn end_access(handle: &mut BufferHandle) -> Result<()> {
    if !handle.is_accessing() {
        return Err(Error::SyncFailed("end_access without begin_access".into()));
    }
    issue_sync(handle, SyncPhase::End)?;
    handle.set_accessing(false);
    Ok(())
}

/// RAII access window over one handle.
///
/// Prefer [`AccessWindow::close`], which reports errors. Dropping an open
/// window still issues `SYNC_END` and logs a failure.
pub struct AccessWindow<'a> {
    handle: &'a mut BufferHandle,
    open: bool,
}

impl<'a> AccessWindow<'a> {
    /// Begin access on `handle`.
    pub fn open(handle: &'a mut BufferHandle) -> Result<Self> {
        begin_access(handle)?;
        Ok(Self { handle, open: true })
    }

    /// The mapped bytes.
    pub fn as_slice(&self) -> Result<&[u8]> {
        self.handle.as_slice()
    }

    /// The mapped bytes, mutably.
    pub fn as_mut_slice(&mut self) -> Result<&mut [u8]> {
        self.handle.as_mut_slice()
    }

    /// The handle being accessed.
    pub fn handle(&self) -> &BufferHandle {
        &*self.handle
    }

    /// End access and report the outcome.
    pub fn close(mut self) -> Result<()> {
        self.open = false;
        end_access(&mut *self.handle)
    }
}

impl Drop for AccessWindow<'_> {
    fn drop(&mut self) {
        if self.open {
            if let Err(e) = end_access(&mut *self.handle) {
                warn!(error = %e, "Failed to close access window on drop");
            }
        }
    }
}
