//! Fixed-size pool of mapped capture buffers.

use crate::error::{Error, Result};
use crate::format::{MAX_PLANES, Planes};
use crate::memory::{BufferHandle, HeapAllocator, MappingState};
use tracing::{debug, info, warn};

/// Which side currently owns a pool index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// Queued to (or held by) the capture device. The CPU must not touch it.
    WithDevice,
    /// Dequeued and available to the application.
    WithApplication,
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Total buffers.
    pub capacity: usize,
    /// Buffers owned by the device.
    pub with_device: usize,
    /// Buffers owned by the application.
    pub with_application: usize,
    /// Regions per buffer.
    pub planes: usize,
    /// Bytes per buffer, summed over its planes.
    pub buffer_size: usize,
}

/// An arena of N mapped buffers addressed by index.
///
/// Every buffer owns one region per plane, so a multi-planar device can
/// write each plane at the start of its own dmabuf. The pool owns every
/// handle for its whole lifetime. Callers refer to buffers by index, and
/// byte slices only ever borrow from the pool, so no address escapes it.
/// Each index carries an [`Ownership`] tag; the tags always add up to the
/// pool size.
///
/// # Design
///
/// - Fixed size: N and the plane sizes are chosen at creation
/// - All-or-nothing creation: a failure part-way releases what was built
/// - Idempotent teardown: `teardown()` and `Drop` both unmap and close
///
/// # Example
///
/// ```rust
/// use dmabuf_capture::memory::{BufferPool, MemfdHeap, Ownership};
///
/// let pool = BufferPool::create(&MemfdHeap::new(), 3, 4096).unwrap();
/// assert_eq!(pool.len(), 3);
/// assert_eq!(pool.ownership(0).unwrap(), Ownership::WithDevice);
///
/// // Two planes per buffer: 4 KiB luma, 2 KiB chroma
/// let nv12 = BufferPool::create_planar(&MemfdHeap::new(), None, 3, &[4096, 2048]).unwrap();
/// assert_eq!(nv12.get(0).unwrap().len(), 2);
/// assert_eq!(nv12.buffer_size(), 6144);
/// ```
pub struct BufferPool {
    /// The buffers, indexed 0..N, one handle per plane.
    buffers: Vec<Planes<BufferHandle>>,
    /// Ownership tag per index.
    owners: Vec<Ownership>,
    /// Size of each plane's region in bytes.
    plane_sizes: Planes<usize>,
    /// Description of the allocator, for logs.
    heap: String,
}

impl BufferPool {
    /// Allocate and map `count` single-region buffers of `size` bytes from
    /// `heap`.
    ///
    /// All indices start as [`Ownership::WithDevice`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::AllocationFailed`] for a zero count or size, or the
    /// first allocation/mapping error. Buffers created before the failure
    /// are released first.
    pub fn create<H: HeapAllocator + ?Sized>(heap: &H, count: usize, size: usize) -> Result<Self> {
        Self::create_planar(heap, None, count, &[size])
    }

    /// Like [`create`](Self::create), labelling buffer `i` as `"{prefix}-{i}"`.
    pub fn create_named<H: HeapAllocator + ?Sized>(
        heap: &H,
        prefix: Option<&str>,
        count: usize,
        size: usize,
    ) -> Result<Self> {
        Self::create_planar(heap, prefix, count, &[size])
    }

    /// Allocate `count` buffers with one region per entry of `plane_sizes`.
    ///
    /// Multi-plane buffers are labelled `"{prefix}-{i}.{plane}"`.
    pub fn create_planar<H: HeapAllocator + ?Sized>(
        heap: &H,
        prefix: Option<&str>,
        count: usize,
        plane_sizes: &[usize],
    ) -> Result<Self> {
        if count == 0 {
            return Err(Error::AllocationFailed("pool needs at least one buffer".into()));
        }
        if plane_sizes.is_empty() || plane_sizes.len() > MAX_PLANES {
            return Err(Error::AllocationFailed(format!(
                "{} planes per buffer, expected 1..={MAX_PLANES}",
                plane_sizes.len()
            )));
        }
        if plane_sizes.contains(&0) {
            return Err(Error::AllocationFailed("buffer size must be greater than 0".into()));
        }

        let mut buffers: Vec<Planes<BufferHandle>> = Vec::with_capacity(count);
        for index in 0..count {
            match allocate_buffer(heap, prefix, index, plane_sizes) {
                Ok(planes) => buffers.push(planes),
                Err(e) => {
                    warn!(
                        index,
                        created = buffers.len(),
                        error = %e,
                        "Buffer pool creation failed, releasing partial pool"
                    );
                    for handle in buffers.iter_mut().flatten() {
                        handle.release();
                    }
                    return Err(e);
                }
            }
        }

        info!(
            count,
            planes = plane_sizes.len(),
            size = plane_sizes.iter().sum::<usize>(),
            heap = %heap.describe(),
            "Created buffer pool"
        );

        Ok(Self {
            buffers,
            owners: vec![Ownership::WithDevice; count],
            plane_sizes: plane_sizes.iter().copied().collect(),
            heap: heap.describe(),
        })
    }

    /// Number of buffers.
    #[inline]
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// Whether the pool has no buffers. Never true for a created pool.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Regions per buffer.
    #[inline]
    pub fn num_planes(&self) -> usize {
        self.plane_sizes.len()
    }

    /// Size of each plane's region in bytes.
    pub fn plane_sizes(&self) -> &[usize] {
        &self.plane_sizes
    }

    /// Bytes per buffer, summed over its planes.
    pub fn buffer_size(&self) -> usize {
        self.plane_sizes.iter().sum()
    }

    /// Borrow the plane handles of buffer `index`. The pool keeps ownership.
    pub fn get(&self, index: usize) -> Result<&[BufferHandle]> {
        self.buffers
            .get(index)
            .map(|planes| planes.as_slice())
            .ok_or(Error::InvalidIndex(index))
    }

    pub(crate) fn get_mut(&mut self, index: usize) -> Result<&mut [BufferHandle]> {
        self.buffers
            .get_mut(index)
            .map(|planes| planes.as_mut_slice())
            .ok_or(Error::InvalidIndex(index))
    }

    /// Iterate over the buffers in index order.
    pub fn iter(&self) -> impl Iterator<Item = &[BufferHandle]> + '_ {
        self.buffers.iter().map(|planes| planes.as_slice())
    }

    /// Whether any plane of buffer `index` has an open access window.
    pub fn is_accessing(&self, index: usize) -> Result<bool> {
        Ok(self.get(index)?.iter().any(BufferHandle::is_accessing))
    }

    /// Current owner of `index`.
    pub fn ownership(&self, index: usize) -> Result<Ownership> {
        self.owners.get(index).copied().ok_or(Error::InvalidIndex(index))
    }

    /// Tag `index` as device-owned, returning the previous tag.
    pub fn mark_with_device(&mut self, index: usize) -> Result<Ownership> {
        self.set_owner(index, Ownership::WithDevice)
    }

    /// Tag `index` as application-owned, returning the previous tag.
    pub fn mark_with_application(&mut self, index: usize) -> Result<Ownership> {
        self.set_owner(index, Ownership::WithApplication)
    }

    /// Tag every index as device-owned.
    pub fn mark_all_with_device(&mut self) {
        self.owners.fill(Ownership::WithDevice);
    }

    fn set_owner(&mut self, index: usize, owner: Ownership) -> Result<Ownership> {
        let slot = self.owners.get_mut(index).ok_or(Error::InvalidIndex(index))?;
        Ok(std::mem::replace(slot, owner))
    }

    /// Buffers currently owned by the device.
    pub fn with_device_count(&self) -> usize {
        self.owners.iter().filter(|o| **o == Ownership::WithDevice).count()
    }

    /// Buffers currently owned by the application.
    pub fn with_application_count(&self) -> usize {
        self.owners
            .iter()
            .filter(|o| **o == Ownership::WithApplication)
            .count()
    }

    /// Occupancy snapshot.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            capacity: self.len(),
            with_device: self.with_device_count(),
            with_application: self.with_application_count(),
            planes: self.num_planes(),
            buffer_size: self.buffer_size(),
        }
    }

    /// Whether every region is mapped.
    pub fn all_mapped(&self) -> bool {
        self.handles()
            .all(|h| h.mapping_state() == MappingState::Mapped)
    }

    /// Unmap and close every region. Already-released regions are skipped.
    pub fn teardown(&mut self) {
        let live = self.handles().filter(|h| !h.is_released()).count();
        if live == 0 {
            return;
        }
        for handle in self.buffers.iter_mut().flatten() {
            handle.release();
        }
        debug!(released = live, heap = %self.heap, "Tore down buffer pool");
    }

    /// Whether [`teardown`](Self::teardown) has released everything.
    pub fn is_torn_down(&self) -> bool {
        self.handles().all(BufferHandle::is_released)
    }

    fn handles(&self) -> impl Iterator<Item = &BufferHandle> + '_ {
        self.buffers.iter().flatten()
    }
}

/// Allocate and map the regions of one buffer. Regions created before a
/// failure are released when the partial set drops.
fn allocate_buffer<H: HeapAllocator + ?Sized>(
    heap: &H,
    prefix: Option<&str>,
    index: usize,
    plane_sizes: &[usize],
) -> Result<Planes<BufferHandle>> {
    let multi = plane_sizes.len() > 1;
    plane_sizes
        .iter()
        .enumerate()
        .map(|(plane, &size)| {
            let name = prefix.map(|p| {
                if multi {
                    format!("{p}-{index}.{plane}")
                } else {
                    format!("{p}-{index}")
                }
            });
            heap.allocate(size, name.as_deref())
                .and_then(BufferHandle::map_region)
        })
        .collect()
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("len", &self.len())
            .field("plane_sizes", &self.plane_sizes)
            .field("owners", &self.owners)
            .field("heap", &self.heap)
            .finish()
    }
}
