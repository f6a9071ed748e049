//! Buffer memory: allocation, mapping, sync windows and the capture pool.
//!
//! # Architecture
//!
//! - [`HeapAllocator`]: Source of fd-backed regions ([`DmaHeap`], [`MemfdHeap`])
//! - [`BufferHandle`]: One region plus its CPU mapping and access state
//! - [`sync`]: Begin/end CPU access windows (`DMA_BUF_IOCTL_SYNC`)
//! - [`BufferPool`]: Fixed arena of handles with device/application ownership
//!
//! # Example
//!
//! ```rust
//! use dmabuf_capture::memory::{BufferPool, MemfdHeap};
//!
//! // Three 64KB buffers, all mapped and owned by the device side
//! let pool = BufferPool::create(&MemfdHeap::new(), 3, 64 * 1024).unwrap();
//! assert!(pool.all_mapped());
//! ```

pub mod defaults;
mod dmabuf;
mod heap;
mod pool;
pub mod sync;

pub use dmabuf::{BufferHandle, MappingState};
pub use heap::{DmaHeap, HeapAllocator, MemfdHeap, Region, RegionKind};
pub use pool::{BufferPool, Ownership, PoolStats};
pub use sync::{AccessWindow, begin_access, end_access};
