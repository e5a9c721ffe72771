//! Device memory allocators
//!
//! The default stack is two layers:
//!
//! ```text
//! ReclaimingAllocator   deferred release of blocks still used by queued work
//! └── BfcAllocator      best-fit with coalescing over regions from a MemorySource
//!     └── Context       raw driver allocations on the worker thread
//! ```
//!
//! A caller-supplied allocator replaces the whole stack.
//!
//! The reclaiming layer orders its releases against the context queue
//! through a [`Fence`]: a block freed by the caller goes back to the base
//! only after every task submitted before the free has run.

mod bfc;
mod reclaim;

pub use bfc::{BfcAllocator, DEFAULT_ALIGNMENT};
pub use reclaim::{DEFAULT_RECLAIM_WATERMARK, Lease, ReclaimingAllocator};

use crate::error::Result;
use crate::runtime::Completion;

/// A block of device memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Allocation {
    /// Device address of the first byte
    pub ptr: u64,
    /// Usable size in bytes
    pub size: usize,
}

impl Allocation {
    /// Create an allocation record
    pub fn new(ptr: u64, size: usize) -> Self {
        Self { ptr, size }
    }

    /// Address one past the last byte
    #[inline]
    pub fn end(&self) -> u64 {
        self.ptr + self.size as u64
    }
}

/// Usage counters reported by an allocator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocatorStats {
    /// Bytes obtained from the device
    pub reserved_bytes: usize,
    /// Bytes currently handed out to callers
    pub allocated_bytes: usize,
    /// Number of blocks currently handed out
    pub live_blocks: usize,
    /// Number of free blocks held for reuse
    pub free_blocks: usize,
    /// Bytes freed by callers but not yet released to the layer below
    pub pending_bytes: usize,
}

/// Memory allocator trait for device memory
///
/// Allocators are shared as `Arc<dyn Allocator>` between a
/// [`Handle`](crate::Handle) and the code that uses it.
pub trait Allocator: Send + Sync {
    /// Short name of this layer, e.g. `"bfc"`
    fn name(&self) -> &'static str;

    /// Allocate at least `size_bytes` bytes
    fn alloc(&self, size_bytes: usize) -> Result<Allocation>;

    /// Return a block obtained from [`Allocator::alloc`]
    fn free(&self, block: Allocation);

    /// Mark `block` as referenced by an in-flight operation.
    ///
    /// Layers without deferred release return a detached lease.
    fn lease(&self, block: Allocation) -> Lease {
        Lease::detached(block)
    }

    /// Release any deferred frees whose references have ended.
    ///
    /// Returns the number of bytes handed back to the layer below.
    fn collect(&self) -> usize {
        0
    }

    /// Whether this layer defers frees until references end
    fn reclaims(&self) -> bool {
        false
    }

    /// The wrapped layer, if this allocator decorates another
    fn inner(&self) -> Option<&dyn Allocator> {
        None
    }

    /// Get usage counters
    fn stats(&self) -> AllocatorStats {
        AllocatorStats::default()
    }
}

/// Source of raw device regions for [`BfcAllocator`]
pub trait MemorySource: Send + Sync {
    /// Obtain `size_bytes` of device memory
    fn reserve(&self, size_bytes: usize) -> Result<u64>;

    /// Give a region obtained from [`MemorySource::reserve`] back
    fn release(&self, ptr: u64, size_bytes: usize);
}

/// Ordering point on a serialized device queue
pub trait Fence: Send + Sync {
    /// A marker that completes once all work submitted before it has run
    fn submit(&self) -> Completion<()>;

    /// Whether the calling thread may block on a marker.
    ///
    /// False on the queue's own worker, where waiting would never finish.
    fn can_wait(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocator_is_object_safe() {
        fn assert_dyn(_: Option<&dyn Allocator>) {}
        assert_dyn(None);
    }

    #[test]
    fn test_allocation_end() {
        let block = Allocation::new(0x1000, 256);
        assert_eq!(block.end(), 0x1100);
    }
}
