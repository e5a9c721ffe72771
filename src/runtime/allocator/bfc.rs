//! Best-fit allocator with coalescing
//!
//! Regions are obtained from a [`MemorySource`] on demand and carved into
//! blocks. A request takes the smallest free block that fits (lowest address
//! on ties), splitting off the remainder. Freed blocks merge with free
//! neighbours of the same region, so a region that is entirely free again is
//! a single block and can be trimmed.

use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, warn};

use super::{Allocation, Allocator, AllocatorStats, MemorySource};
use crate::error::{Error, Result};

/// Alignment and minimum block size, in bytes
pub const DEFAULT_ALIGNMENT: usize = 256;

/// Size of the first region when no reserve is requested
const INITIAL_REGION_BYTES: usize = 1 << 20;

/// Regions stop doubling at this size
const MAX_REGION_BYTES: usize = 1 << 30;

#[inline]
fn round_up(size: usize) -> usize {
    size.div_ceil(DEFAULT_ALIGNMENT) * DEFAULT_ALIGNMENT
}

#[derive(Debug, Clone, Copy)]
struct Block {
    size: usize,
    free: bool,
    /// Base address of the owning region
    region: u64,
}

#[derive(Debug)]
struct BfcState {
    /// region base -> region size
    regions: BTreeMap<u64, usize>,
    /// block address -> block
    blocks: BTreeMap<u64, Block>,
    /// (size, address) of every free block
    free: BTreeSet<(usize, u64)>,
    next_region: usize,
    allocated: usize,
    live: usize,
}

impl BfcState {
    fn new() -> Self {
        Self {
            regions: BTreeMap::new(),
            blocks: BTreeMap::new(),
            free: BTreeSet::new(),
            next_region: INITIAL_REGION_BYTES,
            allocated: 0,
            live: 0,
        }
    }

    fn add_region(&mut self, base: u64, size: usize) {
        self.regions.insert(base, size);
        self.blocks.insert(
            base,
            Block {
                size,
                free: true,
                region: base,
            },
        );
        self.free.insert((size, base));
        if size >= self.next_region {
            self.next_region = (self.next_region * 2).min(MAX_REGION_BYTES);
        }
    }

    fn take_best_fit(&mut self, size: usize) -> Option<Allocation> {
        let (block_size, ptr) = *self.free.range((size, 0)..).next()?;
        self.free.remove(&(block_size, ptr));

        let block = self.blocks.get_mut(&ptr)?;
        block.free = false;
        let region = block.region;
        let rest = block_size - size;
        if rest >= DEFAULT_ALIGNMENT {
            block.size = size;
            let rest_ptr = ptr + size as u64;
            self.blocks.insert(
                rest_ptr,
                Block {
                    size: rest,
                    free: true,
                    region,
                },
            );
            self.free.insert((rest, rest_ptr));
        }

        let size = self.blocks[&ptr].size;
        self.allocated += size;
        self.live += 1;
        Some(Allocation::new(ptr, size))
    }

    fn release_block(&mut self, ptr: u64) -> bool {
        let Some(block) = self.blocks.get(&ptr).copied() else {
            return false;
        };
        if block.free {
            return false;
        }
        self.allocated -= block.size;
        self.live -= 1;

        let (mut start, mut size) = (ptr, block.size);

        let next_ptr = ptr + block.size as u64;
        if let Some(next) = self.blocks.get(&next_ptr).copied() {
            if next.free && next.region == block.region {
                self.free.remove(&(next.size, next_ptr));
                self.blocks.remove(&next_ptr);
                size += next.size;
            }
        }

        let prev = self
            .blocks
            .range(..ptr)
            .next_back()
            .map(|(&p, b)| (p, *b));
        if let Some((prev_ptr, prev)) = prev {
            if prev.free && prev.region == block.region && prev_ptr + prev.size as u64 == ptr {
                self.free.remove(&(prev.size, prev_ptr));
                self.blocks.remove(&ptr);
                start = prev_ptr;
                size += prev.size;
            }
        }

        self.blocks.insert(
            start,
            Block {
                size,
                free: true,
                region: block.region,
            },
        );
        self.free.insert((size, start));
        true
    }
}

/// Best-fit-with-coalescing allocator over a [`MemorySource`].
pub struct BfcAllocator<S: MemorySource> {
    source: Arc<S>,
    state: Mutex<BfcState>,
}

impl<S: MemorySource> std::fmt::Debug for BfcAllocator<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BfcAllocator")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl<S: MemorySource> BfcAllocator<S> {
    /// Create an allocator drawing regions from `source`.
    ///
    /// `reserve_bytes` of 0 reserves nothing up front and grows on demand;
    /// a positive value reserves one region of that size immediately.
    ///
    /// # Errors
    ///
    /// Returns the source's error if the up-front reservation fails.
    pub fn new(source: Arc<S>, reserve_bytes: usize) -> Result<Self> {
        let allocator = Self {
            source,
            state: Mutex::new(BfcState::new()),
        };
        if reserve_bytes > 0 {
            let size = round_up(reserve_bytes);
            let base = allocator.source.reserve(size)?;
            allocator.state.lock().add_region(base, size);
            debug!(base, size, "bfc reserved initial region");
        }
        Ok(allocator)
    }

    /// The memory source regions come from
    pub fn source(&self) -> &Arc<S> {
        &self.source
    }

    /// Release every region that is entirely free.
    ///
    /// Returns the number of bytes given back to the source.
    pub fn trim(&self) -> usize {
        let idle: Vec<(u64, usize)> = {
            let mut state = self.state.lock();
            let idle: Vec<(u64, usize)> = state
                .regions
                .iter()
                .filter(|&(base, size)| {
                    state
                        .blocks
                        .get(base)
                        .is_some_and(|b| b.free && b.size == *size)
                })
                .map(|(&base, &size)| (base, size))
                .collect();
            for &(base, size) in &idle {
                state.regions.remove(&base);
                state.blocks.remove(&base);
                state.free.remove(&(size, base));
            }
            idle
        };

        let mut released = 0;
        for (base, size) in idle {
            self.source.release(base, size);
            released += size;
        }
        if released > 0 {
            debug!(released, "bfc trimmed idle regions");
        }
        released
    }

    /// Obtain a new region of at least `min` bytes without holding the lock.
    fn reserve_region(&self, min: usize) -> Result<(u64, usize)> {
        let target = self.state.lock().next_region.max(min);
        match self.source.reserve(target) {
            Ok(base) => Ok((base, target)),
            Err(e) if e.is_out_of_memory() && target > min => {
                debug!(target, min, "bfc region reservation failed, retrying exact size");
                Ok((self.source.reserve(min)?, min))
            }
            Err(e) => Err(e),
        }
    }
}

impl<S: MemorySource> Allocator for BfcAllocator<S> {
    fn name(&self) -> &'static str {
        "bfc"
    }

    fn alloc(&self, size_bytes: usize) -> Result<Allocation> {
        if size_bytes == 0 {
            return Ok(Allocation::new(0, 0));
        }
        let size = size_bytes
            .checked_next_multiple_of(DEFAULT_ALIGNMENT)
            .ok_or(Error::OutOfMemory { size: size_bytes })?;

        loop {
            if let Some(block) = self.state.lock().take_best_fit(size) {
                return Ok(block);
            }
            // The source may submit to the context worker; never hold the
            // lock across it.
            let (base, region_size) = self.reserve_region(size)?;
            debug!(base, size = region_size, "bfc reserved region");
            let mut state = self.state.lock();
            state.add_region(base, region_size);
            if let Some(block) = state.take_best_fit(size) {
                return Ok(block);
            }
        }
    }

    fn free(&self, block: Allocation) {
        if block.ptr == 0 {
            return;
        }
        if !self.state.lock().release_block(block.ptr) {
            warn!(ptr = block.ptr, size = block.size, "bfc free of unknown or already free block");
        }
    }

    fn stats(&self) -> AllocatorStats {
        let state = self.state.lock();
        AllocatorStats {
            reserved_bytes: state.regions.values().sum(),
            allocated_bytes: state.allocated,
            live_blocks: state.live,
            free_blocks: state.free.len(),
            pending_bytes: 0,
        }
    }
}

impl<S: MemorySource> Drop for BfcAllocator<S> {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if state.live > 0 {
            warn!(
                live_blocks = state.live,
                allocated = state.allocated,
                "bfc dropped with live blocks"
            );
        }
        for (&base, &size) in &state.regions {
            self.source.release(base, size);
        }
        state.regions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Counts reservations; addresses leave a gap between regions.
    #[derive(Default)]
    struct TestSource {
        inner: parking_lot::Mutex<TestSourceState>,
    }

    #[derive(Default)]
    struct TestSourceState {
        next: u64,
        live: HashMap<u64, usize>,
        limit: Option<usize>,
        reserves: usize,
    }

    impl TestSource {
        fn with_limit(limit: usize) -> Self {
            let source = Self::default();
            source.inner.lock().limit = Some(limit);
            source
        }

        fn live_bytes(&self) -> usize {
            self.inner.lock().live.values().sum()
        }

        fn reserves(&self) -> usize {
            self.inner.lock().reserves
        }
    }

    impl MemorySource for TestSource {
        fn reserve(&self, size_bytes: usize) -> Result<u64> {
            let mut s = self.inner.lock();
            let in_use: usize = s.live.values().sum();
            if s.limit.is_some_and(|limit| in_use + size_bytes > limit) {
                return Err(Error::OutOfMemory { size: size_bytes });
            }
            s.next += 1 << 32;
            let ptr = s.next;
            s.live.insert(ptr, size_bytes);
            s.reserves += 1;
            Ok(ptr)
        }

        fn release(&self, ptr: u64, _size_bytes: usize) {
            self.inner.lock().live.remove(&ptr);
        }
    }

    fn bfc(source: &Arc<TestSource>) -> BfcAllocator<TestSource> {
        BfcAllocator::new(Arc::clone(source), 0).unwrap()
    }

    #[test]
    fn test_grows_on_demand() {
        let source = Arc::new(TestSource::default());
        let alloc = bfc(&source);
        assert_eq!(source.reserves(), 0);

        let a = alloc.alloc(100).unwrap();
        assert_eq!(a.size, DEFAULT_ALIGNMENT);
        assert_eq!(source.reserves(), 1);
        assert_eq!(alloc.stats().reserved_bytes, INITIAL_REGION_BYTES);

        let b = alloc.alloc(1000).unwrap();
        assert_eq!(b.ptr, a.end());
        assert_eq!(source.reserves(), 1);
    }

    #[test]
    fn test_best_fit_prefers_smallest_hole() {
        let source = Arc::new(TestSource::default());
        let alloc = bfc(&source);

        let a = alloc.alloc(4096).unwrap();
        let _sep1 = alloc.alloc(256).unwrap();
        let b = alloc.alloc(1024).unwrap();
        let _sep2 = alloc.alloc(256).unwrap();

        alloc.free(a);
        alloc.free(b);

        // Both holes fit; the 1 KiB one is the best fit.
        let c = alloc.alloc(512).unwrap();
        assert_eq!(c.ptr, b.ptr);
    }

    #[test]
    fn test_coalesces_neighbours() {
        let source = Arc::new(TestSource::default());
        let alloc = bfc(&source);

        let a = alloc.alloc(1024).unwrap();
        let b = alloc.alloc(1024).unwrap();
        let c = alloc.alloc(1024).unwrap();

        alloc.free(a);
        alloc.free(c);
        alloc.free(b);

        // Everything merged back into the single region block.
        let stats = alloc.stats();
        assert_eq!(stats.free_blocks, 1);
        assert_eq!(stats.live_blocks, 0);
        assert_eq!(stats.allocated_bytes, 0);

        let big = alloc.alloc(3 * 1024).unwrap();
        assert_eq!(big.ptr, a.ptr);
    }

    #[test]
    fn test_large_request_gets_own_region() {
        let source = Arc::new(TestSource::default());
        let alloc = bfc(&source);
        let big = alloc.alloc(3 * INITIAL_REGION_BYTES + 10).unwrap();
        assert!(big.size >= 3 * INITIAL_REGION_BYTES + 10);
        assert_eq!(source.reserves(), 1);
    }

    #[test]
    fn test_oom_retries_exact_size() {
        let source = Arc::new(TestSource::with_limit(64 * 1024));
        let alloc = bfc(&source);
        let block = alloc.alloc(4096).unwrap();
        assert_eq!(block.size, 4096);
        assert_eq!(alloc.stats().reserved_bytes, 4096);
    }

    #[test]
    fn test_oom_propagates() {
        let source = Arc::new(TestSource::with_limit(1024));
        let alloc = bfc(&source);
        let err = alloc.alloc(4096).unwrap_err();
        assert!(err.is_out_of_memory());
    }

    #[test]
    fn test_trim_and_drop_release_regions() {
        let source = Arc::new(TestSource::default());
        let alloc = bfc(&source);
        let a = alloc.alloc(512).unwrap();
        let _b = alloc.alloc(2 * INITIAL_REGION_BYTES).unwrap();
        assert_eq!(source.reserves(), 2);

        alloc.free(a);
        assert_eq!(alloc.trim(), INITIAL_REGION_BYTES);
        assert!(source.live_bytes() >= 2 * INITIAL_REGION_BYTES);

        drop(alloc);
        assert_eq!(source.live_bytes(), 0);
    }

    #[test]
    fn test_double_free_is_ignored() {
        let source = Arc::new(TestSource::default());
        let alloc = bfc(&source);
        let a = alloc.alloc(256).unwrap();
        alloc.free(a);
        alloc.free(a);
        assert_eq!(alloc.stats().free_blocks, 1);
    }

    #[test]
    fn test_reserve_hint() {
        let source = Arc::new(TestSource::default());
        let alloc = BfcAllocator::new(Arc::clone(&source), 10_000).unwrap();
        assert_eq!(source.reserves(), 1);
        assert_eq!(alloc.stats().reserved_bytes, round_up(10_000));
        let _a = alloc.alloc(8192).unwrap();
        assert_eq!(source.reserves(), 1);
    }

    #[test]
    fn test_zero_size() {
        let source = Arc::new(TestSource::default());
        let alloc = bfc(&source);
        let empty = alloc.alloc(0).unwrap();
        assert_eq!(empty, Allocation::new(0, 0));
        alloc.free(empty);
        assert_eq!(source.reserves(), 0);
    }
}
