//! Reclaiming allocator wrapper
//!
//! Device work is queued, so a buffer can be "done" from the caller's point
//! of view while a kernel that reads it has not run yet. With a [`Fence`]
//! attached, every free records a marker on the context queue and the block
//! is parked until that marker has run, so callers never track in-flight
//! tasks themselves. Work that outlives the queue order (other streams,
//! host-side readers) additionally takes a [`Lease`]; a block freed while
//! leased stays reserved until its last lease is gone.
//!
//! Parked blocks whose marker has completed go back to the base allocator
//! when pending bytes reach the watermark and on explicit
//! [`Allocator::collect`]. When the base reports out-of-memory the wrapper
//! waits for outstanding markers (off the worker thread), releases
//! everything parked, and retries the allocation once.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace, warn};

use super::{Allocation, Allocator, AllocatorStats, Fence};
use crate::error::{Error, Result};
use crate::runtime::Completion;

/// Pending bytes that trigger a collection when the watermark is 0
pub const DEFAULT_RECLAIM_WATERMARK: usize = 32 << 20;

#[derive(Debug)]
struct Entry {
    block: Allocation,
    leases: usize,
    freed: bool,
    /// Marker recorded by a free that had to wait for leases
    fence: Option<Completion<()>>,
}

/// A freed block waiting for its marker
#[derive(Debug)]
struct Parked {
    block: Allocation,
    fence: Option<Completion<()>>,
}

impl Parked {
    fn is_ready(&self) -> bool {
        self.fence.as_ref().is_none_or(Completion::is_ready)
    }
}

#[derive(Debug, Default)]
struct ReclaimState {
    entries: HashMap<u64, Entry>,
    pending: Vec<Parked>,
    pending_bytes: usize,
    deferred_bytes: usize,
}

impl ReclaimState {
    fn park(&mut self, block: Allocation, fence: Option<Completion<()>>) {
        self.pending_bytes += block.size;
        self.pending.push(Parked { block, fence });
    }
}

/// Allocator layer that defers release of blocks still referenced by
/// in-flight operations.
pub struct ReclaimingAllocator<A: Allocator> {
    base: A,
    watermark: usize,
    fence: Option<Arc<dyn Fence>>,
    state: Arc<Mutex<ReclaimState>>,
}

impl<A: Allocator> std::fmt::Debug for ReclaimingAllocator<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReclaimingAllocator")
            .field("base", &self.base.name())
            .field("watermark", &self.watermark)
            .field("fenced", &self.fence.is_some())
            .field("stats", &self.stats())
            .finish()
    }
}

impl<A: Allocator> ReclaimingAllocator<A> {
    /// Wrap `base`.
    ///
    /// A `watermark` of 0 selects [`DEFAULT_RECLAIM_WATERMARK`]. Without a
    /// fence (see [`ReclaimingAllocator::with_fence`]) only leases delay a
    /// release.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidArgument` if `base` already reclaims; the
    /// wrapper is never stacked.
    pub fn new(base: A, watermark: usize) -> Result<Self> {
        if base.reclaims() {
            return Err(Error::invalid_argument(
                "base",
                format!("'{}' already defers frees", base.name()),
            ));
        }
        let watermark = if watermark == 0 {
            DEFAULT_RECLAIM_WATERMARK
        } else {
            watermark
        };
        Ok(Self {
            base,
            watermark,
            fence: None,
            state: Arc::new(Mutex::new(ReclaimState::default())),
        })
    }

    /// Order releases after the work queued on `fence`
    pub fn with_fence(mut self, fence: Arc<dyn Fence>) -> Self {
        self.fence = Some(fence);
        self
    }

    /// The wrapped allocator
    pub fn base(&self) -> &A {
        &self.base
    }

    /// Pending bytes that trigger a collection
    pub fn watermark(&self) -> usize {
        self.watermark
    }

    /// Release parked blocks to the base.
    ///
    /// With `wait` set, blocks on outstanding markers first when the fence
    /// allows it; otherwise only blocks whose marker has run are released.
    fn reclaim(&self, wait: bool) -> usize {
        let wait = wait && self.fence.as_ref().is_some_and(|f| f.can_wait());
        let parked = std::mem::take(&mut self.state.lock().pending);
        if parked.is_empty() {
            return 0;
        }

        let (mut ready, waiting): (Vec<Parked>, Vec<Parked>) =
            parked.into_iter().partition(Parked::is_ready);
        let mut outstanding = Vec::new();
        if wait {
            for mut parked in waiting {
                if let Some(fence) = parked.fence.take() {
                    // A marker that cannot complete has nothing left to order against.
                    let _ = fence.wait();
                }
                ready.push(parked);
            }
        } else {
            outstanding = waiting;
        }

        let released: usize = ready.iter().map(|p| p.block.size).sum();
        {
            let mut state = self.state.lock();
            state.pending_bytes -= released;
            state.pending.extend(outstanding);
        }
        for parked in ready {
            self.base.free(parked.block);
        }
        if released > 0 {
            debug!(released, waited = wait, "reclaimed pending blocks");
        }
        released
    }
}

impl<A: Allocator> Allocator for ReclaimingAllocator<A> {
    fn name(&self) -> &'static str {
        "reclaiming"
    }

    fn alloc(&self, size_bytes: usize) -> Result<Allocation> {
        if self.state.lock().pending_bytes >= self.watermark {
            self.reclaim(false);
        }

        let block = match self.base.alloc(size_bytes) {
            Ok(block) => block,
            Err(e) if e.is_out_of_memory() => {
                if self.reclaim(true) == 0 {
                    return Err(e);
                }
                self.base.alloc(size_bytes)?
            }
            Err(e) => return Err(e),
        };

        if block.ptr != 0 {
            self.state.lock().entries.insert(
                block.ptr,
                Entry {
                    block,
                    leases: 0,
                    freed: false,
                    fence: None,
                },
            );
        }
        Ok(block)
    }

    fn free(&self, block: Allocation) {
        if block.ptr == 0 {
            return;
        }
        // Submitted before taking the lock: a bounded queue may block here.
        let fence = self.fence.as_ref().map(|f| f.submit());

        let mut state = self.state.lock();
        let Some(entry) = state.entries.get_mut(&block.ptr) else {
            warn!(ptr = block.ptr, "reclaiming free of unknown block");
            return;
        };
        if entry.freed {
            warn!(ptr = block.ptr, "reclaiming double free");
            return;
        }
        if entry.leases > 0 {
            entry.freed = true;
            entry.fence = fence;
            let (size, leases) = (entry.block.size, entry.leases);
            state.deferred_bytes += size;
            trace!(ptr = block.ptr, leases, "free deferred until leases end");
            return;
        }
        if let Some(entry) = state.entries.remove(&block.ptr) {
            state.park(entry.block, fence);
        }
    }

    fn lease(&self, block: Allocation) -> Lease {
        let mut state = self.state.lock();
        match state.entries.get_mut(&block.ptr) {
            Some(entry) if !entry.freed => {
                entry.leases += 1;
                Lease {
                    block,
                    state: Some(Arc::clone(&self.state)),
                }
            }
            _ => Lease::detached(block),
        }
    }

    fn collect(&self) -> usize {
        self.reclaim(false)
    }

    fn reclaims(&self) -> bool {
        true
    }

    fn inner(&self) -> Option<&dyn Allocator> {
        Some(&self.base)
    }

    fn stats(&self) -> AllocatorStats {
        let (pending, deferred) = {
            let state = self.state.lock();
            (state.pending_bytes, state.deferred_bytes)
        };
        AllocatorStats {
            pending_bytes: pending + deferred,
            ..self.base.stats()
        }
    }
}

impl<A: Allocator> Drop for ReclaimingAllocator<A> {
    fn drop(&mut self) {
        // Region releases of the base queue behind any outstanding markers,
        // so parked blocks can go back without waiting.
        let (parked, leased) = {
            let mut state = self.state.lock();
            state.pending_bytes = 0;
            let leased = state.entries.values().filter(|e| e.leases > 0).count();
            (std::mem::take(&mut state.pending), leased)
        };
        for parked in parked {
            self.base.free(parked.block);
        }
        if leased > 0 {
            warn!(leased, "reclaiming allocator dropped with leased blocks");
        }
    }
}

// ============================================================================
// Lease
// ============================================================================

/// Marks a block as referenced by an in-flight operation.
///
/// Move the lease into the task that reads or writes the block; dropping it
/// when the task finishes ends the reference.
#[must_use = "dropping a Lease ends the reference immediately"]
#[derive(Debug)]
pub struct Lease {
    block: Allocation,
    state: Option<Arc<Mutex<ReclaimState>>>,
}

impl Lease {
    /// A lease that tracks nothing
    pub fn detached(block: Allocation) -> Self {
        Self { block, state: None }
    }

    /// The leased block
    pub fn block(&self) -> Allocation {
        self.block
    }

    /// Whether dropping this lease can release a deferred free
    pub fn is_tracked(&self) -> bool {
        self.state.is_some()
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        let Some(state) = self.state.take() else {
            return;
        };
        let mut state = state.lock();
        let ptr = self.block.ptr;
        let Some(entry) = state.entries.get_mut(&ptr) else {
            return;
        };
        entry.leases -= 1;
        if entry.leases == 0 && entry.freed {
            if let Some(entry) = state.entries.remove(&ptr) {
                state.deferred_bytes -= entry.block.size;
                state.park(entry.block, entry.fence);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Context;
    use crate::runtime::host::{HostDevice, HostDriver};
    use crossbeam_channel::{Sender, bounded};
    use std::thread;
    use std::time::Duration;

    fn context() -> Arc<Context<HostDriver>> {
        Context::new(HostDriver::default(), HostDevice::new(0), None).unwrap()
    }

    /// Occupy the worker until the returned sender fires.
    fn block_worker(ctx: &Context<HostDriver>) -> (Sender<()>, Completion<()>) {
        let (gate, blocked) = bounded::<()>(0);
        let task = ctx.run(move |_, _| {
            let _ = blocked.recv();
        });
        (gate, task)
    }

    /// Hands out sequential addresses and records frees.
    #[derive(Default)]
    struct Recording {
        inner: Mutex<RecordingState>,
    }

    #[derive(Default)]
    struct RecordingState {
        next: u64,
        freed: Vec<u64>,
        limit: Option<usize>,
        live: usize,
    }

    impl Recording {
        fn with_limit(limit: usize) -> Self {
            let r = Self::default();
            r.inner.lock().limit = Some(limit);
            r
        }

        fn freed(&self) -> Vec<u64> {
            self.inner.lock().freed.clone()
        }
    }

    impl Allocator for Recording {
        fn name(&self) -> &'static str {
            "recording"
        }

        fn alloc(&self, size_bytes: usize) -> Result<Allocation> {
            let mut s = self.inner.lock();
            if s.limit.is_some_and(|l| s.live + size_bytes > l) {
                return Err(Error::OutOfMemory { size: size_bytes });
            }
            s.next += 0x1000;
            s.live += size_bytes;
            Ok(Allocation::new(s.next, size_bytes))
        }

        fn free(&self, block: Allocation) {
            let mut s = self.inner.lock();
            s.live -= block.size;
            s.freed.push(block.ptr);
        }
    }

    #[test]
    fn test_unleased_free_waits_for_collect() {
        let alloc = ReclaimingAllocator::new(Recording::default(), 0).unwrap();
        let a = alloc.alloc(64).unwrap();
        alloc.free(a);
        assert!(alloc.base().freed().is_empty());
        assert_eq!(alloc.stats().pending_bytes, 64);

        assert_eq!(alloc.collect(), 64);
        assert_eq!(alloc.base().freed(), vec![a.ptr]);
    }

    #[test]
    fn test_leased_free_is_deferred_until_lease_drops() {
        let alloc = ReclaimingAllocator::new(Recording::default(), 0).unwrap();
        let a = alloc.alloc(128).unwrap();
        let lease = alloc.lease(a);
        assert!(lease.is_tracked());

        alloc.free(a);
        assert_eq!(alloc.collect(), 0);
        assert!(alloc.base().freed().is_empty());

        drop(lease);
        assert_eq!(alloc.collect(), 128);
        assert_eq!(alloc.base().freed(), vec![a.ptr]);
        assert_eq!(alloc.stats().pending_bytes, 0);
    }

    #[test]
    fn test_multiple_leases() {
        let alloc = ReclaimingAllocator::new(Recording::default(), 0).unwrap();
        let a = alloc.alloc(32).unwrap();
        let first = alloc.lease(a);
        let second = alloc.lease(a);
        alloc.free(a);

        drop(first);
        assert_eq!(alloc.collect(), 0);
        drop(second);
        assert_eq!(alloc.collect(), 32);
    }

    #[test]
    fn test_watermark_triggers_collection() {
        let alloc = ReclaimingAllocator::new(Recording::default(), 100).unwrap();
        let a = alloc.alloc(60).unwrap();
        let b = alloc.alloc(60).unwrap();
        alloc.free(a);
        alloc.free(b);
        assert!(alloc.base().freed().is_empty());

        let _c = alloc.alloc(8).unwrap();
        assert_eq!(alloc.base().freed(), vec![a.ptr, b.ptr]);
    }

    #[test]
    fn test_oom_collects_and_retries() {
        let alloc = ReclaimingAllocator::new(Recording::with_limit(100), 0).unwrap();
        let a = alloc.alloc(80).unwrap();
        alloc.free(a);
        let b = alloc.alloc(80).unwrap();
        assert_ne!(a.ptr, b.ptr);
        assert_eq!(alloc.base().freed(), vec![a.ptr]);
    }

    #[test]
    fn test_oom_with_nothing_to_collect() {
        let alloc = ReclaimingAllocator::new(Recording::with_limit(100), 0).unwrap();
        let _a = alloc.alloc(80).unwrap();
        assert!(alloc.alloc(80).unwrap_err().is_out_of_memory());
    }

    #[test]
    fn test_never_wraps_twice() {
        let once = ReclaimingAllocator::new(Recording::default(), 0).unwrap();
        let err = ReclaimingAllocator::new(once, 0).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { arg: "base", .. }));
    }

    #[test]
    fn test_structure() {
        let alloc = ReclaimingAllocator::new(Recording::default(), 0).unwrap();
        assert!(alloc.reclaims());
        assert_eq!(alloc.watermark(), DEFAULT_RECLAIM_WATERMARK);
        assert_eq!(alloc.inner().map(|a| a.name()), Some("recording"));
    }

    #[test]
    fn test_lease_on_freed_block_is_detached() {
        let alloc = ReclaimingAllocator::new(Recording::default(), 0).unwrap();
        let a = alloc.alloc(16).unwrap();
        let held = alloc.lease(a);
        alloc.free(a);
        let late = alloc.lease(a);
        assert!(!late.is_tracked());
        drop(held);
        drop(late);
        assert_eq!(alloc.collect(), 16);
    }

    #[test]
    fn test_fenced_free_waits_for_queued_work() {
        let ctx = context();
        let alloc = ReclaimingAllocator::new(Recording::default(), 1)
            .unwrap()
            .with_fence(ctx.clone());
        let a = alloc.alloc(64).unwrap();

        let (gate, task) = block_worker(&ctx);
        alloc.free(a);
        assert_eq!(alloc.collect(), 0);
        let _b = alloc.alloc(64).unwrap();
        assert!(alloc.base().freed().is_empty());
        assert!(!task.is_ready());

        gate.send(()).unwrap();
        task.wait().unwrap();
        ctx.synchronize().unwrap();
        assert_eq!(alloc.collect(), 64);
        assert_eq!(alloc.base().freed(), vec![a.ptr]);
    }

    #[test]
    fn test_oom_waits_for_fence_then_retries() {
        let ctx = context();
        let alloc = ReclaimingAllocator::new(Recording::with_limit(100), 0)
            .unwrap()
            .with_fence(ctx.clone());
        let a = alloc.alloc(80).unwrap();

        let (gate, task) = block_worker(&ctx);
        alloc.free(a);
        let opener = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            gate.send(()).unwrap();
        });
        let b = alloc.alloc(80).unwrap();
        assert!(task.is_ready());
        assert_ne!(a.ptr, b.ptr);
        assert_eq!(alloc.base().freed(), vec![a.ptr]);
        opener.join().unwrap();
    }

    #[test]
    fn test_fenced_free_from_worker_is_ready() {
        let ctx = context();
        let alloc = Arc::new(
            ReclaimingAllocator::new(Recording::default(), 0)
                .unwrap()
                .with_fence(ctx.clone()),
        );
        let a = alloc.alloc(32).unwrap();
        let inner = Arc::clone(&alloc);
        ctx.run(move |_, _| inner.free(a)).wait().unwrap();
        assert_eq!(alloc.collect(), 32);
    }
}
