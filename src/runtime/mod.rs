//! Device drivers and the resources bound to them
//!
//! This module defines the `Driver` trait, the capability family a device
//! backend exposes, and the pieces built on top of it.
//!
//! # Architecture
//!
//! ```text
//! Driver (backend identity, device-bound capabilities)
//! ├── Device (identifies a specific GPU)
//! ├── Context (serialized task queue owning the native context)
//! ├── Allocator stack (BFC base + reclaiming wrapper)
//! ├── RandomStream (seeded generator)
//! ├── Blas (linear-algebra handle)
//! └── Module (loaded kernel image)
//! ```

pub mod allocator;
mod context;
pub mod host;

#[cfg(feature = "cuda")]
pub mod cuda;

pub use allocator::{
    Allocation, Allocator, AllocatorStats, BfcAllocator, Fence, Lease, MemorySource,
    ReclaimingAllocator,
};
pub use context::{Completion, Context};

use crate::error::Result;
use crate::kernels::KernelImage;

/// Trait for device identification
pub trait Device: Clone + Send + Sync + 'static {
    /// Unique identifier for this device
    fn id(&self) -> usize;

    /// Check if two devices are the same
    fn is_same(&self, other: &Self) -> bool {
        self.id() == other.id()
    }

    /// Human-readable name
    fn name(&self) -> String {
        format!("Device({})", self.id())
    }
}

/// Pseudo-random generator variants a driver can create
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[non_exhaustive]
pub enum RngKind {
    /// The driver's default pseudo-random generator
    #[default]
    PseudoDefault,
}

/// A seeded pseudo-random stream bound to a context.
///
/// Every method is device work and runs on the context worker; a
/// [`Handle`](crate::Handle) routes calls there through its queue.
pub trait RandomStream: Send + 'static {
    /// Replace the generator state with one derived from `seed`
    fn reseed(&mut self, seed: u64) -> Result<()>;

    /// Fill `out` with values uniformly distributed in `[0, 1)`
    fn fill_uniform(&mut self, out: &mut [f32]) -> Result<()>;

    /// Fill `out` with normally distributed values
    fn fill_normal(&mut self, out: &mut [f32], mean: f32, std: f32) -> Result<()>;
}

/// Core trait for device backends
///
/// A `Driver` is the inbound capability family the rest of the crate is
/// written against: device enumeration, context creation, and creation of
/// every resource a [`Handle`](crate::Handle) aggregates. Every method that
/// takes a `&Self::Context` is only ever called from that context's worker
/// thread.
///
/// # Associated Types
///
/// - `Device`: Identifies a specific compute unit (e.g., GPU 0, GPU 1)
/// - `Context`: Native context, owned by the [`Context`] worker
/// - `Rng`, `Blas`, `Module`, `Stream`: per-context resources
pub trait Driver: Clone + Send + Sync + 'static {
    /// Device identifier type
    type Device: Device;

    /// Native context type
    type Context: Send + Sync + 'static;

    /// Pseudo-random generator
    type Rng: RandomStream;

    /// Linear-algebra handle
    type Blas: Send + Sync + 'static;

    /// Loaded kernel module
    type Module: Send + Sync + 'static;

    /// Execution stream
    type Stream: Send + Sync + 'static;

    /// Human-readable name of this driver
    fn name() -> &'static str;

    /// Physical devices in enumeration order
    fn devices(&self) -> Result<Vec<Self::Device>>;

    /// Create a native context on `device`.
    ///
    /// `queue_depth` is a hint; `None` means no fixed depth.
    fn create_context(
        &self,
        device: &Self::Device,
        queue_depth: Option<usize>,
    ) -> Result<Self::Context>;

    /// Make `ctx` current on the calling thread
    fn bind(&self, _ctx: &Self::Context) -> Result<()> {
        Ok(())
    }

    /// Create a pseudo-random generator
    fn create_generator(&self, ctx: &Self::Context, kind: RngKind) -> Result<Self::Rng>;

    /// Create a linear-algebra handle
    fn create_blas(&self, ctx: &Self::Context) -> Result<Self::Blas>;

    /// Load a compiled kernel image
    fn load_module(&self, ctx: &Self::Context, image: &KernelImage) -> Result<Self::Module>;

    /// Create an execution stream
    fn create_stream(&self, ctx: &Self::Context) -> Result<Self::Stream>;

    /// Allocate `size_bytes` of raw device memory
    fn malloc(&self, ctx: &Self::Context, size_bytes: usize) -> Result<u64>;

    /// Release memory returned by [`Driver::malloc`]
    fn free(&self, ctx: &Self::Context, ptr: u64, size_bytes: usize);

    /// Wait for all pending device work on `ctx`
    fn synchronize(&self, _ctx: &Self::Context) -> Result<()> {
        Ok(())
    }
}
