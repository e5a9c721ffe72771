//! # cudavec
//!
//! **Device resource lifecycle for GPU vector computing.**
//!
//! cudavec gives vector code one object, the [`Handle`], that owns every
//! device resource it needs: a context with a serialized task queue, a
//! caching allocator, a seeded random stream, a BLAS handle, the embedded
//! `kernels32` module and a pool of execution streams.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use cudavec::prelude::*;
//!
//! let handle = Handle::new_default()?;
//! let block = handle.allocator().alloc(1 << 20)?;
//! handle.fill_uniform(&mut buf)?;
//! handle.allocator().free(block);
//! ```
//!
//! ## Feature Flags
//!
//! - `cuda`: NVIDIA CUDA driver. Without it the [`DefaultDriver`] is the
//!   host driver, which keeps device bookkeeping on the CPU.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod handle;
pub mod kernels;
pub mod runtime;

pub use error::{Error, Result, Stage};
pub use handle::{Handle, HandleBuilder, HandleConfig, MAX_STREAMS, StreamPool};

/// Driver used by [`Handle::new`]
#[cfg(feature = "cuda")]
pub type DefaultDriver = runtime::cuda::CudaDriver;

/// Driver used by [`Handle::new`]
#[cfg(not(feature = "cuda"))]
pub type DefaultDriver = runtime::host::HostDriver;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::error::{Error, Result, Stage};
    pub use crate::handle::{Handle, HandleBuilder, HandleConfig};
    pub use crate::runtime::{Allocation, Allocator, Context, Device, Driver, RandomStream};
    pub use crate::DefaultDriver;

    pub use crate::runtime::host::HostDriver;

    #[cfg(feature = "cuda")]
    pub use crate::runtime::cuda::CudaDriver;
}
