//! Error types for cudavec

use std::fmt;
use thiserror::Error;

/// Result type alias using cudavec's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Construction stage that produced a [`Error::ResourceInit`].
///
/// The display form is the context string attached to the error chain, so a
/// failed generator shows up as `create Handle: create generator: ...`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Listing the physical devices
    Devices,
    /// Creating the driver context on the selected device
    Context,
    /// Creating the pseudo-random generator
    Generator,
    /// Reseeding the pseudo-random generator
    Seed,
    /// Creating the linear-algebra handle
    Blas,
    /// Loading the embedded kernel module
    Kernels,
    /// Building the allocator stack
    Allocator,
    /// Creating an execution stream
    Stream,
}

impl Stage {
    /// Context string for this stage
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Devices => "enumerate devices",
            Stage::Context => "create context",
            Stage::Generator => "create generator",
            Stage::Seed => "seed generator",
            Stage::Blas => "create BLAS handle",
            Stage::Kernels => "load kernels",
            Stage::Allocator => "create allocator",
            Stage::Stream => "create stream",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur in cudavec operations
#[derive(Error, Debug)]
pub enum Error {
    /// Device enumeration returned no devices
    #[error("no devices available")]
    NoDevice,

    /// A device was selected but the driver refused to create a context on it
    #[error("create context on {device}: {reason}")]
    ContextCreation {
        /// Name of the selected device
        device: String,
        /// Driver-reported reason
        reason: String,
    },

    /// A device-bound resource failed to initialize
    #[error("{stage}: {source}")]
    ResourceInit {
        /// The stage that failed
        stage: Stage,
        /// Underlying cause
        #[source]
        source: Box<Error>,
    },

    /// Top-level wrapper returned by the Handle entry points
    #[error("create Handle: {0}")]
    CreateHandle(#[source] Box<Error>),

    /// Out of device memory
    #[error("out of memory: failed to allocate {size} bytes")]
    OutOfMemory {
        /// Requested size in bytes
        size: usize,
    },

    /// Invalid argument provided to an operation
    #[error("invalid argument '{arg}': {reason}")]
    InvalidArgument {
        /// The argument name
        arg: &'static str,
        /// Reason for invalidity
        reason: String,
    },

    /// The context's task queue is gone (worker exited)
    #[error("context task queue closed")]
    QueueClosed,

    /// A submitted task panicked before producing a result
    #[error("device task did not complete")]
    TaskAborted,

    /// Backend-specific error
    #[error("backend error: {0}")]
    Backend(String),

    /// CUDA-specific error
    #[cfg(feature = "cuda")]
    #[error("CUDA error: {0}")]
    Cuda(#[from] cudarc::driver::DriverError),
}

impl Error {
    /// Attach a stage to this error
    pub fn at(self, stage: Stage) -> Self {
        Self::ResourceInit {
            stage,
            source: Box::new(self),
        }
    }

    /// Create a backend error from anything printable
    pub fn backend(reason: impl fmt::Display) -> Self {
        Self::Backend(reason.to_string())
    }

    /// Create an invalid argument error
    pub fn invalid_argument(arg: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            arg,
            reason: reason.into(),
        }
    }

    /// The first stage tag found in the error chain, if any.
    ///
    /// `NoDevice` and `ContextCreation` carry no stage: they are environment
    /// problems rather than resource failures.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            Error::ResourceInit { stage, .. } => Some(*stage),
            Error::CreateHandle(inner) => inner.stage(),
            _ => None,
        }
    }

    /// Innermost error of the chain
    pub fn root(&self) -> &Error {
        match self {
            Error::ResourceInit { source, .. } => source.root(),
            Error::CreateHandle(inner) => inner.root(),
            other => other,
        }
    }

    /// Whether the failure was caused by an empty device list
    pub fn is_no_device(&self) -> bool {
        matches!(self.root(), Error::NoDevice)
    }

    /// Whether the failure was an out-of-memory condition
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self.root(), Error::OutOfMemory { .. })
    }
}
