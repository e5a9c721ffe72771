//! CUDA driver
//!
//! Backs the [`Driver`] capabilities with cudarc: a primary context per
//! device, cuRAND for the random stream, cuBLAS for linear algebra and the
//! driver JIT for PTX modules.
//!
//! # Thread Safety
//!
//! Every `&CudaNativeContext` method runs on the owning
//! [`Context`](crate::runtime::Context) worker, which binds the CUDA context
//! to its thread once at startup.

mod device;

pub use device::CudaDevice;

use cudarc::cublas::CudaBlas;
use cudarc::curand::CudaRng;
use cudarc::driver::safe::{CudaContext, CudaModule, CudaStream};
use cudarc::driver::sys::CUresult;
use cudarc::driver::DriverError;
use cudarc::nvrtc::Ptx;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{Driver, RandomStream, RngKind};
use crate::error::{Error, Result};
use crate::kernels::KernelImage;

// ============================================================================
// Native context
// ============================================================================

/// CUDA context plus the stream every handle resource is created on
#[derive(Debug)]
pub struct CudaNativeContext {
    context: Arc<CudaContext>,
    stream: Arc<CudaStream>,
}

impl CudaNativeContext {
    /// The cudarc context
    #[inline]
    pub fn context(&self) -> &Arc<CudaContext> {
        &self.context
    }

    /// The stream resources are created on.
    ///
    /// Kernels launched on other streams are not ordered against it.
    #[inline]
    pub fn stream(&self) -> &Arc<CudaStream> {
        &self.stream
    }
}

// ============================================================================
// Random stream
// ============================================================================

/// cuRAND pseudo-random generator bound to a context stream
pub struct CudaRandom {
    rng: CudaRng,
    stream: Arc<CudaStream>,
}

impl std::fmt::Debug for CudaRandom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CudaRandom").finish_non_exhaustive()
    }
}

impl CudaRandom {
    /// The underlying cuRAND generator, for filling device buffers directly
    pub fn generator(&self) -> &CudaRng {
        &self.rng
    }
}

impl RandomStream for CudaRandom {
    fn reseed(&mut self, seed: u64) -> Result<()> {
        self.rng
            .set_seed(seed)
            .map_err(|e| Error::backend(format!("cuRAND set_seed failed: {e:?}")))
    }

    fn fill_uniform(&mut self, out: &mut [f32]) -> Result<()> {
        if out.is_empty() {
            return Ok(());
        }
        let mut buf = self.stream.alloc_zeros::<f32>(out.len())?;
        self.rng
            .fill_with_uniform(&mut buf)
            .map_err(|e| Error::backend(format!("cuRAND uniform fill failed: {e:?}")))?;
        self.stream.memcpy_dtoh(&buf, out)?;
        Ok(())
    }

    fn fill_normal(&mut self, out: &mut [f32], mean: f32, std: f32) -> Result<()> {
        if !std.is_finite() || std < 0.0 {
            return Err(Error::invalid_argument(
                "std",
                format!("standard deviation must be finite and non-negative, got {std}"),
            ));
        }
        if out.is_empty() {
            return Ok(());
        }
        // cuRAND generates normals in pairs.
        let mut buf = self.stream.alloc_zeros::<f32>(out.len().next_multiple_of(2))?;
        self.rng
            .fill_with_normal(&mut buf, mean, std)
            .map_err(|e| Error::backend(format!("cuRAND normal fill failed: {e:?}")))?;
        let host = self.stream.memcpy_dtov(&buf)?;
        out.copy_from_slice(&host[..out.len()]);
        Ok(())
    }
}

// ============================================================================
// Driver
// ============================================================================

/// NVIDIA CUDA driver
#[derive(Debug, Clone, Copy, Default)]
pub struct CudaDriver;

fn device_error(e: DriverError, size: usize) -> Error {
    if e.0 == CUresult::CUDA_ERROR_OUT_OF_MEMORY {
        Error::OutOfMemory { size }
    } else {
        Error::Cuda(e)
    }
}

impl Driver for CudaDriver {
    type Device = CudaDevice;
    type Context = CudaNativeContext;
    type Rng = CudaRandom;
    type Blas = CudaBlas;
    type Module = Arc<CudaModule>;
    type Stream = Arc<CudaStream>;

    fn name() -> &'static str {
        "cuda"
    }

    fn devices(&self) -> Result<Vec<CudaDevice>> {
        // cudarc panics when the driver library cannot be loaded; treat that
        // as a machine without devices.
        let count = match std::panic::catch_unwind(CudaContext::device_count) {
            Ok(count) => count?,
            Err(_) => {
                warn!("CUDA driver library not available");
                0
            }
        };
        Ok((0..count.max(0) as usize).map(CudaDevice::new).collect())
    }

    fn create_context(
        &self,
        device: &CudaDevice,
        _queue_depth: Option<usize>,
    ) -> Result<CudaNativeContext> {
        let context = CudaContext::new(device.index)?;
        context.bind_to_thread()?;
        let stream = context.default_stream();
        debug!(device = device.index, "CUDA context created");
        Ok(CudaNativeContext { context, stream })
    }

    fn bind(&self, ctx: &CudaNativeContext) -> Result<()> {
        ctx.context.bind_to_thread()?;
        Ok(())
    }

    fn create_generator(&self, ctx: &CudaNativeContext, kind: RngKind) -> Result<CudaRandom> {
        match kind {
            RngKind::PseudoDefault => {}
        }
        // Fixed seed until the caller reseeds.
        let rng = CudaRng::new(0, Arc::clone(&ctx.stream))
            .map_err(|e| Error::backend(format!("cuRAND generator creation failed: {e:?}")))?;
        Ok(CudaRandom {
            rng,
            stream: Arc::clone(&ctx.stream),
        })
    }

    fn create_blas(&self, ctx: &CudaNativeContext) -> Result<CudaBlas> {
        CudaBlas::new(Arc::clone(&ctx.stream))
            .map_err(|e| Error::backend(format!("cuBLAS initialization failed: {e:?}")))
    }

    fn load_module(&self, ctx: &CudaNativeContext, image: &KernelImage) -> Result<Arc<CudaModule>> {
        let module = ctx.context.load_module(Ptx::from_src(image.ptx()))?;
        debug!(image = image.name(), "PTX module loaded");
        Ok(module)
    }

    fn create_stream(&self, ctx: &CudaNativeContext) -> Result<Arc<CudaStream>> {
        Ok(ctx.context.new_stream()?)
    }

    fn malloc(&self, _ctx: &CudaNativeContext, size_bytes: usize) -> Result<u64> {
        // SAFETY: the calling worker has the context bound.
        unsafe { cudarc::driver::result::malloc_sync(size_bytes) }
            .map_err(|e| device_error(e, size_bytes))
    }

    fn free(&self, _ctx: &CudaNativeContext, ptr: u64, size_bytes: usize) {
        if ptr == 0 {
            return;
        }
        // SAFETY: `ptr` came from `malloc` on this context and is freed once.
        if let Err(e) = unsafe { cudarc::driver::result::free_sync(ptr) } {
            warn!(ptr, size_bytes, error = ?e, "cuMemFree failed");
        }
    }

    fn synchronize(&self, ctx: &CudaNativeContext) -> Result<()> {
        ctx.stream.synchronize()?;
        Ok(())
    }
}
