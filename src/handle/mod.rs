//! The Handle: every device resource vector code needs, in one place
//!
//! A [`Handle`] is the first thing to obtain. Construction acquires (or
//! adopts) a [`Context`], then provisions the rest inside a single task on
//! that context's queue:
//!
//! ```text
//! context ─► generator ─► reseed ─► BLAS handle ─► kernels32 ─► allocator
//! ```
//!
//! The first failing step ends construction; the error names the step and
//! is wrapped as `create Handle: <step>: <cause>`. No partially built handle
//! is ever returned.

mod config;
mod streams;

pub use config::HandleConfig;
pub use streams::{MAX_STREAMS, StreamPool};

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info};

use crate::DefaultDriver;
use crate::error::{Error, Result, Stage};
use crate::kernels::{KERNELS32, KernelModule};
use crate::runtime::{
    Allocator, BfcAllocator, Completion, Context, Device, Driver, Fence, RandomStream,
    ReclaimingAllocator, RngKind,
};

// ============================================================================
// Handle
// ============================================================================

/// Aggregate of the device resources bound to one context.
///
/// Field order is drop order: per-context resources go first, then the
/// allocator (which returns its regions through the context), then the
/// context reference itself.
pub struct Handle<D: Driver = DefaultDriver> {
    rng: Arc<Mutex<D::Rng>>,
    blas: D::Blas,
    kernels: KernelModule<D::Module>,
    streams: StreamPool<D::Stream>,
    allocator: Arc<dyn Allocator>,
    context: Arc<Context<D>>,
}

impl<D: Driver> std::fmt::Debug for Handle<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("context", &self.context)
            .field("allocator", &self.allocator.name())
            .field("kernels", &self.kernels.image().name())
            .field("streams", &self.streams)
            .finish_non_exhaustive()
    }
}

impl Handle {
    /// Create a handle with the default driver.
    ///
    /// A `None` context selects the first enumerated device; a `None`
    /// allocator builds the reclaiming BFC stack. Supplied values are used
    /// as they are, and the caller stays responsible for them.
    ///
    /// # Errors
    ///
    /// Returns `Error::CreateHandle` wrapping the failure of the first step
    /// that did not succeed.
    pub fn new(
        context: Option<Arc<Context<DefaultDriver>>>,
        allocator: Option<Arc<dyn Allocator>>,
    ) -> Result<Self> {
        match context {
            Some(context) => Self::with_context(context, allocator),
            None => {
                let mut builder = HandleBuilder::new(DefaultDriver::default());
                builder.allocator = allocator;
                builder.build()
            }
        }
    }

    /// Create a handle with the default device and allocator.
    pub fn new_default() -> Result<Self> {
        Self::new(None, None)
    }
}

impl<D: Driver> Handle<D> {
    /// Start configuring a handle for `driver`
    pub fn builder(driver: D) -> HandleBuilder<D> {
        HandleBuilder::new(driver)
    }

    /// Create a handle on an existing context
    pub fn with_context(
        context: Arc<Context<D>>,
        allocator: Option<Arc<dyn Allocator>>,
    ) -> Result<Self> {
        let mut builder = HandleBuilder::new(context.driver().clone()).context(context);
        builder.allocator = allocator;
        builder.build()
    }

    /// The context every resource is bound to
    #[inline]
    pub fn context(&self) -> &Arc<Context<D>> {
        &self.context
    }

    /// The device of the context
    #[inline]
    pub fn device(&self) -> &D::Device {
        self.context.device()
    }

    /// The allocator for device buffers
    #[inline]
    pub fn allocator(&self) -> &Arc<dyn Allocator> {
        &self.allocator
    }

    /// Run `f` with the random stream on the context worker
    pub fn with_rng<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut D::Rng) -> R + Send + 'static,
        R: Send + 'static,
    {
        let rng = Arc::clone(&self.rng);
        self.context.run(move |_, _| f(&mut *rng.lock())).wait()
    }

    /// Fill `out` with uniform values in `[0, 1)`
    pub fn fill_uniform(&self, out: &mut [f32]) -> Result<()> {
        let len = out.len();
        let values = self.with_rng(move |rng| {
            let mut values = vec![0f32; len];
            rng.fill_uniform(&mut values).map(|()| values)
        })??;
        out.copy_from_slice(&values);
        Ok(())
    }

    /// Fill `out` with normally distributed values
    pub fn fill_normal(&self, out: &mut [f32], mean: f32, std: f32) -> Result<()> {
        let len = out.len();
        let values = self.with_rng(move |rng| {
            let mut values = vec![0f32; len];
            rng.fill_normal(&mut values, mean, std).map(|()| values)
        })??;
        out.copy_from_slice(&values);
        Ok(())
    }

    /// Restart the random stream from `seed`
    pub fn reseed(&self, seed: u64) -> Result<()> {
        self.with_rng(move |rng| rng.reseed(seed))?
    }

    /// The linear-algebra handle
    #[inline]
    pub fn blas(&self) -> &D::Blas {
        &self.blas
    }

    /// The loaded `kernels32` module
    #[inline]
    pub fn kernels(&self) -> &KernelModule<D::Module> {
        &self.kernels
    }

    /// The execution stream pool
    #[inline]
    pub fn streams(&self) -> &StreamPool<D::Stream> {
        &self.streams
    }

    /// Create a stream on the context and add it to the pool.
    ///
    /// Returns `Ok(None)` without touching the device when the pool already
    /// holds [`MAX_STREAMS`].
    pub fn new_stream(&self) -> Result<Option<Arc<D::Stream>>> {
        if self.streams.is_full() {
            return Ok(None);
        }
        let stream = self
            .context
            .run(|driver, native| driver.create_stream(native))
            .wait()?
            .map_err(|e| e.at(Stage::Stream))?;
        Ok(self.streams.try_push(stream).ok())
    }

    /// Submit `f` to the handle's context
    pub fn run<F, R>(&self, f: F) -> Completion<R>
    where
        F: FnOnce(&D, &D::Context) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.context.run(f)
    }
}

// ============================================================================
// HandleBuilder
// ============================================================================

/// Builder for [`Handle`] with explicit driver and settings.
pub struct HandleBuilder<D: Driver> {
    driver: D,
    context: Option<Arc<Context<D>>>,
    allocator: Option<Arc<dyn Allocator>>,
    config: HandleConfig,
}

impl<D: Driver> std::fmt::Debug for HandleBuilder<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleBuilder")
            .field("driver", &D::name())
            .field("context", &self.context.is_some())
            .field("allocator", &self.allocator.as_ref().map(|a| a.name()))
            .field("config", &self.config)
            .finish()
    }
}

impl<D: Driver> HandleBuilder<D> {
    /// Start from default settings
    pub fn new(driver: D) -> Self {
        Self {
            driver,
            context: None,
            allocator: None,
            config: HandleConfig::default(),
        }
    }

    /// Use an existing context instead of creating one
    pub fn context(mut self, context: Arc<Context<D>>) -> Self {
        self.context = Some(context);
        self
    }

    /// Use `allocator` as-is instead of the reclaiming BFC stack
    pub fn allocator(mut self, allocator: Arc<dyn Allocator>) -> Self {
        self.allocator = Some(allocator);
        self
    }

    /// Replace all settings
    pub fn config(mut self, config: HandleConfig) -> Self {
        self.config = config;
        self
    }

    /// Fixed queue depth for a newly created context
    pub fn queue_depth(mut self, depth: usize) -> Self {
        self.config.queue_depth = Some(depth);
        self
    }

    /// Bytes the BFC allocator reserves up front
    pub fn reserve(mut self, bytes: usize) -> Self {
        self.config.reserve_bytes = bytes;
        self
    }

    /// Pending bytes that trigger a reclaim pass
    pub fn reclaim_watermark(mut self, bytes: usize) -> Self {
        self.config.reclaim_watermark = bytes;
        self
    }

    /// Seed the generator with `seed` instead of fresh seed material
    pub fn seed(mut self, seed: u64) -> Self {
        self.config.seed = Some(seed);
        self
    }

    /// Create the handle.
    ///
    /// # Errors
    ///
    /// Every failure is returned as `Error::CreateHandle`; use
    /// [`Error::stage`] or [`Error::is_no_device`] to tell them apart.
    pub fn build(self) -> Result<Handle<D>> {
        self.construct()
            .map_err(|e| Error::CreateHandle(Box::new(e)))
    }

    fn construct(self) -> Result<Handle<D>> {
        self.config.validate()?;
        let HandleBuilder {
            driver,
            context,
            allocator,
            config,
        } = self;

        let context = match context {
            Some(context) => context,
            None => default_context(driver, config.queue_depth)?,
        };
        debug!(
            driver = D::name(),
            device = %context.device().name(),
            external_allocator = allocator.is_some(),
            "provisioning handle"
        );

        let task_context = Arc::clone(&context);
        let parts = context
            .run(move |driver, native| provision(&task_context, driver, native, allocator, &config))
            .wait()??;

        info!(
            driver = D::name(),
            device = %context.device().name(),
            allocator = parts.allocator.name(),
            kernels = parts.module.image().name(),
            "handle ready"
        );

        Ok(Handle {
            rng: Arc::new(Mutex::new(parts.rng)),
            blas: parts.blas,
            kernels: parts.module,
            streams: StreamPool::new(),
            allocator: parts.allocator,
            context,
        })
    }
}

/// Create a context on the first enumerated device.
fn default_context<D: Driver>(driver: D, queue_depth: Option<usize>) -> Result<Arc<Context<D>>> {
    let devices = driver.devices().map_err(|e| e.at(Stage::Devices))?;
    let device = devices.into_iter().next().ok_or(Error::NoDevice)?;
    Context::new(driver, device, queue_depth)
}

/// The allocator stack used when none is supplied.
///
/// `reserve_bytes` and `watermark` of 0 select on-demand growth and the
/// default reclaim watermark.
pub fn default_allocator<D: Driver>(
    context: &Arc<Context<D>>,
    reserve_bytes: usize,
    watermark: usize,
) -> Result<Arc<dyn Allocator>> {
    let base = BfcAllocator::new(Arc::clone(context), reserve_bytes)?;
    let fence: Arc<dyn Fence> = context.clone();
    Ok(Arc::new(ReclaimingAllocator::new(base, watermark)?.with_fence(fence)))
}

struct Parts<D: Driver> {
    rng: D::Rng,
    blas: D::Blas,
    module: KernelModule<D::Module>,
    allocator: Arc<dyn Allocator>,
}

/// Runs on the context worker.
fn provision<D: Driver>(
    context: &Arc<Context<D>>,
    driver: &D,
    native: &D::Context,
    allocator: Option<Arc<dyn Allocator>>,
    config: &HandleConfig,
) -> Result<Parts<D>> {
    let mut rng = driver
        .create_generator(native, RngKind::PseudoDefault)
        .map_err(|e| e.at(Stage::Generator))?;
    let seed = config.seed.unwrap_or_else(rand::random);
    rng.reseed(seed).map_err(|e| e.at(Stage::Seed))?;
    debug!(explicit_seed = config.seed.is_some(), "generator seeded");

    let blas = driver.create_blas(native).map_err(|e| e.at(Stage::Blas))?;

    let module = driver
        .load_module(native, &KERNELS32)
        .map_err(|e| e.at(Stage::Kernels))?;
    let module = KernelModule::new(&KERNELS32, module);

    let allocator = match allocator {
        Some(allocator) => allocator,
        None => default_allocator(context, config.reserve_bytes, config.reclaim_watermark)
            .map_err(|e| e.at(Stage::Allocator))?,
    };

    Ok(Parts {
        rng,
        blas,
        module,
        allocator,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::host::{HostConfig, HostDriver};

    #[test]
    fn test_builder_seed_is_reproducible() {
        let a = Handle::builder(HostDriver::default()).seed(7).build().unwrap();
        let b = Handle::builder(HostDriver::default()).seed(7).build().unwrap();
        let (mut xa, mut xb) = ([0f32; 16], [0f32; 16]);
        a.fill_uniform(&mut xa).unwrap();
        b.fill_uniform(&mut xb).unwrap();
        assert_eq!(xa, xb);

        b.reseed(8).unwrap();
        b.fill_uniform(&mut xb).unwrap();
        assert_ne!(xa, xb);
    }

    #[test]
    fn test_generation_runs_on_worker() {
        let handle = Handle::builder(HostDriver::default()).build().unwrap();
        let worker = handle.run(|_, _| std::thread::current().id()).wait().unwrap();
        let generated_on = handle
            .with_rng(|rng| {
                let mut out = [0f32; 4];
                rng.fill_uniform(&mut out).map(|()| std::thread::current().id())
            })
            .unwrap()
            .unwrap();
        assert_eq!(generated_on, worker);
        assert_ne!(generated_on, std::thread::current().id());
    }

    #[test]
    fn test_fill_normal_errors_propagate() {
        let handle = Handle::builder(HostDriver::default()).build().unwrap();
        let mut out = [0f32; 8];
        handle.fill_normal(&mut out, 0.0, 1.0).unwrap();
        let err = handle.fill_normal(&mut out, 0.0, -1.0).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument { arg: "std", .. }));
    }

    #[test]
    fn test_new_stream_respects_capacity() {
        let driver = HostDriver::default();
        let handle = Handle::builder(driver.clone()).build().unwrap();
        assert!(handle.streams().is_empty());
        for _ in 0..MAX_STREAMS {
            assert!(handle.new_stream().unwrap().is_some());
        }
        assert!(handle.new_stream().unwrap().is_none());
        assert_eq!(handle.streams().len(), MAX_STREAMS);
        assert_eq!(driver.created(Stage::Stream), MAX_STREAMS);
    }

    #[test]
    fn test_stream_failure_is_staged() {
        let driver = HostDriver::new(HostConfig::default().fail_at(Stage::Stream));
        let handle = Handle::builder(driver).build().unwrap();
        let err = handle.new_stream().unwrap_err();
        assert_eq!(err.stage(), Some(Stage::Stream));
        assert!(handle.streams().is_empty());
    }

    #[test]
    fn test_invalid_config_is_wrapped() {
        let err = Handle::builder(HostDriver::default())
            .queue_depth(0)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::CreateHandle(_)));
        assert!(matches!(err.root(), Error::InvalidArgument { .. }));
    }

    #[test]
    fn test_reserve_failure_is_allocator_stage() {
        let driver = HostDriver::new(HostConfig::default().fail_at(Stage::Allocator));
        let err = Handle::builder(driver.clone())
            .reserve(1 << 20)
            .build()
            .unwrap_err();
        assert_eq!(err.stage(), Some(Stage::Allocator));
        assert_eq!(driver.created(Stage::Kernels), 1);
    }

    #[test]
    fn test_bounded_queue_handle() {
        let handle = Handle::builder(HostDriver::default())
            .queue_depth(4)
            .build()
            .unwrap();
        assert_eq!(handle.context().queue_depth(), Some(4));
        assert_eq!(handle.run(|_, native| native.device()).wait().unwrap(), 0);
    }
}
