//! Host driver
//!
//! A bookkeeping-only device backend. Device memory is an address space with
//! no backing bytes, random streams run on the host, and the BLAS handle and
//! kernel module are plain records. It lets the lifecycle code run on
//! machines without a GPU and supports the failure modes a real driver has:
//! a configurable device count, a memory limit, and failure injection at any
//! construction stage.
//!
//! Clones of a `HostDriver` share one device state, so a test can keep a
//! clone and inspect what a [`Handle`](crate::Handle) created.

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{trace, warn};

use super::{Device, Driver, RandomStream, RngKind};
use crate::error::{Error, Result, Stage};
use crate::kernels::KernelImage;

/// Alignment of host device addresses
const HOST_ALIGNMENT: u64 = 256;

/// First address handed out; keeps 0 free as the null pointer
const HOST_BASE_ADDRESS: u64 = 1 << 32;

// ============================================================================
// Configuration
// ============================================================================

/// Host driver configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostConfig {
    /// Number of devices reported by enumeration
    pub devices: usize,
    /// Device memory limit in bytes, `None` for unlimited
    pub memory_limit: Option<usize>,
    /// Stage whose capability call fails with an injected error
    pub fail_at: Option<Stage>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            devices: 1,
            memory_limit: None,
            fail_at: None,
        }
    }
}

impl HostConfig {
    /// Set the number of devices
    pub fn devices(mut self, devices: usize) -> Self {
        self.devices = devices;
        self
    }

    /// Limit device memory
    pub fn memory_limit(mut self, bytes: usize) -> Self {
        self.memory_limit = Some(bytes);
        self
    }

    /// Make the capability for `stage` fail
    pub fn fail_at(mut self, stage: Stage) -> Self {
        self.fail_at = Some(stage);
        self
    }
}

// ============================================================================
// Device and resources
// ============================================================================

/// A simulated device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostDevice {
    index: usize,
}

impl HostDevice {
    /// Create a device handle for `index`
    pub fn new(index: usize) -> Self {
        Self { index }
    }
}

impl Device for HostDevice {
    fn id(&self) -> usize {
        self.index
    }

    fn name(&self) -> String {
        format!("host:{}", self.index)
    }
}

/// Native context of the host driver
#[derive(Debug)]
pub struct HostContext {
    device: usize,
    id: u64,
}

impl HostContext {
    /// Device index the context is bound to
    pub fn device(&self) -> usize {
        self.device
    }

    /// Unique context id
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Host pseudo-random stream
pub struct HostRng {
    rng: StdRng,
    kind: RngKind,
    context: u64,
    fail_seed: bool,
    shared: Arc<HostShared>,
}

impl std::fmt::Debug for HostRng {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostRng")
            .field("kind", &self.kind)
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

impl HostRng {
    /// Generator variant
    pub fn kind(&self) -> RngKind {
        self.kind
    }

    /// Id of the context the stream is bound to
    pub fn context(&self) -> u64 {
        self.context
    }
}

impl RandomStream for HostRng {
    fn reseed(&mut self, seed: u64) -> Result<()> {
        if self.fail_seed {
            return Err(injected(Stage::Seed));
        }
        self.rng = StdRng::seed_from_u64(seed);
        self.shared.record(Stage::Seed);
        Ok(())
    }

    fn fill_uniform(&mut self, out: &mut [f32]) -> Result<()> {
        for x in out.iter_mut() {
            *x = self.rng.random::<f32>();
        }
        Ok(())
    }

    fn fill_normal(&mut self, out: &mut [f32], mean: f32, std: f32) -> Result<()> {
        let normal = Normal::new(mean, std)
            .map_err(|e| Error::invalid_argument("std", e.to_string()))?;
        for x in out.iter_mut() {
            *x = normal.sample(&mut self.rng);
        }
        Ok(())
    }
}

/// Host linear-algebra handle
#[derive(Debug)]
pub struct HostBlas {
    context: u64,
}

impl HostBlas {
    /// Id of the context the handle is bound to
    pub fn context(&self) -> u64 {
        self.context
    }
}

/// Host kernel module: the validated entry list of an image
#[derive(Debug)]
pub struct HostModule {
    context: u64,
    entries: Vec<String>,
}

impl HostModule {
    /// Id of the context the module is loaded into
    pub fn context(&self) -> u64 {
        self.context
    }

    /// Whether the module has an entry called `name`
    pub fn has_function(&self, name: &str) -> bool {
        self.entries.iter().any(|e| e == name)
    }
}

/// Host execution stream
#[derive(Debug)]
pub struct HostStream {
    context: u64,
    id: u64,
}

impl HostStream {
    /// Id of the context the stream belongs to
    pub fn context(&self) -> u64 {
        self.context
    }

    /// Unique stream id
    pub fn id(&self) -> u64 {
        self.id
    }
}

// ============================================================================
// Driver
// ============================================================================

#[derive(Debug)]
struct HostShared {
    next_id: AtomicU64,
    next_address: AtomicU64,
    memory: Mutex<HashMap<u64, usize>>,
    created: Mutex<HashMap<Stage, usize>>,
}

impl HostShared {
    fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            next_address: AtomicU64::new(HOST_BASE_ADDRESS),
            memory: Mutex::new(HashMap::new()),
            created: Mutex::new(HashMap::new()),
        }
    }

    fn id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn record(&self, stage: Stage) {
        *self.created.lock().entry(stage).or_insert(0) += 1;
    }
}

fn injected(stage: Stage) -> Error {
    Error::backend(format!("injected failure ({stage})"))
}

/// Bookkeeping-only driver for CPU-only builds and tests
#[derive(Debug, Clone)]
pub struct HostDriver {
    config: Arc<HostConfig>,
    shared: Arc<HostShared>,
}

impl Default for HostDriver {
    fn default() -> Self {
        Self::new(HostConfig::default())
    }
}

impl HostDriver {
    /// Create a driver with `config`
    pub fn new(config: HostConfig) -> Self {
        Self {
            config: Arc::new(config),
            shared: Arc::new(HostShared::new()),
        }
    }

    /// The driver configuration
    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// How many times the capability for `stage` has succeeded
    pub fn created(&self, stage: Stage) -> usize {
        self.shared
            .created
            .lock()
            .get(&stage)
            .copied()
            .unwrap_or(0)
    }

    /// Device bytes currently allocated through [`Driver::malloc`]
    pub fn bytes_in_use(&self) -> usize {
        self.shared.memory.lock().values().sum()
    }

    /// Number of live raw allocations
    pub fn live_allocations(&self) -> usize {
        self.shared.memory.lock().len()
    }

    fn check(&self, stage: Stage) -> Result<()> {
        if self.config.fail_at == Some(stage) {
            trace!(%stage, "host driver injecting failure");
            return Err(injected(stage));
        }
        Ok(())
    }
}

impl Driver for HostDriver {
    type Device = HostDevice;
    type Context = HostContext;
    type Rng = HostRng;
    type Blas = HostBlas;
    type Module = HostModule;
    type Stream = HostStream;

    fn name() -> &'static str {
        "host"
    }

    fn devices(&self) -> Result<Vec<HostDevice>> {
        self.check(Stage::Devices)?;
        Ok((0..self.config.devices).map(HostDevice::new).collect())
    }

    fn create_context(&self, device: &HostDevice, _queue_depth: Option<usize>) -> Result<HostContext> {
        self.check(Stage::Context)?;
        if device.index >= self.config.devices {
            return Err(Error::backend(format!(
                "invalid device ordinal {} ({} devices)",
                device.index, self.config.devices
            )));
        }
        self.shared.record(Stage::Context);
        Ok(HostContext {
            device: device.index,
            id: self.shared.id(),
        })
    }

    fn create_generator(&self, ctx: &HostContext, kind: RngKind) -> Result<HostRng> {
        self.check(Stage::Generator)?;
        self.shared.record(Stage::Generator);
        // Fixed default seed, as device generators start out; callers reseed.
        Ok(HostRng {
            rng: StdRng::seed_from_u64(0),
            kind,
            context: ctx.id,
            fail_seed: self.config.fail_at == Some(Stage::Seed),
            shared: Arc::clone(&self.shared),
        })
    }

    fn create_blas(&self, ctx: &HostContext) -> Result<HostBlas> {
        self.check(Stage::Blas)?;
        self.shared.record(Stage::Blas);
        Ok(HostBlas { context: ctx.id })
    }

    fn load_module(&self, ctx: &HostContext, image: &KernelImage) -> Result<HostModule> {
        self.check(Stage::Kernels)?;
        if image.version().is_none() {
            return Err(Error::backend(format!(
                "kernel image '{}' has no .version directive",
                image.name()
            )));
        }
        let entries: Vec<String> = image.entries().into_iter().map(String::from).collect();
        if entries.is_empty() {
            return Err(Error::backend(format!(
                "kernel image '{}' declares no entry points",
                image.name()
            )));
        }
        self.shared.record(Stage::Kernels);
        Ok(HostModule {
            context: ctx.id,
            entries,
        })
    }

    fn create_stream(&self, ctx: &HostContext) -> Result<HostStream> {
        self.check(Stage::Stream)?;
        self.shared.record(Stage::Stream);
        Ok(HostStream {
            context: ctx.id,
            id: self.shared.id(),
        })
    }

    fn malloc(&self, _ctx: &HostContext, size_bytes: usize) -> Result<u64> {
        self.check(Stage::Allocator)?;
        let mut memory = self.shared.memory.lock();
        if let Some(limit) = self.config.memory_limit {
            let in_use: usize = memory.values().sum();
            if in_use + size_bytes > limit {
                return Err(Error::OutOfMemory { size: size_bytes });
            }
        }
        let span = (size_bytes as u64).max(1).next_multiple_of(HOST_ALIGNMENT);
        let ptr = self.shared.next_address.fetch_add(span, Ordering::Relaxed);
        memory.insert(ptr, size_bytes);
        Ok(ptr)
    }

    fn free(&self, _ctx: &HostContext, ptr: u64, _size_bytes: usize) {
        if self.shared.memory.lock().remove(&ptr).is_none() {
            warn!(ptr, "host free of unknown pointer");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::KERNELS32;

    fn context(driver: &HostDriver) -> HostContext {
        driver.create_context(&HostDevice::new(0), None).unwrap()
    }

    #[test]
    fn test_enumeration() {
        let driver = HostDriver::new(HostConfig::default().devices(3));
        let devices = driver.devices().unwrap();
        assert_eq!(devices.len(), 3);
        assert_eq!(devices[2].name(), "host:2");
        assert!(driver.create_context(&HostDevice::new(3), None).is_err());
    }

    #[test]
    fn test_reseed_changes_sequence() {
        let driver = HostDriver::default();
        let ctx = context(&driver);
        let mut a = driver.create_generator(&ctx, RngKind::PseudoDefault).unwrap();
        let mut b = driver.create_generator(&ctx, RngKind::PseudoDefault).unwrap();

        let (mut xa, mut xb) = ([0f32; 8], [0f32; 8]);
        a.fill_uniform(&mut xa).unwrap();
        b.fill_uniform(&mut xb).unwrap();
        assert_eq!(xa, xb);

        b.reseed(42).unwrap();
        b.fill_uniform(&mut xb).unwrap();
        assert_ne!(xa, xb);
        assert!(xb.iter().all(|x| (0.0..1.0).contains(x)));
        assert_eq!(driver.created(Stage::Seed), 1);
    }

    #[test]
    fn test_fill_normal_rejects_bad_std() {
        let driver = HostDriver::default();
        let ctx = context(&driver);
        let mut rng = driver.create_generator(&ctx, RngKind::PseudoDefault).unwrap();
        let mut out = [0f32; 4];
        assert!(rng.fill_normal(&mut out, 0.0, -1.0).is_err());
        rng.fill_normal(&mut out, 0.0, 1.0).unwrap();
    }

    #[test]
    fn test_module_validation() {
        let driver = HostDriver::default();
        let ctx = context(&driver);
        let module = driver.load_module(&ctx, &KERNELS32).unwrap();
        assert!(module.has_function("addScaler"));

        let empty = KernelImage::new("empty", ".version 6.0\n");
        assert!(driver.load_module(&ctx, &empty).is_err());
        let headless = KernelImage::new("headless", ".visible .entry f(\n");
        assert!(driver.load_module(&ctx, &headless).is_err());
    }

    #[test]
    fn test_memory_limit() {
        let driver = HostDriver::new(HostConfig::default().memory_limit(1000));
        let ctx = context(&driver);
        let a = driver.malloc(&ctx, 600).unwrap();
        let err = driver.malloc(&ctx, 600).unwrap_err();
        assert!(err.is_out_of_memory());
        driver.free(&ctx, a, 600);
        assert_eq!(driver.bytes_in_use(), 0);
        driver.malloc(&ctx, 600).unwrap();
        assert_eq!(driver.live_allocations(), 1);
    }

    #[test]
    fn test_injected_failure() {
        let driver = HostDriver::new(HostConfig::default().fail_at(Stage::Blas));
        let ctx = context(&driver);
        let err = driver.create_blas(&ctx).unwrap_err();
        assert_eq!(err.to_string(), "backend error: injected failure (create BLAS handle)");
        assert_eq!(driver.created(Stage::Blas), 0);
        assert_eq!(driver.created(Stage::Context), 1);
    }
}
