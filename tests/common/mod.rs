//! Common test utilities
#![allow(dead_code)]

use std::sync::Arc;

use cudavec::runtime::Context;
use cudavec::runtime::host::{HostConfig, HostDevice, HostDriver};
use cudavec::{Handle, Stage};

/// Stages that run on the context worker, in construction order
pub const PROVISION_STAGES: [Stage; 4] = [Stage::Generator, Stage::Seed, Stage::Blas, Stage::Kernels];

/// A host driver with one device
pub fn host_driver() -> HostDriver {
    HostDriver::default()
}

/// A host driver whose `stage` capability fails
pub fn failing_driver(stage: Stage) -> HostDriver {
    HostDriver::new(HostConfig::default().fail_at(stage))
}

/// A context on device 0 of `driver`
pub fn host_context(driver: &HostDriver) -> Arc<Context<HostDriver>> {
    Context::new(driver.clone(), HostDevice::new(0), None).expect("host context")
}

/// A handle built on `driver` with default settings
pub fn host_handle(driver: &HostDriver) -> Handle<HostDriver> {
    Handle::builder(driver.clone()).build().expect("host handle")
}

/// Draw `n` uniform values from the handle's random stream
pub fn uniforms(handle: &Handle<HostDriver>, n: usize) -> Vec<f32> {
    let mut out = vec![0f32; n];
    handle.fill_uniform(&mut out).expect("uniform fill");
    out
}

/// Whether two allocator references point at the same object
pub fn same_allocator(a: &Arc<dyn cudavec::runtime::Allocator>, b: &Arc<dyn cudavec::runtime::Allocator>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}
