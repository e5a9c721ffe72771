//! Device context with a serialized task queue
//!
//! A [`Context`] owns one native driver context and a dedicated worker
//! thread. Every piece of device-bound work is submitted to that worker with
//! [`Context::run`] and executes in submission order, so the native context
//! is only ever touched from one thread.
//!
//! # Thread Safety
//!
//! `Context` is shared as `Arc<Context<D>>`. Submitting work is safe from any
//! thread; the closures themselves always run on the worker.

use crossbeam_channel::{self as channel, Receiver, Sender};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use tracing::{debug, error, trace};

use super::allocator::{Fence, MemorySource};
use super::{Device, Driver};
use crate::error::{Error, Result};

type Task<D> = Box<dyn FnOnce(&D, &<D as Driver>::Context) + Send + 'static>;

// ============================================================================
// Context
// ============================================================================

/// A logical binding to one device plus its serialized task queue.
pub struct Context<D: Driver> {
    driver: D,
    device: D::Device,
    native: Arc<D::Context>,
    queue_depth: Option<usize>,
    queue: Option<Sender<Task<D>>>,
    worker: Option<JoinHandle<()>>,
    worker_id: ThreadId,
}

impl<D: Driver> std::fmt::Debug for Context<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("driver", &D::name())
            .field("device", &self.device.name())
            .field("queue_depth", &self.queue_depth)
            .finish_non_exhaustive()
    }
}

impl<D: Driver> Context<D> {
    /// Create a context on `device`.
    ///
    /// The worker thread is spawned first and creates the native context
    /// itself, so the native context is bound to the thread that will run
    /// every later task. `queue_depth` of `None` gives an unbounded queue;
    /// `Some(n)` makes [`Context::run`] block once `n` tasks are waiting.
    ///
    /// # Errors
    ///
    /// Returns `Error::ContextCreation` if the driver cannot create or bind a
    /// context on the device, and `Error::InvalidArgument` for a zero depth.
    pub fn new(driver: D, device: D::Device, queue_depth: Option<usize>) -> Result<Arc<Self>> {
        if queue_depth == Some(0) {
            return Err(Error::invalid_argument(
                "queue_depth",
                "a fixed queue depth must be at least 1",
            ));
        }

        let (queue, tasks) = match queue_depth {
            Some(depth) => channel::bounded(depth),
            None => channel::unbounded(),
        };
        let (ready_tx, ready_rx) = channel::bounded::<Result<Arc<D::Context>>>(1);

        let worker_driver = driver.clone();
        let worker_device = device.clone();
        let worker = thread::Builder::new()
            .name(format!("cudavec-{}", device.name()))
            .spawn(move || {
                let native = worker_driver
                    .create_context(&worker_device, queue_depth)
                    .and_then(|native| {
                        worker_driver.bind(&native)?;
                        Ok(Arc::new(native))
                    });
                let native = match native {
                    Ok(native) => native,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if ready_tx.send(Ok(Arc::clone(&native))).is_err() {
                    return;
                }
                drop(ready_tx);
                work(&worker_driver, &native, tasks);
            })
            .map_err(|e| Error::ContextCreation {
                device: device.name(),
                reason: format!("failed to spawn worker thread: {e}"),
            })?;

        let worker_id = worker.thread().id();
        let native = match ready_rx.recv() {
            Ok(Ok(native)) => native,
            Ok(Err(e)) => {
                let _ = worker.join();
                return Err(Error::ContextCreation {
                    device: device.name(),
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                let _ = worker.join();
                return Err(Error::ContextCreation {
                    device: device.name(),
                    reason: "worker exited before the context was ready".to_string(),
                });
            }
        };

        debug!(
            driver = D::name(),
            device = %device.name(),
            queue_depth = ?queue_depth,
            "context ready"
        );

        Ok(Arc::new(Self {
            driver,
            device,
            native,
            queue_depth,
            queue: Some(queue),
            worker: Some(worker),
            worker_id,
        }))
    }

    /// Submit `f` to the worker.
    ///
    /// Tasks run one at a time in submission order. Calling `run` from a task
    /// that is already on the worker executes `f` inline, since queueing it
    /// behind the caller would never complete.
    pub fn run<F, R>(&self, f: F) -> Completion<R>
    where
        F: FnOnce(&D, &D::Context) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (done, rx) = channel::bounded(1);

        if self.on_worker() {
            let _ = done.send(f(&self.driver, &self.native));
            return Completion { rx, closed: false };
        }

        let task: Task<D> = Box::new(move |driver, native| {
            let _ = done.send(f(driver, native));
        });

        let closed = match &self.queue {
            Some(queue) => queue.send(task).is_err(),
            None => true,
        };
        if closed {
            trace!(device = %self.device.name(), "task submitted to a closed queue");
        }
        Completion { rx, closed }
    }

    /// Wait for all device work previously submitted through this context.
    pub fn synchronize(&self) -> Result<()> {
        self.run(|driver, native| driver.synchronize(native)).wait()?
    }

    /// Whether the calling thread is this context's worker
    #[inline]
    pub fn on_worker(&self) -> bool {
        thread::current().id() == self.worker_id
    }

    /// The driver this context was created with
    #[inline]
    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// The device this context is bound to
    #[inline]
    pub fn device(&self) -> &D::Device {
        &self.device
    }

    /// The native driver context.
    ///
    /// Native calls made outside [`Context::run`] bypass the task ordering.
    #[inline]
    pub fn native(&self) -> &Arc<D::Context> {
        &self.native
    }

    /// Fixed queue depth, or `None` for an unbounded queue
    #[inline]
    pub fn queue_depth(&self) -> Option<usize> {
        self.queue_depth
    }
}

fn work<D: Driver>(driver: &D, native: &D::Context, tasks: Receiver<Task<D>>) {
    for task in tasks.iter() {
        if panic::catch_unwind(AssertUnwindSafe(|| task(driver, native))).is_err() {
            error!(driver = D::name(), "device task panicked");
        }
    }
    trace!(driver = D::name(), "task queue drained");
}

impl<D: Driver> Drop for Context<D> {
    fn drop(&mut self) {
        // Closing the sender lets the worker drain what is queued and exit.
        self.queue.take();
        let Some(worker) = self.worker.take() else {
            return;
        };
        if thread::current().id() == self.worker_id {
            // Last reference released by a task; the worker exits on its own.
            return;
        }
        if worker.join().is_err() {
            error!(device = %self.device.name(), "context worker panicked");
        }
        debug!(device = %self.device.name(), "context closed");
    }
}

impl<D: Driver> MemorySource for Context<D> {
    fn reserve(&self, size_bytes: usize) -> Result<u64> {
        if self.on_worker() {
            return self.driver.malloc(&self.native, size_bytes);
        }
        self.run(move |driver, native| driver.malloc(native, size_bytes))
            .wait()?
    }

    fn release(&self, ptr: u64, size_bytes: usize) {
        if self.on_worker() {
            self.driver.free(&self.native, ptr, size_bytes);
            return;
        }
        // Queued behind every task already submitted, so work that still
        // reads the block finishes first.
        let _ = self.run(move |driver, native| driver.free(native, ptr, size_bytes));
    }
}

impl<D: Driver> Fence for Context<D> {
    fn submit(&self) -> Completion<()> {
        self.run(|_, _| ())
    }

    fn can_wait(&self) -> bool {
        !self.on_worker()
    }
}

// ============================================================================
// Completion
// ============================================================================

/// Completion signal for a task submitted with [`Context::run`].
#[must_use = "a Completion does nothing unless waited on"]
#[derive(Debug)]
pub struct Completion<R> {
    rx: Receiver<R>,
    closed: bool,
}

impl<R> Completion<R> {
    /// Block until the task has run and return its result.
    ///
    /// # Errors
    ///
    /// `Error::QueueClosed` if the task never reached the worker,
    /// `Error::TaskAborted` if it panicked.
    pub fn wait(self) -> Result<R> {
        self.rx.recv().map_err(|_| {
            if self.closed {
                Error::QueueClosed
            } else {
                Error::TaskAborted
            }
        })
    }

    /// Whether [`Completion::wait`] would return without blocking.
    ///
    /// A task that never reached a worker counts as ready.
    pub fn is_ready(&self) -> bool {
        self.closed || !self.rx.is_empty()
    }
}
