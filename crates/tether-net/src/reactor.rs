//! The worker pool every endpoint runs on.
//!
//! A [`Reactor`] owns a multi-thread tokio runtime sized from
//! [`ReactorSettings`]. Endpoints receive a cloneable [`ReactorHandle`] and
//! spawn all connection work through it; nothing reaches for an ambient
//! runtime. Every task spawned through a handle is tracked so shutdown can
//! wait for in-flight work with a bound.

use std::future::Future;
use std::io;
use std::time::Duration;

use tether_settings::ReactorSettings;
use tokio::runtime::{Builder, EnterGuard, Handle, Runtime, TryCurrentError};
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

/// Owner of the worker threads.
#[derive(Debug)]
pub struct Reactor {
    runtime: Runtime,
    handle: ReactorHandle,
    worker_threads: usize,
}

impl Reactor {
    /// Build the runtime. `worker_threads` is clamped to at least one.
    pub fn new(settings: &ReactorSettings) -> io::Result<Self> {
        let worker_threads = settings.worker_threads.max(1);
        let runtime = Builder::new_multi_thread()
            .worker_threads(worker_threads)
            .thread_name(settings.thread_name.clone())
            .enable_all()
            .build()?;
        let handle = ReactorHandle {
            runtime: runtime.handle().clone(),
            tracker: TaskTracker::new(),
        };
        info!(worker_threads, "reactor started");
        Ok(Self {
            runtime,
            handle,
            worker_threads,
        })
    }

    /// A handle for spawning onto this reactor.
    pub fn handle(&self) -> ReactorHandle {
        self.handle.clone()
    }

    /// Number of worker threads.
    pub fn worker_threads(&self) -> usize {
        self.worker_threads
    }

    /// Run a future to completion on the calling thread.
    ///
    /// Must not be called from inside an async context.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    /// Stop accepting tracked work, wait up to `timeout` for it to finish,
    /// then tear the runtime down.
    ///
    /// Returns `false` if tracked tasks were still running at the deadline.
    /// Must not be called from inside an async context.
    pub fn shutdown(self, timeout: Duration) -> bool {
        let drained = self.runtime.block_on(self.handle.drain(timeout));
        if !drained {
            warn!(?timeout, "reactor shutdown timed out with tasks still running");
        }
        self.runtime.shutdown_timeout(timeout);
        info!("reactor stopped");
        drained
    }
}

/// Cloneable spawner for a [`Reactor`].
#[derive(Clone, Debug)]
pub struct ReactorHandle {
    runtime: Handle,
    tracker: TaskTracker,
}

impl ReactorHandle {
    /// Wrap the runtime the caller is running on.
    ///
    /// # Panics
    ///
    /// Panics outside a tokio runtime; use [`try_current`](Self::try_current)
    /// to handle that case.
    pub fn current() -> Self {
        Self::from_handle(Handle::current())
    }

    /// Wrap the runtime the caller is running on, if any.
    pub fn try_current() -> Result<Self, TryCurrentError> {
        Handle::try_current().map(Self::from_handle)
    }

    fn from_handle(runtime: Handle) -> Self {
        Self {
            runtime,
            tracker: TaskTracker::new(),
        }
    }

    /// Spawn a tracked task.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tracker.spawn_on(future, &self.runtime)
    }

    /// Spawn a task tracked both here and by `group`, so the group can be
    /// drained independently of the whole reactor.
    pub fn spawn_in<F>(&self, group: &TaskTracker, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tracker
            .spawn_on(group.track_future(future), &self.runtime)
    }

    /// Run blocking work on the runtime's blocking pool.
    pub fn spawn_blocking<F, R>(&self, f: F) -> JoinHandle<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.runtime.spawn_blocking(f)
    }

    /// Enter the runtime context, e.g. to register a socket with its driver.
    pub fn enter(&self) -> EnterGuard<'_> {
        self.runtime.enter()
    }

    /// Tasks currently tracked.
    pub fn active_tasks(&self) -> usize {
        self.tracker.len()
    }

    /// Worker threads of the underlying runtime.
    pub fn worker_threads(&self) -> usize {
        self.runtime.metrics().num_workers()
    }

    /// Close the tracker and wait up to `timeout` for tracked tasks.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let _ = self.tracker.close();
        tokio::time::timeout(timeout, self.tracker.wait())
            .await
            .is_ok()
    }
}
