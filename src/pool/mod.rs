//! Bounded pool of reusable page renderers.
//!
//! Handles are created eagerly up to `min_instances` and lazily up to
//! `max_instances`. A semaphore with `max_instances` permits bounds how many
//! handles are checked out at once; the [`PooledRenderer`] guard returns its
//! handle on drop, so every exit path of a caller releases it.

pub mod renderer;

use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::config::{POOL_WARN_THRESHOLD, PoolConfig};
use crate::error::PoolError;

pub use renderer::{HttpRenderer, HttpRendererFactory, PageRenderer, RenderedPage, RendererFactory};

struct PoolInner {
    factory: Arc<dyn RendererFactory>,
    permits: Arc<Semaphore>,
    idle: Mutex<VecDeque<Arc<dyn PageRenderer>>>,
    /// Every handle ever created and not yet destroyed.
    all: Mutex<Vec<Arc<dyn PageRenderer>>>,
    closed: AtomicBool,
    in_use: AtomicUsize,
    max_instances: usize,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Bounded renderer pool.
pub struct RendererPool {
    inner: Arc<PoolInner>,
}

impl RendererPool {
    /// Create the pool and eagerly start `min_instances` handles.
    pub async fn start(
        factory: Arc<dyn RendererFactory>,
        config: &PoolConfig,
    ) -> Result<Arc<Self>, PoolError> {
        let max = config.max_instances.max(1);
        if max > POOL_WARN_THRESHOLD {
            warn!(
                max_instances = max,
                threshold = POOL_WARN_THRESHOLD,
                "Renderer pool is unusually large"
            );
        }

        let inner = Arc::new(PoolInner {
            factory,
            permits: Arc::new(Semaphore::new(max)),
            idle: Mutex::new(VecDeque::new()),
            all: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            in_use: AtomicUsize::new(0),
            max_instances: max,
        });

        for _ in 0..config.min_instances.min(max) {
            let handle = inner.factory.create().await?;
            lock(&inner.all).push(handle.clone());
            lock(&inner.idle).push_back(handle);
        }

        info!(
            min_instances = config.min_instances.min(max),
            max_instances = max,
            "Renderer pool started"
        );
        Ok(Arc::new(Self { inner }))
    }

    /// Check out a handle, waiting at most `timeout` for one to become free.
    pub async fn acquire(&self, timeout: Duration) -> Result<PooledRenderer, PoolError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(PoolError::Closed);
        }

        let permit = match tokio::time::timeout(timeout, self.inner.permits.clone().acquire_owned())
            .await
        {
            Err(_) => return Err(PoolError::Exhausted { timeout }),
            Ok(Err(_)) => return Err(PoolError::Closed),
            Ok(Ok(permit)) => permit,
        };
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(PoolError::Closed);
        }

        let reused = lock(&self.inner.idle).pop_front();
        let handle = match reused {
            Some(handle) => handle,
            None => {
                let handle = self.inner.factory.create().await?;
                lock(&self.inner.all).push(handle.clone());
                debug!(size = self.size(), "Renderer handle created on demand");
                handle
            }
        };

        self.inner.in_use.fetch_add(1, Ordering::SeqCst);
        Ok(PooledRenderer {
            handle,
            _permit: permit,
            pool: self.inner.clone(),
        })
    }

    /// Return a handle early. Dropping the guard has the same effect.
    pub fn release(&self, handle: PooledRenderer) {
        drop(handle);
    }

    /// Destroy every handle, including checked-out ones, and fail all
    /// current and future waiters. Idempotent.
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.permits.close();
        lock(&self.inner.idle).clear();
        let handles: Vec<_> = lock(&self.inner.all).drain(..).collect();
        let count = handles.len();
        for handle in handles {
            handle.close().await;
        }
        info!(destroyed = count, "Renderer pool shut down");
    }

    /// Handles currently checked out.
    pub fn in_use(&self) -> usize {
        self.inner.in_use.load(Ordering::SeqCst)
    }

    /// Live handles (idle and checked out).
    pub fn size(&self) -> usize {
        lock(&self.inner.all).len()
    }

    pub fn max_instances(&self) -> usize {
        self.inner.max_instances
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

/// A checked-out renderer. Returned to the pool on drop.
pub struct PooledRenderer {
    handle: Arc<dyn PageRenderer>,
    _permit: OwnedSemaphorePermit,
    pool: Arc<PoolInner>,
}

impl std::fmt::Debug for PooledRenderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledRenderer").finish_non_exhaustive()
    }
}

impl Deref for PooledRenderer {
    type Target = dyn PageRenderer;

    fn deref(&self) -> &Self::Target {
        self.handle.as_ref()
    }
}

impl Drop for PooledRenderer {
    fn drop(&mut self) {
        self.pool.in_use.fetch_sub(1, Ordering::SeqCst);
        if !self.pool.closed.load(Ordering::SeqCst) {
            lock(&self.pool.idle).push_back(self.handle.clone());
        }
    }
}
