use std::{future::Future, sync::Arc};

use courier_common::internal;
use serde::Deserialize;
use tokio::{runtime::Handle, sync::Semaphore, task::JoinHandle};

use crate::DeliveryError;

const fn default_max_workers() -> usize {
    16
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct WorkerPoolConfig {
    /// Drain workers running at the same time across all destinations
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
        }
    }
}

/// Runs drain workers of every destination on one runtime, bounded by a
/// semaphore.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    handle: Handle,
    permits: Arc<Semaphore>,
    max_workers: usize,
}

impl WorkerPool {
    /// A pool on the runtime of the calling task.
    ///
    /// # Errors
    ///
    /// [`DeliveryError::Internal`] if called outside a tokio runtime.
    pub fn new(config: WorkerPoolConfig) -> Result<Self, DeliveryError> {
        let handle = Handle::try_current()
            .map_err(|e| DeliveryError::Internal(format!("Worker pool needs a runtime: {e}")))?;
        Ok(Self::with_handle(handle, config))
    }

    #[must_use]
    pub fn with_handle(handle: Handle, config: WorkerPoolConfig) -> Self {
        let max_workers = config.max_workers.max(1);
        Self {
            handle,
            permits: Arc::new(Semaphore::new(max_workers)),
            max_workers,
        }
    }

    /// Queue `work` behind a free worker slot. Work spawned after
    /// [`WorkerPool::close`] is dropped without running.
    pub fn spawn<F>(&self, work: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        self.handle.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                internal!(level = DEBUG, "Worker pool closed, dropping scheduled work");
                return;
            };
            work.await;
        })
    }

    /// The runtime timers and probes are spawned on.
    #[must_use]
    pub const fn handle(&self) -> &Handle {
        &self.handle
    }

    #[must_use]
    pub const fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Worker slots currently free.
    #[must_use]
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn close(&self) {
        self.permits.close();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use super::*;

    #[tokio::test]
    async fn test_pool_bounds_concurrency() {
        let pool = WorkerPool::new(WorkerPoolConfig { max_workers: 2 }).unwrap();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let running = running.clone();
                let peak = peak.clone();
                pool.spawn(async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();

        for handle in handles {
            handle.await.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn test_closed_pool_drops_work() {
        let pool = WorkerPool::new(WorkerPoolConfig::default()).unwrap();
        pool.close();

        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        pool.spawn(async move {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap();

        assert!(pool.is_closed());
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_pool_outside_runtime() {
        assert!(WorkerPool::new(WorkerPoolConfig::default()).is_err());
    }

    #[test]
    fn test_zero_workers_is_clamped() {
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let pool = WorkerPool::with_handle(runtime.handle().clone(), WorkerPoolConfig { max_workers: 0 });
        assert_eq!(pool.max_workers(), 1);
    }
}
