use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tracing::Span;

/// Bridges blocking fetch/build work into the cooperative call graph.
///
/// Two bounded pools: the constrained one is sized near the host's core
/// count and carries CPU/IO-heavy work; the larger one carries short
/// blocking calls such as lock acquisition. The ambient `tracing` span is
/// carried across the thread hop.
pub struct WorkerBridge {
    constrained: Arc<Semaphore>,
    unconstrained: Arc<Semaphore>,
}

impl WorkerBridge {
    #[must_use]
    pub fn new(threads_max: Option<usize>) -> Self {
        let constrained = threads_max.unwrap_or_else(default_worker_count).max(1);
        let unconstrained = 2 + constrained * 2;
        Self {
            constrained: Arc::new(Semaphore::new(constrained)),
            unconstrained: Arc::new(Semaphore::new(unconstrained)),
        }
    }

    /// Runs `work` on the constrained pool.
    ///
    /// # Errors
    ///
    /// Returns an error when the worker task is cancelled or panics.
    pub async fn run<T, F>(&self, work: F) -> Result<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        Self::submit(&self.constrained, work).await
    }

    /// Runs a short blocking call on the larger pool.
    ///
    /// # Errors
    ///
    /// Returns an error when the worker task is cancelled or panics.
    pub async fn run_detached<T, F>(&self, work: F) -> Result<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        Self::submit(&self.unconstrained, work).await
    }

    /// Drives a nested future to completion from a plain worker thread.
    ///
    /// # Errors
    ///
    /// Returns an error when the worker task is cancelled or panics.
    pub async fn run_async<T, F>(&self, future: F) -> Result<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let handle = Handle::current();
        Self::submit(&self.constrained, move || handle.block_on(future)).await
    }

    async fn submit<T, F>(pool: &Arc<Semaphore>, work: F) -> Result<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = pool
            .clone()
            .acquire_owned()
            .await
            .context("worker pool is closed")?;
        let span = Span::current();
        let output = tokio::task::spawn_blocking(move || {
            let _entered = span.enter();
            let output = work();
            drop(permit);
            output
        })
        .await
        .context("worker task failed")?;
        Ok(output)
    }
}

fn default_worker_count() -> usize {
    let cores = std::thread::available_parallelism().map_or(4, std::num::NonZeroUsize::get);
    // Small hosts round up so we cannot deadlock ourselves on nested waits;
    // bigger ones leave a core for the scheduler.
    if cores < 8 {
        7
    } else {
        cores - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn runs_blocking_work() -> Result<()> {
        let bridge = WorkerBridge::new(Some(2));
        let result = bridge.run(|| 40 + 2).await?;
        assert_eq!(result, 42);
        Ok(())
    }

    #[tokio::test]
    async fn constrained_pool_bounds_parallelism() -> Result<()> {
        let bridge = Arc::new(WorkerBridge::new(Some(2)));
        let peak = Arc::new(AtomicUsize::new(0));
        let active = Arc::new(AtomicUsize::new(0));

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let bridge = bridge.clone();
            let peak = peak.clone();
            let active = active.clone();
            tasks.spawn(async move {
                bridge
                    .run(move || {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        std::thread::sleep(std::time::Duration::from_millis(20));
                        active.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await
            });
        }
        while let Some(result) = tasks.join_next().await {
            result??;
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        Ok(())
    }

    #[tokio::test]
    async fn drives_nested_futures_from_worker_threads() -> Result<()> {
        let bridge = WorkerBridge::new(Some(2));
        let result = bridge.run_async(async { 7 * 6 }).await?;
        assert_eq!(result, 42);
        Ok(())
    }
}
