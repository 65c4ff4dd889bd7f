//! Bounded pool for blocking renderer and encoder work.
//!
//! Renderer calls are synchronous and may take tens of milliseconds. They
//! run on tokio's blocking threads, gated by a semaphore so that at most
//! `size` calls are in flight regardless of how many sessions exist. A
//! slow renderer therefore occupies one permit and never stalls the async
//! dispatcher that drives other sessions and the expiry sweeper.

use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::error::StreamError;

/// Default number of concurrent blocking jobs.
pub const DEFAULT_WORKERS: usize = 8;

/// Cloneable handle to the shared blocking pool.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    /// Create a pool allowing `size` concurrent jobs (at least one).
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    /// Configured concurrency.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Jobs that could start right now without waiting.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run the blocking closure `f` on a worker and await its result.
    ///
    /// The permit is held until `f` returns, even if the awaiting future
    /// is dropped.
    pub async fn run<F, R>(&self, f: F) -> Result<R, StreamError>
    where
        F: FnOnce() -> Result<R, StreamError> + Send + 'static,
        R: Send + 'static,
    {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| StreamError::Worker("worker pool closed".into()))?;

        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            f()
        })
        .await?
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(DEFAULT_WORKERS)
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn returns_closure_result() {
        let pool = WorkerPool::new(2);
        let v = pool.run(|| Ok(21 * 2)).await.unwrap();
        assert_eq!(v, 42);
        let e = pool
            .run(|| -> Result<(), StreamError> { Err(StreamError::Encode("x".into())) })
            .await;
        assert!(matches!(e, Err(StreamError::Encode(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrency_is_bounded() {
        let pool = WorkerPool::new(2);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut jobs = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            jobs.push(tokio::spawn(async move {
                pool.run(move || {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(20));
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
            }));
        }
        for job in jobs {
            job.await.unwrap().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn panicking_job_is_worker_error() {
        let pool = WorkerPool::new(1);
        let r: Result<(), _> = pool.run(|| panic!("boom")).await;
        assert!(matches!(r, Err(StreamError::Worker(_))));
        // The permit came back.
        assert_eq!(pool.available(), 1);
    }
}
