//! Bounded pool for blocking work
//!
//! Sync handlers, sync dependencies and blocking background tasks run here so
//! they never stall the runtime. Concurrency is capped by a semaphore in
//! front of tokio's blocking threads.

use std::any::Any;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Blocking pool errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("blocking pool is closed")]
    Closed,

    #[error("blocking task panicked: {0}")]
    Panicked(String),

    #[error("blocking task was cancelled")]
    Cancelled,
}

/// Semaphore-bounded wrapper around `spawn_blocking`
#[derive(Debug, Clone)]
pub struct BlockingPool {
    max_workers: usize,
    semaphore: Arc<Semaphore>,
}

impl BlockingPool {
    /// `max_workers` of `None` means one worker per CPU.
    pub fn new(max_workers: Option<usize>) -> Self {
        let max_workers = max_workers.unwrap_or_else(num_cpus::get).max(1);
        Self {
            max_workers,
            semaphore: Arc::new(Semaphore::new(max_workers)),
        }
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Run `func` on a blocking thread once a permit is free.
    pub async fn run<F, R>(&self, func: F) -> Result<R, PoolError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed)?;

        tokio::task::spawn_blocking(move || {
            let result = func();
            drop(permit);
            result
        })
        .await
        .map_err(|err| {
            if err.is_panic() {
                PoolError::Panicked(panic_message(&*err.into_panic()))
            } else {
                PoolError::Cancelled
            }
        })
    }

    /// Stop handing out permits. Pending and future `run` calls fail with `Closed`.
    pub fn close(&self) {
        self.semaphore.close();
    }
}

impl Default for BlockingPool {
    fn default() -> Self {
        Self::new(None)
    }
}

/// Best-effort text of a panic payload
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_run_returns_value() {
        let pool = BlockingPool::new(Some(2));
        assert_eq!(pool.max_workers(), 2);
        assert_eq!(pool.run(|| 21 * 2).await, Ok(42));
        assert_eq!(pool.available_permits(), 2);
    }

    #[tokio::test]
    async fn test_panic_is_reported() {
        let pool = BlockingPool::new(Some(1));
        let err = pool.run(|| -> u8 { panic!("kaboom") }).await.unwrap_err();
        assert_eq!(err, PoolError::Panicked("kaboom".to_string()));
        // The permit comes back even after a panic
        assert_eq!(pool.available_permits(), 1);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let pool = BlockingPool::new(Some(2));
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let pool = pool.clone();
            let active = active.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                pool.run(move || {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(20));
                    active.fetch_sub(1, Ordering::SeqCst);
                })
                .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_closed_pool() {
        let pool = BlockingPool::new(Some(1));
        pool.close();
        assert_eq!(pool.run(|| ()).await, Err(PoolError::Closed));
    }
}
