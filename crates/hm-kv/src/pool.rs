//! Bounded worker pool for blocking store requests.
//!
//! Adapters are synchronous. Each request takes a semaphore permit and
//! runs on the blocking thread pool, so at most `max_concurrent` backend
//! calls are in flight regardless of how many tasks fan out.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;

use crate::error::{StoreError, StoreResult};

#[derive(Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    timeout: Duration,
}

impl WorkerPool {
    pub fn new(max_concurrent: usize, timeout: Duration) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Run `op` on the pool. Waiting for a permit counts against the
    /// request timeout. The permit is held by the blocking call itself, so a
    /// request that times out keeps its slot until the backend returns.
    pub async fn run<T, F>(&self, label: &str, op: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce() -> StoreResult<T> + Send + 'static,
    {
        let permits = self.permits.clone();
        let request = async move {
            let permit = permits
                .acquire_owned()
                .await
                .map_err(|e| StoreError::Backend(format!("worker pool closed: {e}")))?;
            tokio::task::spawn_blocking(move || {
                let _permit = permit;
                op()
            })
            .await
                .map_err(|e| StoreError::Backend(format!("store worker failed: {e}")))?
        };

        match tokio::time::timeout(self.timeout, request).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(format!(
                "{label} exceeded {}ms",
                self.timeout.as_millis()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn runs_blocking_op() {
        let pool = WorkerPool::new(2, Duration::from_secs(1));
        let value = pool.run("get /a", || Ok(42)).await.unwrap();
        assert_eq!(value, 42);
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test]
    async fn errors_pass_through() {
        let pool = WorkerPool::new(1, Duration::from_secs(1));
        let err = pool
            .run::<(), _>("get /a", || Err(StoreError::KeyNotFound("/a".into())))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn slow_op_times_out() {
        let pool = WorkerPool::new(1, Duration::from_millis(20));
        let err = pool
            .run("set /slow", || {
                std::thread::sleep(Duration::from_millis(200));
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let pool = WorkerPool::new(2, Duration::from_secs(5));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                pool.run("op", move || {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(20));
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
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
    async fn timed_out_calls_keep_their_slot() {
        let pool = WorkerPool::new(1, Duration::from_millis(20));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let pool = pool.clone();
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                pool.run("set /slow", move || {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(300));
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
            }));
            tokio::time::sleep(Duration::from_millis(40)).await;
        }
        for handle in handles {
            assert!(handle.await.unwrap().unwrap_err().is_timeout());
        }

        // Let the abandoned calls drain before reading the peak.
        while pool.available() < 1 || in_flight.load(Ordering::SeqCst) > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }
}
