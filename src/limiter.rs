//! Admission control for pipeline stages.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Bounds the number of in-flight jobs of one kind.
///
/// Jobs beyond the capacity wait in FIFO order (tokio's semaphore is fair). Capacity is held
/// for exactly as long as the job's future is alive, so it is returned on success, on
/// failure, and when the caller drops the future. A job dropped while still queued never
/// runs and never takes a slot.
///
/// A capacity of `0` means unbounded: every job is dispatched immediately.
#[derive(Debug, Clone)]
pub struct JobLimiter {
    name: &'static str,
    capacity: usize,
    semaphore: Option<Arc<Semaphore>>,
    running: Arc<AtomicUsize>,
    queued: Arc<AtomicUsize>,
}

impl JobLimiter {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            capacity,
            semaphore: (capacity > 0).then(|| Arc::new(Semaphore::new(capacity))),
            running: Arc::new(AtomicUsize::new(0)),
            queued: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn unbounded(name: &'static str) -> Self {
        Self::new(name, 0)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// `None` when unbounded
    pub fn capacity(&self) -> Option<usize> {
        self.semaphore.as_ref().map(|_| self.capacity)
    }

    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    /// Waits for a slot, then runs `job` while holding it.
    pub async fn schedule<F, Fut, T>(&self, job: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _permit = match &self.semaphore {
            Some(semaphore) => {
                let _waiting = CountGuard::enter(&self.queued);
                // The semaphore is never closed; a closed one degrades to unbounded.
                semaphore.acquire().await.ok()
            }
            None => None,
        };
        let _running = CountGuard::enter(&self.running);
        job().await
    }
}

/// Increments a counter for the lifetime of the guard.
struct CountGuard<'a>(&'a AtomicUsize);

impl<'a> CountGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for CountGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use std::time::Duration;

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_capacity_bounds_running_jobs() {
        let limiter = JobLimiter::new("test", 2);
        let gate = Arc::new(Semaphore::new(0));
        let started = Arc::new(Mutex::new(HashSet::new()));

        let mut handles = Vec::new();
        for id in 0..5usize {
            let limiter = limiter.clone();
            let gate = gate.clone();
            let started = started.clone();
            handles.push(tokio::spawn(async move {
                limiter
                    .schedule(|| async move {
                        started.lock().insert(id);
                        let _ = gate.acquire().await;
                    })
                    .await
            }));
        }

        wait_until(|| limiter.running() == 2 && limiter.queued() == 3).await;
        assert_eq!(started.lock().len(), 2);

        // Cancel one job that is still waiting for a slot.
        let victim = (0..5).find(|id| !started.lock().contains(id)).unwrap();
        handles[victim].abort();
        wait_until(|| limiter.queued() == 2).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(limiter.running(), 2, "cancelling a queued job must not free a slot");
        assert_eq!(started.lock().len(), 2);

        gate.add_permits(16);
        for (id, handle) in handles.into_iter().enumerate() {
            let result = handle.await;
            if id == victim {
                assert!(result.unwrap_err().is_cancelled());
            } else {
                result.unwrap();
            }
        }

        let started = started.lock();
        assert_eq!(started.len(), 4);
        assert!(!started.contains(&victim));
        assert_eq!(limiter.running(), 0);
        assert_eq!(limiter.queued(), 0);
    }

    #[tokio::test]
    async fn test_failed_job_releases_slot() {
        let limiter = JobLimiter::new("test", 1);
        let first: Result<(), String> = limiter.schedule(|| async { Err("boom".to_string()) }).await;
        assert!(first.is_err());
        let second: Result<u32, String> = limiter.schedule(|| async { Ok(7) }).await;
        assert_eq!(second, Ok(7));
        assert_eq!(limiter.running(), 0);
    }

    #[tokio::test]
    async fn test_zero_capacity_is_unbounded() {
        let limiter = JobLimiter::new("test", 0);
        assert_eq!(limiter.capacity(), None);
        let gate = Arc::new(Semaphore::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let limiter = limiter.clone();
            let gate = gate.clone();
            handles.push(tokio::spawn(async move {
                limiter
                    .schedule(|| async move {
                        let _ = gate.acquire().await;
                    })
                    .await
            }));
        }

        wait_until(|| limiter.running() == 10).await;
        assert_eq!(limiter.queued(), 0);
        gate.add_permits(10);
        let results = futures::future::join_all(handles).await;
        assert!(results.iter().all(|r| r.is_ok()));
    }
}
