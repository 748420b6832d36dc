//! Mutual exclusion over the shared accelerator.
//!
//! Every inference call that touches the accelerator (grounding, element
//! detection, speech-to-text) runs inside [`Arbiter::run`]. Waiters are
//! served first come, first served; there is no priority and no reentrancy,
//! so a holder must not call `run` again before releasing.

use std::future::Future;
use std::time::Instant;

use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

/// FIFO lock around the accelerator.
#[derive(Debug, Default)]
pub struct Arbiter {
    lock: Mutex<()>,
}

/// Proof of exclusive access; released on drop.
pub struct ArbiterGuard<'a> {
    _guard: MutexGuard<'a, ()>,
    acquired_at: Instant,
    holder: &'a str,
}

impl Drop for ArbiterGuard<'_> {
    fn drop(&mut self) {
        debug!(
            holder = %self.holder,
            held_ms = self.acquired_at.elapsed().as_millis() as u64,
            "released accelerator"
        );
    }
}

impl Arbiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access.
    pub async fn acquire<'a>(&'a self, holder: &'a str) -> ArbiterGuard<'a> {
        let waiting = Instant::now();
        let guard = self.lock.lock().await;
        debug!(
            holder = %holder,
            waited_ms = waiting.elapsed().as_millis() as u64,
            "acquired accelerator"
        );
        ArbiterGuard {
            _guard: guard,
            acquired_at: Instant::now(),
            holder,
        }
    }

    /// Runs `work` with exclusive access. The lock is released however
    /// `work` ends, including errors, cancellation and panics.
    pub async fn run<F, T>(&self, holder: &str, work: F) -> T
    where
        F: Future<Output = T>,
    {
        let _guard = self.acquire(holder).await;
        work.await
    }

    /// Whether someone holds the accelerator right now.
    pub fn is_busy(&self) -> bool {
        self.lock.try_lock().is_err()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_holders_never_overlap() {
        let arbiter = Arc::new(Arbiter::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..8 {
            let arbiter = arbiter.clone();
            let inside = inside.clone();
            let max_inside = max_inside.clone();
            handles.push(tokio::spawn(async move {
                let name = format!("worker_{i}");
                arbiter
                    .run(&name, async {
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_inside.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        inside.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_released_after_error() {
        let arbiter = Arbiter::new();
        let result: Result<(), &str> = arbiter.run("failing", async { Err("boom") }).await;
        assert!(result.is_err());
        assert!(!arbiter.is_busy());

        let value = arbiter.run("next", async { 42 }).await;
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_released_after_panic() {
        let arbiter = Arc::new(Arbiter::new());
        let task = {
            let arbiter = arbiter.clone();
            tokio::spawn(async move {
                arbiter
                    .run("panicking", async {
                        panic!("inference crashed");
                    })
                    .await
            })
        };
        assert!(task.await.is_err());
        assert!(!arbiter.is_busy());
    }

    #[tokio::test]
    async fn test_released_when_cancelled() {
        let arbiter = Arc::new(Arbiter::new());
        let slow = {
            let arbiter = arbiter.clone();
            tokio::spawn(async move {
                arbiter
                    .run("slow", tokio::time::sleep(Duration::from_secs(60)))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(arbiter.is_busy());

        slow.abort();
        let _ = slow.await;
        assert!(!arbiter.is_busy());
    }
}
