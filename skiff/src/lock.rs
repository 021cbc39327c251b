//! A fair async lock serializing image-store mutation.

use std::future::Future;

use tokio::sync::{Semaphore, SemaphorePermit};

/// A fair, single-holder async mutex.
///
/// Waiters are served in arrival order, so a long pull cannot starve a
/// prune that queued before it. The lock protects logical regions, not
/// data: it is safe to await while holding it, and guards release on
/// every exit path. It is not reentrant — acquiring it again from within
/// [`AsyncLock::with_lock`] deadlocks the task.
#[derive(Debug)]
pub struct AsyncLock {
    semaphore: Semaphore,
}

/// Holds the lock until dropped.
#[derive(Debug)]
pub struct LockGuard<'a> {
    _permit: SemaphorePermit<'a>,
}

impl AsyncLock {
    /// Creates an uncontended lock.
    pub fn new() -> Self {
        Self {
            semaphore: Semaphore::new(1),
        }
    }

    /// Waits for the lock. Dropping the returned future before it
    /// resolves forfeits the queue slot without affecting other waiters.
    pub async fn acquire(&self) -> LockGuard<'_> {
        #[allow(clippy::expect_used)]
        let permit = self
            .semaphore
            .acquire()
            .await
            .expect("lock semaphore is never closed");
        LockGuard { _permit: permit }
    }

    /// Runs `body` while holding the lock, releasing on success, error,
    /// and cancellation alike.
    pub async fn with_lock<T>(&self, body: impl Future<Output = T>) -> T {
        let _guard = self.acquire().await;
        body.await
    }
}

impl Default for AsyncLock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn serializes_critical_sections() {
        let lock = Arc::new(AsyncLock::new());
        let inside = Arc::new(AtomicU32::new(0));
        let max_seen = Arc::new(AtomicU32::new(0));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let lock = Arc::clone(&lock);
            let inside = Arc::clone(&inside);
            let max_seen = Arc::clone(&max_seen);
            tasks.push(tokio::spawn(async move {
                lock.with_lock(async {
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(std::time::Duration::from_millis(1)).await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                })
                .await;
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn waiters_are_fifo() {
        let lock = Arc::new(AsyncLock::new());
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let guard = lock.acquire().await;
        let mut tasks = Vec::new();
        for i in 0..8 {
            let lock = Arc::clone(&lock);
            let order = Arc::clone(&order);
            tasks.push(tokio::spawn(async move {
                lock.with_lock(async {
                    order.lock().unwrap().push(i);
                })
                .await;
            }));
            // let each waiter enqueue before spawning the next
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }
        drop(guard);
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), (0..8).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn releases_on_error_paths() {
        let lock = AsyncLock::new();
        let result: Result<(), &str> = lock.with_lock(async { Err("boom") }).await;
        assert!(result.is_err());
        // lock must be free again
        let _guard = lock.acquire().await;
    }

    #[tokio::test]
    async fn cancelled_waiter_forfeits_slot() {
        let lock = Arc::new(AsyncLock::new());
        let guard = lock.acquire().await;

        let waiter = {
            let lock = Arc::clone(&lock);
            tokio::spawn(async move {
                let _guard = lock.acquire().await;
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        waiter.abort();
        let _ = waiter.await;

        drop(guard);
        // the aborted waiter must not have consumed the lock
        let _guard = lock.acquire().await;
    }
}
