//! Cooperative, capacity-1 FIFO locks serializing the wire's read and write
//! phases. Built on a single-permit semaphore: tokio's semaphore already
//! grants permits in FIFO order, which is exactly what's needed to keep
//! pipelined requests admitted in the order they arrived. Not re-entrant
//! — a task that holds the lock and tries to acquire it again blocks
//! forever, the same as any other non-reentrant mutex; callers must not do
//! this. It's a logic error in the caller, not a recoverable condition.

use tokio::sync::{Semaphore, SemaphorePermit};

pub struct PipelineLock {
    sem: Semaphore,
}

/// Held for the duration of one pipeline's read or write phase; dropping it
/// admits the next FIFO waiter.
pub struct PipelineGuard<'a> {
    _permit: SemaphorePermit<'a>,
}

impl PipelineLock {
    pub fn new() -> Self {
        PipelineLock { sem: Semaphore::new(1) }
    }

    pub async fn acquire(&self) -> PipelineGuard<'_> {
        let permit = self.sem.acquire().await.expect("PipelineLock semaphore is never closed");
        PipelineGuard { _permit: permit }
    }
}

impl Default for PipelineLock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn serializes_concurrent_acquires() {
        let lock = Arc::new(PipelineLock::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let max_concurrent = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let lock = lock.clone();
            let counter = counter.clone();
            let max_concurrent = max_concurrent.clone();
            handles.push(tokio::spawn(async move {
                let _g = lock.acquire().await;
                let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
                max_concurrent.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(1)).await;
                counter.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(max_concurrent.load(Ordering::SeqCst), 1);
    }
}
