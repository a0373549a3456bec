//! A bounded worker pool: caps how many async jobs run concurrently by
//! wrapping a counting semaphore, for cases needing an explicit
//! concurrency bound rather than "as many tasks as there are inputs" —
//! the dispatcher's backpressure channel (C2), and the prefetch
//! downloader's open-file-descriptor ceiling (C5.1, §5).

use std::sync::Arc;
use tokio::sync::{Semaphore, SemaphorePermit};

#[derive(Clone)]
pub struct BoundedPool {
    semaphore: Arc<Semaphore>,
}

impl BoundedPool {
    pub fn new(capacity: usize) -> Self {
        BoundedPool {
            semaphore: Arc::new(Semaphore::new(capacity)),
        }
    }

    /// Blocks until a slot is free, then returns a guard that releases it
    /// on drop. The semaphore is never closed during the process
    /// lifetime, so acquiring can only fail if the pool itself was
    /// dropped out from under the caller, which does not happen here.
    pub async fn acquire(&self) -> SemaphorePermit<'_> {
        self.semaphore
            .acquire()
            .await
            .expect("pool semaphore is never closed")
    }

    /// Default sizing for the background prefetch's simultaneously open
    /// writers, matched to a typical OS file-descriptor ceiling (spec
    /// §4.5.1).
    pub fn default_prefetch_capacity() -> usize {
        100_000
    }

    /// Default sizing for the dispatcher's per-request handlers (spec
    /// §4.2): each `get`/`put` does CPU-bound hashing or (de)compression
    /// work in addition to I/O, so the bound tracks available cores
    /// rather than the much larger file-descriptor ceiling used for
    /// prefetch.
    pub fn default_dispatch_capacity() -> usize {
        num_cpus::get().max(1) * 8
    }

    /// Default sizing for the dispatcher's response channel (spec §4.2).
    pub fn default_response_channel_capacity() -> usize {
        100
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn caps_concurrency() {
        let pool = BoundedPool::new(2);
        let concurrent = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            let concurrent = concurrent.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                let _permit = pool.acquire().await;
                let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                concurrent.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert!(max_seen.load(Ordering::SeqCst) <= 2);
    }
}
