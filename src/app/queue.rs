use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;

/// Caps how many deck jobs run at once in this process. Jobs past the
/// cap wait on a permit inside their spawned task, so submission never
/// blocks the caller.
#[derive(Debug, Clone)]
pub struct JobQueue {
    semaphore: Arc<Semaphore>,
}

impl JobQueue {
    pub fn new(max_concurrent_jobs: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent_jobs.max(1))),
        }
    }

    pub fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let semaphore = Arc::clone(&self.semaphore);
        tokio::spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                tracing::error!("job queue semaphore closed, dropping job");
                return;
            };
            fut.await;
        });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn concurrency_stays_under_the_cap() {
        let queue = JobQueue::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(Semaphore::new(0));

        for _ in 0..6 {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            let done = Arc::clone(&done);
            queue.spawn(async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                done.add_permits(1);
            });
        }

        let _all = done.acquire_many(6).await.unwrap();
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}
