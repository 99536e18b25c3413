use std::future::Future;
use std::pin::Pin;

use tokio::sync::{mpsc, oneshot};

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// A named single-consumer executor.
///
/// Jobs posted to the queue run one at a time, in posting order, on a
/// dedicated task. Work posted from different tasks therefore never races:
/// this is the serialization guarantee the rest of the daemon relies on for
/// "strand"-owned state.
///
/// The queue task exits once every handle has been dropped and the backlog is
/// drained.
#[derive(Clone)]
pub struct SerialQueue {
    name: &'static str,
    tx: mpsc::UnboundedSender<Job>,
}

impl SerialQueue {
    pub fn new(name: &'static str) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                job.await;
            }
        });
        SerialQueue { name, tx }
    }

    /// Enqueue a job. Never blocks and never runs the job inline.
    pub fn post<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.tx.send(Box::pin(fut)).is_err() {
            log::debug!("serial queue {} is gone, dropping job", self.name);
        }
    }

    /// Enqueue a job and wait for its result.
    pub async fn run<F, T>(&self, fut: F) -> T
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.post(async move {
            let _ = tx.send(fut.await);
        });
        rx.await.expect("serial queue dropped a pending job")
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn jobs_run_in_posting_order() {
        let queue = SerialQueue::new("test");
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));

        for i in 0..100u32 {
            let log = log.clone();
            queue.post(async move {
                // Yield so that out-of-order execution would have a chance to
                // show up if jobs were not serialized.
                tokio::task::yield_now().await;
                log.lock().push(i);
            });
        }

        queue.run(async {}).await;
        assert_eq!(*log.lock(), (0..100).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn run_returns_job_result() {
        let queue = SerialQueue::new("test");
        let value = queue.run(async { 7 * 6 }).await;
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn jobs_do_not_interleave() {
        let queue = SerialQueue::new("test");
        let active = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            let active = active.clone();
            queue.post(async move {
                assert_eq!(active.fetch_add(1, Ordering::SeqCst), 0);
                tokio::task::yield_now().await;
                assert_eq!(active.fetch_sub(1, Ordering::SeqCst), 1);
            });
        }

        queue.run(async {}).await;
    }
}
