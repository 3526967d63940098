//! Pipeline worker pool.
//!
//! A fixed set of pre-initialized workers behind a FIFO semaphore. A
//! single worker is not thread-safe; the pool's only job is to serialize
//! access to each one. Release happens on guard drop, so every exit path
//! of a request returns its worker.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::info;

use crate::pipeline::{AnalysisPipeline, PipelineError};

pub struct PipelineWorker {
    pub id: usize,
    pub pipeline: Box<dyn AnalysisPipeline>,
}

#[derive(Debug, Clone, Copy)]
pub struct PoolStats {
    pub size: usize,
    pub available: usize,
}

pub struct PipelinePool {
    workers: Arc<Mutex<VecDeque<PipelineWorker>>>,
    permits: Arc<Semaphore>,
    size: usize,
}

impl PipelinePool {
    /// Pre-initialize `size` workers. Any factory failure fails the whole
    /// pool; a partially-initialized pool would lie about its capacity.
    pub fn new<F>(size: usize, factory: F) -> Result<Self, PipelineError>
    where
        F: Fn(usize) -> Result<Box<dyn AnalysisPipeline>, PipelineError>,
    {
        let mut workers = VecDeque::with_capacity(size);
        for id in 0..size {
            workers.push_back(PipelineWorker {
                id,
                pipeline: factory(id)?,
            });
        }
        info!("pipeline pool ready: {size} workers");
        Ok(Self {
            workers: Arc::new(Mutex::new(workers)),
            permits: Arc::new(Semaphore::new(size)),
            size,
        })
    }

    /// Acquire a worker, waiting up to `deadline`. The semaphore queues
    /// waiters in FIFO order.
    pub async fn acquire(&self, deadline: Duration) -> Result<PoolGuard, AcquireTimeout> {
        let permit = tokio::time::timeout(deadline, self.permits.clone().acquire_owned())
            .await
            .map_err(|_| AcquireTimeout)?
            .expect("pool semaphore closed");
        let worker = self
            .workers
            .lock()
            .pop_front()
            .expect("permit held but no worker available");
        Ok(PoolGuard {
            worker: Some(worker),
            workers: self.workers.clone(),
            _permit: permit,
        })
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            size: self.size,
            available: self.permits.available_permits(),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquireTimeout;

/// Exclusive access to one worker. Dropping the guard returns the worker
/// and releases the permit, in that order.
pub struct PoolGuard {
    worker: Option<PipelineWorker>,
    workers: Arc<Mutex<VecDeque<PipelineWorker>>>,
    _permit: OwnedSemaphorePermit,
}

impl PoolGuard {
    pub fn worker(&mut self) -> &mut PipelineWorker {
        self.worker.as_mut().expect("worker taken")
    }
}

impl Drop for PoolGuard {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            self.workers.lock().push_back(worker);
        }
        // _permit drops after the worker is back in the queue.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{AnalyzeOptions, ProbeTemplate};
    use image::GrayImage;

    struct StubPipeline;

    impl AnalysisPipeline for StubPipeline {
        fn name(&self) -> &'static str {
            "stub"
        }

        fn analyze(
            &mut self,
            _gray: &GrayImage,
            _opts: &AnalyzeOptions,
        ) -> Result<ProbeTemplate, PipelineError> {
            Err(PipelineError::Segmentation("stub".to_string()))
        }
    }

    fn stub_pool(size: usize) -> PipelinePool {
        PipelinePool::new(size, |_| Ok(Box::new(StubPipeline) as Box<dyn AnalysisPipeline>))
            .unwrap()
    }

    #[tokio::test]
    async fn acquire_release_cycles() {
        let pool = stub_pool(2);
        assert_eq!(pool.stats().available, 2);

        let g1 = pool.acquire(Duration::from_millis(100)).await.unwrap();
        let g2 = pool.acquire(Duration::from_millis(100)).await.unwrap();
        assert_eq!(pool.stats().available, 0);

        drop(g1);
        drop(g2);
        assert_eq!(pool.stats().available, 2);
    }

    #[tokio::test]
    async fn exhausted_pool_times_out() {
        let pool = stub_pool(1);
        let _held = pool.acquire(Duration::from_millis(100)).await.unwrap();
        let result = pool.acquire(Duration::from_millis(50)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn waiter_proceeds_after_release() {
        let pool = Arc::new(stub_pool(1));
        let held = pool.acquire(Duration::from_millis(100)).await.unwrap();

        let pool2 = pool.clone();
        let waiter = tokio::spawn(async move {
            pool2.acquire(Duration::from_secs(1)).await.is_ok()
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn workers_rotate_through_queue() {
        let pool = stub_pool(3);
        let mut g1 = pool.acquire(Duration::from_millis(100)).await.unwrap();
        let first_id = g1.worker().id;
        drop(g1);
        // The released worker went to the back of the queue.
        let mut g2 = pool.acquire(Duration::from_millis(100)).await.unwrap();
        assert_ne!(g2.worker().id, first_id);
    }
}
