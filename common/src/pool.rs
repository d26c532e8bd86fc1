//! Bounded set of workers executing transfer work items.
//!
//! A single pool is shared by every transfer and job in the process, so its size bounds the total
//! number of chunks in flight no matter how many objects are being moved. Submission never blocks:
//! items wait in an unbounded queue until a worker is free.

use futures::future::BoxFuture;

type WorkItem = BoxFuture<'static, ()>;

#[derive(Debug, thiserror::Error)]
#[error("worker pool is shut down")]
pub struct PoolClosed;

/// Cheap to clone; all clones feed the same workers.
#[derive(Clone)]
pub struct WorkerPool {
    queue: async_channel::Sender<WorkItem>,
    workers: std::sync::Arc<parking_lot::Mutex<Vec<tokio::task::JoinHandle<()>>>>,
    size: usize,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("size", &self.size)
            .field("queued", &self.queue.len())
            .finish()
    }
}

impl WorkerPool {
    /// Spawns `size` workers on the current tokio runtime.
    pub fn new(size: usize) -> Self {
        assert!(size > 0, "worker pool needs at least one worker");
        let (queue, receiver) = async_channel::unbounded::<WorkItem>();
        let workers = (0..size)
            .map(|worker| {
                let receiver = receiver.clone();
                tokio::spawn(async move {
                    while let Ok(item) = receiver.recv().await {
                        item.await;
                    }
                    tracing::trace!("worker {} exiting, queue closed", worker);
                })
            })
            .collect();
        tracing::debug!("started worker pool with {} workers", size);
        Self {
            queue,
            workers: std::sync::Arc::new(parking_lot::Mutex::new(workers)),
            size,
        }
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of submitted items no worker has picked up yet.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn submit<F>(&self, item: F) -> Result<(), PoolClosed>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.queue
            .try_send(Box::pin(item))
            .map_err(|_| PoolClosed)
    }

    /// Stops accepting work, lets the workers drain what was already queued and waits for them.
    pub async fn shutdown(&self) {
        self.queue.close();
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if let Err(error) = worker.await {
                tracing::error!("worker pool task failed: {}", &error);
            }
        }
    }
}
