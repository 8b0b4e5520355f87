//! Bounded concurrency for the migration: a counting semaphore for heavy
//! subprocess jobs and a worker pool that drains a shared queue.

use crate::error::{MigrateError, Result};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;

/// Counting semaphore. Dropping the returned permit releases it and wakes one waiter.
#[derive(Debug, Clone)]
pub struct JobLimiter {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl JobLimiter {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        JobLimiter {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| MigrateError::Worker(format!("Job limiter closed: {}", e)))
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}

/// Runs `work` over `items` with at most `workers` in flight.
///
/// Workers pull from a shared queue and report every outcome over a channel.
/// After the first error no worker picks up new items; items already running
/// are left to finish. The first error is returned, otherwise all outputs in
/// completion order.
pub async fn run_bounded<I, T, F, Fut>(items: Vec<I>, workers: usize, work: F) -> Result<Vec<T>>
where
    I: Send + 'static,
    T: Send + 'static,
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    if items.is_empty() {
        return Ok(Vec::new());
    }

    let worker_count = workers.max(1).min(items.len());
    let queue = Arc::new(Mutex::new(items.into_iter().collect::<VecDeque<_>>()));
    let stopped = Arc::new(AtomicBool::new(false));
    let work = Arc::new(work);
    let (result_tx, mut result_rx) = mpsc::unbounded_channel::<Result<T>>();

    let mut join_set = JoinSet::new();
    for _ in 0..worker_count {
        let queue = queue.clone();
        let stopped = stopped.clone();
        let work = work.clone();
        let result_tx = result_tx.clone();
        join_set.spawn(async move {
            loop {
                if stopped.load(Ordering::SeqCst) {
                    break;
                }
                let next = { queue.lock().await.pop_front() };
                let Some(item) = next else {
                    break;
                };
                let result = work(item).await;
                if result.is_err() {
                    stopped.store(true, Ordering::SeqCst);
                }
                if result_tx.send(result).is_err() {
                    break;
                }
            }
        });
    }
    drop(result_tx);

    let mut outputs = Vec::new();
    let mut first_error: Option<MigrateError> = None;
    while let Some(result) = result_rx.recv().await {
        match result {
            Ok(output) => outputs.push(output),
            Err(error) => {
                log::error!("Worker failed: {}", error);
                stopped.store(true, Ordering::SeqCst);
                if first_error.is_none() {
                    first_error = Some(error);
                }
            }
        }
    }

    while let Some(joined) = join_set.join_next().await {
        if let Err(join_error) = joined {
            if first_error.is_none() {
                first_error = Some(MigrateError::Worker(format!(
                    "Worker task panicked: {}",
                    join_error
                )));
            }
        }
    }

    match first_error {
        Some(error) => Err(error),
        None => Ok(outputs),
    }
}
