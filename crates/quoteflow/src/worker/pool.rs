use std::time::Duration;

use futures_util::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{QuoteflowError, Result};
use crate::orchestrator::Orchestrator;

/// Pause after a failed delivery before asking the queue again.
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Tokio tasks that pull jobs off the queue and run them through the
/// orchestrator. Shutting down stops new dequeues; jobs in flight run to
/// completion before [`WorkerPool::wait`] returns.
pub struct WorkerPool {
    workers: Vec<JoinHandle<()>>,
    shutdown: CancellationToken,
}

impl WorkerPool {
    /// Re-offers unfinished jobs to the queue, then spawns `worker_count`
    /// workers.
    pub async fn start(
        orchestrator: Orchestrator,
        worker_count: usize,
        dequeue_wait: Duration,
    ) -> Result<Self> {
        if worker_count == 0 {
            return Err(QuoteflowError::Worker(
                "worker_count must be > 0".to_string(),
            ));
        }

        orchestrator.recover().await?;

        let shutdown = CancellationToken::new();
        let workers = (0..worker_count)
            .map(|worker_id| {
                tokio::spawn(run_worker(
                    worker_id,
                    orchestrator.clone(),
                    shutdown.clone(),
                    dequeue_wait,
                ))
            })
            .collect();

        info!("Started {} workers", worker_count);
        Ok(Self { workers, shutdown })
    }

    pub fn shutdown(&self) {
        info!("Shutting down worker pool...");
        self.shutdown.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Handle that stops the pool from another task, e.g. a signal handler.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn wait(self) {
        for (i, result) in join_all(self.workers).await.into_iter().enumerate() {
            if let Err(e) = result {
                error!("Worker {} panicked: {}", i, e);
            } else {
                debug!("Worker {} finished", i);
            }
        }

        info!("All workers have stopped");
    }
}

async fn run_worker(
    worker_id: usize,
    orchestrator: Orchestrator,
    shutdown: CancellationToken,
    dequeue_wait: Duration,
) {
    debug!("Worker {} started", worker_id);

    loop {
        // The dequeue is abandoned on shutdown; a job already taken is not.
        let next = tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("Worker {} received shutdown signal", worker_id);
                break;
            }
            next = orchestrator.next_delivery(dequeue_wait) => next,
        };

        let result = match next {
            Ok(Some(delivery)) => {
                debug!("Worker {} processing job: {}", worker_id, delivery.job_id);
                orchestrator.process_delivery(&delivery).await
            }
            Ok(None) => continue,
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            warn!("Worker {} failed to process a job: {}", worker_id, e);
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(ERROR_BACKOFF) => {}
            }
        }
    }

    debug!("Worker {} stopped", worker_id);
}
