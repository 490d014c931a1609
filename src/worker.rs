use crate::{
    error::{Error, Result},
    queue::RetryQueue,
};
use std::sync::Arc;
use tokio::{
    sync::broadcast,
    task::JoinHandle,
    time::{self, Duration, Instant},
};

/// Polls the retry queue and runs ready jobs, a batch at a time
pub struct Worker {
    queue: Arc<RetryQueue>,
    batch_size: usize,
    poll_interval: Duration,
    error_backoff: Duration,
    processing_timeout: Duration,
    shutdown_tx: broadcast::Sender<()>,
}

/// Graceful shutdown handle for a spawned worker
pub struct WorkerHandle {
    shutdown_tx: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl Worker {
    pub fn new(queue: Arc<RetryQueue>) -> Self {
        let config = queue.config();
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            batch_size: config.batch_size.max(1),
            poll_interval: config.poll_interval,
            error_backoff: config.error_backoff,
            processing_timeout: config.processing_timeout,
            queue,
            shutdown_tx,
        }
    }

    /// Run the worker on its own task and return a handle for graceful shutdown
    pub fn spawn(self) -> WorkerHandle {
        let shutdown_tx = self.shutdown_tx.clone();
        // Subscribe before spawning so a shutdown sent right away is not missed.
        let shutdown_rx = self.shutdown_tx.subscribe();
        let task = tokio::spawn(async move { self.run_until(shutdown_rx).await });
        WorkerHandle { shutdown_tx, task }
    }

    /// Poll in the current task until [`Worker::shutdown`] is called
    pub async fn run(&self) {
        self.run_until(self.shutdown_tx.subscribe()).await
    }

    /// Ask a running [`Worker::run`] to stop once its current batch is done
    pub fn shutdown(&self) {
        if self.shutdown_tx.send(()).is_err() {
            log::debug!("Worker is not running; nothing to stop");
        }
    }

    async fn requeue_stale(&self) {
        match self
            .queue
            .requeue_stale_processing(self.processing_timeout)
            .await
        {
            Ok(0) => {}
            Ok(n) => log::warn!("Requeued {} abandoned job(s)", n),
            Err(e) => log::error!("Error requeueing abandoned jobs: {}", e),
        }
    }

    // A batch in flight always runs to the end before the signal is looked at.
    async fn run_until(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        log::info!("Worker started. Looking for jobs...");

        let mut consecutive_errors: u32 = 0;
        let mut last_requeue: Option<Instant> = None;

        loop {
            if shutdown_rx.try_recv().is_ok() {
                log::info!("Shutdown signal received. Stopping...");
                break;
            }

            if last_requeue.map_or(true, |at| at.elapsed() >= self.processing_timeout) {
                self.requeue_stale().await;
                last_requeue = Some(Instant::now());
            }

            let pause = match self.run_once().await {
                Ok(0) => {
                    consecutive_errors = 0;
                    self.poll_interval
                }
                Ok(_) => {
                    consecutive_errors = 0;
                    continue;
                }
                Err(e) => {
                    consecutive_errors += 1;
                    log::error!(
                        "Error fetching ready jobs (attempt {}): {}",
                        consecutive_errors,
                        e
                    );
                    self.error_backoff
                }
            };

            tokio::select! {
                _ = time::sleep(pause) => {}
                _ = shutdown_rx.recv() => {
                    log::info!("Shutdown signal received. Stopping...");
                    break;
                }
            }
        }

        log::info!("Worker shutdown complete.");
    }

    /// Process one batch of ready jobs concurrently and wait for all of them.
    /// Returns how many jobs were picked up.
    pub async fn run_once(&self) -> Result<usize> {
        let jobs = self.queue.get_ready_jobs(self.batch_size).await?;
        if jobs.is_empty() {
            return Ok(0);
        }

        let count = jobs.len();
        log::debug!("Found {} ready jobs", count);

        // Plain handles detach on drop, so a cancelled run still lets the batch finish.
        let tasks: Vec<JoinHandle<bool>> = jobs
            .into_iter()
            .map(|job| {
                let queue = Arc::clone(&self.queue);
                tokio::spawn(async move { queue.process_job(&job).await })
            })
            .collect();

        let mut succeeded = 0;
        for task in tasks {
            match task.await {
                Ok(true) => succeeded += 1,
                Ok(false) => {}
                Err(e) => log::error!("Job task aborted: {}", e),
            }
        }

        log::debug!("Batch finished: {}/{} jobs succeeded", succeeded, count);
        Ok(count)
    }
}

impl WorkerHandle {
    /// Signal the worker to stop and wait for its current batch to finish
    pub async fn shutdown(self) -> Result<()> {
        if self.shutdown_tx.send(()).is_err() {
            log::warn!("Failed to send shutdown signal - worker may have already stopped");
        }

        self.task
            .await
            .map_err(|e| Error::Worker(format!("Worker task failed: {}", e)))
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
