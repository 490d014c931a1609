use crate::{
    backoff::BackoffPolicy,
    config::RetryQueueConfig,
    error::{Error, Result},
    job::{to_payload, JobRecord, JobStatus, JobType, Payload, TypedJob},
    processor::{JobProcessor, ProcessError, ProcessorRegistry},
    store::JobStore,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{sync::Arc, time::Duration};

/// Per-job settings for [`RetryQueue::enqueue_job`]
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// How long to wait before the job first becomes ready
    pub delay: Duration,
    /// Attempt cap; the queue default applies when `None`
    pub max_attempts: Option<u32>,
    /// Caller-chosen id; a UUID is generated when `None`
    pub job_id: Option<String>,
}

impl EnqueueOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn delay_seconds(self, seconds: u64) -> Self {
        self.delay(Duration::from_secs(seconds))
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn job_id<S: Into<String>>(mut self, job_id: S) -> Self {
        self.job_id = Some(job_id.into());
        self
    }
}

/// Sizes of the queue's index structures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub processing: usize,
    pub dead_letter: usize,
    pub total: usize,
}

/// Health status of the queue
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub store_connected: bool,
    pub stats: Option<QueueStats>,
    pub checked_at: DateTime<Utc>,
}

fn score(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn offset(from: DateTime<Utc>, delay: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| from.checked_add_signed(delay))
}

/// Durable job queue with bounded retries and a dead-letter queue.
///
/// Records live in `<prefix>:job:<id>` hashes. Three indexes track where each job is:
/// `<prefix>:ready` (sorted by `scheduled_at`), `<prefix>:processing` (sorted by claim
/// time) and `<prefix>:dead` (sorted by dead-letter time). Only this type mutates them.
pub struct RetryQueue {
    config: RetryQueueConfig,
    store: Arc<dyn JobStore>,
    processors: Arc<ProcessorRegistry>,
    backoff: BackoffPolicy,
}

impl RetryQueue {
    pub fn new(
        config: RetryQueueConfig,
        store: Arc<dyn JobStore>,
        processors: Arc<ProcessorRegistry>,
    ) -> Self {
        let backoff = config.backoff_policy();
        Self {
            config,
            store,
            processors,
            backoff,
        }
    }

    pub fn config(&self) -> &RetryQueueConfig {
        &self.config
    }

    pub fn processors(&self) -> &Arc<ProcessorRegistry> {
        &self.processors
    }

    /// Register the processor for a job type
    pub async fn register_processor<P>(&self, job_type: JobType, processor: P)
    where
        P: JobProcessor + 'static,
    {
        self.processors
            .register_processor(job_type, processor)
            .await;
    }

    fn job_key(&self, job_id: &str) -> String {
        format!("{}:job:{}", self.config.key_prefix, job_id)
    }

    fn ready_key(&self) -> String {
        format!("{}:ready", self.config.key_prefix)
    }

    fn processing_key(&self) -> String {
        format!("{}:processing", self.config.key_prefix)
    }

    fn dead_letter_key(&self) -> String {
        format!("{}:dead", self.config.key_prefix)
    }

    async fn save_job(&self, job: &JobRecord) -> Result<()> {
        self.store
            .hset_all(&self.job_key(&job.id), &job.to_fields()?)
            .await
    }

    /// Enqueue a job that is ready now, with the default attempt cap
    pub async fn enqueue(&self, job_type: JobType, payload: Payload) -> Result<String> {
        self.enqueue_job(job_type, payload, EnqueueOptions::default())
            .await
    }

    /// Enqueue a typed job under its own job type
    pub async fn enqueue_typed<T>(&self, job: &T, options: EnqueueOptions) -> Result<String>
    where
        T: TypedJob,
    {
        self.enqueue_job(T::job_type(), to_payload(job)?, options)
            .await
    }

    /// Persist a new PENDING job and schedule it `options.delay` from now.
    ///
    /// Re-enqueueing a caller-chosen id whose job has not finished yet returns that id
    /// without scheduling anything; a finished job with the same id is replaced.
    pub async fn enqueue_job(
        &self,
        job_type: JobType,
        payload: Payload,
        options: EnqueueOptions,
    ) -> Result<String> {
        let job_id = match options.job_id {
            Some(id) if id.is_empty() => {
                return Err(Error::Config("Job ID cannot be empty".to_string()));
            }
            Some(id) => id,
            None => uuid::Uuid::new_v4().to_string(),
        };

        let max_attempts = options
            .max_attempts
            .unwrap_or(self.config.default_max_attempts);
        if max_attempts == 0 {
            return Err(Error::Config(
                "Max attempts must be greater than 0".to_string(),
            ));
        }

        if let Some(existing) = self.get_job_status(&job_id).await? {
            if !existing.status.is_terminal() {
                log::debug!(
                    "Job {} is already queued ({}); not enqueueing again",
                    job_id,
                    existing.status
                );
                return Ok(job_id);
            }
        }

        let scheduled_at = offset(Utc::now(), options.delay).ok_or_else(|| {
            Error::Config(format!("Delay {:?} is out of range", options.delay))
        })?;

        let job = JobRecord::new(job_id, job_type, payload, scheduled_at, max_attempts);
        self.save_job(&job).await?;
        self.store
            .zadd(&self.ready_key(), &job.id, score(job.scheduled_at))
            .await?;

        log::info!(
            "Enqueued job {} (type: {}) with delay {:?}, max attempts {}",
            job.id,
            job.job_type,
            options.delay,
            job.max_attempts
        );

        Ok(job.id)
    }

    /// Up to `limit` jobs whose `scheduled_at` has passed, earliest first.
    ///
    /// Nothing is claimed; [`RetryQueue::process_job`] does that. Index entries whose
    /// record is gone are dropped, and unreadable records are dead-lettered, so they
    /// cannot hold up the jobs behind them.
    pub async fn get_ready_jobs(&self, limit: usize) -> Result<Vec<JobRecord>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let ids = self
            .store
            .zrange_by_score(&self.ready_key(), i64::MIN, score(now), limit)
            .await?;

        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            match self.get_job_status(&id).await {
                Ok(Some(job)) => jobs.push(job),
                Ok(None) => {
                    log::warn!("Ready job {} has no record; dropping it from the queue", id);
                    self.store.zrem(&self.ready_key(), &id).await?;
                }
                Err(Error::CorruptRecord(reason)) => {
                    log::error!("Job {} has an unreadable record ({}); dead-lettering it", id, reason);
                    if self.store.zrem(&self.ready_key(), &id).await? {
                        self.store
                            .zadd(&self.dead_letter_key(), &id, score(now))
                            .await?;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Ok(jobs)
    }

    /// Claim and run one job, returning `true` only if its processor succeeded.
    ///
    /// The claim moves the id from the ready set to the processing set atomically, and
    /// only while the job is due. A job seen by several workers runs once, and a stale
    /// copy of a rescheduled job does not run early; losers get `false` and do nothing.
    /// Processor failures and store errors are handled here and never returned to the
    /// caller.
    pub async fn process_job(&self, job: &JobRecord) -> bool {
        let claimed = match self
            .store
            .claim(&self.ready_key(), &self.processing_key(), &job.id, score(Utc::now()))
            .await
        {
            Ok(claimed) => claimed,
            Err(e) => {
                log::error!("Error claiming job {}: {}", job.id, e);
                return false;
            }
        };

        if !claimed {
            log::debug!("Job {} was claimed by another worker", job.id);
            return false;
        }

        match self.run_claimed(&job.id).await {
            Ok(success) => success,
            Err(e) => {
                log::error!("Store error while processing job {}: {}", job.id, e);
                false
            }
        }
    }

    async fn run_claimed(&self, job_id: &str) -> Result<bool> {
        // Reload: the caller's copy may predate another worker's update.
        let Some(mut job) = self.get_job_status(job_id).await? else {
            log::error!("Claimed job {} has no record; discarding it", job_id);
            self.store.zrem(&self.processing_key(), job_id).await?;
            return Ok(false);
        };

        if job.status.is_terminal() {
            log::warn!("Claimed job {} is already {}; skipping", job.id, job.status);
            self.store.zrem(&self.processing_key(), &job.id).await?;
            return Ok(false);
        }

        if !job.attempts_remaining() {
            let reason = ProcessError::fatal(format!(
                "no attempts left ({}/{})",
                job.attempt, job.max_attempts
            ));
            self.handle_failure(&mut job, reason).await?;
            return Ok(false);
        }

        let now = Utc::now();
        job.attempt += 1;
        job.status = JobStatus::Processing;
        job.last_attempt_at = Some(now);
        self.save_job(&job).await?;

        log::info!(
            "Processing job {} (type: {}, attempt {}/{})",
            job.id,
            job.job_type,
            job.attempt,
            job.max_attempts
        );

        let outcome = match self.processors.get(&job.job_type).await {
            Some(processor) => Self::invoke(processor, &job).await,
            None => {
                log::error!(
                    "No processor registered for job type '{}' (job: {})",
                    job.job_type,
                    job.id
                );
                Err(ProcessError::retryable(format!(
                    "no processor registered for job type {}",
                    job.job_type
                )))
            }
        };

        match outcome {
            Ok(()) => {
                self.mark_completed(&mut job).await?;
                Ok(true)
            }
            Err(reason) => {
                self.handle_failure(&mut job, reason).await?;
                Ok(false)
            }
        }
    }

    // The processor runs on its own task so a panic becomes an ordinary failure.
    async fn invoke(
        processor: Arc<dyn JobProcessor>,
        job: &JobRecord,
    ) -> std::result::Result<(), ProcessError> {
        let job = job.clone();
        match tokio::spawn(async move { processor.process(&job).await }).await {
            Ok(outcome) => outcome,
            Err(e) => Err(ProcessError::retryable(format!("processor panicked: {}", e))),
        }
    }

    async fn mark_completed(&self, job: &mut JobRecord) -> Result<()> {
        job.status = JobStatus::Completed;
        job.completed_at = Some(Utc::now());
        self.save_job(job).await?;
        self.store.zrem(&self.processing_key(), &job.id).await?;

        log::info!(
            "Job {} completed after {} attempt(s)",
            job.id,
            job.attempt
        );
        Ok(())
    }

    async fn handle_failure(&self, job: &mut JobRecord, reason: ProcessError) -> Result<()> {
        let now = Utc::now();
        job.status = JobStatus::Failed;
        job.last_error = Some(reason.message().to_string());
        job.last_attempt_at = Some(now);
        self.save_job(job).await?;
        self.store.zrem(&self.processing_key(), &job.id).await?;

        if reason.is_retryable() && job.attempts_remaining() {
            let delay = self.backoff.delay_for(job.attempt);
            job.scheduled_at = offset(now, delay).unwrap_or(DateTime::<Utc>::MAX_UTC);
            job.status = JobStatus::Pending;
            self.save_job(job).await?;
            self.store
                .zadd(&self.ready_key(), &job.id, score(job.scheduled_at))
                .await?;

            log::warn!(
                "Job {} failed: {}. Retrying in {:?} (attempt {}/{})",
                job.id,
                reason,
                delay,
                job.attempt,
                job.max_attempts
            );
        } else {
            job.status = JobStatus::Dead;
            self.save_job(job).await?;
            self.store
                .zadd(&self.dead_letter_key(), &job.id, score(now))
                .await?;

            log::error!(
                "Moving job {} (type: {}) to dead letter queue after {} attempt(s): {}",
                job.id,
                job.job_type,
                job.attempt,
                reason
            );
        }

        Ok(())
    }

    /// Current record of a job, or `None` if the id is unknown
    pub async fn get_job_status(&self, job_id: &str) -> Result<Option<JobRecord>> {
        let fields = self.store.hget_all(&self.job_key(job_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        JobRecord::from_fields(&fields).map(Some)
    }

    /// Get queue statistics for monitoring
    pub async fn get_queue_stats(&self) -> Result<QueueStats> {
        let pending = self.store.zcard(&self.ready_key()).await?;
        let processing = self.store.zcard(&self.processing_key()).await?;
        let dead_letter = self.store.zcard(&self.dead_letter_key()).await?;

        Ok(QueueStats {
            pending,
            processing,
            dead_letter,
            total: pending + processing + dead_letter,
        })
    }

    /// Remove dead-letter entries older than `older_than_hours`. Job records are kept.
    pub async fn cleanup_old_jobs(&self, older_than_hours: u64) -> Result<usize> {
        let age = Duration::from_secs(older_than_hours.saturating_mul(3600));
        let cutoff = chrono::Duration::from_std(age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let removed = self
            .store
            .zrem_range_by_score(&self.dead_letter_key(), i64::MIN, score(cutoff) - 1)
            .await?;

        log::info!(
            "Removed {} dead letter entries older than {} hours",
            removed,
            older_than_hours
        );
        Ok(removed)
    }

    /// Dead-lettered jobs, oldest first
    pub async fn list_dead_letter(&self, limit: usize) -> Result<Vec<JobRecord>> {
        let ids = self
            .store
            .zrange_by_score(&self.dead_letter_key(), i64::MIN, i64::MAX, limit)
            .await?;

        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(job) = self.get_job_status(&id).await? {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }

    /// Give a dead-lettered job a fresh set of attempts, runnable immediately.
    /// Returns `false` if the job is not in the dead-letter queue.
    pub async fn requeue_dead_job(&self, job_id: &str) -> Result<bool> {
        if !self.store.zrem(&self.dead_letter_key(), job_id).await? {
            return Ok(false);
        }

        let Some(mut job) = self.get_job_status(job_id).await? else {
            log::warn!("Dead letter entry {} has no record; dropped it", job_id);
            return Ok(false);
        };

        job.attempt = 0;
        job.status = JobStatus::Pending;
        job.scheduled_at = Utc::now();
        job.completed_at = None;
        self.save_job(&job).await?;
        self.store
            .zadd(&self.ready_key(), &job.id, score(job.scheduled_at))
            .await?;

        log::info!("Requeued dead letter job {} (type: {})", job.id, job.job_type);
        Ok(true)
    }

    /// Put jobs claimed more than `older_than` ago back on the ready set.
    ///
    /// A claim outlives its worker when the process dies mid-job or a store write fails
    /// after the processor ran. Without this those jobs would never run again. A job
    /// that is merely slow may be requeued too and run a second time; execution is
    /// at-least-once. The attempt it was on stays counted.
    pub async fn requeue_stale_processing(&self, older_than: Duration) -> Result<usize> {
        let now = Utc::now();
        let cutoff = chrono::Duration::from_std(older_than)
            .ok()
            .and_then(|age| now.checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let ids = self
            .store
            .zrange_by_score(&self.processing_key(), i64::MIN, score(cutoff), usize::MAX)
            .await?;

        let mut requeued = 0;
        for id in ids {
            // Whoever removes the entry owns the requeue.
            if !self.store.zrem(&self.processing_key(), &id).await? {
                continue;
            }

            let Some(mut job) = self.get_job_status(&id).await? else {
                log::warn!("Stale processing entry {} has no record; dropped it", id);
                continue;
            };
            if job.status.is_terminal() {
                continue;
            }

            job.status = JobStatus::Pending;
            job.scheduled_at = now;
            self.save_job(&job).await?;
            self.store
                .zadd(&self.ready_key(), &job.id, score(now))
                .await?;

            log::warn!(
                "Requeued job {} (type: {}) left in processing since before {}",
                job.id,
                job.job_type,
                cutoff
            );
            requeued += 1;
        }

        Ok(requeued)
    }

    /// Check health status of the queue system
    pub async fn health_check(&self) -> HealthStatus {
        let checked_at = Utc::now();

        let store_connected = match self.store.ping().await {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Job store health check failed: {}", e);
                false
            }
        };

        let stats = if store_connected {
            self.get_queue_stats().await.ok()
        } else {
            None
        };

        HealthStatus {
            store_connected,
            stats,
            checked_at,
        }
    }

    /// Clear the ready, processing and dead-letter indexes (useful for testing)
    pub async fn clear_all_queues(&self) -> Result<()> {
        self.store
            .delete(&[
                self.ready_key(),
                self.processing_key(),
                self.dead_letter_key(),
            ])
            .await
    }
}
