use crate::{
    config::RetryQueueConfig,
    error::{Error, Result},
    idempotency::{IdempotencyManager, IdempotencyStore, MemoryIdempotencyStore},
    job::{JobType, Payload, TypedJob},
    processor::{
        FnProcessor, IdempotentProcessor, JobProcessor, ProcessError, ProcessorRegistry,
        TypedProcessor,
    },
    queue::RetryQueue,
    store::{JobStore, MemoryStore},
    store_redis::{RedisIdempotencyStore, RedisStore},
    worker::{Worker, WorkerHandle},
};
use std::{future::Future, sync::Arc, time::Duration};
use tokio::sync::Mutex;

type ProcessorFactory = Box<dyn FnOnce(&Arc<IdempotencyManager>) -> Arc<dyn JobProcessor> + Send>;

/// Process-wide job machinery: the queue, its worker and the idempotency manager.
///
/// Build it once at startup, share the `Arc` with whatever enqueues jobs or guards
/// requests, and call [`JobSystem::shutdown`] before exiting.
pub struct JobSystem {
    queue: Arc<RetryQueue>,
    idempotency: Arc<IdempotencyManager>,
    worker: Mutex<Option<WorkerHandle>>,
}

impl JobSystem {
    pub fn builder() -> JobSystemBuilder {
        JobSystemBuilder::new()
    }

    pub fn queue(&self) -> &Arc<RetryQueue> {
        &self.queue
    }

    pub fn idempotency(&self) -> &Arc<IdempotencyManager> {
        &self.idempotency
    }

    /// Start the background worker
    pub async fn start(&self) -> Result<()> {
        let mut worker = self.worker.lock().await;
        if worker.is_some() {
            return Err(Error::Worker("Worker is already running".to_string()));
        }

        *worker = Some(Worker::new(Arc::clone(&self.queue)).spawn());
        log::info!(
            "Job system started with processors for {:?}",
            self.queue.processors().job_types().await
        );
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.worker
            .lock()
            .await
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Stop the worker after its current batch. Does nothing if it is not running.
    pub async fn shutdown(&self) -> Result<()> {
        let Some(handle) = self.worker.lock().await.take() else {
            return Ok(());
        };

        handle.shutdown().await?;
        log::info!("Job system stopped");
        Ok(())
    }
}

/// Builder for JobSystem
pub struct JobSystemBuilder {
    config: RetryQueueConfig,
    job_store: Option<Arc<dyn JobStore>>,
    idempotency_store: Option<Arc<dyn IdempotencyStore>>,
    processors: Vec<(JobType, ProcessorFactory)>,
}

impl Default for JobSystemBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl JobSystemBuilder {
    pub fn new() -> Self {
        Self {
            config: RetryQueueConfig::default(),
            job_store: None,
            idempotency_store: None,
            processors: Vec::new(),
        }
    }

    /// Replace the whole configuration
    pub fn config(mut self, config: RetryQueueConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the Redis URL
    pub fn redis_url<S: Into<String>>(mut self, url: S) -> Self {
        self.config.redis_url = url.into();
        self
    }

    /// Set the default attempt cap for jobs
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.config.default_max_attempts = max_attempts;
        self
    }

    /// Set the base delay for exponential backoff
    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.config.base_delay = delay;
        self
    }

    /// Set the maximum retry delay cap
    pub fn max_retry_delay(mut self, delay: Duration) -> Self {
        self.config.max_delay = delay;
        self
    }

    /// Set the worker polling interval
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    /// Use a specific job store instead of connecting to `redis_url`
    pub fn job_store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.job_store = Some(store);
        self
    }

    /// Use a specific idempotency store instead of connecting to `redis_url`
    pub fn idempotency_store(mut self, store: Arc<dyn IdempotencyStore>) -> Self {
        self.idempotency_store = Some(store);
        self
    }

    /// Keep all state in process memory. Only for single-process deployments and tests.
    pub fn in_memory(self) -> Self {
        self.job_store(Arc::new(MemoryStore::new()))
            .idempotency_store(Arc::new(MemoryIdempotencyStore::new()))
    }

    /// Add a job processor
    pub fn processor<P>(mut self, job_type: JobType, processor: P) -> Self
    where
        P: JobProcessor + 'static,
    {
        let processor: Arc<dyn JobProcessor> = Arc::new(processor);
        self.processors
            .push((job_type, Box::new(move |_: &Arc<IdempotencyManager>| processor)));
        self
    }

    /// Add an async closure over the payload as a job processor
    pub fn processor_fn<F, Fut>(self, job_type: JobType, handler: F) -> Self
    where
        F: Fn(Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<(), ProcessError>> + Send + 'static,
    {
        self.processor(job_type, FnProcessor::new(handler))
    }

    /// Add the processor for a typed job
    pub fn typed_processor<T>(self) -> Self
    where
        T: TypedJob + 'static,
    {
        self.processor(T::job_type(), TypedProcessor::<T>::new())
    }

    /// Add a processor whose runs are deduplicated per job id through the
    /// system's idempotency manager
    pub fn idempotent_processor<P>(mut self, job_type: JobType, processor: P) -> Self
    where
        P: JobProcessor + 'static,
    {
        self.processors.push((
            job_type,
            Box::new(move |idempotency: &Arc<IdempotencyManager>| {
                Arc::new(IdempotentProcessor::new(processor, Arc::clone(idempotency)))
                    as Arc<dyn JobProcessor>
            }),
        ));
        self
    }

    /// Validate the configuration, connect any stores not supplied, and register processors
    pub async fn build(self) -> Result<Arc<JobSystem>> {
        self.config.validate().map_err(Error::Config)?;

        let (job_store, idempotency_store) = match (self.job_store, self.idempotency_store) {
            (Some(jobs), Some(keys)) => (jobs, keys),
            (jobs, keys) => {
                let redis = RedisStore::connect(&self.config.redis_url).await?;
                let idempotency_prefix = format!("{}:idempotency", self.config.key_prefix);
                let keys = keys.unwrap_or_else(|| {
                    Arc::new(RedisIdempotencyStore::from_connection(
                        redis.connection(),
                        idempotency_prefix,
                    ))
                });
                let jobs = jobs.unwrap_or_else(|| Arc::new(redis));
                (jobs, keys)
            }
        };

        let idempotency = Arc::new(IdempotencyManager::new(
            idempotency_store,
            self.config.idempotency_ttl,
        ));

        let registry = Arc::new(ProcessorRegistry::new());
        for (job_type, factory) in self.processors {
            registry.register_arc(job_type, factory(&idempotency)).await;
        }

        let queue = Arc::new(RetryQueue::new(self.config, job_store, registry));

        Ok(Arc::new(JobSystem {
            queue,
            idempotency,
            worker: Mutex::new(None),
        }))
    }
}
