use crate::{
    error::Error,
    idempotency::IdempotencyManager,
    job::{JobRecord, JobType, Payload, TypedJob},
};
use async_trait::async_trait;
use std::{collections::HashMap, fmt, future::Future, marker::PhantomData, sync::Arc};
use tokio::sync::RwLock;

/// Why a processor could not finish a job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessError {
    /// Worth trying again after a backoff delay
    Retryable(String),
    /// Will never succeed; the job goes straight to the dead-letter queue
    Fatal(String),
}

impl ProcessError {
    pub fn retryable<S: Into<String>>(msg: S) -> Self {
        ProcessError::Retryable(msg.into())
    }

    pub fn fatal<S: Into<String>>(msg: S) -> Self {
        ProcessError::Fatal(msg.into())
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ProcessError::Retryable(_))
    }

    pub fn message(&self) -> &str {
        match self {
            ProcessError::Retryable(msg) | ProcessError::Fatal(msg) => msg,
        }
    }
}

impl fmt::Display for ProcessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessError::Retryable(msg) => write!(f, "retryable failure: {}", msg),
            ProcessError::Fatal(msg) => write!(f, "fatal failure: {}", msg),
        }
    }
}

impl std::error::Error for ProcessError {}

impl From<Error> for ProcessError {
    fn from(err: Error) -> Self {
        ProcessError::Retryable(err.to_string())
    }
}

/// Performs the side effect for one job type
#[async_trait]
pub trait JobProcessor: Send + Sync {
    /// Process a job. The processor must not mutate queue state itself.
    async fn process(&self, job: &JobRecord) -> Result<(), ProcessError>;
}

/// Adapts an async closure over the job payload into a processor
pub struct FnProcessor<F> {
    handler: F,
}

impl<F> FnProcessor<F> {
    pub fn new(handler: F) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl<F, Fut> JobProcessor for FnProcessor<F>
where
    F: Fn(Payload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), ProcessError>> + Send + 'static,
{
    async fn process(&self, job: &JobRecord) -> Result<(), ProcessError> {
        (self.handler)(job.payload.clone()).await
    }
}

/// A processor that decodes the payload into `T` and runs [`TypedJob::process`]
pub struct TypedProcessor<T>
where
    T: TypedJob,
{
    _phantom: PhantomData<T>,
}

impl<T> TypedProcessor<T>
where
    T: TypedJob,
{
    pub fn new() -> Self {
        Self {
            _phantom: PhantomData,
        }
    }
}

impl<T> Default for TypedProcessor<T>
where
    T: TypedJob,
{
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T> JobProcessor for TypedProcessor<T>
where
    T: TypedJob,
{
    async fn process(&self, job: &JobRecord) -> Result<(), ProcessError> {
        // A payload that does not decode now never will.
        let typed: T = job
            .decode_payload()
            .map_err(|e| ProcessError::fatal(format!("undecodable {} payload: {}", job.job_type, e)))?;
        typed.process().await
    }
}

/// Guards a processor with an idempotency key derived from the job id, so a job that
/// already completed is not executed again when it is delivered a second time.
pub struct IdempotentProcessor<P> {
    inner: P,
    idempotency: Arc<IdempotencyManager>,
}

impl<P> IdempotentProcessor<P> {
    pub fn new(inner: P, idempotency: Arc<IdempotencyManager>) -> Self {
        Self { inner, idempotency }
    }

    fn key_for(job: &JobRecord) -> String {
        format!("job-{}", job.id)
    }
}

#[async_trait]
impl<P> JobProcessor for IdempotentProcessor<P>
where
    P: JobProcessor,
{
    async fn process(&self, job: &JobRecord) -> Result<(), ProcessError> {
        let key = Self::key_for(job);
        let request = serde_json::to_value(&job.payload).map_err(Error::from)?;

        match self.idempotency.check_idempotency(&key, &request).await {
            Ok(Some(_)) => {
                log::info!("Job {} already completed under key {}; skipping", job.id, key);
                return Ok(());
            }
            Ok(None) => {}
            Err(e @ Error::Conflict { .. }) => return Err(ProcessError::fatal(e.to_string())),
            Err(e) => return Err(e.into()),
        }

        self.inner.process(job).await?;

        let outcome = serde_json::json!({ "job_id": job.id, "job_type": job.job_type });
        if let Err(e) = self
            .idempotency
            .store_response(&key, 200, outcome, Default::default(), None)
            .await
        {
            log::warn!("Job {} succeeded but its outcome was not cached: {}", job.id, e);
        }

        Ok(())
    }
}

/// Maps job types to the processors that run them
#[derive(Default)]
pub struct ProcessorRegistry {
    processors: RwLock<HashMap<JobType, Arc<dyn JobProcessor>>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the processor for a job type, replacing any previous one
    pub async fn register_processor<P>(&self, job_type: JobType, processor: P)
    where
        P: JobProcessor + 'static,
    {
        self.register_arc(job_type, Arc::new(processor)).await;
    }

    pub async fn register_arc(&self, job_type: JobType, processor: Arc<dyn JobProcessor>) {
        let mut processors = self.processors.write().await;
        if processors.insert(job_type.clone(), processor).is_some() {
            log::warn!("Replaced existing processor for job type {}", job_type);
        } else {
            log::debug!("Registered processor for job type {}", job_type);
        }
    }

    /// Register an async closure over the payload as the processor for a job type
    pub async fn register_fn<F, Fut>(&self, job_type: JobType, handler: F)
    where
        F: Fn(Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), ProcessError>> + Send + 'static,
    {
        self.register_processor(job_type, FnProcessor::new(handler))
            .await;
    }

    pub async fn get(&self, job_type: &JobType) -> Option<Arc<dyn JobProcessor>> {
        self.processors.read().await.get(job_type).cloned()
    }

    pub async fn job_types(&self) -> Vec<JobType> {
        let mut types: Vec<JobType> = self.processors.read().await.keys().cloned().collect();
        types.sort();
        types
    }
}
