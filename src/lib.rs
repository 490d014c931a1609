//! # retryq - Durable Background Jobs with Idempotency
//!
//! Side-effecting work (saving generated content to a downstream service, cache
//! cleanup, ...) is enqueued as a job, persisted in a shared store, and run by a
//! polling worker. Failed runs are retried with capped exponential backoff and
//! jitter; jobs that exhaust their attempts land in a dead-letter queue for manual
//! reprocessing. Execution is at-least-once, so processors must tolerate running
//! twice: [`IdempotencyManager`] deduplicates requests by key, and
//! [`IdempotentProcessor`] applies it per job.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use retryq::{JobSystem, JobType, ProcessError, TypedJob};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize, Debug)]
//! struct SaveGeneration {
//!     generation_id: String,
//!     content: String,
//! }
//!
//! #[async_trait::async_trait]
//! impl TypedJob for SaveGeneration {
//!     fn job_type() -> JobType {
//!         JobType::SaveGeneration
//!     }
//!
//!     async fn process(&self) -> Result<(), ProcessError> {
//!         // Call the downstream save API here
//!         println!("Saving generation {}", self.generation_id);
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> retryq::Result<()> {
//!     let system = JobSystem::builder()
//!         .redis_url("redis://localhost:6379")
//!         .max_attempts(3)
//!         .typed_processor::<SaveGeneration>()
//!         .build()
//!         .await?;
//!
//!     let job = SaveGeneration {
//!         generation_id: "gen-1".to_string(),
//!         content: "Once upon a time".to_string(),
//!     };
//!     system.queue().enqueue_typed(&job, Default::default()).await?;
//!
//!     system.start().await?;
//!     tokio::signal::ctrl_c().await.ok();
//!     system.shutdown().await
//! }
//! ```

pub mod backoff;
pub mod config;
pub mod error;
pub mod idempotency;
pub mod job;
pub mod processor;
pub mod queue;
pub mod store;
pub mod store_redis;
pub mod system;
pub mod worker;

pub use backoff::{calculate_delay, BackoffPolicy};
pub use config::{RetryQueueConfig, RetryQueueConfigBuilder};
pub use error::{Error, Result};
pub use idempotency::{
    request_hash, IdempotencyKey, IdempotencyManager, IdempotencyStore, IdempotentResponse,
    MemoryIdempotencyStore,
};
pub use job::{to_payload, JobRecord, JobStatus, JobType, Payload, TypedJob};
pub use processor::{
    FnProcessor, IdempotentProcessor, JobProcessor, ProcessError, ProcessorRegistry,
    TypedProcessor,
};
pub use queue::{EnqueueOptions, HealthStatus, QueueStats, RetryQueue};
pub use store::{JobStore, MemoryStore};
pub use store_redis::{RedisIdempotencyStore, RedisStore};
pub use system::{JobSystem, JobSystemBuilder};
pub use worker::{Worker, WorkerHandle};

// Re-export commonly used types
pub use serde_json::Value as JsonValue;
