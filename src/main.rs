use retryq::{
    EnqueueOptions, JobSystem, JobType, Payload, ProcessError, Result, RetryQueueConfig,
    TypedJob,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::signal;

static FLAKY_CALLS: AtomicU32 = AtomicU32::new(0);

#[derive(Serialize, Deserialize, Debug, Clone)]
struct SaveGeneration {
    generation_id: String,
    content: String,
    flaky: bool,
}

#[async_trait::async_trait]
impl TypedJob for SaveGeneration {
    fn job_type() -> JobType {
        JobType::SaveGeneration
    }

    async fn process(&self) -> std::result::Result<(), ProcessError> {
        println!("🔄 Saving generation {}", self.generation_id);

        // Simulate the downstream save call
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;

        if self.flaky && FLAKY_CALLS.fetch_add(1, Ordering::SeqCst) < 2 {
            println!("❌ Save of {} timed out", self.generation_id);
            return Err(ProcessError::retryable("downstream save timed out"));
        }

        println!(
            "✅ Saved generation {} ({} bytes)",
            self.generation_id,
            self.content.len()
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    println!("🚀 retryq demo");
    println!("==============");

    let system = JobSystem::builder()
        .config(RetryQueueConfig::from_env())
        .typed_processor::<SaveGeneration>()
        .processor_fn(JobType::CleanupCache, |payload: Payload| async move {
            println!("🧹 Cleaning cache with {:?}", payload.get("scope"));
            Ok::<(), ProcessError>(())
        })
        .build()
        .await?;

    let queue = system.queue();
    queue.clear_all_queues().await?;

    let jobs = vec![
        SaveGeneration {
            generation_id: "gen_1".to_string(),
            content: "This save will succeed".to_string(),
            flaky: false,
        },
        SaveGeneration {
            generation_id: "gen_2".to_string(),
            content: "This save fails twice, then succeeds".to_string(),
            flaky: true,
        },
    ];

    for job in &jobs {
        let job_id = queue
            .enqueue_typed(job, EnqueueOptions::new().job_id(job.generation_id.clone()))
            .await?;
        println!("📝 Enqueued job: {}", job_id);
    }

    let mut cleanup = Payload::new();
    cleanup.insert("scope".to_string(), serde_json::json!("generations"));
    let cleanup_id = queue
        .enqueue_job(
            JobType::CleanupCache,
            cleanup,
            EnqueueOptions::new().delay_seconds(5),
        )
        .await?;
    println!("📝 Enqueued delayed cleanup job: {}", cleanup_id);

    println!("📊 Queue stats: {:?}", queue.get_queue_stats().await?);

    println!("\n🔄 Starting worker...");
    println!("Note: Failed jobs will be retried with exponential backoff");
    println!("Press Ctrl+C to stop\n");

    system.start().await?;

    match signal::ctrl_c().await {
        Ok(()) => {
            println!("\n🛑 Received Ctrl+C signal. Shutting down gracefully...");
        }
        Err(err) => {
            eprintln!("Unable to listen for shutdown signal: {}", err);
        }
    }

    system.shutdown().await?;

    for job in &jobs {
        if let Some(record) = queue.get_job_status(&job.generation_id).await? {
            println!(
                "📋 {}: {} after {} attempt(s)",
                record.id, record.status, record.attempt
            );
        }
    }
    println!("📊 Queue stats: {:?}", queue.get_queue_stats().await?);

    println!("✅ Shutdown complete.");
    Ok(())
}
