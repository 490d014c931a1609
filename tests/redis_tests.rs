//! These tests need a Redis server at 127.0.0.1:6379. Run them with
//! `cargo test --test redis_tests -- --ignored`.

use retryq::{
    EnqueueOptions, IdempotencyManager, IdempotencyStore, JobStatus, JobStore, JobType, Payload,
    ProcessError, ProcessorRegistry, RedisIdempotencyStore, RedisStore, RetryQueue,
    RetryQueueConfigBuilder,
};
use serde_json::json;
use std::{collections::BTreeMap, sync::Arc, time::Duration};

const REDIS_URL: &str = "redis://127.0.0.1:6379";

fn test_prefix() -> String {
    format!("retryq-test-{}", uuid::Uuid::new_v4())
}

async fn setup_queue() -> (RetryQueue, Arc<RedisStore>) {
    let store = Arc::new(RedisStore::connect(REDIS_URL).await.unwrap());
    let config = RetryQueueConfigBuilder::new()
        .redis_url(REDIS_URL)
        .key_prefix(test_prefix())
        .base_delay(Duration::from_millis(1))
        .max_delay(Duration::from_millis(10))
        .jitter(false)
        .build();
    let queue = RetryQueue::new(config, store.clone(), Arc::new(ProcessorRegistry::new()));
    (queue, store)
}

#[tokio::test]
#[ignore = "requires a Redis server at 127.0.0.1:6379"]
async fn test_redis_ping() {
    let store = RedisStore::connect(REDIS_URL).await.unwrap();
    store.ping().await.unwrap();
}

#[tokio::test]
#[ignore = "requires a Redis server at 127.0.0.1:6379"]
async fn test_redis_claim_is_exclusive() {
    let store = RedisStore::connect(REDIS_URL).await.unwrap();
    let prefix = test_prefix();
    let ready = format!("{}:ready", prefix);
    let processing = format!("{}:processing", prefix);

    store.zadd(&ready, "job-1", 10).await.unwrap();
    store.zadd(&ready, "job-2", 1_000).await.unwrap();

    assert!(store.claim(&ready, &processing, "job-1", 20).await.unwrap());
    assert!(!store.claim(&ready, &processing, "job-1", 20).await.unwrap());
    // Not due until 1000
    assert!(!store.claim(&ready, &processing, "job-2", 20).await.unwrap());
    assert_eq!(store.zcard(&ready).await.unwrap(), 1);
    assert_eq!(store.zcard(&processing).await.unwrap(), 1);
    assert_eq!(
        store
            .zrange_by_score(&processing, 20, 20, 10)
            .await
            .unwrap(),
        vec!["job-1".to_string()]
    );

    store.delete(&[ready, processing]).await.unwrap();
}

#[tokio::test]
#[ignore = "requires a Redis server at 127.0.0.1:6379"]
async fn test_redis_job_lifecycle() {
    let (queue, _store) = setup_queue().await;
    let attempts = Arc::new(std::sync::atomic::AtomicU32::new(0));
    let counter = attempts.clone();

    queue
        .processors()
        .register_fn(JobType::SaveGeneration, move |_payload: Payload| {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0 {
                    Err(ProcessError::retryable("first attempt fails"))
                } else {
                    Ok(())
                }
            }
        })
        .await;

    let job_id = queue
        .enqueue_job(
            JobType::SaveGeneration,
            Payload::new(),
            EnqueueOptions::new().max_attempts(3),
        )
        .await
        .unwrap();

    for _ in 0..100 {
        for job in queue.get_ready_jobs(10).await.unwrap() {
            queue.process_job(&job).await;
        }
        let record = queue.get_job_status(&job_id).await.unwrap().unwrap();
        if record.status.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let record = queue.get_job_status(&job_id).await.unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Completed);
    assert_eq!(record.attempt, 2);

    let stats = queue.get_queue_stats().await.unwrap();
    assert_eq!(stats.total, 0);

    queue.clear_all_queues().await.unwrap();
}

#[tokio::test]
#[ignore = "requires a Redis server at 127.0.0.1:6379"]
async fn test_redis_idempotency_replay() {
    let store = RedisIdempotencyStore::connect(REDIS_URL, test_prefix())
        .await
        .unwrap();
    let manager = IdempotencyManager::new(Arc::new(store), Duration::from_secs(60));
    let request = json!({"project_id": "p-9"});

    assert!(manager
        .check_idempotency("save-p-9", &request)
        .await
        .unwrap()
        .is_none());
    manager
        .store_response("save-p-9", 200, json!({"saved": true}), BTreeMap::new(), None)
        .await
        .unwrap();

    let replay = manager
        .check_idempotency("save-p-9", &request)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(replay.response_data, json!({"saved": true}));
    assert!(manager
        .check_idempotency("save-p-9", &json!({"project_id": "p-10"}))
        .await
        .is_err());
}

#[tokio::test]
#[ignore = "requires a Redis server at 127.0.0.1:6379"]
async fn test_redis_set_if_absent() {
    let store = RedisIdempotencyStore::connect(REDIS_URL, test_prefix())
        .await
        .unwrap();
    let expires_at = chrono::Utc::now() + chrono::Duration::seconds(60);

    assert!(store
        .set_if_absent("k", "first".to_string(), expires_at)
        .await
        .unwrap());
    assert!(!store
        .set_if_absent("k", "second".to_string(), expires_at)
        .await
        .unwrap());
    assert_eq!(store.get("k").await.unwrap().as_deref(), Some("first"));
    store.delete("k").await.unwrap();
}

#[tokio::test]
#[ignore = "requires a Redis server at 127.0.0.1:6379"]
async fn test_redis_idempotency_values_expire() {
    let store = RedisIdempotencyStore::connect(REDIS_URL, test_prefix())
        .await
        .unwrap();
    let expires_at = chrono::Utc::now() + chrono::Duration::milliseconds(100);

    store.set("short", "v".to_string(), expires_at).await.unwrap();
    assert_eq!(store.get("short").await.unwrap().as_deref(), Some("v"));

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(store.get("short").await.unwrap(), None);
}
