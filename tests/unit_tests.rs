use chrono::Utc;
use retryq::{
    calculate_delay, idempotency::validate_key, request_hash, to_payload, Error, JobRecord,
    JobStatus, JobType, Payload, ProcessError, RetryQueueConfig, RetryQueueConfigBuilder,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;

#[test]
fn test_config_builder() {
    let config = RetryQueueConfigBuilder::new()
        .redis_url("redis://test:6379")
        .key_prefix("jobs")
        .default_max_attempts(10)
        .base_delay(Duration::from_secs(5))
        .max_delay(Duration::from_secs(600))
        .jitter(false)
        .batch_size(20)
        .poll_interval(Duration::from_millis(500))
        .error_backoff(Duration::from_secs(2))
        .idempotency_ttl(Duration::from_secs(60))
        .build();

    assert_eq!(config.redis_url, "redis://test:6379");
    assert_eq!(config.key_prefix, "jobs");
    assert_eq!(config.default_max_attempts, 10);
    assert_eq!(config.base_delay, Duration::from_secs(5));
    assert_eq!(config.max_delay, Duration::from_secs(600));
    assert!(!config.jitter);
    assert_eq!(config.batch_size, 20);
    assert_eq!(config.poll_interval, Duration::from_millis(500));
    assert_eq!(config.error_backoff, Duration::from_secs(2));
    assert_eq!(config.idempotency_ttl, Duration::from_secs(60));
}

#[test]
fn test_config_defaults() {
    let config = RetryQueueConfig::default();

    assert_eq!(config.redis_url, "redis://127.0.0.1:6379");
    assert_eq!(config.key_prefix, "retryq");
    assert_eq!(config.default_max_attempts, 3);
    assert_eq!(config.base_delay, Duration::from_secs(1));
    assert_eq!(config.max_delay, Duration::from_secs(300));
    assert!(config.jitter);
    assert_eq!(config.batch_size, 10);
    assert_eq!(config.poll_interval, Duration::from_secs(1));
    assert_eq!(config.error_backoff, Duration::from_secs(5));
    assert_eq!(config.processing_timeout, Duration::from_secs(600));
    assert_eq!(config.idempotency_ttl, Duration::from_secs(86_400));
    assert!(config.validate().is_ok());
}

#[test]
fn test_config_validation() {
    let no_attempts = RetryQueueConfigBuilder::new()
        .default_max_attempts(0)
        .build_and_validate();
    assert!(no_attempts.is_err());

    let inverted_delays = RetryQueueConfigBuilder::new()
        .base_delay(Duration::from_secs(10))
        .max_delay(Duration::from_secs(1))
        .build_and_validate();
    assert_eq!(
        inverted_delays.unwrap_err(),
        "Max delay must be greater than or equal to base delay"
    );

    let no_batch = RetryQueueConfigBuilder::new().batch_size(0).build_and_validate();
    assert!(no_batch.is_err());

    let empty_prefix = RetryQueueConfigBuilder::new().key_prefix("").build_and_validate();
    assert!(empty_prefix.is_err());

    let no_timeout = RetryQueueConfigBuilder::new()
        .processing_timeout(Duration::ZERO)
        .build_and_validate();
    assert_eq!(
        no_timeout.unwrap_err(),
        "Processing timeout must be greater than 0"
    );
}

#[test]
fn test_config_from_env() {
    std::env::set_var("RETRYQ_MAX_ATTEMPTS", "7");
    std::env::set_var("RETRYQ_BASE_DELAY_MS", "250");
    std::env::set_var("RETRYQ_JITTER", "false");
    std::env::set_var("RETRYQ_BATCH_SIZE", "not-a-number");

    let config = RetryQueueConfig::from_env();

    std::env::remove_var("RETRYQ_MAX_ATTEMPTS");
    std::env::remove_var("RETRYQ_BASE_DELAY_MS");
    std::env::remove_var("RETRYQ_JITTER");
    std::env::remove_var("RETRYQ_BATCH_SIZE");

    assert_eq!(config.default_max_attempts, 7);
    assert_eq!(config.base_delay, Duration::from_millis(250));
    assert!(!config.jitter);
    // Unparsable values fall back to the default
    assert_eq!(config.batch_size, 10);
}

#[test]
fn test_error_display() {
    let config_error = Error::Config("Invalid configuration".to_string());
    assert_eq!(
        config_error.to_string(),
        "Configuration error: Invalid configuration"
    );

    let conflict = Error::Conflict {
        key: "abc".to_string(),
    };
    assert_eq!(
        conflict.to_string(),
        "Idempotency conflict: key 'abc' was already used with a different request"
    );

    let worker_error = Error::Worker("Worker stopped".to_string());
    assert_eq!(worker_error.to_string(), "Worker error: Worker stopped");

    let unknown = Error::UnknownIdempotencyKey("k1".to_string());
    assert_eq!(
        unknown.to_string(),
        "Unknown or expired idempotency key: k1"
    );
}

#[test]
fn test_error_from_serde() {
    let serde_error = serde_json::from_str::<String>("invalid json").unwrap_err();
    let error: Error = serde_error.into();

    match error {
        Error::Serialization(_) => {} // Expected
        _ => panic!("Expected Serialization error"),
    }
}

#[test]
fn test_process_error_from_crate_error() {
    let error: ProcessError = Error::Connection("Redis down".to_string()).into();
    assert!(error.is_retryable());
    assert_eq!(error.message(), "Connection error: Redis down");

    assert!(!ProcessError::fatal("bad payload").is_retryable());
}

#[test]
fn test_backoff_doubles_until_capped() {
    let base = Duration::from_millis(100);
    let max = Duration::from_secs(1);

    assert_eq!(calculate_delay(0, base, max, false), Duration::from_millis(100));
    assert_eq!(calculate_delay(1, base, max, false), Duration::from_millis(200));
    assert_eq!(calculate_delay(3, base, max, false), Duration::from_millis(800));
    assert_eq!(calculate_delay(4, base, max, false), max);
    // 2^40 does not fit in u32; the cap still applies
    assert_eq!(calculate_delay(40, base, max, false), max);
}

#[test]
fn test_backoff_is_monotonic_and_bounded() {
    let base = Duration::from_millis(30);
    let max = Duration::from_secs(120);

    let mut previous = Duration::ZERO;
    for attempt in 0..64 {
        let delay = calculate_delay(attempt, base, max, false);
        assert!(delay >= previous, "delay shrank at attempt {}", attempt);
        assert!(delay <= max, "delay exceeded cap at attempt {}", attempt);
        previous = delay;
    }
}

#[test]
fn test_backoff_jitter_stays_within_ten_percent() {
    let base = Duration::from_millis(100);
    let max = Duration::from_secs(10);

    for _ in 0..200 {
        let delay = calculate_delay(2, base, max, true);
        assert!(delay >= Duration::from_millis(400));
        assert!(delay <= Duration::from_millis(440));
    }
}

#[test]
fn test_backoff_jitter_saturates_at_duration_max() {
    for _ in 0..20 {
        assert_eq!(
            calculate_delay(0, Duration::MAX, Duration::MAX, true),
            Duration::MAX
        );
    }

    let uncapped = calculate_delay(3, Duration::from_secs(1), Duration::MAX, true);
    assert!(uncapped >= Duration::from_secs(8));
    assert!(uncapped <= Duration::from_millis(8_800));
}

#[test]
fn test_job_type_names() {
    assert_eq!(JobType::SaveGeneration.as_str(), "SAVE_GENERATION");
    assert_eq!(JobType::from("SAVE_EPISODE"), JobType::SaveEpisode);
    assert_eq!(
        JobType::from("REINDEX"),
        JobType::Custom("REINDEX".to_string())
    );
    assert_eq!(
        serde_json::to_string(&JobType::SaveProject).unwrap(),
        "\"SAVE_PROJECT\""
    );
    assert_eq!(
        serde_json::from_str::<JobType>("\"CLEANUP_CACHE\"").unwrap(),
        JobType::CleanupCache
    );
}

#[test]
fn test_job_status_terminal_states() {
    assert!(JobStatus::Completed.is_terminal());
    assert!(JobStatus::Dead.is_terminal());
    assert!(!JobStatus::Pending.is_terminal());
    assert!(!JobStatus::Processing.is_terminal());
    assert!(!JobStatus::Failed.is_terminal());
    assert_eq!("DEAD".parse::<JobStatus>().unwrap(), JobStatus::Dead);
    assert!("LOST".parse::<JobStatus>().is_err());
}

#[derive(Serialize, Deserialize, Debug, PartialEq)]
struct SaveEpisode {
    episode_id: String,
    scenes: Vec<String>,
}

#[test]
fn test_job_record_fields_preserve_state() {
    let episode = SaveEpisode {
        episode_id: "ep-7".to_string(),
        scenes: vec!["intro".to_string(), "finale".to_string()],
    };
    let mut job = JobRecord::new(
        "job-1".to_string(),
        JobType::SaveEpisode,
        to_payload(&episode).unwrap(),
        Utc::now(),
        4,
    );
    job.attempt = 2;
    job.status = JobStatus::Pending;
    job.last_error = Some("downstream returned 503".to_string());
    job.last_attempt_at = Some(Utc::now());

    let fields: std::collections::HashMap<String, String> =
        job.to_fields().unwrap().into_iter().collect();
    let restored = JobRecord::from_fields(&fields).unwrap();

    assert_eq!(restored, job);
    assert_eq!(restored.decode_payload::<SaveEpisode>().unwrap(), episode);
}

#[test]
fn test_job_record_missing_field_is_corrupt() {
    let job = JobRecord::new(
        "job-2".to_string(),
        JobType::CleanupCache,
        Payload::new(),
        Utc::now(),
        1,
    );
    let mut fields: std::collections::HashMap<String, String> =
        job.to_fields().unwrap().into_iter().collect();
    fields.remove("attempt");

    match JobRecord::from_fields(&fields) {
        Err(Error::CorruptRecord(msg)) => assert!(msg.contains("attempt")),
        other => panic!("Expected CorruptRecord, got {:?}", other),
    }
}

#[test]
fn test_payload_must_be_an_object() {
    assert!(matches!(to_payload(&vec![1, 2, 3]), Err(Error::Config(_))));
}

#[test]
fn test_request_hash_ignores_key_order() {
    let a = json!({"title": "Pilot", "meta": {"lang": "en", "tags": ["a", "b"]}});
    let b = json!({"meta": {"tags": ["a", "b"], "lang": "en"}, "title": "Pilot"});
    let reordered_array = json!({"title": "Pilot", "meta": {"lang": "en", "tags": ["b", "a"]}});

    assert_eq!(request_hash(&a), request_hash(&b));
    assert_ne!(request_hash(&a), request_hash(&reordered_array));
    assert_eq!(request_hash(&a).len(), 64);
}

#[test]
fn test_idempotency_key_validation() {
    assert!(validate_key("3f0c9a8e-2d7b-4a57-9c3e-6f1f1e0b2a11").is_ok());
    assert!(validate_key("").is_err());
    assert!(validate_key("has space").is_err());
    assert!(validate_key(&"k".repeat(256)).is_err());
}
