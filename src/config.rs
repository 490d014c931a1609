use std::{env, time::Duration};

use crate::backoff::BackoffPolicy;

/// Configuration for the retry queue, its worker and the idempotency layer
#[derive(Debug, Clone)]
pub struct RetryQueueConfig {
    pub redis_url: String,
    pub key_prefix: String,
    pub default_max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
    pub batch_size: usize,
    pub poll_interval: Duration,
    pub error_backoff: Duration,
    /// Claims older than this are considered abandoned and requeued by the worker
    pub processing_timeout: Duration,
    pub idempotency_ttl: Duration,
}

impl Default for RetryQueueConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "retryq".to_string(),
            default_max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300), // 5 minutes
            jitter: true,
            batch_size: 10,
            poll_interval: Duration::from_secs(1),
            error_backoff: Duration::from_secs(5),
            processing_timeout: Duration::from_secs(600),
            idempotency_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Builder for RetryQueueConfig
#[derive(Debug)]
pub struct RetryQueueConfigBuilder {
    config: RetryQueueConfig,
}

impl Default for RetryQueueConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryQueueConfigBuilder {
    /// Create a new config builder with default values
    pub fn new() -> Self {
        Self {
            config: RetryQueueConfig::default(),
        }
    }

    /// Set the Redis URL
    pub fn redis_url<S: Into<String>>(mut self, url: S) -> Self {
        self.config.redis_url = url.into();
        self
    }

    /// Set the prefix used for every store key
    pub fn key_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.config.key_prefix = prefix.into();
        self
    }

    /// Set the attempt cap used when a job does not specify its own
    pub fn default_max_attempts(mut self, max_attempts: u32) -> Self {
        self.config.default_max_attempts = max_attempts;
        self
    }

    /// Set the base delay for exponential backoff
    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.config.base_delay = delay;
        self
    }

    /// Set the maximum delay cap
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.config.max_delay = delay;
        self
    }

    /// Enable or disable jitter on retry delays
    pub fn jitter(mut self, jitter: bool) -> Self {
        self.config.jitter = jitter;
        self
    }

    /// Set the number of jobs a worker claims per tick
    pub fn batch_size(mut self, size: usize) -> Self {
        self.config.batch_size = size;
        self
    }

    /// Set the worker polling interval
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    /// Set how long the worker pauses after a store error
    pub fn error_backoff(mut self, backoff: Duration) -> Self {
        self.config.error_backoff = backoff;
        self
    }

    /// Set how long a claimed job may stay in processing before it is requeued
    pub fn processing_timeout(mut self, timeout: Duration) -> Self {
        self.config.processing_timeout = timeout;
        self
    }

    /// Set the default lifetime of idempotency keys and cached responses
    pub fn idempotency_ttl(mut self, ttl: Duration) -> Self {
        self.config.idempotency_ttl = ttl;
        self
    }

    /// Load configuration from environment variables
    pub fn from_env(mut self) -> Self {
        self.config = RetryQueueConfig::from_env();
        self
    }

    /// Validate and build the final configuration
    pub fn build_and_validate(self) -> Result<RetryQueueConfig, String> {
        self.config.validate()?;
        Ok(self.config)
    }

    /// Build the final configuration
    pub fn build(self) -> RetryQueueConfig {
        self.config
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = env::var(name).ok()?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("Ignoring unparsable value {:?} for {}", raw, name);
            None
        }
    }
}

impl RetryQueueConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = RetryQueueConfig::default();

        if let Ok(redis_url) = env::var("RETRYQ_REDIS_URL") {
            config.redis_url = redis_url;
        }

        if let Ok(prefix) = env::var("RETRYQ_KEY_PREFIX") {
            config.key_prefix = prefix;
        }

        if let Some(attempts) = env_parse::<u32>("RETRYQ_MAX_ATTEMPTS") {
            config.default_max_attempts = attempts;
        }

        if let Some(ms) = env_parse::<u64>("RETRYQ_BASE_DELAY_MS") {
            config.base_delay = Duration::from_millis(ms);
        }

        if let Some(secs) = env_parse::<u64>("RETRYQ_MAX_DELAY_SECS") {
            config.max_delay = Duration::from_secs(secs);
        }

        if let Some(jitter) = env_parse::<bool>("RETRYQ_JITTER") {
            config.jitter = jitter;
        }

        if let Some(size) = env_parse::<usize>("RETRYQ_BATCH_SIZE") {
            config.batch_size = size;
        }

        if let Some(ms) = env_parse::<u64>("RETRYQ_POLL_INTERVAL_MS") {
            config.poll_interval = Duration::from_millis(ms);
        }

        if let Some(secs) = env_parse::<u64>("RETRYQ_ERROR_BACKOFF_SECS") {
            config.error_backoff = Duration::from_secs(secs);
        }

        if let Some(secs) = env_parse::<u64>("RETRYQ_PROCESSING_TIMEOUT_SECS") {
            config.processing_timeout = Duration::from_secs(secs);
        }

        if let Some(secs) = env_parse::<u64>("RETRYQ_IDEMPOTENCY_TTL_SECS") {
            config.idempotency_ttl = Duration::from_secs(secs);
        }

        config
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), String> {
        if self.redis_url.is_empty() {
            return Err("Redis URL cannot be empty".to_string());
        }

        if self.key_prefix.is_empty() {
            return Err("Key prefix cannot be empty".to_string());
        }

        if self.default_max_attempts == 0 {
            return Err("Max attempts must be greater than 0".to_string());
        }

        if self.base_delay.is_zero() {
            return Err("Base delay must be greater than 0".to_string());
        }

        if self.max_delay < self.base_delay {
            return Err("Max delay must be greater than or equal to base delay".to_string());
        }

        if self.batch_size == 0 {
            return Err("Batch size must be greater than 0".to_string());
        }

        if self.poll_interval.is_zero() {
            return Err("Worker poll interval must be greater than 0".to_string());
        }

        if self.processing_timeout.is_zero() {
            return Err("Processing timeout must be greater than 0".to_string());
        }

        if self.idempotency_ttl.is_zero() {
            return Err("Idempotency TTL must be greater than 0".to_string());
        }

        Ok(())
    }

    /// Backoff policy derived from the delay settings
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base_delay: self.base_delay,
            max_delay: self.max_delay,
            jitter: self.jitter,
        }
    }
}
