use crate::{
    error::{Error, Result},
    idempotency::IdempotencyStore,
    store::JobStore,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{aio::MultiplexedConnection, AsyncCommands, Client};
use std::collections::HashMap;

/// Moves a due member from the ready sorted set into the processing sorted set,
/// scored by the claim time. Running every step in one script keeps two workers from
/// claiming the same job, and keeps a stale copy from claiming a rescheduled one.
const CLAIM_SCRIPT: &str = r#"
    local ready_key = KEYS[1]
    local processing_key = KEYS[2]
    local member = ARGV[1]
    local now = tonumber(ARGV[2])

    local score = redis.call('ZSCORE', ready_key, member)
    if not score or tonumber(score) > now then
        return 0
    end

    redis.call('ZREM', ready_key, member)
    redis.call('ZADD', processing_key, now, member)
    return 1
"#;

async fn connect(redis_url: &str) -> Result<MultiplexedConnection> {
    let client = Client::open(redis_url)
        .map_err(|e| Error::Connection(format!("Failed to create Redis client: {}", e)))?;

    client
        .get_multiplexed_async_connection()
        .await
        .map_err(|e| Error::Connection(format!("Failed to connect to Redis: {}", e)))
}

/// Job store backed by Redis, shareable between processes
#[derive(Clone)]
pub struct RedisStore {
    connection: MultiplexedConnection,
}

impl RedisStore {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        Ok(Self::from_connection(connect(redis_url).await?))
    }

    pub fn from_connection(connection: MultiplexedConnection) -> Self {
        Self { connection }
    }

    /// A handle onto the shared connection; multiplexed handles are cheap to clone
    pub fn connection(&self) -> MultiplexedConnection {
        self.connection.clone()
    }
}

#[async_trait]
impl JobStore for RedisStore {
    async fn hset_all(&self, key: &str, fields: &[(String, String)]) -> Result<()> {
        let mut conn = self.connection();
        let _: () = conn.hset_multiple(key, fields).await?;
        Ok(())
    }

    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut conn = self.connection();
        let fields: HashMap<String, String> = conn.hgetall(key).await?;
        Ok(fields)
    }

    async fn zadd(&self, key: &str, member: &str, score: i64) -> Result<()> {
        let mut conn = self.connection();
        let _: () = conn.zadd(key, member, score).await?;
        Ok(())
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: i64,
        max: i64,
        limit: usize,
    ) -> Result<Vec<String>> {
        let mut conn = self.connection();
        let members: Vec<String> = conn
            .zrangebyscore_limit(key, min, max, 0, isize::try_from(limit).unwrap_or(-1))
            .await?;
        Ok(members)
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.connection();
        let removed: i64 = conn.zrem(key, member).await?;
        Ok(removed > 0)
    }

    async fn zcard(&self, key: &str) -> Result<usize> {
        let mut conn = self.connection();
        let size: usize = conn.zcard(key).await?;
        Ok(size)
    }

    async fn zrem_range_by_score(&self, key: &str, min: i64, max: i64) -> Result<usize> {
        let mut conn = self.connection();
        let removed: usize = conn.zrembyscore(key, min, max).await?;
        Ok(removed)
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection();
        let _: () = conn.del(keys).await?;
        Ok(())
    }

    async fn claim(&self, from: &str, to: &str, member: &str, now: i64) -> Result<bool> {
        let mut conn = self.connection();
        let claimed: i64 = redis::cmd("EVAL")
            .arg(CLAIM_SCRIPT)
            .arg(2) // Number of keys
            .arg(from) // KEYS[1]
            .arg(to) // KEYS[2]
            .arg(member) // ARGV[1]
            .arg(now) // ARGV[2]
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::Worker(format!("Failed to claim job {}: {}", member, e)))?;
        Ok(claimed == 1)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

/// Idempotency store backed by Redis string keys with a TTL, for multi-instance deployments
#[derive(Clone)]
pub struct RedisIdempotencyStore {
    connection: MultiplexedConnection,
    prefix: String,
}

impl RedisIdempotencyStore {
    pub async fn connect(redis_url: &str, prefix: impl Into<String>) -> Result<Self> {
        Ok(Self::from_connection(connect(redis_url).await?, prefix))
    }

    pub fn from_connection(connection: MultiplexedConnection, prefix: impl Into<String>) -> Self {
        Self {
            connection,
            prefix: prefix.into(),
        }
    }

    fn redis_key(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }
}

#[async_trait]
impl IdempotencyStore for RedisIdempotencyStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection.clone();
        let value: Option<String> = conn.get(self.redis_key(key)).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: String, expires_at: DateTime<Utc>) -> Result<()> {
        let ttl_ms = (expires_at - Utc::now()).num_milliseconds();
        if ttl_ms <= 0 {
            return self.delete(key).await;
        }

        let mut conn = self.connection.clone();
        let _: () = conn
            .pset_ex(self.redis_key(key), value, ttl_ms as u64)
            .await?;
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: String,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let ttl_ms = (expires_at - Utc::now()).num_milliseconds();
        if ttl_ms <= 0 {
            return Ok(false);
        }

        let mut conn = self.connection.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.redis_key(key))
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.connection.clone();
        let _: () = conn.del(self.redis_key(key)).await?;
        Ok(())
    }

    async fn purge_expired(&self, _now: DateTime<Utc>) -> Result<usize> {
        // Redis drops keys once their TTL runs out.
        Ok(0)
    }
}
