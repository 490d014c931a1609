//! Request deduplication for mutating operations.
//!
//! A caller presents an idempotency key before doing work. The first time a key is
//! seen it is bound to a hash of the request body; later calls with the same key and
//! the same body get the cached response back (once one was stored), while a call
//! with the same key and a *different* body is rejected with [`Error::Conflict`].

use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::{
    collections::{hash_map::Entry, BTreeMap, HashMap},
    fmt::Write as _,
    sync::Arc,
    time::Duration,
};
use tokio::sync::Mutex;

const MAX_KEY_LEN: usize = 255;

/// A key bound to the request it was first used with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyKey {
    pub key: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub operation: Option<String>,
    pub request_hash: String,
}

impl IdempotencyKey {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// The outcome of an operation, replayed verbatim for repeated requests
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotentResponse {
    pub key: String,
    pub status_code: u16,
    pub response_data: Value,
    pub headers: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl IdempotentResponse {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Key/value storage with expiry used by [`IdempotencyManager`]
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Read a value. Expired values read as `None`.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: String, expires_at: DateTime<Utc>) -> Result<()>;

    /// Write a value only if no live value exists, as one atomic step.
    /// Returns `true` if this call wrote it.
    async fn set_if_absent(
        &self,
        key: &str,
        value: String,
        expires_at: DateTime<Utc>,
    ) -> Result<bool>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Drop every entry that expired at or before `now`, returning how many were dropped
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize>;
}

/// Single-process idempotency store. Replays only work when every request for a key
/// reaches the same process; use [`crate::RedisIdempotencyStore`] otherwise.
#[derive(Default)]
pub struct MemoryIdempotencyStore {
    entries: Mutex<HashMap<String, (String, DateTime<Utc>)>>,
}

impl MemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdempotencyStore for MemoryIdempotencyStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Utc::now();
        let entries = self.entries.lock().await;
        Ok(entries
            .get(key)
            .filter(|(_, expires_at)| *expires_at > now)
            .map(|(value, _)| value.clone()))
    }

    async fn set(&self, key: &str, value: String, expires_at: DateTime<Utc>) -> Result<()> {
        self.entries
            .lock()
            .await
            .insert(key.to_string(), (value, expires_at));
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: String,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let now = Utc::now();
        if expires_at <= now {
            return Ok(false);
        }

        let mut entries = self.entries.lock().await;
        match entries.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                if entry.get().1 > now {
                    return Ok(false);
                }
                entry.insert((value, expires_at));
            }
            Entry::Vacant(entry) => {
                entry.insert((value, expires_at));
            }
        }
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, (_, expires_at)| *expires_at > now);
        Ok(before - entries.len())
    }
}

/// Stable hash of a request body. Object keys are sorted first, so two bodies that
/// differ only in key order hash the same; array order still matters.
pub fn request_hash(request_data: &Value) -> String {
    let mut canonical = String::new();
    write_canonical(request_data, &mut canonical);
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (key, value)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                let _ = write!(out, "{}:", Value::String(key.clone()));
                write_canonical(value, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => {
            let _ = write!(out, "{}", scalar);
        }
    }
}

/// Keys are limited to visible ASCII so they can travel in an HTTP header unchanged.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::InvalidIdempotencyKey("key cannot be empty".to_string()));
    }

    if key.len() > MAX_KEY_LEN {
        return Err(Error::InvalidIdempotencyKey(format!(
            "key is longer than {} characters",
            MAX_KEY_LEN
        )));
    }

    if !key.chars().all(|c| c.is_ascii_graphic()) {
        return Err(Error::InvalidIdempotencyKey(
            "key must contain only visible ASCII characters".to_string(),
        ));
    }

    Ok(())
}

fn expiry(now: DateTime<Utc>, ttl: Duration) -> Result<DateTime<Utc>> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .ok_or_else(|| Error::Config(format!("TTL {:?} is out of range", ttl)))
}

/// Issues keys, detects conflicting reuse and caches responses for replay
pub struct IdempotencyManager {
    store: Arc<dyn IdempotencyStore>,
    default_ttl: Duration,
}

impl IdempotencyManager {
    pub fn new(store: Arc<dyn IdempotencyStore>, default_ttl: Duration) -> Self {
        Self { store, default_ttl }
    }

    /// Manager over a fresh in-process store
    pub fn in_memory(default_ttl: Duration) -> Self {
        Self::new(Arc::new(MemoryIdempotencyStore::new()), default_ttl)
    }

    fn key_slot(key: &str) -> String {
        format!("key:{}", key)
    }

    fn response_slot(key: &str) -> String {
        format!("response:{}", key)
    }

    async fn load<T: DeserializeOwned>(&self, slot: &str) -> Result<Option<T>> {
        match self.store.get(slot).await? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| Error::CorruptRecord(format!("{}: {}", slot, e))),
            None => Ok(None),
        }
    }

    async fn save_key(&self, record: &IdempotencyKey) -> Result<()> {
        self.store
            .set(
                &Self::key_slot(&record.key),
                serde_json::to_string(record)?,
                record.expires_at,
            )
            .await
    }

    /// Look up a key that has not expired yet
    pub async fn get_key(&self, key: &str) -> Result<Option<IdempotencyKey>> {
        let now = Utc::now();
        let record: Option<IdempotencyKey> = self.load(&Self::key_slot(key)).await?;
        Ok(record.filter(|record| !record.is_expired(now)))
    }

    /// Look up a cached response that has not expired yet
    pub async fn get_response(&self, key: &str) -> Result<Option<IdempotentResponse>> {
        let now = Utc::now();
        let response: Option<IdempotentResponse> = self.load(&Self::response_slot(key)).await?;
        Ok(response.filter(|response| !response.is_expired(now)))
    }

    /// Generate a new key bound to `request_data`
    pub async fn create_key(
        &self,
        operation: Option<&str>,
        request_data: &Value,
        ttl: Option<Duration>,
    ) -> Result<IdempotencyKey> {
        let now = Utc::now();
        let record = IdempotencyKey {
            key: uuid::Uuid::new_v4().to_string(),
            created_at: now,
            expires_at: expiry(now, ttl.unwrap_or(self.default_ttl))?,
            operation: operation.map(str::to_string),
            request_hash: request_hash(request_data),
        };

        self.save_key(&record).await?;
        log::debug!(
            "Created idempotency key {} for operation {:?}",
            record.key,
            record.operation
        );
        Ok(record)
    }

    /// Decide whether a request may run.
    ///
    /// `Ok(Some(response))` means the request already ran and its response should be
    /// replayed. `Ok(None)` means the caller should execute it and then call
    /// [`IdempotencyManager::store_response`]; an unknown key is bound to this request
    /// first. A live key bound to a different request is an [`Error::Conflict`].
    pub async fn check_idempotency(
        &self,
        key: &str,
        request_data: &Value,
    ) -> Result<Option<IdempotentResponse>> {
        validate_key(key)?;
        let hash = request_hash(request_data);

        let record = match self.get_key(key).await? {
            Some(record) => record,
            None => {
                let now = Utc::now();
                let candidate = IdempotencyKey {
                    key: key.to_string(),
                    created_at: now,
                    expires_at: expiry(now, self.default_ttl)?,
                    operation: None,
                    request_hash: hash.clone(),
                };
                let registered = self
                    .store
                    .set_if_absent(
                        &Self::key_slot(key),
                        serde_json::to_string(&candidate)?,
                        candidate.expires_at,
                    )
                    .await?;
                if registered {
                    log::debug!("Registered idempotency key {}", key);
                    return Ok(None);
                }

                // Another caller registered the key first; judge against its request.
                self.get_key(key).await?.ok_or_else(|| Error::Conflict {
                    key: key.to_string(),
                })?
            }
        };

        if record.request_hash != hash {
            log::warn!(
                "Idempotency key {} reused with a different request (operation {:?})",
                key,
                record.operation
            );
            return Err(Error::Conflict {
                key: key.to_string(),
            });
        }

        let response = self.get_response(key).await?;
        if response.is_some() {
            log::debug!("Replaying cached response for idempotency key {}", key);
        }
        Ok(response)
    }

    /// Cache the outcome of the request bound to `key`.
    ///
    /// Only the first response for a key is cached. Later calls return that one unchanged.
    pub async fn store_response(
        &self,
        key: &str,
        status_code: u16,
        response_data: Value,
        headers: BTreeMap<String, String>,
        ttl: Option<Duration>,
    ) -> Result<IdempotentResponse> {
        validate_key(key)?;
        let mut record = self
            .get_key(key)
            .await?
            .ok_or_else(|| Error::UnknownIdempotencyKey(key.to_string()))?;

        let now = Utc::now();
        let response = IdempotentResponse {
            key: key.to_string(),
            status_code,
            response_data,
            headers,
            created_at: now,
            expires_at: expiry(now, ttl.unwrap_or(self.default_ttl))?,
        };

        let stored = self
            .store
            .set_if_absent(
                &Self::response_slot(key),
                serde_json::to_string(&response)?,
                response.expires_at,
            )
            .await?;
        if !stored {
            // First response wins; later ones are not cached.
            if let Some(existing) = self.get_response(key).await? {
                log::debug!(
                    "Idempotency key {} already has a cached response; keeping it",
                    key
                );
                return Ok(existing);
            }
        }

        // The response is only reachable through its key, so the key must live as long.
        if record.expires_at < response.expires_at {
            record.expires_at = response.expires_at;
            self.save_key(&record).await?;
        }

        log::debug!("Stored response {} for idempotency key {}", status_code, key);
        Ok(response)
    }

    /// Purge expired keys and responses, returning how many stored entries were removed
    pub async fn cleanup_expired(&self) -> Result<usize> {
        let removed = self.store.purge_expired(Utc::now()).await?;
        if removed > 0 {
            log::info!("Purged {} expired idempotency entries", removed);
        }
        Ok(removed)
    }
}
