//! Storage primitives used by the retry queue.
//!
//! The queue only ever talks to its backing store through [`JobStore`]: hashes for
//! job records and sorted sets for the time-ordered indexes.
//! [`MemoryStore`] keeps everything in process; [`crate::RedisStore`] shares state
//! between processes.

use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Write every field of a hash, replacing existing values
    async fn hset_all(&self, key: &str, fields: &[(String, String)]) -> Result<()>;

    /// Read a whole hash. A missing key yields an empty map.
    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>>;

    /// Add a member to a sorted set, or update its score
    async fn zadd(&self, key: &str, member: &str, score: i64) -> Result<()>;

    /// Members with `min <= score <= max`, lowest score first, at most `limit`
    async fn zrange_by_score(
        &self,
        key: &str,
        min: i64,
        max: i64,
        limit: usize,
    ) -> Result<Vec<String>>;

    /// Remove a member from a sorted set; `true` if it was present
    async fn zrem(&self, key: &str, member: &str) -> Result<bool>;

    async fn zcard(&self, key: &str) -> Result<usize>;

    /// Remove members with `min <= score <= max` and return how many were removed
    async fn zrem_range_by_score(&self, key: &str, min: i64, max: i64) -> Result<usize>;

    async fn delete(&self, keys: &[String]) -> Result<()>;

    /// Atomically move `member` from the sorted set `from` into the sorted set `to`,
    /// scored by `now`, provided its score in `from` is at most `now`.
    ///
    /// Returns `false` and changes nothing when `member` is missing from `from` or not
    /// due yet. That is how a worker holding a stale copy of a job learns that someone
    /// else claimed it first, or rescheduled it for later.
    async fn claim(&self, from: &str, to: &str, member: &str, now: i64) -> Result<bool>;

    /// Check that the store is reachable
    async fn ping(&self) -> Result<()>;
}

#[derive(Default)]
struct MemoryState {
    hashes: HashMap<String, HashMap<String, String>>,
    // member -> (score, insertion sequence); the sequence breaks score ties
    sorted_sets: HashMap<String, HashMap<String, (i64, u64)>>,
    sequence: u64,
}

impl MemoryState {
    fn zrem(&mut self, key: &str, member: &str) -> bool {
        self.sorted_sets
            .get_mut(key)
            .map(|set| set.remove(member).is_some())
            .unwrap_or(false)
    }

    fn zadd(&mut self, key: &str, member: &str, score: i64) {
        self.sequence += 1;
        let sequence = self.sequence;
        self.sorted_sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), (score, sequence));
    }
}

/// Single-process store for tests and embedded deployments.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn hset_all(&self, key: &str, fields: &[(String, String)]) -> Result<()> {
        let mut state = self.state.lock().await;
        let hash = state.hashes.entry(key.to_string()).or_default();
        for (field, value) in fields {
            hash.insert(field.clone(), value.clone());
        }
        Ok(())
    }

    async fn hget_all(&self, key: &str) -> Result<HashMap<String, String>> {
        let state = self.state.lock().await;
        Ok(state.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn zadd(&self, key: &str, member: &str, score: i64) -> Result<()> {
        self.state.lock().await.zadd(key, member, score);
        Ok(())
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: i64,
        max: i64,
        limit: usize,
    ) -> Result<Vec<String>> {
        let state = self.state.lock().await;
        let Some(set) = state.sorted_sets.get(key) else {
            return Ok(Vec::new());
        };

        let mut members: Vec<(&String, &(i64, u64))> = set
            .iter()
            .filter(|(_, (score, _))| *score >= min && *score <= max)
            .collect();
        members.sort_by_key(|(_, order)| **order);

        Ok(members
            .into_iter()
            .take(limit)
            .map(|(member, _)| member.clone())
            .collect())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        Ok(self.state.lock().await.zrem(key, member))
    }

    async fn zcard(&self, key: &str) -> Result<usize> {
        let state = self.state.lock().await;
        Ok(state.sorted_sets.get(key).map_or(0, HashMap::len))
    }

    async fn zrem_range_by_score(&self, key: &str, min: i64, max: i64) -> Result<usize> {
        let mut state = self.state.lock().await;
        let Some(set) = state.sorted_sets.get_mut(key) else {
            return Ok(0);
        };
        let before = set.len();
        set.retain(|_, (score, _)| *score < min || *score > max);
        Ok(before - set.len())
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        let mut state = self.state.lock().await;
        for key in keys {
            state.hashes.remove(key);
            state.sorted_sets.remove(key);
        }
        Ok(())
    }

    async fn claim(&self, from: &str, to: &str, member: &str, now: i64) -> Result<bool> {
        let mut state = self.state.lock().await;
        let due = state
            .sorted_sets
            .get(from)
            .and_then(|set| set.get(member))
            .is_some_and(|(score, _)| *score <= now);
        if !due {
            return Ok(false);
        }
        state.zrem(from, member);
        state.zadd(to, member, now);
        Ok(true)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
