//! nova_store
//!
//! Typed key-value contract + in-memory backend.
//! The audit chain, caches, and rate-limit escalation state depend only on
//! this contract so a networked KV or embedded database can be swapped in.
//!
//! Operations are individually atomic. No multi-key transactions.
//! Backend failures surface as retryable `StoreError::Backend`.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use nova_common::{Clock, SystemClock};

#[derive(Debug, Error)]
pub enum StoreError {
    /// Retryable backend fault (maps to BACKEND_ERROR at the boundary).
    #[error("backend error: {0}")]
    Backend(String),
    #[error("value is not a counter: {0}")]
    NotACounter(String),
}

impl StoreError {
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::Backend(_) => "BACKEND_ERROR",
            StoreError::NotACounter(_) => "BACKEND_ERROR",
        }
    }

    pub fn retryable(&self) -> bool {
        true
    }
}

/// A member of a sorted set with its score.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredMember {
    pub score: f64,
    pub member: String,
}

/// Primitive storage with TTL, counters, and a sorted-set subset.
/// Values are opaque byte strings; callers serialize to canonical JSON.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
    async fn set(&self, key: &str, value: Vec<u8>, ttl_millis: Option<u64>) -> Result<(), StoreError>;
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;
    async fn incr(&self, key: &str) -> Result<i64, StoreError>;

    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<(), StoreError>;
    /// Ascending by score; `start..=stop` are inclusive rank bounds, negative
    /// counts from the end (redis convention).
    async fn zrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<ScoredMember>, StoreError>;
    async fn zrevrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<ScoredMember>, StoreError>;
    async fn zrangebyscore(&self, key: &str, min: f64, max: f64) -> Result<Vec<ScoredMember>, StoreError>;
    async fn zrevrangebyscore(&self, key: &str, max: f64, min: f64) -> Result<Vec<ScoredMember>, StoreError>;
    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError>;
    async fn zcard(&self, key: &str) -> Result<u64, StoreError>;
}

// ----------------------------
// In-memory backend
// ----------------------------

struct ValueEntry {
    bytes: Vec<u8>,
    /// Absolute expiry in epoch millis. None = no TTL.
    expires_at: Option<u64>,
}

#[derive(Default)]
struct SortedSet {
    /// Kept ordered by (score, member). Membership is unique by member.
    members: Vec<ScoredMember>,
}

impl SortedSet {
    fn insert(&mut self, score: f64, member: &str) {
        self.members.retain(|m| m.member != member);
        let item = ScoredMember { score, member: member.to_string() };
        let pos = self
            .members
            .partition_point(|m| (m.score, m.member.as_str()) < (score, member));
        self.members.insert(pos, item);
    }
}

/// Process-local store. TTLs are enforced lazily at read time.
pub struct MemoryStore {
    values: RwLock<HashMap<String, ValueEntry>>,
    counters: RwLock<HashMap<String, i64>>,
    sorted: RwLock<HashMap<String, SortedSet>>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            values: RwLock::new(HashMap::new()),
            counters: RwLock::new(HashMap::new()),
            sorted: RwLock::new(HashMap::new()),
            clock,
        }
    }

    fn expired(&self, entry: &ValueEntry) -> bool {
        matches!(entry.expires_at, Some(at) if at <= self.clock.now_millis())
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        {
            let values = self.values.read();
            match values.get(key) {
                None => return Ok(None),
                Some(entry) if !self.expired(entry) => return Ok(Some(entry.bytes.clone())),
                Some(_) => {}
            }
        }
        // Expired: drop under the write lock.
        self.values.write().remove(key);
        Ok(None)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl_millis: Option<u64>) -> Result<(), StoreError> {
        let expires_at = ttl_millis.map(|ttl| self.clock.now_millis() + ttl);
        self.values
            .write()
            .insert(key.to_string(), ValueEntry { bytes: value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let removed_value = self.values.write().remove(key).is_some();
        let removed_counter = self.counters.write().remove(key).is_some();
        let removed_set = self.sorted.write().remove(key).is_some();
        Ok(removed_value || removed_counter || removed_set)
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        let mut counters = self.counters.write();
        let n = counters.entry(key.to_string()).or_insert(0);
        *n += 1;
        Ok(*n)
    }

    async fn zadd(&self, key: &str, score: f64, member: &str) -> Result<(), StoreError> {
        let mut sorted = self.sorted.write();
        sorted.entry(key.to_string()).or_default().insert(score, member);
        Ok(())
    }

    async fn zrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<ScoredMember>, StoreError> {
        let sorted = self.sorted.read();
        let members = sorted.get(key).map(|s| s.members.clone()).unwrap_or_default();
        Ok(slice_by_rank(&members, start, stop))
    }

    async fn zrevrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<ScoredMember>, StoreError> {
        let sorted = self.sorted.read();
        let mut members = sorted.get(key).map(|s| s.members.clone()).unwrap_or_default();
        members.reverse();
        Ok(slice_by_rank(&members, start, stop))
    }

    async fn zrangebyscore(&self, key: &str, min: f64, max: f64) -> Result<Vec<ScoredMember>, StoreError> {
        let sorted = self.sorted.read();
        let members = sorted.get(key).map(|s| s.members.clone()).unwrap_or_default();
        Ok(members
            .into_iter()
            .filter(|m| m.score >= min && m.score <= max)
            .collect())
    }

    async fn zrevrangebyscore(&self, key: &str, max: f64, min: f64) -> Result<Vec<ScoredMember>, StoreError> {
        let mut hits = self.zrangebyscore(key, min, max).await?;
        hits.reverse();
        Ok(hits)
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut sorted = self.sorted.write();
        if let Some(set) = sorted.get_mut(key) {
            let before = set.members.len();
            set.members.retain(|m| m.member != member);
            return Ok(set.members.len() != before);
        }
        Ok(false)
    }

    async fn zcard(&self, key: &str) -> Result<u64, StoreError> {
        let sorted = self.sorted.read();
        Ok(sorted.get(key).map(|s| s.members.len() as u64).unwrap_or(0))
    }
}

/// Inclusive rank slice with redis-style negative indices.
fn slice_by_rank(members: &[ScoredMember], start: i64, stop: i64) -> Vec<ScoredMember> {
    let len = members.len() as i64;
    if len == 0 {
        return vec![];
    }
    let norm = |i: i64| -> i64 {
        if i < 0 {
            (len + i).max(0)
        } else {
            i
        }
    };
    let lo = norm(start);
    let hi = norm(stop).min(len - 1);
    if lo > hi {
        return vec![];
    }
    members[lo as usize..=hi as usize].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use nova_common::ManualClock;

    #[tokio::test]
    async fn set_get_roundtrip_and_ttl() {
        let clock = Arc::new(ManualClock::new(0));
        let store = MemoryStore::new(clock.clone());

        store.set("k", b"v".to_vec(), Some(1_000)).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(b"v".to_vec()));

        clock.advance(1_001);
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn incr_is_monotonic() {
        let store = MemoryStore::default();
        assert_eq!(store.incr("seq").await.unwrap(), 1);
        assert_eq!(store.incr("seq").await.unwrap(), 2);
        assert_eq!(store.incr("seq").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn sorted_set_ordering_and_ranges() {
        let store = MemoryStore::default();
        store.zadd("idx", 3.0, "c").await.unwrap();
        store.zadd("idx", 1.0, "a").await.unwrap();
        store.zadd("idx", 2.0, "b").await.unwrap();

        let all = store.zrange("idx", 0, -1).await.unwrap();
        let names: Vec<&str> = all.iter().map(|m| m.member.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);

        let rev = store.zrevrange("idx", 0, 0).await.unwrap();
        assert_eq!(rev[0].member, "c");

        let mid = store.zrangebyscore("idx", 1.5, 2.5).await.unwrap();
        assert_eq!(mid.len(), 1);
        assert_eq!(mid[0].member, "b");

        assert_eq!(store.zcard("idx").await.unwrap(), 3);
        assert!(store.zrem("idx", "b").await.unwrap());
        assert_eq!(store.zcard("idx").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn zadd_reschedules_existing_member() {
        let store = MemoryStore::default();
        store.zadd("idx", 1.0, "a").await.unwrap();
        store.zadd("idx", 9.0, "a").await.unwrap();
        assert_eq!(store.zcard("idx").await.unwrap(), 1);
        let all = store.zrange("idx", 0, -1).await.unwrap();
        assert_eq!(all[0].score, 9.0);
    }
}
