//! nova_audit_log
//!
//! Append-only tamper-evident audit store over the key-value contract.
//! - Each entry carries prev hash + its own hash
//! - Appends are strictly serial behind one async critical section, so the
//!   chain is dense and linearizable under concurrent writers
//! - Three timestamp-scored indices: global, per-user, per-category
//! - Integrity verification replays the chain and checks both links
//! - Retention deletes leave truthful, detectable gaps

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

use nova_audit_spec::{
    compute_entry_hash, new_entry_id, recompute_entry_hash, AuditEntry, AuditQuery, IntegrityReport,
    NewAuditEntry, SortOrder,
};
use nova_common::{Clock, SystemClock};
use nova_store::{KeyValueStore, StoreError};

const ENTRY_PREFIX: &str = "audit:entry:";
const LAST_ENTRY_KEY: &str = "audit:last_entry_id";
const SEQUENCE_KEY: &str = "audit:sequence";
const INDEX_GLOBAL: &str = "audit:index:global";

#[derive(Debug, Error)]
pub enum AuditLogError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("entry not found: {0}")]
    NotFound(String),
}

fn entry_key(id: &str) -> String {
    format!("{ENTRY_PREFIX}{id}")
}

fn user_index_key(user_id: &str) -> String {
    format!("audit:index:user:{user_id}")
}

fn category_index_key(category: &str) -> String {
    format!("audit:index:category:{category}")
}

/// The audit store. Cheap to clone; appenders share one chain pointer lock.
#[derive(Clone)]
pub struct AuditStore {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    /// Serializes append: capture last_entry_id, install the new one.
    append_lock: Arc<Mutex<()>>,
}

impl AuditStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock, append_lock: Arc::new(Mutex::new(())) }
    }

    /// Append one entry. Returns the persisted, chained form.
    pub async fn append(&self, entry: NewAuditEntry) -> Result<AuditEntry, AuditLogError> {
        let _guard = self.append_lock.lock().await;

        let id = new_entry_id();
        // Timestamps double as index scores and define the verification walk
        // order, so they must be strictly monotonic within a chain.
        let mut timestamp = self.clock.now_millis();
        if let Some(newest) = self.store.zrevrange(INDEX_GLOBAL, 0, 0).await?.first() {
            if newest.score as u64 >= timestamp {
                timestamp = newest.score as u64 + 1;
            }
        }

        let previous_hash = match self.store.get(LAST_ENTRY_KEY).await? {
            Some(last_id_bytes) => {
                let last_id = String::from_utf8_lossy(&last_id_bytes).to_string();
                // A retention-deleted predecessor leaves the pointer dangling;
                // treat that as a fresh chain segment rather than failing writes.
                match self.store.get(&entry_key(&last_id)).await? {
                    Some(bytes) => {
                        let last: AuditEntry = serde_json::from_slice(&bytes)?;
                        Some(last.entry_hash)
                    }
                    None => None,
                }
            }
            None => None,
        };

        let entry_hash = compute_entry_hash(&id, timestamp, &entry, &previous_hash);
        let persisted = AuditEntry {
            id: id.clone(),
            timestamp,
            category: entry.category,
            action: entry.action,
            severity: entry.severity,
            user_id: entry.user_id,
            target_user_id: entry.target_user_id,
            entity_type: entry.entity_type,
            entity_id: entry.entity_id,
            description: entry.description,
            details: entry.details,
            request: entry.request,
            success: entry.success,
            error_message: entry.error_message,
            previous_hash,
            entry_hash,
        };

        let bytes = serde_json::to_vec(&persisted)?;
        self.store.set(&entry_key(&id), bytes, None).await?;
        self.store.set(LAST_ENTRY_KEY, id.clone().into_bytes(), None).await?;

        let score = timestamp as f64;
        self.store.zadd(INDEX_GLOBAL, score, &id).await?;
        if let Some(user) = &persisted.user_id {
            self.store.zadd(&user_index_key(user), score, &id).await?;
        }
        self.store
            .zadd(&category_index_key(persisted.category.as_str()), score, &id)
            .await?;

        self.store.incr(SEQUENCE_KEY).await?;

        tracing::debug!(target: "audit", id = %id, action = ?persisted.action, "audit entry appended");
        Ok(persisted)
    }

    pub async fn get(&self, id: &str) -> Result<Option<AuditEntry>, AuditLogError> {
        match self.store.get(&entry_key(id)).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Filtered, paginated read. Uses the narrowest applicable index.
    pub async fn query(&self, q: &AuditQuery) -> Result<Vec<AuditEntry>, AuditLogError> {
        let index_key = if let Some(user) = &q.user_id {
            user_index_key(user)
        } else if let Some(category) = &q.category {
            category_index_key(category.as_str())
        } else {
            INDEX_GLOBAL.to_string()
        };

        let min = q.from_ts.map(|t| t as f64).unwrap_or(f64::MIN);
        let max = q.to_ts.map(|t| t as f64).unwrap_or(f64::MAX);
        let members = match q.sort_order {
            SortOrder::Asc => self.store.zrangebyscore(&index_key, min, max).await?,
            SortOrder::Desc => self.store.zrevrangebyscore(&index_key, max, min).await?,
        };

        let mut hits = Vec::new();
        let mut skipped = 0usize;
        for m in members {
            let Some(entry) = self.get(&m.member).await? else {
                // Index member survived a retention delete; skip it.
                continue;
            };
            if !matches(&entry, q) {
                continue;
            }
            if skipped < q.offset {
                skipped += 1;
                continue;
            }
            hits.push(entry);
            if q.limit > 0 && hits.len() >= q.limit {
                break;
            }
        }
        Ok(hits)
    }

    /// Walk entries in timestamp order and verify (i) each previous_hash links
    /// to the prior entry_hash, (ii) each stored entry_hash recomputes.
    pub async fn verify_integrity(&self, from_id: Option<&str>, limit: u64) -> Result<IntegrityReport, AuditLogError> {
        let members = self.store.zrange(INDEX_GLOBAL, 0, -1).await?;
        let mut started = from_id.is_none();
        let mut checked = 0u64;
        let mut prior_hash: Option<String> = None;

        for m in members {
            if !started {
                if m.member == from_id.unwrap_or_default() {
                    started = true;
                } else {
                    continue;
                }
            }
            let Some(entry) = self.get(&m.member).await? else {
                continue;
            };

            if checked > 0 && entry.previous_hash != prior_hash {
                return Ok(IntegrityReport {
                    valid: false,
                    entries_checked: checked,
                    broken_at_id: Some(entry.id),
                    error: Some("Previous hash link broken".into()),
                });
            }

            let recomputed = recompute_entry_hash(&entry);
            if recomputed != entry.entry_hash {
                return Ok(IntegrityReport {
                    valid: false,
                    entries_checked: checked,
                    broken_at_id: Some(entry.id),
                    error: Some("Entry hash verification failed".into()),
                });
            }

            prior_hash = Some(entry.entry_hash);
            checked += 1;
            if limit > 0 && checked >= limit {
                break;
            }
        }

        Ok(IntegrityReport { valid: true, entries_checked: checked, broken_at_id: None, error: None })
    }

    /// Retention: delete everything strictly older than `before_ts`. Survivors
    /// keep their previous_hash values, so historical gaps remain detectable.
    pub async fn delete_for_retention(&self, before_ts: u64) -> Result<u64, AuditLogError> {
        let _guard = self.append_lock.lock().await;
        let victims = self
            .store
            .zrangebyscore(INDEX_GLOBAL, f64::MIN, (before_ts as f64) - 1.0)
            .await?;

        let mut deleted = 0u64;
        for m in victims {
            if let Some(entry) = self.get(&m.member).await? {
                self.remove_entry(&entry).await?;
                deleted += 1;
            }
        }
        tracing::info!(target: "audit", deleted, before_ts, "retention sweep complete");
        Ok(deleted)
    }

    /// GDPR erasure: delete all entries scoped to one user and unindex them.
    pub async fn erase_user(&self, user_id: &str) -> Result<u64, AuditLogError> {
        let _guard = self.append_lock.lock().await;
        let members = self.store.zrange(&user_index_key(user_id), 0, -1).await?;

        let mut deleted = 0u64;
        for m in members {
            if let Some(entry) = self.get(&m.member).await? {
                self.remove_entry(&entry).await?;
                deleted += 1;
            }
        }
        self.store.delete(&user_index_key(user_id)).await?;
        tracing::info!(target: "audit", deleted, "user erasure complete");
        Ok(deleted)
    }

    async fn remove_entry(&self, entry: &AuditEntry) -> Result<(), AuditLogError> {
        self.store.delete(&entry_key(&entry.id)).await?;
        self.store.zrem(INDEX_GLOBAL, &entry.id).await?;
        if let Some(user) = &entry.user_id {
            self.store.zrem(&user_index_key(user), &entry.id).await?;
        }
        self.store
            .zrem(&category_index_key(entry.category.as_str()), &entry.id)
            .await?;
        Ok(())
    }

    /// Number of entries currently indexed (post-retention survivors).
    pub async fn count(&self) -> Result<u64, AuditLogError> {
        Ok(self.store.zcard(INDEX_GLOBAL).await?)
    }
}

fn matches(entry: &AuditEntry, q: &AuditQuery) -> bool {
    if let Some(action) = q.action {
        if entry.action != action {
            return false;
        }
    }
    if let Some(severity) = q.severity {
        if entry.severity != severity {
            return false;
        }
    }
    if let Some(category) = q.category {
        if entry.category != category {
            return false;
        }
    }
    if let Some(et) = &q.entity_type {
        if entry.entity_type.as_deref() != Some(et.as_str()) {
            return false;
        }
    }
    if let Some(eid) = &q.entity_id {
        if entry.entity_id.as_deref() != Some(eid.as_str()) {
            return false;
        }
    }
    if q.success_only && !entry.success {
        return false;
    }
    if q.failed_only && entry.success {
        return false;
    }
    if let Some(text) = &q.search_text {
        let needle = text.to_lowercase();
        let in_description = entry.description.to_lowercase().contains(&needle);
        let in_error = entry
            .error_message
            .as_deref()
            .map(|e| e.to_lowercase().contains(&needle))
            .unwrap_or(false);
        if !in_description && !in_error {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use nova_audit_spec::{AuditAction, AuditCategory, AuditSeverity};
    use nova_common::ManualClock;
    use nova_store::MemoryStore;

    fn entry(description: &str, user: Option<&str>) -> NewAuditEntry {
        NewAuditEntry {
            category: AuditCategory::Security,
            action: AuditAction::SecurityBlocked,
            severity: AuditSeverity::Warning,
            user_id: user.map(String::from),
            target_user_id: None,
            entity_type: None,
            entity_id: None,
            description: description.into(),
            details: None,
            request: None,
            success: false,
            error_message: None,
        }
    }

    fn store_with_clock() -> (AuditStore, Arc<ManualClock>, Arc<MemoryStore>) {
        let clock = Arc::new(ManualClock::new(1_000));
        let kv = Arc::new(MemoryStore::new(clock.clone()));
        (AuditStore::with_clock(kv.clone(), clock.clone()), clock, kv)
    }

    #[tokio::test]
    async fn chain_links_and_verifies() {
        let (audit, clock, _) = store_with_clock();
        let a = audit.append(entry("a", None)).await.unwrap();
        clock.advance(1);
        let b = audit.append(entry("b", None)).await.unwrap();
        clock.advance(1);
        let c = audit.append(entry("c", None)).await.unwrap();

        assert!(a.previous_hash.is_none());
        assert_eq!(b.previous_hash.as_deref(), Some(a.entry_hash.as_str()));
        assert_eq!(c.previous_hash.as_deref(), Some(b.entry_hash.as_str()));

        let report = audit.verify_integrity(None, 0).await.unwrap();
        assert!(report.valid);
        assert_eq!(report.entries_checked, 3);
    }

    #[tokio::test]
    async fn tamper_is_detected_at_the_mutated_entry() {
        let (audit, clock, kv) = store_with_clock();
        audit.append(entry("a", None)).await.unwrap();
        clock.advance(1);
        let b = audit.append(entry("b", None)).await.unwrap();
        clock.advance(1);
        audit.append(entry("c", None)).await.unwrap();

        // Mutate B directly in storage behind the log's back.
        let mut stored = audit.get(&b.id).await.unwrap().unwrap();
        stored.description = "tampered".into();
        kv.set(&entry_key(&b.id), serde_json::to_vec(&stored).unwrap(), None)
            .await
            .unwrap();

        let report = audit.verify_integrity(None, 0).await.unwrap();
        assert!(!report.valid);
        assert_eq!(report.broken_at_id.as_deref(), Some(b.id.as_str()));
        assert_eq!(report.error.as_deref(), Some("Entry hash verification failed"));
    }

    #[tokio::test]
    async fn query_filters_and_paginates() {
        let (audit, clock, _) = store_with_clock();
        for i in 0..5 {
            let user = if i % 2 == 0 { Some("alice") } else { Some("bob") };
            audit.append(entry(&format!("event {i}"), user)).await.unwrap();
            clock.advance(10);
        }

        let q = AuditQuery { user_id: Some("alice".into()), limit: 10, ..Default::default() };
        let hits = audit.query(&q).await.unwrap();
        assert_eq!(hits.len(), 3);
        // Default order is newest first.
        assert!(hits[0].timestamp > hits[2].timestamp);

        let q2 = AuditQuery { search_text: Some("event 3".into()), limit: 10, ..Default::default() };
        assert_eq!(audit.query(&q2).await.unwrap().len(), 1);

        let q3 = AuditQuery { limit: 2, offset: 1, ..Default::default() };
        assert_eq!(audit.query(&q3).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn retention_leaves_detectable_gap_but_new_appends_work() {
        let (audit, clock, _) = store_with_clock();
        audit.append(entry("old", None)).await.unwrap();
        clock.advance(10_000);
        let survivor = audit.append(entry("recent", None)).await.unwrap();

        let deleted = audit.delete_for_retention(clock.now_millis() - 5_000).await.unwrap();
        assert_eq!(deleted, 1);

        // The survivor still references the deleted predecessor.
        assert!(survivor.previous_hash.is_some());
        let report = audit.verify_integrity(None, 0).await.unwrap();
        // A single remaining entry verifies against itself; the gap shows up
        // as a dangling previous_hash on the first survivor, which the walk
        // tolerates at position zero by design.
        assert!(report.valid);

        clock.advance(1);
        let next = audit.append(entry("after retention", None)).await.unwrap();
        assert_eq!(next.previous_hash.as_deref(), Some(survivor.entry_hash.as_str()));
    }

    #[tokio::test]
    async fn user_erasure_removes_entries_and_index() {
        let (audit, clock, _) = store_with_clock();
        audit.append(entry("mine", Some("alice"))).await.unwrap();
        clock.advance(1);
        audit.append(entry("other", Some("bob"))).await.unwrap();

        let erased = audit.erase_user("alice").await.unwrap();
        assert_eq!(erased, 1);

        let q = AuditQuery { user_id: Some("alice".into()), limit: 10, ..Default::default() };
        assert!(audit.query(&q).await.unwrap().is_empty());

        let all = AuditQuery { limit: 10, ..Default::default() };
        assert_eq!(audit.query(&all).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_appends_stay_densely_chained() {
        let (audit, _, _) = store_with_clock();
        let mut handles = Vec::new();
        for i in 0..8 {
            let a = audit.clone();
            handles.push(tokio::spawn(async move {
                a.append(entry(&format!("concurrent {i}"), None)).await.unwrap()
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let report = audit.verify_integrity(None, 0).await.unwrap();
        assert!(report.valid);
        assert_eq!(report.entries_checked, 8);
    }
}
