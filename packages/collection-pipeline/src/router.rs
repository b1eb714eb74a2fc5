//! Per-record storage placement.
//!
//! The decision table is driven entirely by the data type's policy:
//! relational and/or document as primary, cache when eligible, vector
//! indexing when eligible. Required steps retry independently with backoff;
//! indexing goes through the outbound queue and never fails the record.
//! Fail-forward: a write failure leaves every destination's prior state
//! intact, because the destinations share no transaction boundary.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use crate::config::StoragePolicy;
use crate::error::{StoreError, StoreResult};
use crate::index_queue::{embedding_text, IndexQueue, IndexRequest};
use crate::traits::{CacheStore, DocumentStore, RelationalStore};
use crate::types::{
    RouteResult, RouteStatus, StoreKind, StoreOperation, StoreOutcome, StoredRecord,
};

/// Cache key for a record: data type + fingerprint.
pub fn cache_key(data_type: &str, fingerprint: &str) -> String {
    format!("{data_type}:{fingerprint}")
}

/// Document key for a record.
fn document_key(record: &StoredRecord) -> String {
    format!(
        "{}/{}/{}",
        record.source, record.data_type, record.fingerprint
    )
}

pub struct StorageRouter {
    relational: Arc<dyn RelationalStore>,
    document: Arc<dyn DocumentStore>,
    cache: Arc<dyn CacheStore>,
    index_queue: Arc<IndexQueue>,
    store_retries: u32,
    store_timeout: Duration,
}

impl StorageRouter {
    pub fn new(
        relational: Arc<dyn RelationalStore>,
        document: Arc<dyn DocumentStore>,
        cache: Arc<dyn CacheStore>,
        index_queue: Arc<IndexQueue>,
        store_retries: u32,
        store_timeout: Duration,
    ) -> Self {
        Self {
            relational,
            document,
            cache,
            index_queue,
            store_retries,
            store_timeout,
        }
    }

    /// Route one accepted record through its configured store set.
    pub async fn route(&self, mut record: StoredRecord, policy: &StoragePolicy) -> RouteResult {
        let mut stores_written = Vec::new();
        let mut errors = Vec::new();
        let mut operations = Vec::new();
        let mut required_failed = false;
        let mut record_id = record.id;

        // 1. Relational upsert, keyed by fingerprint so a re-observation
        //    refreshes instead of inserting.
        if policy.primary_store.includes_relational() {
            record.stores_written.push(StoreKind::Relational);
            let (outcome, mut ops) = self
                .attempt(StoreKind::Relational, || async {
                    self.relational.upsert_record(&record).await
                })
                .await;
            operations.append(&mut ops);
            match outcome {
                Ok(upsert) => {
                    record_id = upsert.record_id;
                    stores_written.push(StoreKind::Relational);
                }
                Err(e) => {
                    errors.push(format!("relational: {e}"));
                    required_failed = true;
                }
            }
        }

        // 2. Document write with expiration from the retention policy.
        if policy.primary_store.includes_document() {
            let key = document_key(&record);
            let now = Utc::now();
            let doc = json!({
                "source": record.source,
                "data_type": record.data_type,
                "fingerprint": record.fingerprint,
                "payload": record.payload,
                "stored_at": now,
            });
            let expires_at = policy.document_expiry(now);
            let (outcome, mut ops) = self
                .attempt(StoreKind::Document, || {
                    let doc = doc.clone();
                    let key = key.clone();
                    async move { self.document.put(&key, &doc, expires_at).await }
                })
                .await;
            operations.append(&mut ops);
            match outcome {
                Ok(()) => {
                    stores_written.push(StoreKind::Document);
                }
                Err(e) => {
                    errors.push(format!("document: {e}"));
                    required_failed = true;
                }
            }
        }

        // 3. Cache entry with TTL from the criticality table.
        if policy.cache_eligible {
            let key = cache_key(&record.data_type, record.fingerprint.as_str());
            let ttl = policy.cache_ttl();
            let payload = record.payload.clone();
            let (outcome, mut ops) = self
                .attempt(StoreKind::Cache, || {
                    let key = key.clone();
                    let payload = payload.clone();
                    async move { self.cache.put(&key, &payload, ttl).await }
                })
                .await;
            operations.append(&mut ops);
            match outcome {
                Ok(()) => {
                    stores_written.push(StoreKind::Cache);
                }
                Err(e) => {
                    errors.push(format!("cache: {e}"));
                    required_failed = true;
                }
            }
        }

        // 4. Best-effort indexing through the outbound queue. Failure there
        //    never rolls back or fails steps 1-3.
        if policy.vector_eligible {
            let text = embedding_text(&record.payload);
            if text.trim().is_empty() {
                tracing::debug!(
                    fingerprint = %record.fingerprint,
                    "no embeddable text, skipping index request"
                );
            } else {
                self.index_queue.enqueue(IndexRequest {
                    id: format!(
                        "{}_{}_{}",
                        record.source, record.data_type, record.fingerprint
                    ),
                    text,
                    metadata: json!({
                        "source": record.source,
                        "data_type": record.data_type,
                        "record_id": record_id,
                        "fingerprint": record.fingerprint,
                    }),
                });
                stores_written.push(StoreKind::VectorIndex);
            }
        }

        // Terminal status; the tracker exposes the partially_routed count
        // while a job's records are mid-route.
        let status = if required_failed {
            RouteStatus::Failed
        } else {
            RouteStatus::Routed
        };

        if status == RouteStatus::Failed {
            tracing::warn!(
                fingerprint = %record.fingerprint,
                data_type = %record.data_type,
                errors = ?errors,
                "record routing failed; prior store state left intact"
            );
        }

        RouteResult {
            record_id,
            fingerprint: record.fingerprint,
            status,
            stores_written,
            errors,
            operations,
        }
    }

    /// Run one store write with timeout and exponential-backoff retries,
    /// recording every attempt.
    async fn attempt<T, F, Fut>(
        &self,
        kind: StoreKind,
        op: F,
    ) -> (StoreResult<T>, Vec<StoreOperation>)
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = StoreResult<T>>,
    {
        let mut operations = Vec::new();
        let mut attempt = 0u32;
        loop {
            let started = std::time::Instant::now();
            let result = match tokio::time::timeout(self.store_timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(StoreError::Timeout {
                    waited_ms: self.store_timeout.as_millis() as u64,
                }),
            };
            let duration = started.elapsed();

            match result {
                Ok(value) => {
                    operations.push(StoreOperation {
                        kind,
                        duration,
                        outcome: StoreOutcome::Success,
                    });
                    return (Ok(value), operations);
                }
                Err(e) => {
                    operations.push(StoreOperation {
                        kind,
                        duration,
                        outcome: StoreOutcome::Failure,
                    });
                    if attempt >= self.store_retries {
                        return (Err(e), operations);
                    }
                    attempt += 1;
                    let backoff = Duration::from_millis(50 * (1 << attempt.min(6)));
                    tracing::debug!(
                        store = kind.as_str(),
                        attempt,
                        error = %e,
                        "store write failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PrimaryStore, StoragePolicy};
    use crate::storage::memory::{
        MemoryCacheStore, MemoryDocumentStore, MemoryRelationalStore, MemoryVectorIndex,
    };
    use crate::types::{CandidateRecord, QualityBand};
    use serde_json::json;

    struct Fixture {
        relational: Arc<MemoryRelationalStore>,
        document: Arc<MemoryDocumentStore>,
        cache: Arc<MemoryCacheStore>,
        index: Arc<MemoryVectorIndex>,
        queue: Arc<IndexQueue>,
        router: StorageRouter,
    }

    fn fixture() -> Fixture {
        fixture_with_index(Arc::new(MemoryVectorIndex::new()))
    }

    fn fixture_with_index(index: Arc<MemoryVectorIndex>) -> Fixture {
        let relational = Arc::new(MemoryRelationalStore::new());
        let document = Arc::new(MemoryDocumentStore::new());
        let cache = Arc::new(MemoryCacheStore::new());
        let queue = Arc::new(IndexQueue::spawn(index.clone(), 64, 0));
        let router = StorageRouter::new(
            relational.clone(),
            document.clone(),
            cache.clone(),
            queue.clone(),
            1,
            Duration::from_secs(5),
        );
        Fixture {
            relational,
            document,
            cache,
            index,
            queue,
            router,
        }
    }

    fn record(payload: serde_json::Value) -> StoredRecord {
        let candidate = CandidateRecord::new("portal", "service_listing", payload);
        StoredRecord::from_candidate(&candidate, QualityBand::High)
    }

    #[tokio::test]
    async fn both_policy_writes_both_primaries() {
        let f = fixture();
        let policy = StoragePolicy::new(PrimaryStore::Both).with_criticality(8);

        let result = f.router.route(record(json!({"title": "x"})), &policy).await;

        assert_eq!(result.status, RouteStatus::Routed);
        assert!(result.stores_written.contains(&StoreKind::Relational));
        assert!(result.stores_written.contains(&StoreKind::Document));
        assert_eq!(f.relational.record_count(), 1);
        assert_eq!(f.document.len(), 1);

        // The index request drains in the background.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(f.index.len(), 1);
        f.queue.shutdown().await;
    }

    #[tokio::test]
    async fn retention_sets_document_expiry() {
        let f = fixture();
        let policy = StoragePolicy::new(PrimaryStore::Document)
            .with_retention_days(7)
            .without_vector()
            .without_cache();

        let rec = record(json!({"title": "x"}));
        let key = document_key(&rec);
        f.router.route(rec, &policy).await;

        let expiry = f.document.expiry_of(&key).unwrap();
        assert!(expiry.is_some());

        // Permanent policy leaves the expiry absent.
        let f = fixture();
        let policy = StoragePolicy::new(PrimaryStore::Document)
            .without_vector()
            .without_cache();
        let rec = record(json!({"title": "y"}));
        let key = document_key(&rec);
        f.router.route(rec, &policy).await;
        assert_eq!(f.document.expiry_of(&key).unwrap(), None);
    }

    #[tokio::test]
    async fn cache_ttl_follows_criticality() {
        let f = fixture();
        let policy = StoragePolicy::new(PrimaryStore::Relational)
            .with_criticality(10)
            .without_vector();

        let rec = record(json!({"title": "x"}));
        let key = cache_key(&rec.data_type, rec.fingerprint.as_str());
        f.router.route(rec, &policy).await;

        let ttl = f.cache.ttl_of(&key).unwrap();
        assert!(ttl <= chrono::Duration::hours(1));
        assert!(ttl > chrono::Duration::minutes(55));

        let policy = StoragePolicy::new(PrimaryStore::Relational)
            .with_criticality(2)
            .without_vector();
        let rec = record(json!({"title": "low-priority entry"}));
        let key = cache_key(&rec.data_type, rec.fingerprint.as_str());
        f.router.route(rec, &policy).await;

        let ttl = f.cache.ttl_of(&key).unwrap();
        assert!(ttl <= chrono::Duration::weeks(4));
        assert!(ttl > chrono::Duration::weeks(3));
    }

    #[tokio::test]
    async fn vector_failure_does_not_fail_routing() {
        let f = fixture_with_index(Arc::new(MemoryVectorIndex::failing()));
        let policy = StoragePolicy::new(PrimaryStore::Both).with_criticality(7);

        let result = f.router.route(record(json!({"title": "x"})), &policy).await;

        assert_eq!(result.status, RouteStatus::Routed);
        assert_eq!(f.relational.record_count(), 1);
        assert_eq!(f.document.len(), 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            f.queue
                .stats()
                .failed
                .load(std::sync::atomic::Ordering::Relaxed),
            1
        );
        f.queue.shutdown().await;
    }

    #[tokio::test]
    async fn required_store_exhaustion_fails_forward() {
        let f = fixture();
        f.document.set_failing(true);
        let policy = StoragePolicy::new(PrimaryStore::Both)
            .without_cache()
            .without_vector();

        let result = f.router.route(record(json!({"title": "x"})), &policy).await;

        assert_eq!(result.status, RouteStatus::Failed);
        // The relational write that succeeded stays; nothing is rolled back.
        assert!(result.stores_written.contains(&StoreKind::Relational));
        assert_eq!(f.relational.record_count(), 1);
        assert!(!result.errors.is_empty());

        // Both attempts on the failing store were recorded.
        let document_failures = result
            .operations
            .iter()
            .filter(|op| op.kind == StoreKind::Document && op.outcome == StoreOutcome::Failure)
            .count();
        assert_eq!(document_failures, 2);
        f.queue.shutdown().await;
    }

    #[tokio::test]
    async fn refresh_reuses_existing_record_id() {
        let f = fixture();
        let policy = StoragePolicy::new(PrimaryStore::Relational)
            .without_cache()
            .without_vector();

        let first = f.router.route(record(json!({"title": "x"})), &policy).await;
        let second = f.router.route(record(json!({"title": "x"})), &policy).await;

        assert_eq!(first.record_id, second.record_id);
        assert_eq!(f.relational.record_count(), 1);
        f.queue.shutdown().await;
    }
}
