use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{FetchResult, StoreResult};
use crate::types::{
    CandidateRecord, DedupOutcome, FetchTarget, Fingerprint, QualityAssessment, StoredRecord,
    UpsertOutcome,
};

// ============================================================================
// EXTRACTION: Supplied per source by site-specific adapters
// ============================================================================

/// The externally supplied extraction capability for one source.
///
/// The pipeline never interprets source markup itself; adapters turn a fetch
/// target into zero or more candidate records, or an error.
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Fetch targets for one data type of this source.
    async fn targets(&self, data_type: &str) -> FetchResult<Vec<FetchTarget>>;

    /// Fetch and extract one target.
    async fn fetch(&self, target: &FetchTarget) -> FetchResult<Vec<CandidateRecord>>;
}

// ============================================================================
// RATE LIMITER: Ephemeral per-source coordination
// ============================================================================

/// Politeness gate shared by every worker targeting the same source.
///
/// `acquire` suspends until a permit is available; every acquired permit
/// must be released, on success or failure, to avoid starving later jobs.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    async fn acquire(&self, source: &str);
    fn release(&self, source: &str);
}

// ============================================================================
// STORES: Routed destinations
// ============================================================================

/// Relational store: durable upsert-by-fingerprint plus range queries and
/// quality history.
#[async_trait]
pub trait RelationalStore: Send + Sync {
    /// Upsert keyed by (source, data type, fingerprint). Re-observation of
    /// an existing fingerprint refreshes `last_seen_at` instead of
    /// inserting a second row.
    async fn upsert_record(&self, record: &StoredRecord) -> StoreResult<UpsertOutcome>;

    /// Atomic freshness check for one fingerprint: `Duplicate` if a record
    /// was last seen within `window`, `Refresh` if one exists but is
    /// older, `New` otherwise. Single store operation, no read-then-write.
    async fn check_fingerprint(
        &self,
        source: &str,
        data_type: &str,
        fingerprint: &Fingerprint,
        window: chrono::Duration,
    ) -> StoreResult<DedupOutcome>;

    /// Point lookup by the upsert key.
    async fn find_by_fingerprint(
        &self,
        source: &str,
        data_type: &str,
        fingerprint: &Fingerprint,
    ) -> StoreResult<Option<StoredRecord>>;

    /// Range query by (source, data type, observation window).
    async fn records_in_range(
        &self,
        source: &str,
        data_type: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<StoredRecord>>;

    /// Persist a job's quality assessment for trend analysis.
    async fn save_assessment(
        &self,
        source: &str,
        data_type: &str,
        job_id: crate::types::JobId,
        assessment: &QualityAssessment,
    ) -> StoreResult<()>;

    /// Assessments for a (source, data type) within a time range.
    async fn assessments_in_range(
        &self,
        source: &str,
        data_type: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<QualityAssessment>>;
}

/// Document store: put-with-expiration, get-by-key.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn put(
        &self,
        key: &str,
        document: &serde_json::Value,
        expires_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()>;

    async fn get(&self, key: &str) -> StoreResult<Option<serde_json::Value>>;

    /// Delete expired documents; returns how many were removed.
    async fn purge_expired(&self, now: DateTime<Utc>) -> StoreResult<u64>;
}

/// Cache: TTL'd write-through entries keyed by (data type, fingerprint).
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn put(
        &self,
        key: &str,
        value: &serde_json::Value,
        ttl: std::time::Duration,
    ) -> StoreResult<()>;

    async fn get(&self, key: &str) -> StoreResult<Option<serde_json::Value>>;
}

/// Vector index: embedding generation and upsert happen behind this seam.
/// Fire-and-forget from the pipeline's perspective; requests reach it
/// through the outbound index queue.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn upsert(
        &self,
        id: &str,
        text: &str,
        metadata: serde_json::Value,
    ) -> StoreResult<()>;
}
