use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;
use uuid::Uuid;

/// Unique identifier for a collection job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Unique identifier for a stored record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordId(pub Uuid);

impl RecordId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Content fingerprint for deduplication and upsert keying.
///
/// A SHA-256 over the normalized payload, hex-encoded. Incidental metadata
/// (capture timestamps, prior fingerprints) is excluded so the same content
/// observed twice hashes identically.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(pub String);

/// Top-level payload keys that vary between observations of the same content.
const VOLATILE_KEYS: &[&str] = &["captured_at", "extracted_at", "fingerprint"];

impl Fingerprint {
    pub fn from_payload(payload: &serde_json::Value) -> Self {
        let normalized = normalize_payload(payload, true);
        let canonical = serde_json::to_string(&normalized).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Normalize a payload for consistent fingerprinting: object keys sorted,
/// strings trimmed and lowercased, volatile top-level keys dropped.
fn normalize_payload(value: &serde_json::Value, top_level: bool) -> serde_json::Value {
    match value {
        serde_json::Value::String(s) => serde_json::Value::String(s.trim().to_lowercase()),
        serde_json::Value::Object(map) => {
            let mut normalized = std::collections::BTreeMap::new();
            for (k, v) in map {
                if top_level && VOLATILE_KEYS.contains(&k.as_str()) {
                    continue;
                }
                normalized.insert(k.clone(), normalize_payload(v, false));
            }
            serde_json::Value::Object(normalized.into_iter().collect())
        }
        serde_json::Value::Array(arr) => {
            serde_json::Value::Array(arr.iter().map(|v| normalize_payload(v, false)).collect())
        }
        other => other.clone(),
    }
}

/// One fetchable unit of work within a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchTarget {
    pub url: Url,
}

impl FetchTarget {
    pub fn new(url: Url) -> Self {
        Self { url }
    }
}

impl std::fmt::Display for FetchTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.url.as_str())
    }
}

/// Raw output of extraction before validation. Exists only within a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateRecord {
    pub source: String,
    pub data_type: String,
    pub payload: serde_json::Value,
    pub fingerprint: Fingerprint,
    pub captured_at: DateTime<Utc>,
}

impl CandidateRecord {
    pub fn new(
        source: impl Into<String>,
        data_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        let fingerprint = Fingerprint::from_payload(&payload);
        Self {
            source: source.into(),
            data_type: data_type.into(),
            payload,
            fingerprint,
            captured_at: Utc::now(),
        }
    }
}

// ============================================================================
// ENUMS (type-safe states)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }
}

/// Quality band assigned to a job's batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityBand {
    High,
    Medium,
    Low,
    Invalid,
}

impl QualityBand {
    pub fn as_str(&self) -> &'static str {
        match self {
            QualityBand::High => "high",
            QualityBand::Medium => "medium",
            QualityBand::Low => "low",
            QualityBand::Invalid => "invalid",
        }
    }

    /// Numeric score for gauges and threshold alerting.
    pub fn score(&self) -> f64 {
        match self {
            QualityBand::High => 1.0,
            QualityBand::Medium => 0.7,
            QualityBand::Low => 0.5,
            QualityBand::Invalid => 0.0,
        }
    }

    /// Ordering rank, higher is better.
    pub fn rank(&self) -> u8 {
        match self {
            QualityBand::High => 3,
            QualityBand::Medium => 2,
            QualityBand::Low => 1,
            QualityBand::Invalid => 0,
        }
    }
}

/// Storage destinations a record can be written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    Relational,
    Document,
    Cache,
    VectorIndex,
}

impl StoreKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreKind::Relational => "relational",
            StoreKind::Document => "document",
            StoreKind::Cache => "cache",
            StoreKind::VectorIndex => "vector_index",
        }
    }
}

/// Routing status for one record: pending → partially_routed → routed/failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteStatus {
    Pending,
    PartiallyRouted,
    Routed,
    Failed,
}

/// Outcome of the freshness-window check for one candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupOutcome {
    /// No stored record with this fingerprint
    New,
    /// A stored record exists but is older than the freshness window
    Refresh,
    /// A stored record was written within the freshness window; dropped
    Duplicate,
}

/// Outcome of one store write, for metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Success,
    Failure,
}

// ============================================================================
// CORE TYPES
// ============================================================================

/// One scheduled run for a (source, data type) pair.
///
/// Mutated only by the worker executing it; terminal once completed or
/// failed. A retry creates a new job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionJob {
    pub id: JobId,
    pub source: String,
    pub data_type: String,
    pub state: JobState,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub error_summary: Option<String>,
    /// Policy snapshot taken when the job was created
    pub policy: crate::config::StoragePolicy,
}

/// Quality classification of a job's batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityAssessment {
    pub total: u64,
    pub valid: u64,
    pub errors: u64,
    pub band: QualityBand,
    pub assessed_at: DateTime<Utc>,
}

/// Durable form of an accepted candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredRecord {
    pub id: RecordId,
    pub source: String,
    pub data_type: String,
    pub fingerprint: Fingerprint,
    pub band: QualityBand,
    pub payload: serde_json::Value,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub stores_written: Vec<StoreKind>,
}

impl StoredRecord {
    /// Build the durable form of an accepted candidate.
    pub fn from_candidate(candidate: &CandidateRecord, band: QualityBand) -> Self {
        Self {
            id: RecordId::new(),
            source: candidate.source.clone(),
            data_type: candidate.data_type.clone(),
            fingerprint: candidate.fingerprint.clone(),
            band,
            payload: candidate.payload.clone(),
            first_seen_at: candidate.captured_at,
            last_seen_at: candidate.captured_at,
            stores_written: Vec::new(),
        }
    }
}

/// Result of a keyed upsert against the relational store.
#[derive(Debug, Clone)]
pub struct UpsertOutcome {
    pub record_id: RecordId,
    pub was_inserted: bool,
}

/// One store write attempt, for the metrics tracker.
#[derive(Debug, Clone)]
pub struct StoreOperation {
    pub kind: StoreKind,
    pub duration: std::time::Duration,
    pub outcome: StoreOutcome,
}

/// Result of routing one record through its store set.
#[derive(Debug, Clone)]
pub struct RouteResult {
    pub record_id: RecordId,
    pub fingerprint: Fingerprint,
    pub status: RouteStatus,
    pub stores_written: Vec<StoreKind>,
    pub errors: Vec<String>,
    /// Every write attempt made while routing, including retries
    pub operations: Vec<StoreOperation>,
}

/// Final result of a collection job.
#[derive(Debug, Clone)]
pub struct JobResult {
    pub job_id: JobId,
    pub assessment: QualityAssessment,
    pub records_routed: u64,
    pub records_failed: u64,
    pub duplicates: u64,
    pub fetch_errors: u64,
    pub warnings: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fingerprint_ignores_volatile_keys() {
        let a = json!({"title": "Road Closure", "captured_at": "2024-01-01T00:00:00Z"});
        let b = json!({"title": "Road Closure", "captured_at": "2025-06-15T12:00:00Z"});
        assert_eq!(Fingerprint::from_payload(&a), Fingerprint::from_payload(&b));
    }

    #[test]
    fn fingerprint_normalizes_whitespace_and_case() {
        let a = json!({"title": "  Road Closure  "});
        let b = json!({"title": "road closure"});
        assert_eq!(Fingerprint::from_payload(&a), Fingerprint::from_payload(&b));
    }

    #[test]
    fn fingerprint_is_key_order_independent() {
        let a = json!({"a": 1, "b": 2});
        let b = json!({"b": 2, "a": 1});
        assert_eq!(Fingerprint::from_payload(&a), Fingerprint::from_payload(&b));
    }

    #[test]
    fn fingerprint_differs_on_content() {
        let a = json!({"title": "one"});
        let b = json!({"title": "two"});
        assert_ne!(Fingerprint::from_payload(&a), Fingerprint::from_payload(&b));
    }
}
