//! In-memory store implementations for tests and development.
//!
//! Not suitable for production; data is lost on restart. The relational,
//! document and vector implementations can be switched into a failing mode
//! so tests can exercise retry and fail-forward paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{StoreError, StoreResult};
use crate::traits::{CacheStore, DocumentStore, RelationalStore, VectorIndex};
use crate::types::{
    DedupOutcome, Fingerprint, JobId, QualityAssessment, StoredRecord, UpsertOutcome,
};

fn injected_failure(kind: &str) -> StoreError {
    StoreError::Unavailable(format!("{kind} store in failing mode"))
}

type RecordKey = (String, String, String);

// ============================================================================
// RELATIONAL
// ============================================================================

pub struct MemoryRelationalStore {
    records: RwLock<HashMap<RecordKey, StoredRecord>>,
    assessments: RwLock<Vec<(String, String, JobId, QualityAssessment)>>,
    failing: AtomicBool,
}

impl MemoryRelationalStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            assessments: RwLock::new(Vec::new()),
            failing: AtomicBool::new(false),
        }
    }

    /// Make every subsequent write fail, for retry/exhaustion tests.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn record_count(&self) -> usize {
        self.records.read().unwrap().len()
    }

    pub fn get_by_fingerprint(
        &self,
        source: &str,
        data_type: &str,
        fingerprint: &Fingerprint,
    ) -> Option<StoredRecord> {
        let key = (
            source.to_string(),
            data_type.to_string(),
            fingerprint.0.clone(),
        );
        self.records.read().unwrap().get(&key).cloned()
    }

    /// Backdate a record's last observation, for freshness-window tests.
    pub fn age_record(
        &self,
        source: &str,
        data_type: &str,
        fingerprint: &Fingerprint,
        last_seen_at: DateTime<Utc>,
    ) {
        let key = (
            source.to_string(),
            data_type.to_string(),
            fingerprint.0.clone(),
        );
        if let Some(record) = self.records.write().unwrap().get_mut(&key) {
            record.last_seen_at = last_seen_at;
        }
    }

    fn check_failing(&self) -> StoreResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(injected_failure("relational"))
        } else {
            Ok(())
        }
    }
}

impl Default for MemoryRelationalStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RelationalStore for MemoryRelationalStore {
    async fn upsert_record(&self, record: &StoredRecord) -> StoreResult<UpsertOutcome> {
        self.check_failing()?;
        let key = (
            record.source.clone(),
            record.data_type.clone(),
            record.fingerprint.0.clone(),
        );

        let mut records = self.records.write().unwrap();
        match records.get_mut(&key) {
            Some(existing) => {
                // Refresh: same fingerprint, new observation.
                existing.payload = record.payload.clone();
                existing.band = record.band;
                existing.last_seen_at = record.last_seen_at;
                for store in &record.stores_written {
                    if !existing.stores_written.contains(store) {
                        existing.stores_written.push(*store);
                    }
                }
                Ok(UpsertOutcome {
                    record_id: existing.id,
                    was_inserted: false,
                })
            }
            None => {
                let id = record.id;
                records.insert(key, record.clone());
                Ok(UpsertOutcome {
                    record_id: id,
                    was_inserted: true,
                })
            }
        }
    }

    async fn check_fingerprint(
        &self,
        source: &str,
        data_type: &str,
        fingerprint: &Fingerprint,
        window: chrono::Duration,
    ) -> StoreResult<DedupOutcome> {
        self.check_failing()?;
        let key = (
            source.to_string(),
            data_type.to_string(),
            fingerprint.0.clone(),
        );
        let records = self.records.read().unwrap();
        Ok(match records.get(&key) {
            None => DedupOutcome::New,
            Some(existing) if Utc::now() - existing.last_seen_at <= window => {
                DedupOutcome::Duplicate
            }
            Some(_) => DedupOutcome::Refresh,
        })
    }

    async fn find_by_fingerprint(
        &self,
        source: &str,
        data_type: &str,
        fingerprint: &Fingerprint,
    ) -> StoreResult<Option<StoredRecord>> {
        Ok(self.get_by_fingerprint(source, data_type, fingerprint))
    }

    async fn records_in_range(
        &self,
        source: &str,
        data_type: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<StoredRecord>> {
        let records = self.records.read().unwrap();
        Ok(records
            .values()
            .filter(|r| {
                r.source == source
                    && r.data_type == data_type
                    && r.last_seen_at >= from
                    && r.last_seen_at <= to
            })
            .cloned()
            .collect())
    }

    async fn save_assessment(
        &self,
        source: &str,
        data_type: &str,
        job_id: JobId,
        assessment: &QualityAssessment,
    ) -> StoreResult<()> {
        self.check_failing()?;
        self.assessments.write().unwrap().push((
            source.to_string(),
            data_type.to_string(),
            job_id,
            assessment.clone(),
        ));
        Ok(())
    }

    async fn assessments_in_range(
        &self,
        source: &str,
        data_type: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<QualityAssessment>> {
        let assessments = self.assessments.read().unwrap();
        Ok(assessments
            .iter()
            .filter(|(s, dt, _, a)| {
                s == source && dt == data_type && a.assessed_at >= from && a.assessed_at <= to
            })
            .map(|(_, _, _, a)| a.clone())
            .collect())
    }
}

// ============================================================================
// DOCUMENT
// ============================================================================

pub struct MemoryDocumentStore {
    documents: RwLock<HashMap<String, (serde_json::Value, Option<DateTime<Utc>>)>>,
    failing: AtomicBool,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self {
            documents: RwLock::new(HashMap::new()),
            failing: AtomicBool::new(false),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.documents.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn expiry_of(&self, key: &str) -> Option<Option<DateTime<Utc>>> {
        self.documents
            .read()
            .unwrap()
            .get(key)
            .map(|(_, expires)| *expires)
    }
}

impl Default for MemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn put(
        &self,
        key: &str,
        document: &serde_json::Value,
        expires_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(injected_failure("document"));
        }
        self.documents
            .write()
            .unwrap()
            .insert(key.to_string(), (document.clone(), expires_at));
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<serde_json::Value>> {
        let documents = self.documents.read().unwrap();
        Ok(documents.get(key).and_then(|(doc, expires_at)| {
            match expires_at {
                Some(expiry) if *expiry <= Utc::now() => None,
                _ => Some(doc.clone()),
            }
        }))
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> StoreResult<u64> {
        let mut documents = self.documents.write().unwrap();
        let before = documents.len();
        documents.retain(|_, (_, expires_at)| match expires_at {
            Some(expiry) => *expiry > now,
            None => true,
        });
        Ok((before - documents.len()) as u64)
    }
}

// ============================================================================
// CACHE
// ============================================================================

pub struct MemoryCacheStore {
    entries: RwLock<HashMap<String, (serde_json::Value, DateTime<Utc>)>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn ttl_of(&self, key: &str) -> Option<chrono::Duration> {
        self.entries
            .read()
            .unwrap()
            .get(key)
            .map(|(_, expires_at)| *expires_at - Utc::now())
    }
}

impl Default for MemoryCacheStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn put(
        &self,
        key: &str,
        value: &serde_json::Value,
        ttl: std::time::Duration,
    ) -> StoreResult<()> {
        let expires_at = Utc::now()
            + chrono::Duration::from_std(ttl).map_err(|e| StoreError::Cache(Box::new(e)))?;
        self.entries
            .write()
            .unwrap()
            .insert(key.to_string(), (value.clone(), expires_at));
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<serde_json::Value>> {
        let entries = self.entries.read().unwrap();
        Ok(entries
            .get(key)
            .filter(|(_, expires_at)| *expires_at > Utc::now())
            .map(|(value, _)| value.clone()))
    }
}

// ============================================================================
// VECTOR INDEX
// ============================================================================

pub struct MemoryVectorIndex {
    entries: RwLock<HashMap<String, (String, serde_json::Value)>>,
    failing: AtomicBool,
}

impl MemoryVectorIndex {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            failing: AtomicBool::new(false),
        }
    }

    /// An index whose every upsert fails, for fail-forward tests.
    pub fn failing() -> Self {
        let index = Self::new();
        index.failing.store(true, Ordering::SeqCst);
        index
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryVectorIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VectorIndex for MemoryVectorIndex {
    async fn upsert(
        &self,
        id: &str,
        text: &str,
        metadata: serde_json::Value,
    ) -> StoreResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(injected_failure("vector"));
        }
        self.entries
            .write()
            .unwrap()
            .insert(id.to_string(), (text.to_string(), metadata));
        Ok(())
    }
}
