//! Fingerprint-based deduplication against the freshness window.
//!
//! A candidate is dropped when a stored record with the same
//! (source, data type, fingerprint) was written within the window; an older
//! match makes the candidate a refresh of the existing record. The per-
//! fingerprint check is a single store operation, and the store's unique
//! key is what keeps two concurrent workers from inserting the same content
//! twice.

use std::collections::HashSet;
use std::sync::Arc;

use crate::error::StoreResult;
use crate::traits::RelationalStore;
use crate::types::{CandidateRecord, DedupOutcome, Fingerprint};

/// Result of filtering one batch.
#[derive(Debug)]
pub struct FilterResult {
    /// Surviving candidates with their dedup classification
    pub accepted: Vec<(CandidateRecord, DedupOutcome)>,
    /// Candidates dropped as duplicates (in-batch or within the window)
    pub duplicates: u64,
}

pub struct Deduplicator {
    store: Arc<dyn RelationalStore>,
    window: chrono::Duration,
}

impl Deduplicator {
    pub fn new(store: Arc<dyn RelationalStore>, window: chrono::Duration) -> Self {
        Self { store, window }
    }

    /// Filter a complete batch. Runs only after the job has finished
    /// fetching; never over a partial batch.
    pub async fn filter(&self, candidates: Vec<CandidateRecord>) -> StoreResult<FilterResult> {
        let mut seen: HashSet<Fingerprint> = HashSet::with_capacity(candidates.len());
        let mut accepted = Vec::with_capacity(candidates.len());
        let mut duplicates = 0u64;

        for candidate in candidates {
            if !seen.insert(candidate.fingerprint.clone()) {
                duplicates += 1;
                continue;
            }

            let outcome = self
                .store
                .check_fingerprint(
                    &candidate.source,
                    &candidate.data_type,
                    &candidate.fingerprint,
                    self.window,
                )
                .await?;

            match outcome {
                DedupOutcome::Duplicate => {
                    tracing::debug!(
                        fingerprint = %candidate.fingerprint,
                        source = %candidate.source,
                        data_type = %candidate.data_type,
                        "dropping duplicate within freshness window"
                    );
                    duplicates += 1;
                }
                outcome => accepted.push((candidate, outcome)),
            }
        }

        Ok(FilterResult {
            accepted,
            duplicates,
        })
    }
}
