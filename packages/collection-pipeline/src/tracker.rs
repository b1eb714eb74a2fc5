//! Job lifecycle and operational metrics.
//!
//! The tracker observes and reports; it never retries anything. Alerting
//! (sustained low quality, store failure rates) is an external consumer of
//! the snapshots exposed here.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use chrono::Utc;

use crate::config::StoragePolicy;
use crate::error::{PipelineError, Result};
use crate::types::{
    CollectionJob, JobId, JobResult, JobState, QualityBand, StoreKind, StoreOperation,
    StoreOutcome,
};

/// How many recent bands to keep per (source, data type) for trend checks.
const BAND_HISTORY_LIMIT: usize = 50;

/// Aggregate counters for one store destination.
#[derive(Debug, Clone, Default)]
pub struct StoreMetrics {
    pub successes: u64,
    pub failures: u64,
    pub total_duration: Duration,
    pub max_duration: Duration,
}

impl StoreMetrics {
    fn record(&mut self, op: &StoreOperation) {
        match op.outcome {
            StoreOutcome::Success => self.successes += 1,
            StoreOutcome::Failure => self.failures += 1,
        }
        self.total_duration += op.duration;
        self.max_duration = self.max_duration.max(op.duration);
    }

    pub fn attempts(&self) -> u64 {
        self.successes + self.failures
    }

    pub fn failure_rate(&self) -> f64 {
        if self.attempts() == 0 {
            0.0
        } else {
            self.failures as f64 / self.attempts() as f64
        }
    }

    pub fn mean_latency(&self) -> Duration {
        if self.attempts() == 0 {
            Duration::ZERO
        } else {
            self.total_duration / self.attempts() as u32
        }
    }
}

/// Point-in-time view for alert consumers.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub store_metrics: HashMap<StoreKind, StoreMetrics>,
    pub partially_routed: u64,
}

#[derive(Default)]
struct TrackerState {
    jobs: HashMap<JobId, CollectionJob>,
    job_operations: HashMap<JobId, Vec<StoreOperation>>,
    running: HashMap<(String, String), JobId>,
    store_metrics: HashMap<StoreKind, StoreMetrics>,
    band_history: HashMap<(String, String), VecDeque<QualityBand>>,
    jobs_completed: u64,
    jobs_failed: u64,
}

pub struct JobTracker {
    state: RwLock<TrackerState>,
    partially_routed: AtomicU64,
}

impl JobTracker {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(TrackerState::default()),
            partially_routed: AtomicU64::new(0),
        }
    }

    /// Create a job for a (source, data type) pair. Returns the existing
    /// job when one is already running for the pair, so a scheduler retry
    /// never starts a second collection against the same source.
    pub fn start_job(
        &self,
        source: &str,
        data_type: &str,
        policy: StoragePolicy,
    ) -> (JobId, bool) {
        let key = (source.to_string(), data_type.to_string());
        let mut state = self.state.write().unwrap();

        if let Some(existing) = state.running.get(&key) {
            return (*existing, false);
        }

        let job = CollectionJob {
            id: JobId::new(),
            source: source.to_string(),
            data_type: data_type.to_string(),
            state: JobState::Pending,
            started_at: Utc::now(),
            finished_at: None,
            processed: 0,
            succeeded: 0,
            failed: 0,
            error_summary: None,
            policy,
        };
        let id = job.id;
        state.running.insert(key, id);
        state.jobs.insert(id, job);

        tracing::info!(job_id = %id, source = %source, data_type = %data_type, "job created");
        (id, true)
    }

    pub fn mark_running(&self, job_id: JobId) {
        let mut state = self.state.write().unwrap();
        if let Some(job) = state.jobs.get_mut(&job_id) {
            job.state = JobState::Running;
        }
    }

    /// Record one store write attempt against the job and the global
    /// per-store aggregates.
    pub fn record_store_outcome(&self, job_id: JobId, op: StoreOperation) {
        let mut state = self.state.write().unwrap();
        state.store_metrics.entry(op.kind).or_default().record(&op);
        state.job_operations.entry(job_id).or_default().push(op);
    }

    /// Close a job as completed and fold its assessment into the band
    /// history for trend alerting.
    pub fn complete_job(&self, result: &JobResult) {
        let mut state = self.state.write().unwrap();
        let Some(job) = state.jobs.get_mut(&result.job_id) else {
            return;
        };

        job.state = JobState::Completed;
        job.finished_at = Some(Utc::now());
        job.processed = result.assessment.total;
        job.succeeded = result.records_routed;
        job.failed = result.records_failed + result.fetch_errors;

        let source = job.source.clone();
        let data_type = job.data_type.clone();
        let band = result.assessment.band;

        state.running.remove(&(source.clone(), data_type.clone()));
        state.jobs_completed += 1;

        let history = state.band_history.entry((source, data_type)).or_default();
        history.push_back(band);
        if history.len() > BAND_HISTORY_LIMIT {
            history.pop_front();
        }

        tracing::info!(
            job_id = %result.job_id,
            band = band.as_str(),
            routed = result.records_routed,
            duplicates = result.duplicates,
            "job completed"
        );
    }

    /// Close a job as failed. Terminal; a retry creates a new job.
    pub fn fail_job(&self, job_id: JobId, error_summary: impl Into<String>) {
        let mut state = self.state.write().unwrap();
        let Some(job) = state.jobs.get_mut(&job_id) else {
            return;
        };

        job.state = JobState::Failed;
        job.finished_at = Some(Utc::now());
        let summary = error_summary.into();
        job.error_summary = Some(summary.clone());

        let key = (job.source.clone(), job.data_type.clone());
        state.running.remove(&key);
        state.jobs_failed += 1;

        tracing::warn!(job_id = %job_id, error = %summary, "job failed");
    }

    pub fn job_status(&self, job_id: JobId) -> Result<CollectionJob> {
        self.state
            .read()
            .unwrap()
            .jobs
            .get(&job_id)
            .cloned()
            .ok_or(PipelineError::UnknownJob(job_id))
    }

    /// Store write attempts recorded against one job.
    pub fn job_operations(&self, job_id: JobId) -> Vec<StoreOperation> {
        self.state
            .read()
            .unwrap()
            .job_operations
            .get(&job_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Most recent quality bands for a (source, data type), newest last.
    pub fn recent_bands(&self, source: &str, data_type: &str, limit: usize) -> Vec<QualityBand> {
        let state = self.state.read().unwrap();
        state
            .band_history
            .get(&(source.to_string(), data_type.to_string()))
            .map(|history| {
                history
                    .iter()
                    .rev()
                    .take(limit)
                    .rev()
                    .copied()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn routing_started(&self) {
        self.partially_routed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn routing_finished(&self) {
        self.partially_routed.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let state = self.state.read().unwrap();
        MetricsSnapshot {
            jobs_completed: state.jobs_completed,
            jobs_failed: state.jobs_failed,
            store_metrics: state.store_metrics.clone(),
            partially_routed: self.partially_routed.load(Ordering::Relaxed),
        }
    }
}

impl Default for JobTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PrimaryStore, StoragePolicy};
    use crate::quality;

    fn policy() -> StoragePolicy {
        StoragePolicy::new(PrimaryStore::Relational)
    }

    fn result_for(job_id: JobId, band_counts: (u64, u64, u64)) -> JobResult {
        let (total, valid, errors) = band_counts;
        JobResult {
            job_id,
            assessment: quality::assess(total, valid, errors),
            records_routed: valid,
            records_failed: 0,
            duplicates: 0,
            fetch_errors: errors,
            warnings: Vec::new(),
        }
    }

    #[test]
    fn second_start_returns_running_job() {
        let tracker = JobTracker::new();
        let (first, created) = tracker.start_job("portal", "service_listing", policy());
        assert!(created);
        let (second, created) = tracker.start_job("portal", "service_listing", policy());
        assert!(!created);
        assert_eq!(first, second);

        // A different data type gets its own job.
        let (third, created) = tracker.start_job("portal", "notices", policy());
        assert!(created);
        assert_ne!(first, third);
    }

    #[test]
    fn completion_frees_the_pair() {
        let tracker = JobTracker::new();
        let (first, _) = tracker.start_job("portal", "service_listing", policy());
        tracker.complete_job(&result_for(first, (10, 10, 0)));

        let status = tracker.job_status(first).unwrap();
        assert_eq!(status.state, JobState::Completed);
        assert!(status.finished_at.is_some());

        let (second, created) = tracker.start_job("portal", "service_listing", policy());
        assert!(created);
        assert_ne!(first, second);
    }

    #[test]
    fn band_history_accumulates() {
        let tracker = JobTracker::new();
        for counts in [(10, 10, 0), (10, 7, 2), (10, 2, 8)] {
            let (id, _) = tracker.start_job("portal", "service_listing", policy());
            tracker.complete_job(&result_for(id, counts));
        }
        let bands = tracker.recent_bands("portal", "service_listing", 10);
        assert_eq!(
            bands,
            vec![QualityBand::High, QualityBand::Medium, QualityBand::Invalid]
        );
    }

    #[test]
    fn store_metrics_aggregate() {
        let tracker = JobTracker::new();
        let (id, _) = tracker.start_job("portal", "service_listing", policy());
        tracker.record_store_outcome(
            id,
            StoreOperation {
                kind: StoreKind::Relational,
                duration: Duration::from_millis(10),
                outcome: StoreOutcome::Success,
            },
        );
        tracker.record_store_outcome(
            id,
            StoreOperation {
                kind: StoreKind::Relational,
                duration: Duration::from_millis(30),
                outcome: StoreOutcome::Failure,
            },
        );

        let snapshot = tracker.snapshot();
        let metrics = &snapshot.store_metrics[&StoreKind::Relational];
        assert_eq!(metrics.attempts(), 2);
        assert_eq!(metrics.failure_rate(), 0.5);
        assert_eq!(metrics.mean_latency(), Duration::from_millis(20));
        assert_eq!(tracker.job_operations(id).len(), 2);
    }

    #[test]
    fn failed_job_is_terminal_and_frees_pair() {
        let tracker = JobTracker::new();
        let (id, _) = tracker.start_job("portal", "service_listing", policy());
        tracker.fail_job(id, "no records produced");

        let status = tracker.job_status(id).unwrap();
        assert_eq!(status.state, JobState::Failed);
        assert_eq!(status.error_summary.as_deref(), Some("no records produced"));

        let (second, created) = tracker.start_job("portal", "service_listing", policy());
        assert!(created);
        assert_ne!(id, second);
    }
}
