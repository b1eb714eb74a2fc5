//! Job execution.
//!
//! A runner takes one job through its whole life: permit-gated fetches with
//! retries, whole-batch cleaning/validation, deduplication, quality scoring,
//! routing, and tracker bookkeeping. Partial target failures never abort the
//! job; the job-level deadline abandons the targets not yet fetched and the
//! job fails only when it produced nothing at all.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::dedup::Deduplicator;
use crate::error::FetchError;
use crate::quality;
use crate::router::StorageRouter;
use crate::tracker::JobTracker;
use crate::traits::{Extractor, RateLimiter, RelationalStore};
use crate::types::{
    CandidateRecord, CollectionJob, FetchTarget, JobResult, RouteStatus, StoredRecord,
};
use crate::validate;

pub struct JobRunner {
    limiter: Arc<dyn RateLimiter>,
    dedup: Arc<Deduplicator>,
    router: Arc<StorageRouter>,
    relational: Arc<dyn RelationalStore>,
    tracker: Arc<JobTracker>,
    fetch_timeout: Duration,
    job_timeout: Duration,
    fetch_retries: u32,
}

struct FetchPhase {
    candidates: Vec<CandidateRecord>,
    fetch_errors: u64,
    timed_out: bool,
    cancelled: bool,
}

impl JobRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        limiter: Arc<dyn RateLimiter>,
        dedup: Arc<Deduplicator>,
        router: Arc<StorageRouter>,
        relational: Arc<dyn RelationalStore>,
        tracker: Arc<JobTracker>,
        fetch_timeout: Duration,
        job_timeout: Duration,
        fetch_retries: u32,
    ) -> Self {
        Self {
            limiter,
            dedup,
            router,
            relational,
            tracker,
            fetch_timeout,
            job_timeout,
            fetch_retries,
        }
    }

    /// Run one job to a terminal state. Always leaves the tracker and the
    /// stores consistent; never panics on fetch or store failures.
    pub async fn run_job(
        &self,
        job: &CollectionJob,
        extractor: Arc<dyn Extractor>,
        cancel: CancellationToken,
    ) -> JobResult {
        self.tracker.mark_running(job.id);
        tracing::info!(
            job_id = %job.id,
            source = %job.source,
            data_type = %job.data_type,
            "job running"
        );

        let phase = self.fetch_phase(job, extractor, &cancel).await;

        if phase.candidates.is_empty() {
            let reason = if phase.cancelled {
                "cancelled before any records were produced"
            } else if phase.timed_out {
                "job timed out with zero records produced"
            } else {
                "zero records produced"
            };
            let result = JobResult {
                job_id: job.id,
                assessment: quality::assess(0, 0, 0),
                records_routed: 0,
                records_failed: 0,
                duplicates: 0,
                fetch_errors: phase.fetch_errors,
                warnings: Vec::new(),
            };
            self.save_assessment(job, &result);
            self.tracker.fail_job(job.id, reason);
            return result;
        }

        // Clean and validate over the complete batch only.
        let total = phase.candidates.len() as u64;
        let mut valid_candidates = Vec::with_capacity(phase.candidates.len());
        let mut validation_errors = 0u64;

        for candidate in phase.candidates {
            let cleaned = validate::clean_payload(&candidate.payload);
            let mut cleaned_candidate =
                CandidateRecord::new(&candidate.source, &candidate.data_type, cleaned);
            cleaned_candidate.captured_at = candidate.captured_at;

            match validate::validate_candidate(&cleaned_candidate) {
                Ok(()) => valid_candidates.push(cleaned_candidate),
                Err(e) => {
                    validation_errors += 1;
                    tracing::debug!(
                        job_id = %job.id,
                        error = %e,
                        "candidate failed validation, dropping"
                    );
                }
            }
        }

        let valid = valid_candidates.len() as u64;
        let assessment = quality::assess(total, valid, validation_errors);
        tracing::info!(
            job_id = %job.id,
            total,
            valid,
            errors = validation_errors,
            band = assessment.band.as_str(),
            "batch assessed"
        );

        // Dedup against the freshness window, over the complete batch.
        let filtered = match self.dedup.filter(valid_candidates).await {
            Ok(filtered) => filtered,
            Err(e) => {
                let result = JobResult {
                    job_id: job.id,
                    assessment,
                    records_routed: 0,
                    records_failed: 0,
                    duplicates: 0,
                    fetch_errors: phase.fetch_errors,
                    warnings: Vec::new(),
                };
                self.save_assessment(job, &result);
                self.tracker
                    .fail_job(job.id, format!("dedup check failed: {e}"));
                return result;
            }
        };

        let warnings =
            validate::batch_warnings(&filtered.accepted.iter().map(|(c, _)| c.clone()).collect::<Vec<_>>());

        // Route the survivors. An invalid batch band still routes its
        // individually valid records; the band is a signal, not a gate.
        let mut records_routed = 0u64;
        let mut records_failed = 0u64;

        for (candidate, outcome) in filtered.accepted {
            if cancel.is_cancelled() {
                tracing::info!(job_id = %job.id, "cancelled mid-routing; routed records remain");
                break;
            }

            tracing::debug!(
                job_id = %job.id,
                fingerprint = %candidate.fingerprint,
                outcome = ?outcome,
                "routing record"
            );

            let record = StoredRecord::from_candidate(&candidate, assessment.band);
            self.tracker.routing_started();
            let route = self.router.route(record, &job.policy).await;
            self.tracker.routing_finished();

            for op in route.operations {
                self.tracker.record_store_outcome(job.id, op);
            }

            match route.status {
                RouteStatus::Routed => records_routed += 1,
                _ => records_failed += 1,
            }
        }

        let result = JobResult {
            job_id: job.id,
            assessment,
            records_routed,
            records_failed,
            duplicates: filtered.duplicates,
            fetch_errors: phase.fetch_errors,
            warnings,
        };

        self.save_assessment(job, &result);
        self.tracker.complete_job(&result);
        result
    }

    /// Fetch every target, permit-gated, until done, deadline, or cancel.
    async fn fetch_phase(
        &self,
        job: &CollectionJob,
        extractor: Arc<dyn Extractor>,
        cancel: &CancellationToken,
    ) -> FetchPhase {
        let mut phase = FetchPhase {
            candidates: Vec::new(),
            fetch_errors: 0,
            timed_out: false,
            cancelled: false,
        };

        let targets = match extractor.targets(&job.data_type).await {
            Ok(targets) => targets,
            Err(e) => {
                tracing::warn!(job_id = %job.id, error = %e, "target enumeration failed");
                phase.fetch_errors += 1;
                return phase;
            }
        };

        let deadline = tokio::time::Instant::now() + self.job_timeout;

        for target in &targets {
            if cancel.is_cancelled() {
                phase.cancelled = true;
                tracing::info!(job_id = %job.id, "job cancelled, abandoning remaining targets");
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                phase.timed_out = true;
                tracing::warn!(
                    job_id = %job.id,
                    fetched = phase.candidates.len(),
                    "job deadline reached, abandoning remaining targets"
                );
                break;
            }

            match self.fetch_one(&job.source, extractor.as_ref(), target).await {
                Ok(mut candidates) => phase.candidates.append(&mut candidates),
                Err(e) => {
                    phase.fetch_errors += 1;
                    tracing::warn!(
                        job_id = %job.id,
                        target = %target,
                        error = %e,
                        "target failed after retries, continuing"
                    );
                }
            }
        }

        phase
    }

    /// One target: each attempt takes and returns a rate permit, so retries
    /// are as polite as first tries.
    async fn fetch_one(
        &self,
        source: &str,
        extractor: &dyn Extractor,
        target: &FetchTarget,
    ) -> Result<Vec<CandidateRecord>, FetchError> {
        let mut attempt = 0u32;
        loop {
            self.limiter.acquire(source).await;
            let outcome = match tokio::time::timeout(self.fetch_timeout, extractor.fetch(target))
                .await
            {
                Ok(outcome) => outcome,
                Err(_) => Err(FetchError::Timeout {
                    target: target.to_string(),
                }),
            };
            self.limiter.release(source);

            match outcome {
                Ok(candidates) => return Ok(candidates),
                Err(e) if e.is_retryable() && attempt < self.fetch_retries => {
                    attempt += 1;
                    let backoff = Duration::from_millis(100 * (1 << attempt.min(6)));
                    tracing::debug!(
                        target = %target,
                        attempt,
                        error = %e,
                        "fetch failed, backing off"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Persisting the assessment is observability, not routing; a failure
    /// here logs and moves on.
    fn save_assessment(&self, job: &CollectionJob, result: &JobResult) {
        let relational = self.relational.clone();
        let source = job.source.clone();
        let data_type = job.data_type.clone();
        let job_id = job.id;
        let assessment = result.assessment.clone();
        tokio::spawn(async move {
            if let Err(e) = relational
                .save_assessment(&source, &data_type, job_id, &assessment)
                .await
            {
                tracing::warn!(job_id = %job_id, error = %e, "failed to persist assessment");
            }
        });
    }
}
