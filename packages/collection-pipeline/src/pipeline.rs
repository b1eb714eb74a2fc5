//! Pipeline orchestration.
//!
//! Wires the limiter, workers, deduplicator, router and tracker together;
//! exposes the job trigger and query surface consumed by the external
//! scheduler and by operators. Configuration is an immutable snapshot per
//! job; a reload takes effect on the next job, never retroactively.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::config::PipelineConfig;
use crate::dedup::Deduplicator;
use crate::error::{PipelineError, Result};
use crate::index_queue::IndexQueue;
use crate::limiter::TokenBucketLimiter;
use crate::router::{cache_key, StorageRouter};
use crate::tracker::{JobTracker, MetricsSnapshot};
use crate::traits::{
    CacheStore, DocumentStore, Extractor, RateLimiter, RelationalStore, VectorIndex,
};
use crate::types::{CollectionJob, Fingerprint, JobId, QualityAssessment};
use crate::worker::JobRunner;

pub struct CollectionPipeline {
    config: RwLock<Arc<PipelineConfig>>,
    extractors: RwLock<HashMap<String, Arc<dyn Extractor>>>,
    limiter: RwLock<Arc<dyn RateLimiter>>,
    /// True when the limiter was injected rather than built from config;
    /// injected limiters survive reloads.
    custom_limiter: bool,
    relational: Arc<dyn RelationalStore>,
    document: Arc<dyn DocumentStore>,
    cache: Arc<dyn CacheStore>,
    index_queue: Arc<IndexQueue>,
    tracker: Arc<JobTracker>,
    pool: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl CollectionPipeline {
    pub fn new(
        config: PipelineConfig,
        relational: Arc<dyn RelationalStore>,
        document: Arc<dyn DocumentStore>,
        cache: Arc<dyn CacheStore>,
        vector: Arc<dyn VectorIndex>,
    ) -> Self {
        let limiter: Arc<dyn RateLimiter> = Arc::new(TokenBucketLimiter::from_config(&config));
        let index_queue = Arc::new(IndexQueue::spawn(
            vector,
            config.index_queue_capacity,
            config.index_retries,
        ));
        let pool = Arc::new(Semaphore::new(config.worker_concurrency));

        Self {
            config: RwLock::new(Arc::new(config)),
            extractors: RwLock::new(HashMap::new()),
            limiter: RwLock::new(limiter),
            custom_limiter: false,
            relational,
            document,
            cache,
            index_queue,
            tracker: Arc::new(JobTracker::new()),
            pool,
            shutdown: CancellationToken::new(),
        }
    }

    /// Substitute a deterministic limiter (tests, shared cluster-wide
    /// limiters). Survives configuration reloads.
    pub fn with_limiter(mut self, limiter: Arc<dyn RateLimiter>) -> Self {
        *self.limiter.write().unwrap() = limiter;
        self.custom_limiter = true;
        self
    }

    /// Register the extraction adapter for a source.
    pub fn register_extractor(&self, source: impl Into<String>, extractor: Arc<dyn Extractor>) {
        self.extractors.write().unwrap().insert(source.into(), extractor);
    }

    pub fn tracker(&self) -> Arc<JobTracker> {
        self.tracker.clone()
    }

    pub fn config_snapshot(&self) -> Arc<PipelineConfig> {
        self.config.read().unwrap().clone()
    }

    /// Swap in a new configuration. Takes effect for jobs submitted after
    /// the swap; running jobs keep their snapshot.
    pub fn reload(&self, config: PipelineConfig) -> Result<()> {
        config.validate()?;
        if !self.custom_limiter {
            *self.limiter.write().unwrap() = Arc::new(TokenBucketLimiter::from_config(&config));
        }
        *self.config.write().unwrap() = Arc::new(config);
        tracing::info!("configuration reloaded");
        Ok(())
    }

    /// Job trigger for the external scheduler. Idempotent: when a job for
    /// the same (source, data type) is already running, its id is returned
    /// instead of starting a second one. Configuration problems reject the
    /// job before any fetch.
    pub fn submit_job(&self, source: &str, data_type: &str) -> Result<JobId> {
        let config = self.config_snapshot();
        let source_config = config.source(source)?;
        if !source_config.supports(data_type) {
            return Err(PipelineError::Config {
                message: format!("source '{source}' does not collect data type '{data_type}'"),
            });
        }
        let policy = config.policy_for(data_type)?.clone();

        let extractor = self
            .extractors
            .read()
            .unwrap()
            .get(source)
            .cloned()
            .ok_or_else(|| PipelineError::MissingExtractor {
                source_name: source.to_string(),
            })?;

        let (job_id, created) = self.tracker.start_job(source, data_type, policy);
        if !created {
            tracing::info!(
                job_id = %job_id,
                source = %source,
                data_type = %data_type,
                "job already running for pair, returning existing id"
            );
            return Ok(job_id);
        }

        let job = self.tracker.job_status(job_id)?;
        let runner = self.runner_for(&config);
        let tracker = self.tracker.clone();
        let pool = self.pool.clone();
        let cancel = self.shutdown.child_token();

        tokio::spawn(async move {
            let _permit = match pool.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    tracker.fail_job(job.id, "pipeline shut down before job started");
                    return;
                }
            };
            runner.run_job(&job, extractor, cancel).await;
        });

        Ok(job_id)
    }

    fn runner_for(&self, config: &PipelineConfig) -> JobRunner {
        let router = Arc::new(StorageRouter::new(
            self.relational.clone(),
            self.document.clone(),
            self.cache.clone(),
            self.index_queue.clone(),
            config.store_retries,
            config.store_timeout(),
        ));
        let dedup = Arc::new(Deduplicator::new(
            self.relational.clone(),
            config.dedup_window(),
        ));
        JobRunner::new(
            self.limiter.read().unwrap().clone(),
            dedup,
            router,
            self.relational.clone(),
            self.tracker.clone(),
            config.fetch_timeout(),
            config.job_timeout(),
            config.fetch_retries,
        )
    }

    // ========================================================================
    // QUERY SURFACE
    // ========================================================================

    pub fn job_status(&self, job_id: JobId) -> Result<CollectionJob> {
        self.tracker.job_status(job_id)
    }

    pub async fn quality_history(
        &self,
        source: &str,
        data_type: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<QualityAssessment>> {
        Ok(self
            .relational
            .assessments_in_range(source, data_type, from, to)
            .await?)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.tracker.snapshot()
    }

    /// Read-through lookup for one record: cache first when the policy
    /// allows it, then the primary store(s).
    pub async fn lookup(
        &self,
        source: &str,
        data_type: &str,
        fingerprint: &Fingerprint,
    ) -> Result<Option<serde_json::Value>> {
        let config = self.config_snapshot();
        let policy = config.policy_for(data_type)?;

        if policy.cache_eligible {
            if let Some(hit) = self.cache.get(&cache_key(data_type, fingerprint.as_str())).await? {
                return Ok(Some(hit));
            }
        }

        if policy.primary_store.includes_relational() {
            if let Some(record) = self
                .relational
                .find_by_fingerprint(source, data_type, fingerprint)
                .await?
            {
                return Ok(Some(record.payload));
            }
        }

        if policy.primary_store.includes_document() {
            let key = format!("{source}/{data_type}/{fingerprint}");
            if let Some(doc) = self.document.get(&key).await? {
                return Ok(doc.get("payload").cloned().or(Some(doc)));
            }
        }

        Ok(None)
    }

    /// Sweep expired documents out of the document store.
    pub async fn purge_expired(&self) -> Result<u64> {
        let purged = self.document.purge_expired(Utc::now()).await?;
        if purged > 0 {
            tracing::info!(purged, "purged expired documents");
        }
        Ok(purged)
    }

    // ========================================================================
    // SCHEDULING & SHUTDOWN
    // ========================================================================

    /// Periodic collection sweep over every configured (source, data type)
    /// pair, plus retention cleanup, until shutdown.
    pub async fn run_scheduled(&self) {
        let interval = self.config_snapshot().schedule_interval_secs;
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(interval.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::info!("scheduled collection stopped");
                    return;
                }
                _ = ticker.tick() => {}
            }

            let config = self.config_snapshot();
            for (source, source_config) in &config.sources {
                for data_type in &source_config.data_types {
                    match self.submit_job(source, data_type) {
                        Ok(job_id) => {
                            tracing::debug!(job_id = %job_id, source = %source, data_type = %data_type, "scheduled job");
                        }
                        Err(e) => {
                            tracing::warn!(source = %source, data_type = %data_type, error = %e, "scheduled submit failed");
                        }
                    }
                }
            }

            if let Err(e) = self.purge_expired().await {
                tracing::warn!(error = %e, "retention sweep failed");
            }
        }
    }

    /// Cancel running jobs and stop the index drain task. Records already
    /// routed stay where they are.
    pub async fn shutdown(&self) {
        tracing::info!("pipeline shutting down");
        self.shutdown.cancel();
        self.pool.close();
        self.index_queue.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PrimaryStore, RateLimit, SourceConfig, StoragePolicy};
    use crate::storage::memory::{
        MemoryCacheStore, MemoryDocumentStore, MemoryRelationalStore, MemoryVectorIndex,
    };
    use crate::testing::{MockExtractor, NoopLimiter};
    use crate::types::JobState;
    use serde_json::json;

    fn test_config() -> PipelineConfig {
        let mut config = PipelineConfig::default();
        config.policies.insert(
            "service_listing".into(),
            StoragePolicy::new(PrimaryStore::Both).with_criticality(8),
        );
        config.sources.insert(
            "portal".into(),
            SourceConfig {
                base_url: "https://example.gov".parse().unwrap(),
                rate_limit: RateLimit {
                    requests_per_second: 100,
                    burst: 100,
                    max_in_flight: 10,
                },
                data_types: vec!["service_listing".into()],
                owner: None,
            },
        );
        config
    }

    fn pipeline(config: PipelineConfig) -> CollectionPipeline {
        CollectionPipeline::new(
            config,
            Arc::new(MemoryRelationalStore::new()),
            Arc::new(MemoryDocumentStore::new()),
            Arc::new(MemoryCacheStore::new()),
            Arc::new(MemoryVectorIndex::new()),
        )
    }

    async fn wait_terminal(pipeline: &CollectionPipeline, job_id: JobId) -> CollectionJob {
        for _ in 0..200 {
            let job = pipeline.job_status(job_id).unwrap();
            if job.state.is_terminal() {
                return job;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        panic!("job {job_id} never reached a terminal state");
    }

    #[tokio::test]
    async fn submit_runs_job_to_completion() {
        let pipeline = pipeline(test_config());
        pipeline.register_extractor(
            "portal",
            Arc::new(
                MockExtractor::new("portal")
                    .with_target("https://example.gov/a", vec![json!({"title": "alpha"})]),
            ),
        );

        let job_id = pipeline.submit_job("portal", "service_listing").unwrap();
        let job = wait_terminal(&pipeline, job_id).await;

        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.succeeded, 1);
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn submit_is_idempotent_while_running() {
        let pipeline = pipeline(test_config()).with_limiter(Arc::new(NoopLimiter));
        pipeline.register_extractor(
            "portal",
            Arc::new(
                MockExtractor::new("portal")
                    .with_target("https://example.gov/a", vec![json!({"title": "alpha"})])
                    .with_delay(std::time::Duration::from_millis(200)),
            ),
        );

        let first = pipeline.submit_job("portal", "service_listing").unwrap();
        let second = pipeline.submit_job("portal", "service_listing").unwrap();
        assert_eq!(first, second);

        let job = wait_terminal(&pipeline, first).await;
        assert_eq!(job.state, JobState::Completed);

        // Terminal job frees the pair: a new submit creates a new job.
        let third = pipeline.submit_job("portal", "service_listing").unwrap();
        assert_ne!(first, third);
        wait_terminal(&pipeline, third).await;
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_source_and_missing_policy_are_rejected() {
        let pipeline = pipeline(test_config());

        assert!(matches!(
            pipeline.submit_job("nowhere", "service_listing"),
            Err(PipelineError::UnknownSource { .. })
        ));

        // Data type the source does not collect.
        assert!(matches!(
            pipeline.submit_job("portal", "mystery"),
            Err(PipelineError::Config { .. })
        ));
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn missing_extractor_rejects_before_any_fetch() {
        let pipeline = pipeline(test_config());
        assert!(matches!(
            pipeline.submit_job("portal", "service_listing"),
            Err(PipelineError::MissingExtractor { .. })
        ));
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn quality_history_accumulates_across_jobs() {
        let pipeline = pipeline(test_config());
        pipeline.register_extractor(
            "portal",
            Arc::new(
                MockExtractor::new("portal")
                    .with_target("https://example.gov/a", vec![json!({"title": "alpha"})]),
            ),
        );

        let job_id = pipeline.submit_job("portal", "service_listing").unwrap();
        wait_terminal(&pipeline, job_id).await;
        // Assessment persistence is spawned; give it a moment.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let history = pipeline
            .quality_history(
                "portal",
                "service_listing",
                Utc::now() - chrono::Duration::hours(1),
                Utc::now() + chrono::Duration::hours(1),
            )
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn lookup_reads_through_cache_to_primary() {
        let pipeline = pipeline(test_config());
        pipeline.register_extractor(
            "portal",
            Arc::new(
                MockExtractor::new("portal")
                    .with_target("https://example.gov/a", vec![json!({"title": "alpha"})]),
            ),
        );

        let job_id = pipeline.submit_job("portal", "service_listing").unwrap();
        wait_terminal(&pipeline, job_id).await;

        let fingerprint = Fingerprint::from_payload(&json!({"title": "alpha"}));
        let found = pipeline
            .lookup("portal", "service_listing", &fingerprint)
            .await
            .unwrap();
        assert_eq!(found, Some(json!({"title": "alpha"})));
        pipeline.shutdown().await;
    }

    #[tokio::test]
    async fn reload_applies_to_next_job() {
        let pipeline = pipeline(test_config());

        let mut updated = test_config();
        updated.policies.insert(
            "notices".into(),
            StoragePolicy::new(PrimaryStore::Document).with_retention_days(7),
        );
        updated
            .sources
            .get_mut("portal")
            .unwrap()
            .data_types
            .push("notices".into());
        pipeline.reload(updated).unwrap();

        pipeline.register_extractor(
            "portal",
            Arc::new(
                MockExtractor::new("portal")
                    .with_data_type("notices")
                    .with_target("https://example.gov/n", vec![json!({"title": "notice"})]),
            ),
        );

        let job_id = pipeline.submit_job("portal", "notices").unwrap();
        let job = wait_terminal(&pipeline, job_id).await;
        assert_eq!(job.state, JobState::Completed);
        pipeline.shutdown().await;
    }
}
