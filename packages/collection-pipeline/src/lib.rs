//! Collection orchestration and data-quality pipeline.
//!
//! Ingests raw records harvested from configured external sources, removes
//! duplicates by content fingerprint, scores batch quality, and routes each
//! accepted record to the store set its data type's policy calls for.
//! Site-specific extraction is supplied per source through the [`Extractor`]
//! trait; the relational/document/cache/vector destinations are likewise
//! trait seams, with in-memory and Postgres implementations provided.

pub mod config;
pub mod dedup;
pub mod error;
pub mod index_queue;
pub mod limiter;
pub mod pipeline;
pub mod quality;
pub mod router;
pub mod storage;
pub mod testing;
pub mod tracker;
pub mod traits;
pub mod types;
pub mod validate;
pub mod worker;

// Re-exports for clean API
pub use config::{PipelineConfig, PrimaryStore, RateLimit, SourceConfig, StoragePolicy};
pub use error::{FetchError, PipelineError, Result, StoreError};
pub use limiter::TokenBucketLimiter;
pub use pipeline::CollectionPipeline;
pub use tracker::{JobTracker, MetricsSnapshot, StoreMetrics};
pub use traits::{
    CacheStore, DocumentStore, Extractor, RateLimiter, RelationalStore, VectorIndex,
};
pub use types::{
    CandidateRecord, CollectionJob, DedupOutcome, FetchTarget, Fingerprint, JobId, JobResult,
    JobState, QualityAssessment, QualityBand, RecordId, RouteResult, RouteStatus, StoreKind,
    StoredRecord,
};
