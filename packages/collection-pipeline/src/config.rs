//! Source definitions and per-data-type storage policy.
//!
//! Loaded from a JSON document at startup (env overrides for the runtime
//! knobs), consumed as an immutable snapshot by every job. A reload swaps
//! the whole snapshot; running jobs keep the one they started with.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{PipelineError, Result};

/// Primary durable store for a data type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrimaryStore {
    Relational,
    Document,
    Both,
}

impl PrimaryStore {
    pub fn includes_relational(&self) -> bool {
        matches!(self, PrimaryStore::Relational | PrimaryStore::Both)
    }

    pub fn includes_document(&self) -> bool {
        matches!(self, PrimaryStore::Document | PrimaryStore::Both)
    }
}

/// Storage placement policy for one data type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoragePolicy {
    pub primary_store: PrimaryStore,
    #[serde(default = "default_true")]
    pub cache_eligible: bool,
    #[serde(default = "default_true")]
    pub vector_eligible: bool,
    /// None = permanent
    #[serde(default)]
    pub retention_days: Option<u32>,
    #[serde(default = "default_criticality")]
    pub criticality: u8,
}

fn default_true() -> bool {
    true
}

fn default_criticality() -> u8 {
    5
}

impl StoragePolicy {
    pub fn new(primary_store: PrimaryStore) -> Self {
        Self {
            primary_store,
            cache_eligible: true,
            vector_eligible: true,
            retention_days: None,
            criticality: 5,
        }
    }

    pub fn with_retention_days(mut self, days: u32) -> Self {
        self.retention_days = Some(days);
        self
    }

    pub fn with_criticality(mut self, criticality: u8) -> Self {
        self.criticality = criticality;
        self
    }

    pub fn without_cache(mut self) -> Self {
        self.cache_eligible = false;
        self
    }

    pub fn without_vector(mut self) -> Self {
        self.vector_eligible = false;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=10).contains(&self.criticality) {
            return Err(PipelineError::Config {
                message: format!("criticality must be 1..=10, got {}", self.criticality),
            });
        }
        if self.retention_days == Some(0) {
            return Err(PipelineError::Config {
                message: "retention_days must be positive; omit for permanent data".into(),
            });
        }
        Ok(())
    }

    /// Cache TTL from the criticality table: hotter data expires sooner
    /// so it is re-read from the primary store more often.
    pub fn cache_ttl(&self) -> Duration {
        match self.criticality {
            9..=10 => Duration::from_secs(60 * 60),
            7..=8 => Duration::from_secs(6 * 60 * 60),
            5..=6 => Duration::from_secs(24 * 60 * 60),
            3..=4 => Duration::from_secs(7 * 24 * 60 * 60),
            _ => Duration::from_secs(28 * 24 * 60 * 60),
        }
    }

    /// Document expiration timestamp, absent for permanent data.
    pub fn document_expiry(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.retention_days
            .map(|days| now + chrono::Duration::days(i64::from(days)))
    }
}

/// Politeness budget for one source domain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimit {
    /// Sustained requests per second
    #[serde(default = "default_rps")]
    pub requests_per_second: u32,
    /// Short burst allowance on top of the sustained rate
    #[serde(default = "default_burst")]
    pub burst: u32,
    /// Bound on simultaneously in-flight requests
    #[serde(default = "default_in_flight")]
    pub max_in_flight: usize,
}

fn default_rps() -> u32 {
    1
}

fn default_burst() -> u32 {
    2
}

fn default_in_flight() -> usize {
    2
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            requests_per_second: default_rps(),
            burst: default_burst(),
            max_in_flight: default_in_flight(),
        }
    }
}

/// A named external data origin. Immutable at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub base_url: Url,
    #[serde(default)]
    pub rate_limit: RateLimit,
    pub data_types: Vec<String>,
    #[serde(default)]
    pub owner: Option<String>,
}

impl SourceConfig {
    pub fn supports(&self, data_type: &str) -> bool {
        self.data_types.iter().any(|dt| dt == data_type)
    }
}

/// Full pipeline configuration snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub sources: HashMap<String, SourceConfig>,
    #[serde(default)]
    pub policies: HashMap<String, StoragePolicy>,

    /// Freshness window: repeated fingerprints inside it are duplicates
    #[serde(default = "default_dedup_window_days")]
    pub dedup_window_days: u32,
    /// Global worker pool size
    #[serde(default = "default_concurrency")]
    pub worker_concurrency: usize,
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,
    #[serde(default = "default_job_timeout")]
    pub job_timeout_secs: u64,
    #[serde(default = "default_store_timeout")]
    pub store_timeout_secs: u64,
    /// Retry attempts per fetch target after the first try
    #[serde(default = "default_retries")]
    pub fetch_retries: u32,
    /// Retry attempts per required store write after the first try
    #[serde(default = "default_retries")]
    pub store_retries: u32,
    /// Retry attempts per vector-index request after the first try
    #[serde(default = "default_retries")]
    pub index_retries: u32,
    #[serde(default = "default_index_capacity")]
    pub index_queue_capacity: usize,
    /// Interval between scheduled collection sweeps
    #[serde(default = "default_schedule_interval")]
    pub schedule_interval_secs: u64,
}

fn default_dedup_window_days() -> u32 {
    30
}

fn default_concurrency() -> usize {
    5
}

fn default_fetch_timeout() -> u64 {
    30
}

fn default_job_timeout() -> u64 {
    300
}

fn default_store_timeout() -> u64 {
    10
}

fn default_retries() -> u32 {
    3
}

fn default_index_capacity() -> usize {
    1024
}

fn default_schedule_interval() -> u64 {
    3600
}

impl Default for PipelineConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("empty config deserializes")
    }
}

impl PipelineConfig {
    /// Parse a JSON configuration document and validate it.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from the file named by `COLLECTION_CONFIG_PATH` (after reading
    /// a local `.env` if present), then apply env overrides.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut config = match std::env::var("COLLECTION_CONFIG_PATH") {
            Ok(path) => {
                let raw = std::fs::read_to_string(&path).map_err(|e| PipelineError::Config {
                    message: format!("cannot read config file {path}: {e}"),
                })?;
                Self::from_json(&raw)?
            }
            Err(_) => Self::default(),
        };

        if let Some(v) = env_u64("COLLECTION_WORKER_CONCURRENCY")? {
            config.worker_concurrency = v as usize;
        }
        if let Some(v) = env_u64("COLLECTION_DEDUP_WINDOW_DAYS")? {
            config.dedup_window_days = v as u32;
        }
        if let Some(v) = env_u64("COLLECTION_FETCH_TIMEOUT_SECS")? {
            config.fetch_timeout_secs = v;
        }
        if let Some(v) = env_u64("COLLECTION_JOB_TIMEOUT_SECS")? {
            config.job_timeout_secs = v;
        }
        if let Some(v) = env_u64("COLLECTION_SCHEDULE_INTERVAL_SECS")? {
            config.schedule_interval_secs = v;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for (data_type, policy) in &self.policies {
            policy.validate().map_err(|e| PipelineError::Config {
                message: format!("policy '{data_type}': {e}"),
            })?;
        }
        for (name, source) in &self.sources {
            if source.rate_limit.requests_per_second == 0 {
                return Err(PipelineError::Config {
                    message: format!("source '{name}': requests_per_second must be > 0"),
                });
            }
            if source.rate_limit.max_in_flight == 0 {
                return Err(PipelineError::Config {
                    message: format!("source '{name}': max_in_flight must be > 0"),
                });
            }
            for data_type in &source.data_types {
                if !self.policies.contains_key(data_type) {
                    return Err(PipelineError::Config {
                        message: format!(
                            "source '{name}' lists data type '{data_type}' with no storage policy"
                        ),
                    });
                }
            }
        }
        if self.worker_concurrency == 0 {
            return Err(PipelineError::Config {
                message: "worker_concurrency must be > 0".into(),
            });
        }
        Ok(())
    }

    pub fn source(&self, name: &str) -> Result<&SourceConfig> {
        self.sources.get(name).ok_or_else(|| PipelineError::UnknownSource {
            source_name: name.to_string(),
        })
    }

    pub fn policy_for(&self, data_type: &str) -> Result<&StoragePolicy> {
        self.policies
            .get(data_type)
            .ok_or_else(|| PipelineError::MissingPolicy {
                data_type: data_type.to_string(),
            })
    }

    pub fn dedup_window(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.dedup_window_days))
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store_timeout_secs)
    }
}

fn env_u64(key: &str) -> Result<Option<u64>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<u64>()
            .map(Some)
            .map_err(|_| PipelineError::Config {
                message: format!("{key} must be an integer, got '{raw}'"),
            }),
        Err(_) => Ok(None),
    }
}
