//! Deterministic test doubles for the pipeline's injected seams.
//!
//! Used by unit tests here and by the integration suite; not part of the
//! production surface.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use url::Url;

use crate::error::{FetchError, FetchResult};
use crate::traits::{Extractor, RateLimiter};
use crate::types::{CandidateRecord, FetchTarget};

/// A limiter that always admits immediately.
pub struct NoopLimiter;

#[async_trait]
impl RateLimiter for NoopLimiter {
    async fn acquire(&self, _source: &str) {}
    fn release(&self, _source: &str) {}
}

/// Scripted extraction adapter: fixed targets, fixed payloads per target,
/// optional failures with a transient-failure budget.
pub struct MockExtractor {
    source: String,
    data_type: String,
    targets: Vec<FetchTarget>,
    payloads: HashMap<String, Vec<serde_json::Value>>,
    /// Targets that fail this many times before succeeding; u32::MAX never
    /// succeeds.
    failures: HashMap<String, AtomicU32>,
    fetch_calls: AtomicUsize,
    delay: Mutex<Option<std::time::Duration>>,
}

impl MockExtractor {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            data_type: "service_listing".into(),
            targets: Vec::new(),
            payloads: HashMap::new(),
            failures: HashMap::new(),
            fetch_calls: AtomicUsize::new(0),
            delay: Mutex::new(None),
        }
    }

    pub fn with_data_type(mut self, data_type: impl Into<String>) -> Self {
        self.data_type = data_type.into();
        self
    }

    /// Register a target returning the given payloads.
    pub fn with_target(mut self, url: &str, payloads: Vec<serde_json::Value>) -> Self {
        let url: Url = url.parse().expect("valid mock url");
        self.targets.push(FetchTarget::new(url.clone()));
        self.payloads.insert(url.to_string(), payloads);
        self
    }

    /// Make a target fail `times` times with a retryable network error
    /// before serving its payloads.
    pub fn failing_times(mut self, url: &str, times: u32) -> Self {
        self.failures
            .insert(url.to_string(), AtomicU32::new(times));
        self
    }

    /// Make a target fail forever.
    pub fn always_failing(self, url: &str) -> Self {
        self.failing_times(url, u32::MAX)
    }

    /// Delay every fetch, for timeout tests.
    pub fn with_delay(self, delay: std::time::Duration) -> Self {
        *self.delay.lock().unwrap() = Some(delay);
        self
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Extractor for MockExtractor {
    async fn targets(&self, _data_type: &str) -> FetchResult<Vec<FetchTarget>> {
        Ok(self.targets.clone())
    }

    async fn fetch(&self, target: &FetchTarget) -> FetchResult<Vec<CandidateRecord>> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);

        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let key = target.url.to_string();
        if let Some(remaining) = self.failures.get(&key) {
            let left = remaining.load(Ordering::SeqCst);
            if left > 0 {
                if left != u32::MAX {
                    remaining.fetch_sub(1, Ordering::SeqCst);
                }
                return Err(FetchError::Network {
                    target: key,
                    message: "connection reset".into(),
                });
            }
        }

        let payloads = self.payloads.get(&key).cloned().unwrap_or_default();
        Ok(payloads
            .into_iter()
            .map(|payload| {
                CandidateRecord::new(self.source.clone(), self.data_type.clone(), payload)
            })
            .collect())
    }
}
