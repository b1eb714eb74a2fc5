//! Outbound queue for vector indexing.
//!
//! Indexing is best-effort: the router enqueues a request and moves on. A
//! background drain task owns the retry policy, so routing completion is
//! decoupled from embedding and index latency. Exhausted retries log and
//! count; they never fail the record's routing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::traits::VectorIndex;

/// One indexing request: record id, text to embed, search metadata.
#[derive(Debug, Clone)]
pub struct IndexRequest {
    pub id: String,
    pub text: String,
    pub metadata: serde_json::Value,
}

/// Counters exposed to the metrics tracker.
#[derive(Debug, Default)]
pub struct IndexStats {
    pub indexed: AtomicU64,
    pub failed: AtomicU64,
    pub dropped: AtomicU64,
}

pub struct IndexQueue {
    tx: mpsc::Sender<IndexRequest>,
    stats: Arc<IndexStats>,
    drain: std::sync::Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl IndexQueue {
    /// Spawn the drain task over a bounded queue.
    pub fn spawn(index: Arc<dyn VectorIndex>, capacity: usize, retries: u32) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        let stats = Arc::new(IndexStats::default());
        let shutdown = CancellationToken::new();
        let drain = tokio::spawn(drain_loop(
            index,
            rx,
            stats.clone(),
            retries,
            shutdown.clone(),
        ));
        Self {
            tx,
            stats,
            drain: std::sync::Mutex::new(Some(drain)),
            shutdown,
        }
    }

    /// Enqueue without waiting. A full or closed queue drops the request
    /// (counted), because indexing must never block or fail routing.
    pub fn enqueue(&self, request: IndexRequest) {
        if let Err(e) = self.tx.try_send(request) {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(error = %e, "index queue full, dropping request");
        }
    }

    pub fn stats(&self) -> &IndexStats {
        &self.stats
    }

    /// Stop the drain task. The request being written finishes its attempt;
    /// queued requests not yet started are abandoned.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handle = self.drain.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

async fn drain_loop(
    index: Arc<dyn VectorIndex>,
    mut rx: mpsc::Receiver<IndexRequest>,
    stats: Arc<IndexStats>,
    retries: u32,
    shutdown: CancellationToken,
) {
    loop {
        let request = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            request = rx.recv() => match request {
                Some(request) => request,
                None => break,
            },
        };

        let mut attempt = 0u32;
        loop {
            match index
                .upsert(&request.id, &request.text, request.metadata.clone())
                .await
            {
                Ok(()) => {
                    stats.indexed.fetch_add(1, Ordering::Relaxed);
                    break;
                }
                Err(e) if attempt < retries => {
                    attempt += 1;
                    let backoff = std::time::Duration::from_millis(100 * (1 << attempt.min(6)));
                    tracing::debug!(
                        id = %request.id,
                        attempt,
                        error = %e,
                        "index upsert failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    stats.failed.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        id = %request.id,
                        error = %e,
                        "index upsert exhausted retries, dropping"
                    );
                    break;
                }
            }
        }
    }
}

/// Fields carrying the semantic content of a record, in priority order.
const EMBEDDING_FIELDS: &[&str] = &["title", "content", "description", "summary", "body", "text"];

/// Concatenate the text worth embedding from a payload. Falls back to any
/// reasonably long string field when none of the preferred ones exist.
pub fn embedding_text(payload: &serde_json::Value) -> String {
    let Some(object) = payload.as_object() else {
        return String::new();
    };

    let mut parts: Vec<&str> = EMBEDDING_FIELDS
        .iter()
        .filter_map(|field| object.get(*field).and_then(|v| v.as_str()))
        .collect();

    if parts.is_empty() {
        parts = object
            .values()
            .filter_map(|v| v.as_str())
            .filter(|s| s.len() > 10)
            .collect();
    }

    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryVectorIndex;
    use serde_json::json;

    #[tokio::test]
    async fn drains_enqueued_requests() {
        let index = Arc::new(MemoryVectorIndex::new());
        let queue = IndexQueue::spawn(index.clone(), 16, 0);

        queue.enqueue(IndexRequest {
            id: "portal_listing_abc".into(),
            text: "permit office hours".into(),
            metadata: json!({"source": "portal"}),
        });

        // recv + upsert happen on the drain task
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(index.len(), 1);
        assert_eq!(queue.stats().indexed.load(Ordering::Relaxed), 1);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn failures_are_counted_not_raised() {
        let index = Arc::new(MemoryVectorIndex::failing());
        let queue = IndexQueue::spawn(index, 16, 1);

        queue.enqueue(IndexRequest {
            id: "x".into(),
            text: "y".into(),
            metadata: json!({}),
        });

        tokio::time::sleep(std::time::Duration::from_millis(600)).await;
        assert_eq!(queue.stats().failed.load(Ordering::Relaxed), 1);
        queue.shutdown().await;
    }

    #[test]
    fn embedding_text_prefers_semantic_fields() {
        let text = embedding_text(&json!({
            "title": "Permit office",
            "description": "Opening hours and fees",
            "id": "should not appear either way"
        }));
        assert_eq!(text, "Permit office Opening hours and fees");
    }

    #[test]
    fn embedding_text_falls_back_to_long_strings() {
        let text = embedding_text(&json!({
            "code": "abc",
            "note": "a string long enough to matter"
        }));
        assert_eq!(text, "a string long enough to matter");
    }
}
