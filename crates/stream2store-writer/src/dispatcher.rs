//! Bounded-concurrency submission of batches to a [`WriteBackend`].

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use stream2store_batch::{Batch, PendingRequest};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::backend::WriteBackend;
use crate::error::StoreError;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Submissions allowed per batch for transient errors, and per request
    /// for partial rejections.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(5_000),
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff for the given zero-based retry, capped at
    /// `max_backoff`, with ±25% jitter that never exceeds the cap.
    pub fn backoff(&self, retry: u32) -> Duration {
        let initial_ms = self.initial_backoff.as_millis() as u64;
        let max_ms = self.max_backoff.as_millis() as u64;
        let exp = 1u64.checked_shl(retry).unwrap_or(u64::MAX);
        let capped = initial_ms.saturating_mul(exp).min(max_ms);

        let jitter_range = capped / 4;
        let jitter = if jitter_range > 0 {
            rand::thread_rng().gen_range(0..=jitter_range * 2)
        } else {
            0
        };
        let with_jitter = capped
            .saturating_sub(jitter_range)
            .saturating_add(jitter)
            .min(max_ms);
        Duration::from_millis(with_jitter)
    }
}

/// A batch that could not be submitted at all.
#[derive(Debug)]
pub struct DispatchFailure {
    pub error: StoreError,
    pub requests: Vec<PendingRequest>,
}

pub struct Dispatcher {
    backend: Arc<dyn WriteBackend>,
    permits: Arc<Semaphore>,
    retry: RetryPolicy,
}

impl Dispatcher {
    pub fn new(backend: Arc<dyn WriteBackend>, max_in_flight: usize, retry: RetryPolicy) -> Self {
        Self {
            backend,
            permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
            retry,
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Wait for an in-flight slot. Returns `None` once the dispatcher is closed.
    pub async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.permits).acquire_owned().await.ok()
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn close(&self) {
        self.permits.close();
    }

    /// Submit a batch, retrying the whole batch on transient errors.
    ///
    /// Returns the requests the store rejected; their `attempts` count is not
    /// touched here.
    pub async fn submit(&self, batch: Batch) -> Result<Vec<PendingRequest>, DispatchFailure> {
        let requests = batch.write_requests();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            match self.backend.submit_batch(&requests).await {
                Ok(rejected) => {
                    debug!(
                        batch_id = batch.id,
                        size = requests.len(),
                        rejected = rejected.len(),
                        attempt,
                        "Batch submitted"
                    );
                    return Ok(match_rejected(batch.requests, rejected));
                }
                Err(error) if error.is_transient() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.backoff(attempt - 1);
                    warn!(
                        batch_id = batch.id,
                        backend = self.backend.name(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Transient store error, retrying batch"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(error) => {
                    return Err(DispatchFailure {
                        error,
                        requests: batch.requests,
                    });
                }
            }
        }
    }
}

// Rejected requests come back as plain write requests; pair each with one
// pending entry of equal content.
fn match_rejected(
    mut pending: Vec<PendingRequest>,
    rejected: Vec<stream2store_core::WriteRequest>,
) -> Vec<PendingRequest> {
    let mut matched = Vec::with_capacity(rejected.len());
    for request in rejected {
        match pending.iter().position(|p| p.request == request) {
            Some(i) => matched.push(pending.remove(i)),
            None => warn!(
                key = %request.key_summary(),
                "Store rejected a request that was not part of the batch"
            ),
        }
    }
    matched
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryBackend, ScriptedResponse};
    use std::collections::BTreeMap;
    use std::time::Instant;
    use stream2store_core::{FieldValue, WriteRequest};

    fn req(ticker: &str) -> WriteRequest {
        let mut key = BTreeMap::new();
        key.insert("ticker".to_string(), FieldValue::Text(ticker.to_string()));
        WriteRequest::put(key, BTreeMap::new())
    }

    fn batch(tickers: &[&str]) -> Batch {
        let now = Instant::now();
        Batch {
            id: 7,
            requests: tickers
                .iter()
                .enumerate()
                .map(|(i, t)| PendingRequest {
                    request: req(t),
                    attempts: 0,
                    arrived_at: now,
                    sequence: i as u64,
                })
                .collect(),
        }
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(1_000),
        }
    }

    #[test]
    fn test_backoff_is_capped_with_jitter() {
        let policy = policy(5);
        for _ in 0..50 {
            let first = policy.backoff(0).as_millis();
            assert!((75..=125).contains(&first), "{}", first);
            let later = policy.backoff(10).as_millis();
            assert!((750..=1_000).contains(&later), "{}", later);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_rejection_returns_pending_entries() {
        let backend = Arc::new(MemoryBackend::new());
        backend.push_response(ScriptedResponse::Reject(vec![0, 2]));
        let dispatcher = Dispatcher::new(backend.clone(), 1, policy(3));

        let rejected = dispatcher.submit(batch(&["A", "B", "C"])).await.unwrap();
        let keys: Vec<_> = rejected.iter().map(|p| p.request.key_summary()).collect();
        assert_eq!(keys, ["ticker=A", "ticker=C"]);
        assert_eq!(backend.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_retry_whole_batch() {
        let backend = Arc::new(MemoryBackend::new());
        backend.push_response(ScriptedResponse::Fail(StoreError::throttled("slow down")));
        backend.push_response(ScriptedResponse::Fail(StoreError::unavailable("503")));
        let dispatcher = Dispatcher::new(backend.clone(), 1, policy(3));

        let rejected = dispatcher.submit(batch(&["A", "B"])).await.unwrap();
        assert!(rejected.is_empty());
        assert_eq!(backend.submission_count(), 3);
        assert_eq!(backend.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_exhaust_attempts() {
        let backend = Arc::new(MemoryBackend::new());
        for _ in 0..2 {
            backend.push_response(ScriptedResponse::Fail(StoreError::throttled("slow down")));
        }
        let dispatcher = Dispatcher::new(backend.clone(), 1, policy(2));

        let failure = dispatcher.submit(batch(&["A"])).await.unwrap_err();
        assert!(failure.error.is_transient());
        assert_eq!(failure.requests.len(), 1);
        assert_eq!(backend.submission_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_fails_immediately() {
        let backend = Arc::new(MemoryBackend::new());
        backend.push_response(ScriptedResponse::Fail(StoreError::permanent("no table")));
        let dispatcher = Dispatcher::new(backend.clone(), 1, policy(5));

        let failure = dispatcher.submit(batch(&["A", "B"])).await.unwrap_err();
        assert!(!failure.error.is_transient());
        assert_eq!(failure.requests.len(), 2);
        assert_eq!(backend.submission_count(), 1);
    }

    #[tokio::test]
    async fn test_permits_bound_concurrency() {
        let backend = Arc::new(MemoryBackend::new());
        let dispatcher = Dispatcher::new(backend, 2, policy(1));
        let first = dispatcher.acquire().await.unwrap();
        let _second = dispatcher.acquire().await.unwrap();
        assert_eq!(dispatcher.available_permits(), 0);
        drop(first);
        assert_eq!(dispatcher.available_permits(), 1);

        dispatcher.close();
        assert!(dispatcher.acquire().await.is_none());
    }
}
