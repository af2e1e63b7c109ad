//! Flush scheduler task, one per writer.
//!
//! The loop takes an in-flight permit *before* looking at the buffer, so at
//! most one extracted batch ever waits on a permit. With the permit held it
//! waits for the flush policy to fire, extracts the batch under the buffer
//! lock, and hands batch and permit to a dispatch task.

use std::sync::Arc;

use stream2store_batch::{decide, Batch, FlushDecision, PendingRequest, RequeueOutcome};
use tokio::sync::OwnedSemaphorePermit;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

use crate::dispatcher::{DispatchFailure, Dispatcher};
use crate::drain::WriterState;
use crate::error::SinkError;
use crate::sink::Shared;

pub(crate) async fn run(shared: Arc<Shared>, dispatcher: Arc<Dispatcher>) {
    let mut tasks = JoinSet::new();
    debug!("Flush scheduler started");

    loop {
        // Finished dispatch tasks are reaped before waiting for a permit.
        let permit = tokio::select! {
            biased;
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                log_join_result(joined);
                continue;
            }
            permit = dispatcher.acquire() => match permit {
                Some(permit) => permit,
                None => break,
            },
        };

        let Some(batch) = next_batch(&shared).await else {
            break;
        };

        let shared = Arc::clone(&shared);
        let dispatcher = Arc::clone(&dispatcher);
        tasks.spawn(dispatch(shared, dispatcher, batch, permit));
    }

    // Let outstanding submissions settle so in-flight accounting stays exact.
    while let Some(joined) = tasks.join_next().await {
        log_join_result(joined);
    }
    debug!("Flush scheduler stopped");
}

/// Wait until the flush policy fires, then extract a batch.
///
/// Returns `None` when the writer has failed or closed.
async fn next_batch(shared: &Shared) -> Option<Batch> {
    loop {
        let notified = shared.wake_scheduler.notified();

        let decision = {
            let mut core = shared.core.lock();
            if core.fatal.is_some() || core.state == WriterState::Closed {
                return None;
            }

            let now = tokio::time::Instant::now().into_std();
            let force = core.state == WriterState::Draining;
            let decision = decide(
                core.accumulator.len(),
                core.accumulator.oldest_arrival_age(now),
                force,
                &shared.settings.batch,
            );

            if decision == FlushDecision::Flush {
                if let Some(batch) = core.accumulator.extract_batch() {
                    let keys = batch
                        .requests
                        .iter()
                        .map(|p| p.request.key_summary())
                        .collect();
                    core.in_flight.insert(batch.id, keys);
                    core.in_flight_requests += batch.len();
                    core.stats.batches_submitted += 1;
                    drop(core);

                    shared.space_freed.notify_waiters();
                    return Some(batch);
                }
            }
            decision
        };

        match decision {
            FlushDecision::WaitFor(remaining) => {
                tokio::select! {
                    _ = notified => {}
                    _ = tokio::time::sleep(remaining) => {}
                }
            }
            FlushDecision::Idle | FlushDecision::Flush => notified.await,
        }
    }
}

async fn dispatch(
    shared: Arc<Shared>,
    dispatcher: Arc<Dispatcher>,
    batch: Batch,
    permit: OwnedSemaphorePermit,
) {
    let batch_id = batch.id;
    let size = batch.len();
    let max_attempts = dispatcher.retry_policy().max_attempts;

    let (retry, exhausted, reason) = match dispatcher.submit(batch).await {
        Ok(rejected) => {
            let mut retry = Vec::new();
            let mut exhausted = Vec::new();
            for mut pending in rejected {
                pending.attempts += 1;
                if pending.attempts < max_attempts {
                    retry.push(pending);
                } else {
                    exhausted.push(pending);
                }
            }
            let reason = format!("rejected by the store {} time(s)", max_attempts);
            (retry, exhausted, reason)
        }
        Err(DispatchFailure { error, requests }) => {
            error!(
                batch_id,
                size,
                code = error.code().as_str(),
                error = %error,
                "Batch submission failed"
            );
            (Vec::new(), requests, error.to_string())
        }
    };

    if !retry.is_empty() {
        let attempt = retry.iter().map(|p| p.attempts).max().unwrap_or(1);
        let delay = dispatcher.retry_policy().backoff(attempt.saturating_sub(1));
        warn!(
            batch_id,
            rejected = retry.len(),
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Store rejected part of a batch, requeueing"
        );
        // The permit stays held during the delay to slow further submissions.
        tokio::time::sleep(delay).await;
    }

    {
        let mut core = shared.core.lock();
        // Close already reported this batch as unresolved.
        if core.in_flight.remove(&batch_id).is_none() {
            debug!(batch_id, size, "Dispatch finished after the writer closed");
            return;
        }
        match core.in_flight_requests.checked_sub(size) {
            Some(remaining) => core.in_flight_requests = remaining,
            None => {
                error!(
                    batch_id,
                    size,
                    in_flight = core.in_flight_requests,
                    "In-flight accounting underflow"
                );
                core.in_flight_requests = 0;
            }
        }

        let resolved = size - retry.len() - exhausted.len();
        core.stats.requests_written += resolved as u64;

        // Requeue in reverse so the batch's order is kept at the buffer head.
        for pending in retry.into_iter().rev() {
            match core.accumulator.requeue(pending) {
                RequeueOutcome::Requeued => core.stats.requests_retried += 1,
                RequeueOutcome::Superseded => core.stats.requests_superseded += 1,
            }
        }

        if !exhausted.is_empty() {
            if shared.settings.fail_on_error {
                if core.fatal.is_none() {
                    error!(
                        batch_id,
                        count = exhausted.len(),
                        reason = %reason,
                        "Write requests exhausted their retries; failing the writer"
                    );
                    core.fatal = Some(SinkError::RetriesExhausted {
                        count: exhausted.len(),
                        reason,
                    });
                    core.state = WriterState::Failed;
                }
            } else {
                drop_exhausted(&exhausted, &reason);
                core.stats.requests_dropped += exhausted.len() as u64;
            }
        }
    }

    drop(permit);
    shared.notify_all();
}

fn drop_exhausted(requests: &[PendingRequest], reason: &str) {
    for pending in requests {
        error!(
            key = %pending.request.key_summary(),
            attempts = pending.attempts,
            reason,
            "Dropping write request after exhausting retries"
        );
    }
}

fn log_join_result(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!(error = %e, "Dispatch task panicked");
        }
    }
}
