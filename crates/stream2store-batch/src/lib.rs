//! Write-request buffering for the sink writer.
//!
//! [`Accumulator`] holds not-yet-flushed requests, collapsing requests that
//! share the configured key fields so only the most recent arrival is written.
//! [`policy::decide`] turns the buffer's size and age into a flush decision.
//!
//! Nothing here is thread-safe on its own; the writer wraps the accumulator in
//! a mutex and drives the policy from its scheduler task.

use std::time::{Duration, Instant};

use stream2store_core::WriteRequest;

mod accumulator;
pub mod policy;

pub use accumulator::{Accumulator, AddOutcome, RequeueOutcome};
pub use policy::{decide, FlushDecision};

#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub max_batch_size: usize,
    pub max_buffered_requests: usize,
    pub max_time_in_buffer: Duration,
    /// Field names whose combined values identify duplicate requests.
    /// Empty disables deduplication.
    pub overwrite_by_key_fields: Vec<String>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 25,
            max_buffered_requests: 10_000,
            max_time_in_buffer: Duration::from_millis(5_000),
            overwrite_by_key_fields: Vec::new(),
        }
    }
}

/// A buffered write request together with its delivery bookkeeping.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub request: WriteRequest,
    /// Number of submissions that rejected this request so far.
    pub attempts: u32,
    pub arrived_at: Instant,
    /// Monotonic arrival order, used to decide which of two requests for the
    /// same key is newer.
    pub sequence: u64,
}

/// Requests extracted together for one submission, oldest arrival first.
#[derive(Debug)]
pub struct Batch {
    pub id: u64,
    pub requests: Vec<PendingRequest>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn write_requests(&self) -> Vec<WriteRequest> {
        self.requests.iter().map(|p| p.request.clone()).collect()
    }
}
