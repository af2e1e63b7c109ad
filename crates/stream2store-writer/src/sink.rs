//! The sink writer: the producer-facing half of the batching pipeline.
//!
//! Producers call [`SinkWriter::add`]; a scheduler task (see
//! [`crate::scheduler`]) extracts batches and hands them to the
//! [`Dispatcher`]. All mutable state sits behind one mutex in [`Shared`], and
//! three `Notify`s connect the parties:
//!
//! - `space_freed` wakes producers suspended at capacity
//! - `wake_scheduler` wakes the scheduler when a threshold may have been met
//! - `changed` wakes drainers when the buffer or in-flight set shrinks

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use stream2store_batch::{Accumulator, AddOutcome, BatchConfig};
use stream2store_core::WriteRequest;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::backend::WriteBackend;
use crate::dispatcher::{Dispatcher, RetryPolicy};
use crate::drain::WriterState;
use crate::error::SinkError;
use crate::scheduler;

#[derive(Debug, Clone)]
pub struct SinkSettings {
    pub batch: BatchConfig,
    pub max_in_flight_requests: usize,
    pub fail_on_error: bool,
    pub retry: RetryPolicy,
}

impl Default for SinkSettings {
    fn default() -> Self {
        Self {
            batch: BatchConfig::default(),
            max_in_flight_requests: 50,
            fail_on_error: false,
            retry: RetryPolicy::default(),
        }
    }
}

/// Delivery counters, cumulative over the writer's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterStats {
    pub requests_added: u64,
    pub requests_replaced: u64,
    pub batches_submitted: u64,
    pub requests_written: u64,
    pub requests_retried: u64,
    pub requests_superseded: u64,
    pub requests_dropped: u64,
}

pub(crate) struct Core {
    pub accumulator: Accumulator,
    pub state: WriterState,
    pub fatal: Option<SinkError>,
    /// Key summaries of submitted-but-unresolved requests, by batch id.
    pub in_flight: HashMap<u64, Vec<String>>,
    pub in_flight_requests: usize,
    pub stats: WriterStats,
}

impl Core {
    pub fn check_accepting(&self) -> Result<(), SinkError> {
        if let Some(fatal) = &self.fatal {
            return Err(fatal.clone());
        }
        match self.state {
            WriterState::Running => Ok(()),
            state => Err(SinkError::NotAccepting { state }),
        }
    }

    pub fn is_quiescent(&self) -> bool {
        self.accumulator.is_empty() && self.in_flight_requests == 0
    }
}

pub(crate) struct Shared {
    pub core: Mutex<Core>,
    pub settings: SinkSettings,
    pub space_freed: Notify,
    pub wake_scheduler: Notify,
    pub changed: Notify,
}

impl Shared {
    /// Wake every party so each re-evaluates the writer state.
    pub fn notify_all(&self) {
        self.space_freed.notify_waiters();
        self.changed.notify_waiters();
        self.wake_scheduler.notify_one();
    }
}

/// Batched, deduplicating, backpressure-aware writer for one pipeline slot.
pub struct SinkWriter {
    pub(crate) shared: Arc<Shared>,
    pub(crate) dispatcher: Arc<Dispatcher>,
    pub(crate) scheduler: Mutex<Option<JoinHandle<()>>>,
}

impl SinkWriter {
    /// Create a writer and start its scheduler task on the current runtime.
    pub fn new(backend: Arc<dyn WriteBackend>, settings: SinkSettings) -> Self {
        let dispatcher = Arc::new(Dispatcher::new(
            backend,
            settings.max_in_flight_requests,
            settings.retry.clone(),
        ));
        let shared = Arc::new(Shared {
            core: Mutex::new(Core {
                accumulator: Accumulator::new(settings.batch.clone()),
                state: WriterState::Running,
                fatal: None,
                in_flight: HashMap::new(),
                in_flight_requests: 0,
                stats: WriterStats::default(),
            }),
            settings,
            space_freed: Notify::new(),
            wake_scheduler: Notify::new(),
            changed: Notify::new(),
        });

        info!(
            backend = dispatcher.backend_name(),
            max_batch_size = shared.settings.batch.max_batch_size,
            max_in_flight_requests = shared.settings.max_in_flight_requests,
            max_buffered_requests = shared.settings.batch.max_buffered_requests,
            max_time_in_buffer_ms = shared.settings.batch.max_time_in_buffer.as_millis() as u64,
            fail_on_error = shared.settings.fail_on_error,
            "Sink writer started"
        );

        let handle = tokio::spawn(scheduler::run(Arc::clone(&shared), Arc::clone(&dispatcher)));

        Self {
            shared,
            dispatcher,
            scheduler: Mutex::new(Some(handle)),
        }
    }

    /// Buffer a write request, suspending while the buffer is at capacity.
    pub async fn add(&self, request: WriteRequest) -> Result<(), SinkError> {
        let mut request = request;
        loop {
            // Register interest before checking so a release between the
            // check and the await is not missed.
            let notified = self.shared.space_freed.notified();
            {
                let mut core = self.shared.core.lock();
                core.check_accepting()?;

                let now = tokio::time::Instant::now().into_std();
                match core.accumulator.try_add(request, now) {
                    AddOutcome::Inserted => {
                        core.stats.requests_added += 1;
                        let len = core.accumulator.len();
                        drop(core);
                        if len == 1 || len >= self.shared.settings.batch.max_batch_size {
                            self.shared.wake_scheduler.notify_one();
                        }
                        return Ok(());
                    }
                    AddOutcome::Replaced => {
                        core.stats.requests_replaced += 1;
                        return Ok(());
                    }
                    AddOutcome::Full(returned) => request = returned,
                }
            }

            debug!("Buffer at capacity, waiting for a flush");
            notified.await;
        }
    }

    pub fn state(&self) -> WriterState {
        self.shared.core.lock().state
    }

    pub fn buffered_len(&self) -> usize {
        self.shared.core.lock().accumulator.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.shared.core.lock().in_flight_requests
    }

    pub fn stats(&self) -> WriterStats {
        self.shared.core.lock().stats
    }

    /// The fatal error that stopped this writer, if any.
    pub fn fatal_error(&self) -> Option<SinkError> {
        self.shared.core.lock().fatal.clone()
    }
}

impl Drop for SinkWriter {
    fn drop(&mut self) {
        if let Some(handle) = self.scheduler.get_mut().take() {
            handle.abort();
        }
    }
}
