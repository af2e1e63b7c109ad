//! Drain contract between the writer and the checkpoint mechanism.
//!
//! A successful [`SinkWriter::drain`] means every request added before the
//! call has been acknowledged by the store or deliberately dropped, so the
//! source position covering those records may be acknowledged.

use std::fmt;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::SinkError;
use crate::sink::{SinkWriter, WriterStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    Running,
    Draining,
    Drained,
    Failed,
    Closed,
}

impl fmt::Display for WriterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriterState::Running => write!(f, "running"),
            WriterState::Draining => write!(f, "draining"),
            WriterState::Drained => write!(f, "drained"),
            WriterState::Failed => write!(f, "failed"),
            WriterState::Closed => write!(f, "closed"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DrainReport {
    pub elapsed: Duration,
    pub stats: WriterStats,
}

impl SinkWriter {
    /// Stop accepting records, flush everything, and wait until the buffer
    /// and in-flight set are both empty or `timeout` elapses.
    ///
    /// The writer stays in `Drained` (or `Draining` on timeout) until
    /// [`SinkWriter::resume`] or [`SinkWriter::close`].
    pub async fn drain(&self, timeout: Duration) -> Result<DrainReport, SinkError> {
        let started = Instant::now();
        let deadline = started + timeout;

        {
            let mut core = self.shared.core.lock();
            if let Some(fatal) = &core.fatal {
                return Err(fatal.clone());
            }
            match core.state {
                WriterState::Closed => {
                    return Err(SinkError::NotAccepting {
                        state: WriterState::Closed,
                    })
                }
                WriterState::Running | WriterState::Drained => {
                    core.state = WriterState::Draining;
                }
                WriterState::Draining | WriterState::Failed => {}
            }
            debug!(
                buffered = core.accumulator.len(),
                in_flight = core.in_flight_requests,
                "Draining writer"
            );
        }
        self.shared.wake_scheduler.notify_one();

        loop {
            let notified = self.shared.changed.notified();
            {
                let mut core = self.shared.core.lock();
                if let Some(fatal) = &core.fatal {
                    return Err(fatal.clone());
                }
                if core.is_quiescent() {
                    core.state = WriterState::Drained;
                    return Ok(DrainReport {
                        elapsed: started.elapsed(),
                        stats: core.stats,
                    });
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                let core = self.shared.core.lock();
                return Err(SinkError::DrainIncomplete {
                    buffered: core.accumulator.len(),
                    in_flight: core.in_flight_requests,
                });
            }
        }
    }

    /// Return a drained (or draining) writer to accepting records.
    pub fn resume(&self) -> Result<(), SinkError> {
        let mut core = self.shared.core.lock();
        if let Some(fatal) = &core.fatal {
            return Err(fatal.clone());
        }
        match core.state {
            WriterState::Draining | WriterState::Drained => {
                core.state = WriterState::Running;
                Ok(())
            }
            WriterState::Running => Ok(()),
            state => Err(SinkError::NotAccepting { state }),
        }
    }

    /// Drain with a grace period, then stop the scheduler.
    ///
    /// Requests still unresolved afterwards are logged with their key fields
    /// and reported through the returned error; they are not retried.
    pub async fn close(&self, grace: Duration) -> Result<DrainReport, SinkError> {
        let result = self.drain(grace).await;

        let handle = self.scheduler.lock().take();
        if let Some(handle) = handle {
            handle.abort();
            // Dropping the scheduler drops its JoinSet, which cancels every
            // dispatch task before the unresolved set is taken below.
            if let Err(e) = handle.await {
                if e.is_panic() {
                    warn!(error = %e, "Flush scheduler panicked");
                }
            }
        }
        self.dispatcher.close();

        let (leftover, in_flight) = {
            let mut core = self.shared.core.lock();
            if core.fatal.is_none() {
                core.state = WriterState::Closed;
            }
            let leftover = core.accumulator.take_all();
            let in_flight: Vec<String> = core.in_flight.drain().flat_map(|(_, keys)| keys).collect();
            core.in_flight_requests = 0;
            (leftover, in_flight)
        };
        self.shared.notify_all();

        for pending in &leftover {
            warn!(
                key = %pending.request.key_summary(),
                attempts = pending.attempts,
                "Unresolved buffered write request at shutdown"
            );
        }
        for key in &in_flight {
            warn!(key = %key, "Unresolved in-flight write request at shutdown");
        }

        match result {
            Ok(report) => {
                info!(
                    elapsed_ms = report.elapsed.as_millis() as u64,
                    written = report.stats.requests_written,
                    dropped = report.stats.requests_dropped,
                    "Sink writer closed"
                );
                Ok(report)
            }
            Err(SinkError::DrainIncomplete { .. }) => Err(SinkError::DrainIncomplete {
                buffered: leftover.len(),
                in_flight: in_flight.len(),
            }),
            Err(e) => Err(e),
        }
    }
}
