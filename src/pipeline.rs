// One pipeline slot: source -> decode -> filter -> map -> sink writer
//
// The slot checkpoints on a fixed interval: it drains the writer and, only if
// the drain completed, acknowledges the last position read from each
// partition. A fatal writer error ends the slot without acknowledging.

use crate::source::{Position, RecordSource, SourceEvent};
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use stream2store_core::{decode_record, RecordFilter, RecordMapper};
use stream2store_writer::{SinkError, SinkWriter};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Per-record stages applied before the writer.
#[derive(Clone)]
pub struct Stages {
    pub filter: Arc<dyn RecordFilter>,
    pub mapper: Arc<dyn RecordMapper>,
}

#[derive(Debug, Clone)]
pub struct SlotSettings {
    pub slot: usize,
    pub checkpoint_interval: Duration,
    pub drain_timeout: Duration,
    pub shutdown_grace: Duration,
    pub poll_interval: Duration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotStats {
    pub received: u64,
    pub decode_failures: u64,
    pub filtered: u64,
    pub map_failures: u64,
    pub accepted: u64,
    pub acknowledged: u64,
    pub checkpoints: u64,
}

/// Why the read loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotEnd {
    Exhausted,
    Shutdown,
}

enum Step {
    Shutdown,
    Checkpoint,
    Event(Result<SourceEvent>),
}

/// Positions read but not yet acknowledged, with the record count behind them.
#[derive(Default)]
struct Unacked {
    positions: BTreeMap<String, Position>,
    records: u64,
}

impl Unacked {
    fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    fn take(&mut self) -> (Vec<Position>, u64) {
        let positions = std::mem::take(&mut self.positions).into_values().collect();
        (positions, std::mem::take(&mut self.records))
    }
}

/// Run a slot until its source is exhausted or `shutdown` flips to `true`.
pub async fn run_slot<S>(
    source: &mut S,
    writer: &SinkWriter,
    stages: &Stages,
    settings: &SlotSettings,
    mut shutdown: watch::Receiver<bool>,
) -> Result<SlotStats>
where
    S: RecordSource + ?Sized,
{
    let mut stats = SlotStats::default();
    let mut unacked = Unacked::default();

    let mut checkpoint = tokio::time::interval(settings.checkpoint_interval);
    checkpoint.set_missed_tick_behavior(MissedTickBehavior::Delay);
    checkpoint.tick().await;

    info!(slot = settings.slot, source = source.name(), "Pipeline slot started");

    let end = loop {
        if *shutdown.borrow() {
            break SlotEnd::Shutdown;
        }

        let step = tokio::select! {
            biased;
            _ = shutdown.changed() => Step::Shutdown,
            _ = checkpoint.tick() => Step::Checkpoint,
            event = source.next_event() => Step::Event(event),
        };

        match step {
            Step::Shutdown => break SlotEnd::Shutdown,
            Step::Checkpoint => {
                run_checkpoint(source, writer, settings, &mut unacked, &mut stats).await?;
            }
            Step::Event(event) => match event.context("Failed to read from source")? {
                SourceEvent::Record { payload, position } => {
                    stats.received += 1;
                    unacked.records += 1;
                    unacked.positions.insert(position.partition.clone(), position);
                    handle_record(&payload, writer, stages, &mut stats).await?;
                }
                SourceEvent::Idle => {
                    let interrupted = tokio::select! {
                        _ = tokio::time::sleep(settings.poll_interval) => false,
                        _ = shutdown.changed() => true,
                    };
                    if interrupted {
                        break SlotEnd::Shutdown;
                    }
                }
                SourceEvent::EndOfPartition {
                    partition,
                    remaining,
                } => {
                    info!(slot = settings.slot, partition = %partition, remaining, "Partition ended");
                    if remaining == 0 {
                        break SlotEnd::Exhausted;
                    }
                }
            },
        }
    };

    info!(slot = settings.slot, reason = ?end, "Closing pipeline slot");
    match writer.close(settings.shutdown_grace).await {
        Ok(_) => {
            let (positions, records) = unacked.take();
            if !positions.is_empty() {
                source.ack(&positions).await?;
                stats.acknowledged += records;
            }
        }
        Err(SinkError::DrainIncomplete {
            buffered,
            in_flight,
        }) => {
            warn!(
                slot = settings.slot,
                buffered,
                in_flight,
                "Writer did not drain within the shutdown grace period; final position not acknowledged"
            );
        }
        Err(e) => return Err(e).context("Sink writer failed"),
    }

    info!(
        slot = settings.slot,
        received = stats.received,
        decode_failures = stats.decode_failures,
        filtered = stats.filtered,
        map_failures = stats.map_failures,
        accepted = stats.accepted,
        acknowledged = stats.acknowledged,
        checkpoints = stats.checkpoints,
        "Pipeline slot finished"
    );
    Ok(stats)
}

async fn handle_record(
    payload: &[u8],
    writer: &SinkWriter,
    stages: &Stages,
    stats: &mut SlotStats,
) -> Result<()> {
    let record = match decode_record(payload) {
        Ok(record) => record,
        Err(e) => {
            stats.decode_failures += 1;
            warn!(error = %e, bytes = payload.len(), "Dropping undecodable record");
            return Ok(());
        }
    };

    if !stages.filter.keep(&record) {
        stats.filtered += 1;
        return Ok(());
    }

    let request = match stages.mapper.to_write_request(&record) {
        Ok(request) => request,
        Err(e) => {
            stats.map_failures += 1;
            warn!(error = %e, ticker = %record.ticker, "Dropping unmappable record");
            return Ok(());
        }
    };

    writer
        .add(request)
        .await
        .context("Sink writer rejected a record")?;
    stats.accepted += 1;
    Ok(())
}

async fn run_checkpoint<S>(
    source: &mut S,
    writer: &SinkWriter,
    settings: &SlotSettings,
    unacked: &mut Unacked,
    stats: &mut SlotStats,
) -> Result<()>
where
    S: RecordSource + ?Sized,
{
    if unacked.is_empty() && writer.buffered_len() == 0 && writer.in_flight_len() == 0 {
        return Ok(());
    }

    match writer.drain(settings.drain_timeout).await {
        Ok(report) => {
            let (positions, records) = unacked.take();
            source.ack(&positions).await?;
            stats.acknowledged += records;
            stats.checkpoints += 1;
            debug!(
                slot = settings.slot,
                records,
                elapsed_ms = report.elapsed.as_millis() as u64,
                written = report.stats.requests_written,
                "Checkpoint complete"
            );
        }
        Err(SinkError::DrainIncomplete {
            buffered,
            in_flight,
        }) => {
            warn!(
                slot = settings.slot,
                buffered,
                in_flight,
                "Drain timed out; skipping checkpoint"
            );
        }
        Err(e) => return Err(e).context("Sink writer failed"),
    }

    writer.resume().context("Failed to resume sink writer")?;
    Ok(())
}
