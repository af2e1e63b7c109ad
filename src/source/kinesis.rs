// Kinesis Data Streams source
//
// Shards are listed once at startup; shard `i` of the sorted list belongs to
// slot `i % parallelism`. Iterators are opened lazily and reopened after the
// last seen sequence number when they expire. Transient read failures retry
// with backoff, anything else ends the slot with an error.

use super::{Position, RecordSource, SourceEvent};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use aws_sdk_kinesis::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_kinesis::primitives::DateTime as AwsDateTime;
use aws_sdk_kinesis::types::ShardIteratorType;
use aws_sdk_kinesis::Client;
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};
use stream2store_config::{InitialPosition, SourceConfig};
use stream2store_writer::RetryPolicy;
use tracing::{debug, info, warn};

/// Cap on the backoff exponent for read retries.
const MAX_BACKOFF_EXPONENT: u32 = 10;

/// Where a shard without a stored sequence number starts reading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartPosition {
    Latest,
    TrimHorizon,
    AtTimestamp(DateTime<Utc>),
}

impl StartPosition {
    pub fn from_config(config: &SourceConfig) -> Result<Self> {
        match config.initial_position {
            Some(InitialPosition::Latest) => Ok(StartPosition::Latest),
            Some(InitialPosition::TrimHorizon) => Ok(StartPosition::TrimHorizon),
            Some(InitialPosition::AtTimestamp) => {
                let ts = config
                    .initial_timestamp
                    .as_deref()
                    .ok_or_else(|| anyhow!("AT_TIMESTAMP requires source.initial_timestamp"))?;
                let parsed = DateTime::parse_from_rfc3339(ts)
                    .with_context(|| format!("Invalid initial timestamp: {}", ts))?;
                Ok(StartPosition::AtTimestamp(parsed.with_timezone(&Utc)))
            }
            None => bail!("source.initial_position is required"),
        }
    }
}

#[derive(Debug)]
struct ShardCursor {
    shard_id: String,
    iterator: Option<String>,
    last_sequence: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
enum ReadFailure {
    ExpiredIterator,
    Transient,
    Permanent,
}

pub struct KinesisSource {
    client: Client,
    stream: String,
    start: StartPosition,
    limit: i32,
    retry: RetryPolicy,
    cursors: Vec<ShardCursor>,
    next_cursor: usize,
    pending: VecDeque<SourceEvent>,
    acknowledged: HashMap<String, String>,
}

/// Build a Kinesis client from the default AWS credential chain.
pub async fn client(region: &str) -> Client {
    let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(aws_config::Region::new(region.to_string()))
        .load()
        .await;
    Client::new(&sdk_config)
}

impl KinesisSource {
    /// Discover the stream's shards and keep the ones owned by `slot`.
    pub async fn connect(
        client: Client,
        config: &SourceConfig,
        slot: usize,
        parallelism: usize,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let start = StartPosition::from_config(config)?;
        let shard_ids = list_shards(&client, &config.name).await?;
        let total = shard_ids.len();
        let owned = assigned_shards(shard_ids, slot, parallelism);

        if owned.is_empty() {
            warn!(
                stream = %config.name,
                slot,
                shards = total,
                "No shards assigned to this slot"
            );
        } else {
            info!(
                stream = %config.name,
                slot,
                shards = ?owned,
                start = ?start,
                "Reading stream shards"
            );
        }

        Ok(Self {
            client,
            stream: config.name.clone(),
            start,
            limit: config.max_records_per_poll,
            retry,
            cursors: owned
                .into_iter()
                .map(|shard_id| ShardCursor {
                    shard_id,
                    iterator: None,
                    last_sequence: None,
                })
                .collect(),
            next_cursor: 0,
            pending: VecDeque::new(),
            acknowledged: HashMap::new(),
        })
    }

    /// Highest acknowledged sequence number per shard.
    pub fn acknowledged(&self) -> &HashMap<String, String> {
        &self.acknowledged
    }

    async fn open_iterator(&self, index: usize) -> Result<String> {
        let cursor = &self.cursors[index];
        let request = self
            .client
            .get_shard_iterator()
            .stream_name(&self.stream)
            .shard_id(&cursor.shard_id);

        let request = match (&cursor.last_sequence, &self.start) {
            (Some(sequence), _) => request
                .shard_iterator_type(ShardIteratorType::AfterSequenceNumber)
                .starting_sequence_number(sequence),
            (None, StartPosition::Latest) => request.shard_iterator_type(ShardIteratorType::Latest),
            (None, StartPosition::TrimHorizon) => {
                request.shard_iterator_type(ShardIteratorType::TrimHorizon)
            }
            (None, StartPosition::AtTimestamp(ts)) => request
                .shard_iterator_type(ShardIteratorType::AtTimestamp)
                .timestamp(AwsDateTime::from_millis(ts.timestamp_millis())),
        };

        let output = request.send().await.map_err(|e| {
            anyhow!(
                "Failed to open iterator for shard {}: {}",
                cursor.shard_id,
                DisplayErrorContext(&e)
            )
        })?;
        output
            .shard_iterator()
            .map(str::to_string)
            .ok_or_else(|| anyhow!("No iterator returned for shard {}", cursor.shard_id))
    }

    /// Read one page from a shard into `pending`. Returns whether anything
    /// was queued.
    async fn poll_shard(&mut self, index: usize) -> Result<bool> {
        let mut failures: u32 = 0;

        loop {
            let iterator = match self.cursors[index].iterator.clone() {
                Some(iterator) => iterator,
                None => {
                    let iterator = self.open_iterator(index).await?;
                    self.cursors[index].iterator = Some(iterator.clone());
                    iterator
                }
            };

            let result = self
                .client
                .get_records()
                .shard_iterator(iterator)
                .limit(self.limit)
                .send()
                .await;

            let output = match result {
                Ok(output) => output,
                Err(err) => {
                    let shard_id = &self.cursors[index].shard_id;
                    match classify_read_error(&err) {
                        ReadFailure::ExpiredIterator => {
                            debug!(shard = %shard_id, "Shard iterator expired, reopening");
                            self.cursors[index].iterator = None;
                        }
                        ReadFailure::Transient => {
                            let delay = self
                                .retry
                                .backoff(failures.min(MAX_BACKOFF_EXPONENT));
                            failures += 1;
                            warn!(
                                shard = %shard_id,
                                attempt = failures,
                                delay_ms = delay.as_millis() as u64,
                                error = %DisplayErrorContext(&err),
                                "Transient stream read error, retrying"
                            );
                            tokio::time::sleep(delay).await;
                        }
                        ReadFailure::Permanent => {
                            bail!(
                                "Failed to read shard {}: {}",
                                shard_id,
                                DisplayErrorContext(&err)
                            );
                        }
                    }
                    continue;
                }
            };

            let cursor = &mut self.cursors[index];
            for record in output.records() {
                self.pending.push_back(SourceEvent::Record {
                    payload: record.data().as_ref().to_vec(),
                    position: Position {
                        partition: cursor.shard_id.clone(),
                        sequence: record.sequence_number().to_string(),
                    },
                });
            }
            if let Some(last) = output.records().last() {
                cursor.last_sequence = Some(last.sequence_number().to_string());
            }
            debug!(
                shard = %cursor.shard_id,
                records = output.records().len(),
                millis_behind_latest = output.millis_behind_latest().unwrap_or_default(),
                "Polled shard"
            );

            match output.next_shard_iterator() {
                Some(next) => cursor.iterator = Some(next.to_string()),
                None => {
                    let closed = self.cursors.remove(index);
                    info!(
                        shard = %closed.shard_id,
                        last_sequence = closed.last_sequence.as_deref().unwrap_or("none"),
                        "Shard closed"
                    );
                    self.pending.push_back(SourceEvent::EndOfPartition {
                        partition: closed.shard_id,
                        remaining: self.cursors.len(),
                    });
                }
            }
            return Ok(!self.pending.is_empty());
        }
    }
}

#[async_trait]
impl RecordSource for KinesisSource {
    fn name(&self) -> &str {
        &self.stream
    }

    async fn next_event(&mut self) -> Result<SourceEvent> {
        if let Some(event) = self.pending.pop_front() {
            return Ok(event);
        }
        if self.cursors.is_empty() {
            return Ok(SourceEvent::EndOfPartition {
                partition: self.stream.clone(),
                remaining: 0,
            });
        }

        // One round-robin pass over the owned shards.
        let mut empty_polls = 0;
        while empty_polls < self.cursors.len() {
            let index = self.next_cursor % self.cursors.len();
            self.next_cursor = index + 1;
            if self.poll_shard(index).await? {
                if let Some(event) = self.pending.pop_front() {
                    return Ok(event);
                }
            }
            empty_polls += 1;
        }
        Ok(SourceEvent::Idle)
    }

    async fn ack(&mut self, positions: &[Position]) -> Result<()> {
        for position in positions {
            let newer = self
                .acknowledged
                .get(&position.partition)
                .map_or(true, |acked| {
                    compare_sequence(&position.sequence, acked) == Ordering::Greater
                });
            if newer {
                info!(
                    stream = %self.stream,
                    shard = %position.partition,
                    sequence = %position.sequence,
                    "Acknowledged stream position"
                );
                self.acknowledged
                    .insert(position.partition.clone(), position.sequence.clone());
            }
        }
        Ok(())
    }
}

async fn list_shards(client: &Client, stream: &str) -> Result<Vec<String>> {
    let mut shard_ids = Vec::new();
    let mut next_token: Option<String> = None;

    loop {
        // The stream name and a pagination token are mutually exclusive.
        let request = match &next_token {
            Some(token) => client.list_shards().next_token(token),
            None => client.list_shards().stream_name(stream),
        };
        let output = request.send().await.map_err(|e| {
            anyhow!(
                "Failed to list shards of stream {}: {}",
                stream,
                DisplayErrorContext(&e)
            )
        })?;

        shard_ids.extend(output.shards().iter().map(|s| s.shard_id().to_string()));
        match output.next_token() {
            Some(token) => next_token = Some(token.to_string()),
            None => break,
        }
    }

    Ok(shard_ids)
}

fn assigned_shards(mut shard_ids: Vec<String>, slot: usize, parallelism: usize) -> Vec<String> {
    shard_ids.sort();
    let parallelism = parallelism.max(1);
    shard_ids
        .into_iter()
        .enumerate()
        .filter(|(i, _)| i % parallelism == slot)
        .map(|(_, id)| id)
        .collect()
}

// Sequence numbers are unbounded decimal strings.
fn compare_sequence(a: &str, b: &str) -> Ordering {
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

fn classify_read_error<E, R>(err: &SdkError<E, R>) -> ReadFailure
where
    E: ProvideErrorMetadata,
{
    match err {
        SdkError::ServiceError(service) => classify_service_code(service.err().code()),
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            ReadFailure::Transient
        }
        SdkError::ConstructionFailure(_) => ReadFailure::Permanent,
        _ => ReadFailure::Transient,
    }
}

fn classify_service_code(code: Option<&str>) -> ReadFailure {
    match code.unwrap_or("Unknown") {
        "ExpiredIteratorException" => ReadFailure::ExpiredIterator,
        "ProvisionedThroughputExceededException"
        | "LimitExceededException"
        | "KMSThrottlingException"
        | "InternalFailure"
        | "ServiceUnavailable" => ReadFailure::Transient,
        _ => ReadFailure::Permanent,
    }
}
