// Record sources feeding a pipeline slot
//
// A source yields raw payloads with an acknowledgeable position. Positions are
// acknowledged only after the writer has drained everything read before them.

use anyhow::Result;
use async_trait::async_trait;
use std::fmt;

pub mod file;
pub mod kinesis;

pub use file::JsonLinesSource;
pub use kinesis::KinesisSource;

/// Position of a record within one partition of the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Position {
    pub partition: String,
    pub sequence: String,
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.partition, self.sequence)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceEvent {
    Record { payload: Vec<u8>, position: Position },
    /// Nothing to read right now; the caller should back off.
    Idle,
    /// A partition has no more records. The source is exhausted once
    /// `remaining` reaches zero.
    EndOfPartition { partition: String, remaining: usize },
}

#[async_trait]
pub trait RecordSource: Send {
    fn name(&self) -> &str;

    async fn next_event(&mut self) -> Result<SourceEvent>;

    /// Acknowledge that every record up to and including these positions
    /// has been persisted.
    async fn ack(&mut self, positions: &[Position]) -> Result<()>;
}
