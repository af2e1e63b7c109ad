//! stream2store-writer - Batched sink writer and store backends
//!
//! [`SinkWriter`] turns individual write requests into bounded, deduplicated,
//! retried batch submissions against a [`WriteBackend`], and exposes a drain
//! contract so the caller knows when it is safe to acknowledge the source.
//!
//! Backends:
//! - [`DynamoDbBackend`]: key-value store via BatchWriteItem
//! - [`KeyspacesBackend`]: wide-column store via CQL unlogged batches
//! - [`MemoryBackend`]: in-process store for dry runs and tests

mod backend;
pub mod dispatcher;
mod drain;
pub mod dynamodb;
mod error;
pub mod keyspaces;
pub mod memory;
mod scheduler;
mod sink;

pub use backend::WriteBackend;
pub use dispatcher::{DispatchFailure, Dispatcher, RetryPolicy};
pub use drain::{DrainReport, WriterState};
pub use dynamodb::{DynamoDbBackend, DynamoDbSettings};
pub use error::{ErrorCode, Result, SinkError, StoreError};
pub use keyspaces::{KeyspacesBackend, KeyspacesSettings};
pub use memory::{MemoryBackend, ScriptedResponse};
pub use sink::{SinkSettings, SinkWriter, WriterStats};
