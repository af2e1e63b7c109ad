// stream2store-core - Record model shared by every stage of the pipeline
//
// Inbound payloads are decoded into `StockRecord`s, filtered, and mapped into
// store-neutral `WriteRequest`s that the batching layer and backends consume.

pub mod decode;
pub mod filter;
pub mod mapper;
mod types;

pub use decode::{decode_record, DecodeError};
pub use filter::{AcceptAll, PriceThresholdFilter, RecordFilter};
pub use mapper::{ItemMapper, MapError, RecordMapper, RowMapper};
pub use types::{FieldValue, StockRecord, WriteOperation, WriteRequest};
