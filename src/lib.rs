// stream2store - stream records into a key-oriented store
//
// Each pipeline slot reads its share of the source, decodes, filters and maps
// records, and hands write requests to its own batched sink writer. Source
// positions are acknowledged only after the writer drains.

pub mod init;
pub mod pipeline;
pub mod source;

pub use pipeline::{run_slot, SlotSettings, SlotStats, Stages};
pub use source::{JsonLinesSource, KinesisSource, Position, RecordSource, SourceEvent};
