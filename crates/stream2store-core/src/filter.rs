//! Record filters applied between decoding and mapping.

use crate::StockRecord;

/// Decides whether a decoded record continues down the pipeline.
pub trait RecordFilter: Send + Sync {
    fn keep(&self, record: &StockRecord) -> bool;
}

/// Keeps records priced strictly below `threshold`.
///
/// `NaN` never compares below the threshold, so such records are dropped.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceThresholdFilter {
    pub threshold: f64,
}

impl PriceThresholdFilter {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }
}

impl Default for PriceThresholdFilter {
    fn default() -> Self {
        Self { threshold: 1.0 }
    }
}

impl RecordFilter for PriceThresholdFilter {
    fn keep(&self, record: &StockRecord) -> bool {
        record.price < self.threshold
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl RecordFilter for AcceptAll {
    fn keep(&self, _record: &StockRecord) -> bool {
        true
    }
}
