//! Flush decision for the writer's scheduler.

use std::time::Duration;

use crate::BatchConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushDecision {
    Flush,
    /// Nothing is due yet; re-evaluate after this long at the latest.
    WaitFor(Duration),
    Idle,
}

/// Decide whether the buffer should be flushed now.
///
/// `force` is set while the writer drains, which flushes any non-empty
/// buffer regardless of size or age.
pub fn decide(
    size: usize,
    oldest_age: Option<Duration>,
    force: bool,
    config: &BatchConfig,
) -> FlushDecision {
    if size == 0 {
        return FlushDecision::Idle;
    }
    if size >= config.max_batch_size || force {
        return FlushDecision::Flush;
    }

    let age = oldest_age.unwrap_or_default();
    if age >= config.max_time_in_buffer {
        FlushDecision::Flush
    } else {
        FlushDecision::WaitFor(config.max_time_in_buffer - age)
    }
}
