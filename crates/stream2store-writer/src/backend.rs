use async_trait::async_trait;
use stream2store_core::WriteRequest;

use crate::error::Result;

/// Remote "submit batch" primitive implemented by each store.
///
/// A successful call returns the subset of `requests` the store did not
/// apply (empty on full success). An `Err` means nothing from the batch can
/// be assumed written.
#[async_trait]
pub trait WriteBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn submit_batch(&self, requests: &[WriteRequest]) -> Result<Vec<WriteRequest>>;
}
