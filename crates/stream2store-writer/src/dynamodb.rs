//! Key-value store backend using DynamoDB BatchWriteItem.
//!
//! Error mapping:
//! - `SdkError::ServiceError`, classified by service error code
//!   - throughput and request-rate codes → `StoreError::Throttled`
//!   - internal/unavailable codes → `StoreError::Unavailable`
//!   - everything else (validation, missing table, auth) → `StoreError::Permanent`
//! - `SdkError::TimeoutError`, `DispatchFailure`, `ResponseError` → `StoreError::Unavailable`
//! - `SdkError::ConstructionFailure` → `StoreError::Permanent`
//!
//! Items the service leaves in `UnprocessedItems` are returned as rejected.

use std::collections::HashMap;

use async_trait::async_trait;
use aws_sdk_dynamodb::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_dynamodb::types::{AttributeValue, PutRequest, WriteRequest as DdbWriteRequest};
use aws_sdk_dynamodb::Client;
use stream2store_core::{FieldValue, WriteOperation, WriteRequest};
use tracing::{debug, info};

use crate::backend::WriteBackend;
use crate::error::{Result, StoreError};

type Item = HashMap<String, AttributeValue>;

#[derive(Debug, Clone)]
pub struct DynamoDbSettings {
    pub table: String,
    pub region: String,
    /// Custom endpoint, e.g. DynamoDB Local.
    pub endpoint: Option<String>,
}

pub struct DynamoDbBackend {
    client: Client,
    table: String,
}

impl DynamoDbBackend {
    /// Build a client from the default AWS credential chain.
    pub async fn connect(settings: DynamoDbSettings) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(settings.region.clone()));
        if let Some(endpoint) = &settings.endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let sdk_config = loader.load().await;

        info!(
            table = %settings.table,
            region = %settings.region,
            endpoint = settings.endpoint.as_deref().unwrap_or("default"),
            "Connected DynamoDB backend"
        );
        Self::from_client(Client::new(&sdk_config), settings.table)
    }

    pub fn from_client(client: Client, table: impl Into<String>) -> Self {
        Self {
            client,
            table: table.into(),
        }
    }
}

#[async_trait]
impl WriteBackend for DynamoDbBackend {
    fn name(&self) -> &'static str {
        "dynamodb"
    }

    async fn submit_batch(&self, requests: &[WriteRequest]) -> Result<Vec<WriteRequest>> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }

        let items: Vec<Item> = requests.iter().map(to_item).collect();
        let mut writes = Vec::with_capacity(items.len());
        for (request, item) in requests.iter().zip(&items) {
            match request.operation {
                WriteOperation::Put => {
                    let put = PutRequest::builder()
                        .set_item(Some(item.clone()))
                        .build()
                        .map_err(|e| StoreError::permanent(format!("invalid put request: {}", e)))?;
                    writes.push(DdbWriteRequest::builder().put_request(put).build());
                }
            }
        }

        let output = self
            .client
            .batch_write_item()
            .request_items(&self.table, writes)
            .send()
            .await
            .map_err(|e| classify_sdk_error(&e))?;

        let unprocessed: Vec<&Item> = output
            .unprocessed_items()
            .and_then(|tables| tables.get(&self.table))
            .map(|writes| {
                writes
                    .iter()
                    .filter_map(|w| w.put_request())
                    .map(|put| put.item())
                    .collect()
            })
            .unwrap_or_default();

        if !unprocessed.is_empty() {
            debug!(
                table = %self.table,
                unprocessed = unprocessed.len(),
                "BatchWriteItem left unprocessed items"
            );
        }

        // Map unprocessed items back to the requests they came from.
        let mut taken = vec![false; items.len()];
        let mut rejected = Vec::with_capacity(unprocessed.len());
        for item in unprocessed {
            if let Some(i) = (0..items.len()).find(|&i| !taken[i] && &items[i] == item) {
                taken[i] = true;
                rejected.push(requests[i].clone());
            }
        }
        Ok(rejected)
    }
}

fn to_item(request: &WriteRequest) -> Item {
    request
        .key
        .iter()
        .chain(request.attributes.iter())
        .map(|(name, value)| (name.clone(), to_attribute(value)))
        .collect()
}

fn to_attribute(value: &FieldValue) -> AttributeValue {
    match value {
        FieldValue::Text(s) => AttributeValue::S(s.clone()),
        FieldValue::Number(n) => AttributeValue::N(n.clone()),
    }
}

fn classify_sdk_error<E, R>(err: &SdkError<E, R>) -> StoreError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    let message = DisplayErrorContext(err).to_string();
    match err {
        SdkError::ServiceError(service) => classify_service_code(service.err().code(), message),
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            StoreError::unavailable(message)
        }
        SdkError::ConstructionFailure(_) => StoreError::permanent(message),
        _ => StoreError::unavailable(message),
    }
}

fn classify_service_code(code: Option<&str>, message: String) -> StoreError {
    match code.unwrap_or("Unknown") {
        "ProvisionedThroughputExceededException"
        | "ThrottlingException"
        | "RequestLimitExceeded"
        | "LimitExceededException" => StoreError::throttled(message),
        "InternalServerError" | "ServiceUnavailable" | "TransactionInProgressException" => {
            StoreError::unavailable(message)
        }
        _ => StoreError::permanent(message),
    }
}
