//! Wide-column store backend over CQL (Amazon Keyspaces or any Cassandra
//! compatible cluster).
//!
//! Each submission is one unlogged batch of INSERTs at the configured
//! consistency level. Batches apply all-or-nothing, so a successful call never
//! reports a partial rejection. Prepared statements are cached per column set.
//!
//! Authentication uses username/password service-specific credentials only.
//! Keyspaces also accepts SigV4-signed auth from IAM credentials; that is not
//! supported here.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use scylla::batch::{Batch, BatchType};
use scylla::load_balancing::DefaultPolicy;
use scylla::prepared_statement::PreparedStatement;
use scylla::statement::Consistency;
use scylla::transport::ExecutionProfile;
use scylla::{Session, SessionBuilder};
use stream2store_core::{WriteOperation, WriteRequest};
use tracing::{debug, info};

use crate::backend::WriteBackend;
use crate::error::{Result, StoreError};

#[derive(Debug, Clone)]
pub struct KeyspacesSettings {
    pub contact_points: Vec<String>,
    pub port: u16,
    pub local_datacenter: String,
    pub keyspace: String,
    pub table: String,
    pub consistency: Consistency,
    pub username: Option<String>,
    pub password: Option<String>,
}

pub struct KeyspacesBackend {
    session: Session,
    keyspace: String,
    table: String,
    consistency: Consistency,
    statements: Mutex<HashMap<Vec<String>, PreparedStatement>>,
}

impl KeyspacesBackend {
    pub async fn connect(settings: KeyspacesSettings) -> Result<Self> {
        let policy = DefaultPolicy::builder()
            .prefer_datacenter(settings.local_datacenter.clone())
            .token_aware(true)
            .build();
        let profile = ExecutionProfile::builder()
            .consistency(settings.consistency)
            .load_balancing_policy(policy)
            .build();

        let mut builder = SessionBuilder::new().default_execution_profile_handle(profile.into_handle());
        for point in &settings.contact_points {
            builder = builder.known_node(format!("{}:{}", point, settings.port));
        }
        // TODO: SigV4 authentication from the default AWS credential chain.
        if let (Some(user), Some(password)) = (&settings.username, &settings.password) {
            builder = builder.user(user, password);
        }
        #[cfg(feature = "tls")]
        {
            builder = builder.ssl_context(Some(tls_context()?));
        }

        let session = builder
            .build()
            .await
            .map_err(|e| classify_message(format!("failed to connect: {}", e)))?;

        info!(
            contact_points = ?settings.contact_points,
            port = settings.port,
            local_datacenter = %settings.local_datacenter,
            keyspace = %settings.keyspace,
            table = %settings.table,
            consistency = ?settings.consistency,
            "Connected wide-column backend"
        );

        Ok(Self {
            session,
            keyspace: settings.keyspace,
            table: settings.table,
            consistency: settings.consistency,
            statements: Mutex::new(HashMap::new()),
        })
    }

    async fn statement_for(&self, columns: &[String]) -> Result<PreparedStatement> {
        if let Some(prepared) = self.statements.lock().get(columns) {
            return Ok(prepared.clone());
        }

        let query = insert_statement(&self.keyspace, &self.table, columns);
        debug!(query = %query, "Preparing insert statement");
        let prepared = self
            .session
            .prepare(query)
            .await
            .map_err(|e| classify_message(e.to_string()))?;
        self.statements
            .lock()
            .insert(columns.to_vec(), prepared.clone());
        Ok(prepared)
    }
}

#[async_trait]
impl WriteBackend for KeyspacesBackend {
    fn name(&self) -> &'static str {
        "keyspaces"
    }

    async fn submit_batch(&self, requests: &[WriteRequest]) -> Result<Vec<WriteRequest>> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }

        let mut batch = Batch::new(BatchType::Unlogged);
        batch.set_consistency(self.consistency);
        let mut values: Vec<Vec<String>> = Vec::with_capacity(requests.len());

        for request in requests {
            match request.operation {
                WriteOperation::Put => {
                    let (columns, row) = row_of(request);
                    batch.append_statement(self.statement_for(&columns).await?);
                    values.push(row);
                }
            }
        }

        self.session
            .batch(&batch, values)
            .await
            .map_err(|e| classify_message(e.to_string()))?;
        Ok(Vec::new())
    }
}

/// Parse a CQL consistency level name such as `LOCAL_QUORUM`.
pub fn parse_consistency(level: &str) -> Result<Consistency> {
    match level.to_uppercase().as_str() {
        "ANY" => Ok(Consistency::Any),
        "ONE" => Ok(Consistency::One),
        "TWO" => Ok(Consistency::Two),
        "THREE" => Ok(Consistency::Three),
        "QUORUM" => Ok(Consistency::Quorum),
        "ALL" => Ok(Consistency::All),
        "LOCAL_QUORUM" => Ok(Consistency::LocalQuorum),
        "EACH_QUORUM" => Ok(Consistency::EachQuorum),
        "LOCAL_ONE" => Ok(Consistency::LocalOne),
        other => Err(StoreError::permanent(format!(
            "unknown consistency level: {}",
            other
        ))),
    }
}

fn row_of(request: &WriteRequest) -> (Vec<String>, Vec<String>) {
    request
        .key
        .iter()
        .chain(request.attributes.iter())
        .map(|(name, value)| (name.clone(), value.as_str().to_string()))
        .unzip()
}

fn insert_statement(keyspace: &str, table: &str, columns: &[String]) -> String {
    let placeholders = vec!["?"; columns.len()].join(", ");
    format!(
        "INSERT INTO {}.{} ({}) VALUES ({})",
        keyspace,
        table,
        columns.join(", "),
        placeholders
    )
}

// Driver errors are classified by message so the mapping does not depend on
// the driver's error enum layout.
fn classify_message(message: String) -> StoreError {
    let lower = message.to_lowercase();
    if lower.contains("overloaded") || lower.contains("rate exceeded") || lower.contains("throttl")
    {
        StoreError::throttled(message)
    } else if lower.contains("timeout")
        || lower.contains("timed out")
        || lower.contains("unavailable")
        || lower.contains("connection")
        || lower.contains("broken pipe")
        || lower.contains("io error")
    {
        StoreError::unavailable(message)
    } else {
        StoreError::permanent(message)
    }
}

#[cfg(feature = "tls")]
fn tls_context() -> Result<openssl::ssl::SslContext> {
    use openssl::ssl::{SslContextBuilder, SslMethod, SslVerifyMode};

    let mut builder = SslContextBuilder::new(SslMethod::tls())
        .map_err(|e| StoreError::permanent(format!("failed to create TLS context: {}", e)))?;
    builder
        .set_default_verify_paths()
        .map_err(|e| StoreError::permanent(format!("failed to load CA certificates: {}", e)))?;
    builder.set_verify(SslVerifyMode::PEER);
    Ok(builder.build())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use stream2store_core::FieldValue;

    #[test]
    fn test_insert_statement() {
        let columns = vec![
            "ticker".to_string(),
            "event_time".to_string(),
            "stock_price".to_string(),
        ];
        assert_eq!(
            insert_statement("stock", "stock_prices", &columns),
            "INSERT INTO stock.stock_prices (ticker, event_time, stock_price) VALUES (?, ?, ?)"
        );
    }

    #[test]
    fn test_row_of_puts_key_first() {
        let mut key = BTreeMap::new();
        key.insert("ticker".to_string(), FieldValue::Text("AMZN".to_string()));
        let mut attributes = BTreeMap::new();
        attributes.insert("stock_price".to_string(), FieldValue::Text("0.5".to_string()));
        attributes.insert("event_time".to_string(), FieldValue::Text("t".to_string()));

        let (columns, row) = row_of(&WriteRequest::put(key, attributes));
        assert_eq!(columns, ["ticker", "event_time", "stock_price"]);
        assert_eq!(row, ["AMZN", "t", "0.5"]);
    }

    #[test]
    fn test_parse_consistency() {
        assert_eq!(
            parse_consistency("local_quorum").unwrap(),
            Consistency::LocalQuorum
        );
        assert_eq!(parse_consistency("ONE").unwrap(), Consistency::One);
        assert!(parse_consistency("MOST").is_err());
    }

    #[test]
    fn test_classify_message() {
        assert!(matches!(
            classify_message("Database returned an error: Overloaded".to_string()),
            StoreError::Throttled { .. }
        ));
        assert!(matches!(
            classify_message("Write timeout for 1 of 2 replicas".to_string()),
            StoreError::Unavailable { .. }
        ));
        assert!(matches!(
            classify_message("Invalid query: unconfigured table".to_string()),
            StoreError::Permanent { .. }
        ));
    }
}
