use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A single price observation carried by the stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockRecord {
    pub ticker: String,
    pub event_time: String,
    pub price: f64,
}

/// A value written to the store.
///
/// Numbers keep their textual form so each backend can pick its wire type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum FieldValue {
    Text(String),
    Number(String),
}

impl FieldValue {
    pub fn as_str(&self) -> &str {
        match self {
            FieldValue::Text(s) | FieldValue::Number(s) => s,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteOperation {
    Put,
}

/// Store-neutral write intent produced by a [`crate::RecordMapper`].
///
/// Fields are kept in `BTreeMap`s so two requests for the same content compare
/// and hash equal regardless of insertion order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WriteRequest {
    pub operation: WriteOperation,
    pub key: BTreeMap<String, FieldValue>,
    pub attributes: BTreeMap<String, FieldValue>,
}

impl WriteRequest {
    pub fn put(key: BTreeMap<String, FieldValue>, attributes: BTreeMap<String, FieldValue>) -> Self {
        Self {
            operation: WriteOperation::Put,
            key,
            attributes,
        }
    }

    /// Look up a field by name in the key first, then in the attributes.
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.key.get(name).or_else(|| self.attributes.get(name))
    }

    /// Render the key fields as `name=value` pairs for diagnostics.
    pub fn key_summary(&self) -> String {
        self.key
            .iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> WriteRequest {
        let mut key = BTreeMap::new();
        key.insert("ticker".to_string(), FieldValue::Text("AMZN".to_string()));
        let mut attributes = BTreeMap::new();
        attributes.insert(
            "event_time".to_string(),
            FieldValue::Text("2024-01-01T00:00:00".to_string()),
        );
        WriteRequest::put(key, attributes)
    }

    #[test]
    fn test_field_lookup_prefers_key() {
        let req = request();
        assert_eq!(req.field("ticker").map(FieldValue::as_str), Some("AMZN"));
        assert_eq!(
            req.field("event_time").map(FieldValue::as_str),
            Some("2024-01-01T00:00:00")
        );
        assert!(req.field("price").is_none());
    }

    #[test]
    fn test_key_summary() {
        assert_eq!(request().key_summary(), "ticker=AMZN");
    }
}
