//! Mapping of records into store-specific write requests.

use crate::{FieldValue, StockRecord, WriteRequest};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MapError {
    #[error("record field '{0}' is missing or empty")]
    MissingField(&'static str),

    #[error("record price {0} is not a finite number")]
    NonFinitePrice(f64),
}

pub trait RecordMapper: Send + Sync {
    fn to_write_request(&self, record: &StockRecord) -> Result<WriteRequest, MapError>;
}

/// Item layout for the key-value store: `ticker` is the partition key.
///
/// `price` is a Number attribute unless `price_as_string` is set, which
/// matches tables written with a String price.
#[derive(Debug, Clone, Copy, Default)]
pub struct ItemMapper {
    pub price_as_string: bool,
}

impl RecordMapper for ItemMapper {
    fn to_write_request(&self, record: &StockRecord) -> Result<WriteRequest, MapError> {
        let price = checked_price(record)?;
        let mut attributes = BTreeMap::new();
        attributes.insert(
            "event_time".to_string(),
            FieldValue::Text(record.event_time.clone()),
        );
        let price = if self.price_as_string {
            FieldValue::Text(price)
        } else {
            FieldValue::Number(price)
        };
        attributes.insert("price".to_string(), price);
        Ok(WriteRequest::put(ticker_key(record)?, attributes))
    }
}

/// Row layout for the wide-column store (`ticker`, `event_time`, `stock_price`).
#[derive(Debug, Clone, Copy, Default)]
pub struct RowMapper;

impl RecordMapper for RowMapper {
    fn to_write_request(&self, record: &StockRecord) -> Result<WriteRequest, MapError> {
        let price = checked_price(record)?;
        let mut attributes = BTreeMap::new();
        attributes.insert(
            "event_time".to_string(),
            FieldValue::Text(record.event_time.clone()),
        );
        attributes.insert("stock_price".to_string(), FieldValue::Text(price));
        Ok(WriteRequest::put(ticker_key(record)?, attributes))
    }
}

fn ticker_key(record: &StockRecord) -> Result<BTreeMap<String, FieldValue>, MapError> {
    if record.ticker.is_empty() {
        return Err(MapError::MissingField("ticker"));
    }
    let mut key = BTreeMap::new();
    key.insert("ticker".to_string(), FieldValue::Text(record.ticker.clone()));
    Ok(key)
}

// Validates the record and renders its price with the shortest round-trip form.
fn checked_price(record: &StockRecord) -> Result<String, MapError> {
    if record.event_time.is_empty() {
        return Err(MapError::MissingField("event_time"));
    }
    if !record.price.is_finite() {
        return Err(MapError::NonFinitePrice(record.price));
    }
    Ok(record.price.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(ticker: &str, price: f64) -> StockRecord {
        StockRecord {
            ticker: ticker.to_string(),
            event_time: "2024-03-01T10:00:00".to_string(),
            price,
        }
    }

    #[test]
    fn test_item_mapper() {
        let req = ItemMapper::default().to_write_request(&record("AMZN", 0.25)).unwrap();
        assert_eq!(req.key.len(), 1);
        assert_eq!(req.key["ticker"], FieldValue::Text("AMZN".to_string()));
        assert_eq!(req.attributes["price"], FieldValue::Number("0.25".to_string()));
        assert_eq!(
            req.attributes["event_time"],
            FieldValue::Text("2024-03-01T10:00:00".to_string())
        );
    }

    #[test]
    fn test_item_mapper_string_price() {
        let mapper = ItemMapper {
            price_as_string: true,
        };
        let req = mapper.to_write_request(&record("AMZN", 0.25)).unwrap();
        assert_eq!(req.attributes["price"], FieldValue::Text("0.25".to_string()));
    }

    #[test]
    fn test_row_mapper() {
        let req = RowMapper.to_write_request(&record("INTC", 0.5)).unwrap();
        assert_eq!(req.key["ticker"], FieldValue::Text("INTC".to_string()));
        assert_eq!(req.attributes["stock_price"], FieldValue::Text("0.5".to_string()));
        assert!(!req.attributes.contains_key("price"));
    }

    #[test]
    fn test_mapping_is_deterministic() {
        let a = ItemMapper::default().to_write_request(&record("AMZN", 0.1)).unwrap();
        let b = ItemMapper::default().to_write_request(&record("AMZN", 0.1)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_mapping_errors() {
        assert_eq!(
            ItemMapper::default().to_write_request(&record("", 0.1)),
            Err(MapError::MissingField("ticker"))
        );
        let mut no_time = record("AMZN", 0.1);
        no_time.event_time.clear();
        assert_eq!(
            RowMapper.to_write_request(&no_time),
            Err(MapError::MissingField("event_time"))
        );
        assert!(matches!(
            ItemMapper::default().to_write_request(&record("AMZN", f64::INFINITY)),
            Err(MapError::NonFinitePrice(_))
        ));
    }
}
