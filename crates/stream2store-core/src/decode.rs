//! Decoding of stream payloads into [`StockRecord`]s.
//!
//! Payloads are UTF-8 JSON objects of the form
//! `{"event_time": "...", "ticker": "...", "price": 12.5}`. Unknown fields are
//! ignored; a missing or mistyped field is a record-level error.

use crate::StockRecord;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload is empty")]
    Empty,

    #[error("invalid record payload: {0}")]
    Json(#[from] serde_json::Error),
}

pub fn decode_record(payload: &[u8]) -> Result<StockRecord, DecodeError> {
    if payload.iter().all(u8::is_ascii_whitespace) {
        return Err(DecodeError::Empty);
    }
    Ok(serde_json::from_slice(payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_record() {
        let record = decode_record(
            br#"{"event_time": "2024-03-01T10:00:00.000", "ticker": "AAPL", "price": 0.42}"#,
        )
        .unwrap();
        assert_eq!(record.ticker, "AAPL");
        assert_eq!(record.event_time, "2024-03-01T10:00:00.000");
        assert_eq!(record.price, 0.42);
    }

    #[test]
    fn test_decode_ignores_unknown_fields() {
        let record =
            decode_record(br#"{"ticker": "MSFT", "event_time": "t", "price": 1, "venue": "X"}"#)
                .unwrap();
        assert_eq!(record.price, 1.0);
    }

    #[test]
    fn test_decode_errors() {
        assert!(matches!(decode_record(b"  \n"), Err(DecodeError::Empty)));
        assert!(matches!(
            decode_record(br#"{"ticker": "MSFT", "price": 1.0}"#),
            Err(DecodeError::Json(_))
        ));
        assert!(matches!(
            decode_record(br#"{"ticker": "MSFT", "event_time": "t", "price": "cheap"}"#),
            Err(DecodeError::Json(_))
        ));
    }
}
