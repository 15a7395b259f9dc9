//! Raw payload → `TransactionEvent`
//!
//! Malformed payloads are rejected with a typed error; the caller logs,
//! counts and moves on. Nothing here is fatal.

use crate::domain::types::{Amount, EventTime, Item, TransactionEvent};
use serde::Deserialize;
use time::format_description::well_known::{Iso8601, Rfc3339};
use time::{OffsetDateTime, PrimitiveDateTime};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum NormalizeError {
    #[error("payload is not valid JSON: {0}")]
    Parse(String),
    #[error("required field '{0}' is missing")]
    MissingField(&'static str),
    #[error("field '{field}' is invalid: {reason}")]
    InvalidField { field: &'static str, reason: String },
}

impl NormalizeError {
    /// Short label for structured logs
    pub fn kind(&self) -> &'static str {
        match self {
            NormalizeError::Parse(_) => "parse_error",
            NormalizeError::MissingField(_) => "missing_field",
            NormalizeError::InvalidField { .. } => "invalid_field",
        }
    }
}

/// Wire shape of a POS transaction; everything optional so that a missing
/// field is reported as such instead of as a parse failure.
#[derive(Debug, Deserialize)]
struct RawTransaction {
    #[serde(default)]
    transaction_id: Option<serde_json::Value>,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    store_id: Option<String>,
    #[serde(default)]
    total_amount: Option<f64>,
    #[serde(default)]
    items: Option<Vec<Item>>,
}

/// Parse a raw broker payload into a typed event
pub fn normalize(payload: &str) -> Result<TransactionEvent, NormalizeError> {
    let raw: RawTransaction =
        serde_json::from_str(payload).map_err(|e| NormalizeError::Parse(e.to_string()))?;

    let timestamp = raw.timestamp.ok_or(NormalizeError::MissingField("timestamp"))?;
    let store_id = raw.store_id.ok_or(NormalizeError::MissingField("store_id"))?;
    let total_amount = raw.total_amount.ok_or(NormalizeError::MissingField("total_amount"))?;

    let timestamp = parse_event_time(&timestamp).ok_or_else(|| NormalizeError::InvalidField {
        field: "timestamp",
        reason: format!("'{}' is not an ISO 8601 timestamp", timestamp),
    })?;

    // Keyed on the value as sent; " S1" and "S1" are different stores
    if store_id.is_empty() {
        return Err(NormalizeError::InvalidField {
            field: "store_id",
            reason: "empty".to_string(),
        });
    }

    let total_amount = Amount::from_f64(total_amount)
        .filter(|a| a.is_positive())
        .ok_or_else(|| NormalizeError::InvalidField {
            field: "total_amount",
            reason: format!("{} is not a positive amount", total_amount),
        })?;

    let transaction_id = raw.transaction_id.map(|v| match v {
        serde_json::Value::String(s) => s,
        other => other.to_string(),
    });

    Ok(TransactionEvent {
        transaction_id,
        timestamp,
        store_id,
        total_amount,
        items: raw.items.unwrap_or_default(),
    })
}

/// Parse an event timestamp to epoch microseconds.
///
/// Accepts RFC 3339 (`Z` or numeric offset) and offset-less ISO 8601,
/// which is taken as UTC.
pub fn parse_event_time(value: &str) -> Option<EventTime> {
    let value = value.trim();
    let dt = OffsetDateTime::parse(value, &Rfc3339)
        .or_else(|_| OffsetDateTime::parse(value, &Iso8601::DEFAULT))
        .or_else(|_| PrimitiveDateTime::parse(value, &Iso8601::DEFAULT).map(|p| p.assume_utc()))
        .ok()?;
    // Sub-microsecond digits are floored away
    let micros = dt.unix_timestamp_nanos().div_euclid(1_000);
    i64::try_from(micros).ok().map(EventTime)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "transaction_id": "335f21fb-538a-4f30-a868-2ed0e0e31a57",
        "timestamp": "2024-11-27T15:40:49Z",
        "store_id": "STORE_2",
        "cashier_id": "CASHIER_9",
        "items": [{"item_id": "dd308a50-943f-4893-8a2d-a79e7f04b80a", "name": "Wasser - 1.5L",
                   "quantity": 4, "price_per_unit": 0.79, "total_price": 3.16}],
        "total_amount": 3.16,
        "payment_method": "credit_card",
        "payment_status": "success",
        "customer_id": "CUSTOMER_316",
        "loyalty_points_earned": 4,
        "receipt": {"receipt_id": "37ed85ac", "date": "2024-11-02T19:24:20.201465Z",
                    "total_amount": 3.16, "payment_method": "credit_card",
                    "transaction_id": "f02e5673"}
    }"#;

    #[test]
    fn test_normalize_full_transaction() {
        let event = normalize(SAMPLE).unwrap();
        assert_eq!(event.store_id, "STORE_2");
        assert_eq!(event.timestamp, EventTime::from_millis(1_732_722_049_000));
        assert_eq!(event.total_amount, Amount(3_160_000));
        assert_eq!(event.transaction_id.as_deref(), Some("335f21fb-538a-4f30-a868-2ed0e0e31a57"));
        assert_eq!(event.items.len(), 1);
        assert_eq!(event.items[0].quantity, Some(4));
    }

    #[test]
    fn test_invalid_json_is_parse_error() {
        assert!(matches!(normalize("not json"), Err(NormalizeError::Parse(_))));
        assert!(matches!(normalize(""), Err(NormalizeError::Parse(_))));
        assert!(matches!(normalize("[1, 2]"), Err(NormalizeError::Parse(_))));
    }

    #[test]
    fn test_missing_required_fields() {
        let no_ts = r#"{"store_id": "S1", "total_amount": 1.0}"#;
        assert_eq!(normalize(no_ts), Err(NormalizeError::MissingField("timestamp")));

        let no_store = r#"{"timestamp": "2024-11-27T15:40:49Z", "total_amount": 1.0}"#;
        assert_eq!(normalize(no_store), Err(NormalizeError::MissingField("store_id")));

        let no_amount = r#"{"timestamp": "2024-11-27T15:40:49Z", "store_id": "S1"}"#;
        assert_eq!(normalize(no_amount), Err(NormalizeError::MissingField("total_amount")));
    }

    #[test]
    fn test_invalid_field_values() {
        let bad_ts = r#"{"timestamp": "yesterday", "store_id": "S1", "total_amount": 1.0}"#;
        assert!(matches!(
            normalize(bad_ts),
            Err(NormalizeError::InvalidField { field: "timestamp", .. })
        ));

        let zero = r#"{"timestamp": "2024-11-27T15:40:49Z", "store_id": "S1", "total_amount": 0}"#;
        assert!(matches!(
            normalize(zero),
            Err(NormalizeError::InvalidField { field: "total_amount", .. })
        ));

        let negative =
            r#"{"timestamp": "2024-11-27T15:40:49Z", "store_id": "S1", "total_amount": -2.5}"#;
        assert!(matches!(
            normalize(negative),
            Err(NormalizeError::InvalidField { field: "total_amount", .. })
        ));

        let empty = r#"{"timestamp": "2024-11-27T15:40:49Z", "store_id": "", "total_amount": 1}"#;
        assert!(matches!(
            normalize(empty),
            Err(NormalizeError::InvalidField { field: "store_id", .. })
        ));
    }

    #[test]
    fn test_store_id_is_kept_verbatim() {
        let padded = r#"{"timestamp": "2024-11-27T15:40:49Z", "store_id": " S1", "total_amount": 1}"#;
        assert_eq!(normalize(padded).unwrap().store_id, " S1");

        let blank = r#"{"timestamp": "2024-11-27T15:40:49Z", "store_id": "  ", "total_amount": 1}"#;
        assert_eq!(normalize(blank).unwrap().store_id, "  ");
    }

    #[test]
    fn test_wrong_type_is_parse_error() {
        let amount_as_text =
            r#"{"timestamp": "2024-11-27T15:40:49Z", "store_id": "S1", "total_amount": "3.16"}"#;
        assert!(matches!(normalize(amount_as_text), Err(NormalizeError::Parse(_))));
    }

    #[test]
    fn test_parse_event_time_variants() {
        let expected = Some(EventTime::from_millis(1_732_722_049_000));
        assert_eq!(parse_event_time("2024-11-27T15:40:49Z"), expected);
        assert_eq!(parse_event_time("2024-11-27T15:40:49+00:00"), expected);
        assert_eq!(parse_event_time("2024-11-27T16:40:49+01:00"), expected);
        assert_eq!(parse_event_time("2024-11-27T15:40:49"), expected);
        assert_eq!(
            parse_event_time("2024-11-27T15:40:49.250Z"),
            Some(EventTime::from_millis(1_732_722_049_250))
        );
        assert_eq!(
            parse_event_time("2024-11-27T15:40:49.201465Z"),
            Some(EventTime(1_732_722_049_201_465))
        );
        // Nanosecond digits floor to the microsecond
        assert_eq!(
            parse_event_time("2024-11-27T15:40:49.201465999Z"),
            Some(EventTime(1_732_722_049_201_465))
        );
        assert_eq!(parse_event_time("not a timestamp"), None);
        assert_eq!(parse_event_time(""), None);
    }

    #[test]
    fn test_pre_epoch_timestamp_floors() {
        assert_eq!(parse_event_time("1969-12-31T23:59:59.999999Z"), Some(EventTime(-1)));
        assert_eq!(parse_event_time("1969-12-31T23:59:59.999Z"), Some(EventTime(-1_000)));
    }

    #[test]
    fn test_microsecond_timestamp_survives_to_output() {
        use crate::domain::{Accumulator, AggregatedEvent, WindowKey};
        use crate::services::window::TumblingWindower;

        let payload = r#"{"timestamp": "2024-11-27T15:40:49.201465Z", "store_id": "S1", "total_amount": 3.16}"#;
        let event = normalize(payload).unwrap();
        assert_eq!(event.timestamp, EventTime(1_732_722_049_201_465));

        let windower = TumblingWindower::new(
            std::time::Duration::from_secs(10),
            EventTime::from_millis(1_731_685_240_000),
        )
        .unwrap();
        let key = WindowKey::new(event.store_id.clone(), windower.assign(event.timestamp));
        let mut acc = Accumulator::empty();
        acc.fold(&event).unwrap();

        let out = AggregatedEvent::from_closed(&key, &acc).unwrap();
        assert_eq!(out.begin_stream_aggregator, "2024-11-27T15:40:49.201465+00:00");
        assert_eq!(out.end_stream_aggregator, "2024-11-27T15:40:49.201465+00:00");
        assert_eq!(key.window.start.to_iso8601(), "2024-11-27T15:40:40+00:00");
    }
}
