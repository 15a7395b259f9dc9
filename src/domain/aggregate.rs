//! Emitted aggregate record and the formatter that builds it

use crate::domain::accumulator::Accumulator;
use crate::domain::types::{Amount, WindowKey};
use serde::Serialize;
use uuid::Uuid;

/// Record posted to the amount-per-store endpoint
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregatedEvent {
    /// Rounded to 2 decimal places
    pub total_amount: f64,
    pub event_id: String,
    pub store_id: String,
    /// Earliest folded event time (ISO 8601)
    pub begin_stream_aggregator: String,
    /// Latest folded event time (ISO 8601)
    pub end_stream_aggregator: String,
}

/// Why a closed window produced no record
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FormatError {
    #[error("window {0} closed with no events")]
    Empty(String),
    #[error("aggregate for {key} rounds to {amount}, must be > 0")]
    NonPositive { key: String, amount: Amount },
}

impl AggregatedEvent {
    /// Convert a closed accumulator into its output record
    pub fn from_closed(key: &WindowKey, acc: &Accumulator) -> Result<Self, FormatError> {
        let (Some(begin), Some(end)) = (acc.min_timestamp, acc.max_timestamp) else {
            return Err(FormatError::Empty(key.to_string()));
        };
        if acc.total_amount.round_to_cents() <= 0 {
            return Err(FormatError::NonPositive {
                key: key.to_string(),
                amount: acc.total_amount,
            });
        }

        Ok(Self {
            total_amount: acc.total_amount.to_f64_2dp(),
            event_id: Uuid::now_v7().to_string(),
            store_id: key.store_id.clone(),
            begin_stream_aggregator: begin.to_iso8601(),
            end_stream_aggregator: end.to_iso8601(),
        })
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}
