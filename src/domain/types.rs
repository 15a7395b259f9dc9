//! Shared types for the POS aggregator

use serde::{Deserialize, Serialize};
use std::fmt;

/// Micro-units per currency unit for fixed-point amounts
pub const AMOUNT_SCALE: i64 = 1_000_000;

/// Microseconds per millisecond, for converting wall-clock and config spans
pub const MICROS_PER_MILLI: i64 = 1_000;

/// Newtype for event time in microseconds since the Unix epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct EventTime(pub i64);

impl EventTime {
    pub fn from_millis(millis: i64) -> Self {
        EventTime(millis.saturating_mul(MICROS_PER_MILLI))
    }

    /// Format as ISO 8601 with an explicit `+00:00` offset.
    ///
    /// Fractional seconds are printed only when non-zero, as milliseconds
    /// or microseconds depending on the precision present.
    pub fn to_iso8601(self) -> String {
        match chrono::DateTime::<chrono::Utc>::from_timestamp_micros(self.0) {
            Some(dt) => dt.to_rfc3339_opts(chrono::SecondsFormat::AutoSi, false),
            None => self.0.to_string(),
        }
    }
}

impl fmt::Display for EventTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_iso8601())
    }
}

/// Fixed-point currency amount in micro-units
///
/// Integer addition keeps folding and merging exactly associative,
/// which a float running sum would not be.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Amount(pub i64);

impl Amount {
    /// Convert a decimal amount, rejecting non-finite or out-of-range values
    pub fn from_f64(value: f64) -> Option<Self> {
        if !value.is_finite() {
            return None;
        }
        let scaled = (value * AMOUNT_SCALE as f64).round();
        if scaled.abs() >= i64::MAX as f64 {
            return None;
        }
        Some(Amount(scaled as i64))
    }

    pub fn is_positive(self) -> bool {
        self.0 > 0
    }

    /// Round to whole cents, half away from zero
    pub fn round_to_cents(self) -> i64 {
        let per_cent = AMOUNT_SCALE / 100;
        let half = per_cent / 2;
        if self.0 >= 0 {
            self.0.saturating_add(half) / per_cent
        } else {
            self.0.saturating_sub(half) / per_cent
        }
    }

    /// Decimal value rounded to 2 places
    pub fn to_f64_2dp(self) -> f64 {
        self.round_to_cents() as f64 / 100.0
    }

    /// Sum of two amounts, `None` on overflow
    pub fn checked_add(self, other: Amount) -> Option<Amount> {
        self.0.checked_add(other.0).map(Amount)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}", self.to_f64_2dp())
    }
}

/// Half-open tumbling window `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Window {
    pub start: EventTime,
    pub end: EventTime,
}

impl Window {
    pub fn contains(&self, t: EventTime) -> bool {
        self.start <= t && t < self.end
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Accumulator slot identity: one store within one window
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WindowKey {
    pub store_id: String,
    pub window: Window,
}

impl WindowKey {
    pub fn new(store_id: impl Into<String>, window: Window) -> Self {
        Self { store_id: store_id.into(), window }
    }
}

impl fmt::Display for WindowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.store_id, self.window)
    }
}

/// Line item carried through from the raw transaction
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Item {
    #[serde(default)]
    pub item_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub quantity: Option<i64>,
    #[serde(default)]
    pub price_per_unit: Option<f64>,
    #[serde(default)]
    pub total_price: Option<f64>,
}

/// Normalized POS transaction, immutable once parsed
#[derive(Debug, Clone, PartialEq)]
pub struct TransactionEvent {
    pub transaction_id: Option<String>,
    pub timestamp: EventTime,
    pub store_id: String,
    pub total_amount: Amount,
    pub items: Vec<Item>,
}

/// Raw message handed from the broker to the ingestion queue
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub payload: String,
    /// Wall-clock receive time (epoch µs)
    pub received_at: i64,
}

impl RawMessage {
    pub fn new(payload: impl Into<String>) -> Self {
        Self { payload: payload.into(), received_at: epoch_us() }
    }
}

/// Current wall-clock time in epoch microseconds, the unit of `EventTime`
pub fn epoch_us() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}
