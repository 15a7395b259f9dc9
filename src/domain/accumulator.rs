//! Per-window partial aggregate
//!
//! `fold` absorbs one event, `merge` combines two partials. Both are
//! order-independent: sum over fixed-point amounts and min/max over
//! timestamps, so partials built by different workers combine to the
//! same result regardless of arrival order.

use crate::domain::types::{Amount, EventTime, TransactionEvent};

/// The running total would leave the representable range.
///
/// The accumulator is left exactly as it was before the rejected input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("window total overflows at {total} + {rejected}")]
pub struct AmountOverflow {
    pub total: Amount,
    pub rejected: Amount,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Accumulator {
    pub total_amount: Amount,
    pub min_timestamp: Option<EventTime>,
    pub max_timestamp: Option<EventTime>,
    /// Number of events folded in (summed on merge)
    pub event_count: u64,
}

impl Accumulator {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.event_count == 0
    }

    /// Absorb a single event
    pub fn fold(&mut self, event: &TransactionEvent) -> Result<(), AmountOverflow> {
        self.fold_value(event.timestamp, event.total_amount)
    }

    pub(crate) fn fold_value(
        &mut self,
        timestamp: EventTime,
        amount: Amount,
    ) -> Result<(), AmountOverflow> {
        self.total_amount = self.add_to_total(amount)?;
        self.min_timestamp = Some(match self.min_timestamp {
            Some(current) => current.min(timestamp),
            None => timestamp,
        });
        self.max_timestamp = Some(match self.max_timestamp {
            Some(current) => current.max(timestamp),
            None => timestamp,
        });
        self.event_count += 1;
        Ok(())
    }

    /// Combine another partial into this one
    pub fn merge(&mut self, other: &Accumulator) -> Result<(), AmountOverflow> {
        self.total_amount = self.add_to_total(other.total_amount)?;
        self.min_timestamp = pick(self.min_timestamp, other.min_timestamp, std::cmp::min);
        self.max_timestamp = pick(self.max_timestamp, other.max_timestamp, std::cmp::max);
        self.event_count += other.event_count;
        Ok(())
    }

    fn add_to_total(&self, amount: Amount) -> Result<Amount, AmountOverflow> {
        self.total_amount
            .checked_add(amount)
            .ok_or(AmountOverflow { total: self.total_amount, rejected: amount })
    }
}

/// Unset is the identity on either side
#[inline]
fn pick(
    a: Option<EventTime>,
    b: Option<EventTime>,
    f: fn(EventTime, EventTime) -> EventTime,
) -> Option<EventTime> {
    match (a, b) {
        (Some(x), Some(y)) => Some(f(x, y)),
        (Some(x), None) | (None, Some(x)) => Some(x),
        (None, None) => None,
    }
}
