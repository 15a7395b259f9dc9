//! Tumbling window assignment aligned to a fixed epoch

use crate::domain::types::{EventTime, Window};
use std::time::Duration;

/// Maps an event time to the tumbling window it belongs to.
///
/// `index = floor((t - align_to) / length)`, window is
/// `[align_to + index * length, align_to + (index + 1) * length)`.
/// All arithmetic is in event-time microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TumblingWindower {
    length_us: i64,
    align_to: EventTime,
}

impl TumblingWindower {
    /// Returns `None` for a zero or out-of-range length
    pub fn new(length: Duration, align_to: EventTime) -> Option<Self> {
        let length_us = i64::try_from(length.as_micros()).ok().filter(|l| *l > 0)?;
        Some(Self { length_us, align_to })
    }

    pub fn length(&self) -> Duration {
        Duration::from_micros(self.length_us as u64)
    }

    pub fn align_to(&self) -> EventTime {
        self.align_to
    }

    /// Window index relative to the alignment epoch (may be negative)
    #[inline]
    pub fn index_of(&self, t: EventTime) -> i64 {
        (t.0 as i128 - self.align_to.0 as i128).div_euclid(self.length_us as i128) as i64
    }

    /// Window containing `t`
    #[inline]
    pub fn assign(&self, t: EventTime) -> Window {
        let index = self.index_of(t) as i128;
        let start = self.align_to.0 as i128 + index * self.length_us as i128;
        let end = start + self.length_us as i128;
        Window { start: EventTime(saturate(start)), end: EventTime(saturate(end)) }
    }
}

#[inline]
fn saturate(v: i128) -> i64 {
    v.clamp(i64::MIN as i128, i64::MAX as i128) as i64
}
