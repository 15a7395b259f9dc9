//! Per-key event-time watermark
//!
//! watermark = max observed event time - allowed lateness, optionally
//! advanced by the wall-clock time elapsed since that maximum was seen so
//! that a key that stops receiving events still closes its windows.
//! Event time and wall-clock time are both epoch microseconds.

use crate::domain::types::EventTime;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatermarkPolicy {
    pub allowed_lateness_us: i64,
    pub advance_with_system_time: bool,
}

impl WatermarkPolicy {
    pub fn new(allowed_lateness: Duration, advance_with_system_time: bool) -> Self {
        Self {
            allowed_lateness_us: i64::try_from(allowed_lateness.as_micros()).unwrap_or(i64::MAX),
            advance_with_system_time,
        }
    }

    pub fn allowed_lateness(&self) -> Duration {
        Duration::from_micros(self.allowed_lateness_us as u64)
    }
}

#[derive(Debug, Clone)]
pub struct WatermarkClock {
    policy: WatermarkPolicy,
    max_observed: Option<EventTime>,
    /// Wall-clock time at which `max_observed` was last raised
    observed_at_us: i64,
    /// Highest watermark handed out; never goes backwards
    last_watermark: Option<EventTime>,
}

impl WatermarkClock {
    pub fn new(policy: WatermarkPolicy) -> Self {
        Self { policy, max_observed: None, observed_at_us: 0, last_watermark: None }
    }

    /// Record an event time seen at wall-clock `now_us`
    pub fn observe(&mut self, ts: EventTime, now_us: i64) {
        match self.max_observed {
            Some(max) if ts <= max => {}
            _ => {
                self.max_observed = Some(ts);
                self.observed_at_us = now_us;
            }
        }
    }

    /// Current watermark, `None` until the first observation
    pub fn watermark(&mut self, now_us: i64) -> Option<EventTime> {
        let max = self.max_observed?;
        let mut wm = max.0.saturating_sub(self.policy.allowed_lateness_us);
        if self.policy.advance_with_system_time {
            let idle = now_us.saturating_sub(self.observed_at_us).max(0);
            wm = wm.saturating_add(idle);
        }
        let wm = match self.last_watermark {
            Some(prev) if prev.0 > wm => prev,
            _ => EventTime(wm),
        };
        self.last_watermark = Some(wm);
        Some(wm)
    }

    /// Last watermark computed, without advancing it
    pub fn current(&self) -> Option<EventTime> {
        self.last_watermark
    }
}
