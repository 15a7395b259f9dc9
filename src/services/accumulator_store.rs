//! Keyed accumulator state
//!
//! - `PartialStore` - a worker's private (store, window) → accumulator map,
//!   filled by `fold` and handed off whole to the reducers
//! - `WindowStore` - a reducer's authoritative state. Owns the watermark
//!   clock per store key and drives every window through
//!   Open → Closing → Emitted exactly once
//!
//! A store key always routes to the same reducer shard, so one window's
//! accumulator is only ever merged by a single owner.

use crate::domain::accumulator::{Accumulator, AmountOverflow};
use crate::domain::types::{EventTime, TransactionEvent, Window, WindowKey};
use crate::services::watermark::{WatermarkClock, WatermarkPolicy};
use crate::services::window::TumblingWindower;
use rustc_hash::{FxHashMap, FxHasher};
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

/// Lifecycle of one (store, window) slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowState {
    /// Accepts folds and merges
    Open,
    /// Watermark has passed the window end; emission pending
    Closing,
    /// Terminal; accumulator discarded, further input is late
    Emitted,
}

/// Reducer shard owning `store_id`
pub fn shard_for(store_id: &str, shards: usize) -> usize {
    if shards <= 1 {
        return 0;
    }
    let mut hasher = FxHasher::default();
    store_id.hash(&mut hasher);
    (hasher.finish() % shards as u64) as usize
}

/// Worker-local partial aggregates for one batch
#[derive(Debug)]
pub struct PartialStore {
    windower: TumblingWindower,
    partials: FxHashMap<WindowKey, Accumulator>,
}

impl PartialStore {
    pub fn new(windower: TumblingWindower) -> Self {
        Self { windower, partials: FxHashMap::default() }
    }

    /// Fold an event into its window's partial, returning the key it landed in
    pub fn fold(&mut self, event: &TransactionEvent) -> Result<WindowKey, AmountOverflow> {
        let window = self.windower.assign(event.timestamp);
        let key = WindowKey::new(event.store_id.clone(), window);
        self.partials.entry(key.clone()).or_default().fold(event)?;
        Ok(key)
    }

    pub fn len(&self) -> usize {
        self.partials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partials.is_empty()
    }

    pub fn get(&self, key: &WindowKey) -> Option<&Accumulator> {
        self.partials.get(key)
    }

    /// Hand over every partial, grouped by reducer shard
    pub fn drain_by_shard(&mut self, shards: usize) -> Vec<Vec<(WindowKey, Accumulator)>> {
        let shards = shards.max(1);
        let mut out: Vec<Vec<(WindowKey, Accumulator)>> = vec![Vec::new(); shards];
        for (key, acc) in self.partials.drain() {
            let shard = shard_for(&key.store_id, shards);
            out[shard].push((key, acc));
        }
        out
    }
}

/// Result of merging one batch of partials
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MergeReport {
    /// Partials merged into open windows
    pub merged: usize,
    /// Windows opened by this batch
    pub opened: usize,
    /// Partials rejected because their window already closed
    pub late_partials: usize,
    /// Events contained in the rejected partials
    pub late_events: u64,
    /// Partials rejected because the window total would overflow
    pub overflowed_partials: usize,
    /// Events contained in the overflowing partials
    pub overflowed_events: u64,
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    acc: Accumulator,
    state: WindowState,
}

#[derive(Debug)]
struct KeyWindows {
    clock: WatermarkClock,
    /// Highest end of any emitted window; everything ending at or before it is retired
    closed_through: Option<EventTime>,
    slots: BTreeMap<Window, Slot>,
}

impl KeyWindows {
    fn new(policy: WatermarkPolicy) -> Self {
        Self { clock: WatermarkClock::new(policy), closed_through: None, slots: BTreeMap::new() }
    }

    /// A window is late once it has been retired or the watermark passed its end
    fn is_late(&self, window: &Window) -> bool {
        if matches!(self.closed_through, Some(c) if window.end <= c) {
            return true;
        }
        if matches!(self.slots.get(window), Some(slot) if slot.state != WindowState::Open) {
            return true;
        }
        // A slot that is still open merely has not been ticked yet
        !self.slots.contains_key(window)
            && matches!(self.clock.current(), Some(wm) if window.end <= wm)
    }
}

/// Reducer-owned window state for a set of store keys
#[derive(Debug)]
pub struct WindowStore {
    policy: WatermarkPolicy,
    keys: FxHashMap<String, KeyWindows>,
}

impl WindowStore {
    /// Windows arrive already assigned by the workers' `PartialStore`
    pub fn new(policy: WatermarkPolicy) -> Self {
        Self { policy, keys: FxHashMap::default() }
    }

    /// Merge a batch of worker partials.
    ///
    /// Lateness is judged against the watermark as it stood before the
    /// batch; the batch's own event times advance the clocks afterwards.
    pub fn merge_partials<I>(&mut self, partials: I, now_us: i64) -> MergeReport
    where
        I: IntoIterator<Item = (WindowKey, Accumulator)>,
    {
        let mut report = MergeReport::default();
        let mut observed: Vec<(String, EventTime)> = Vec::new();
        let policy = self.policy;

        for (key, partial) in partials {
            if partial.is_empty() {
                continue;
            }
            let key_windows =
                self.keys.entry(key.store_id.clone()).or_insert_with(|| KeyWindows::new(policy));

            if key_windows.is_late(&key.window) {
                report.late_partials += 1;
                report.late_events += partial.event_count;
                continue;
            }

            let slot = key_windows.slots.entry(key.window).or_insert_with(|| {
                report.opened += 1;
                Slot { acc: Accumulator::empty(), state: WindowState::Open }
            });
            if slot.acc.merge(&partial).is_err() {
                report.overflowed_partials += 1;
                report.overflowed_events += partial.event_count;
                continue;
            }
            report.merged += 1;

            if let Some(max) = partial.max_timestamp {
                observed.push((key.store_id, max));
            }
        }

        for (store_id, ts) in observed {
            if let Some(key_windows) = self.keys.get_mut(&store_id) {
                key_windows.clock.observe(ts, now_us);
            }
        }
        report
    }

    /// Move every open window whose end the watermark has reached to Closing.
    ///
    /// Returns how many windows changed state.
    pub fn mark_closing(&mut self, now_us: i64) -> usize {
        let mut marked = 0;
        for key_windows in self.keys.values_mut() {
            let Some(wm) = key_windows.clock.watermark(now_us) else { continue };
            for (window, slot) in key_windows.slots.iter_mut() {
                if window.end > wm {
                    // Slots are ordered by start, so later windows end later too
                    break;
                }
                if slot.state == WindowState::Open {
                    slot.state = WindowState::Closing;
                    marked += 1;
                }
            }
        }
        marked
    }

    /// Remove every Closing window and retire it as Emitted.
    ///
    /// Output is ordered by store key, then window start.
    pub fn take_closing(&mut self) -> Vec<(WindowKey, Accumulator)> {
        let mut out = Vec::new();
        for (store_id, key_windows) in self.keys.iter_mut() {
            let closing: Vec<Window> = key_windows
                .slots
                .iter()
                .filter(|(_, slot)| slot.state == WindowState::Closing)
                .map(|(window, _)| *window)
                .collect();
            for window in closing {
                if let Some(slot) = key_windows.slots.remove(&window) {
                    key_windows.closed_through = Some(match key_windows.closed_through {
                        Some(c) => c.max(window.end),
                        None => window.end,
                    });
                    out.push((WindowKey::new(store_id.clone(), window), slot.acc));
                }
            }
        }
        out.sort_by(|(a, _), (b, _)| {
            a.store_id.cmp(&b.store_id).then(a.window.start.cmp(&b.window.start))
        });
        out
    }

    /// `mark_closing` followed by `take_closing`
    pub fn close_ready(&mut self, now_us: i64) -> Vec<(WindowKey, Accumulator)> {
        self.mark_closing(now_us);
        self.take_closing()
    }

    /// Lifecycle state of a window key, `None` if it was never opened
    pub fn state(&self, key: &WindowKey) -> Option<WindowState> {
        let key_windows = self.keys.get(&key.store_id)?;
        if let Some(slot) = key_windows.slots.get(&key.window) {
            return Some(slot.state);
        }
        match key_windows.closed_through {
            Some(c) if key.window.end <= c => Some(WindowState::Emitted),
            _ => None,
        }
    }

    /// Accumulator of a window that has not been emitted yet
    pub fn get(&self, key: &WindowKey) -> Option<&Accumulator> {
        self.keys.get(&key.store_id)?.slots.get(&key.window).map(|slot| &slot.acc)
    }

    /// Last watermark computed for a store key
    pub fn watermark(&self, store_id: &str) -> Option<EventTime> {
        self.keys.get(store_id)?.clock.current()
    }

    /// Windows not yet emitted
    pub fn open_windows(&self) -> usize {
        self.keys.values().map(|k| k.slots.len()).sum()
    }
}
