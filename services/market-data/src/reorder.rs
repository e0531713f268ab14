//! Per-stream reordering of bar deliveries
//!
//! Sources may deliver bars late, twice, or out of order. The buffer hands
//! bars to the pipeline strictly in open_time order so indicator windows
//! never see a bar from the future.

use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::types::{Bar, Interval};

/// What happened to a pushed bar
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Buffered,
    /// Same open_time already waiting in the buffer
    Duplicate,
    /// At or before the last released bar; dropped
    Late,
}

pub struct ReorderBuffer {
    step: Duration,
    capacity: usize,
    watermark: Option<DateTime<Utc>>,
    pending: BTreeMap<DateTime<Utc>, Bar>,
}

impl ReorderBuffer {
    pub fn new(interval: Interval, capacity: usize) -> Self {
        Self {
            step: interval.duration(),
            capacity: capacity.max(1),
            watermark: None,
            pending: BTreeMap::new(),
        }
    }

    /// Continue after an already-processed bar, e.g. the latest stored one
    pub fn resume_from(mut self, watermark: Option<DateTime<Utc>>) -> Self {
        self.watermark = watermark;
        self
    }

    /// Open time of the last released bar
    pub fn watermark(&self) -> Option<DateTime<Utc>> {
        self.watermark
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn push(&mut self, bar: Bar) -> Admission {
        if let Some(watermark) = self.watermark {
            if bar.open_time <= watermark {
                debug!(
                    "Dropping late bar {} at {} (released through {})",
                    bar.label(),
                    bar.open_time,
                    watermark
                );
                return Admission::Late;
            }
        }
        if self.pending.contains_key(&bar.open_time) {
            return Admission::Duplicate;
        }
        self.pending.insert(bar.open_time, bar);
        Admission::Buffered
    }

    /// Release bars that directly follow the watermark. When the buffer
    /// exceeds capacity the earliest bar is released across the gap.
    pub fn drain_ready(&mut self) -> Vec<Bar> {
        let mut ready = Vec::new();
        while let Some((&open_time, _)) = self.pending.first_key_value() {
            let contiguous = match self.watermark {
                None => true,
                Some(watermark) => open_time == watermark + self.step,
            };
            if !contiguous && self.pending.len() <= self.capacity {
                break;
            }
            if let Some(bar) = self.release_first() {
                ready.push(bar);
            }
        }
        ready
    }

    /// Release every buffered bar opening before `cutoff`. Used once the
    /// source has delivered a complete range, so remaining gaps are real.
    pub fn flush_through(&mut self, cutoff: DateTime<Utc>) -> Vec<Bar> {
        let mut ready = Vec::new();
        while let Some((&open_time, _)) = self.pending.first_key_value() {
            if open_time >= cutoff {
                break;
            }
            if let Some(bar) = self.release_first() {
                ready.push(bar);
            }
        }
        ready.extend(self.drain_ready());
        ready
    }

    fn release_first(&mut self) -> Option<Bar> {
        let (open_time, bar) = self.pending.pop_first()?;
        if let Some(watermark) = self.watermark {
            let expected = watermark + self.step;
            if open_time != expected {
                warn!(
                    "Gap in {}: expected bar at {}, next is {}",
                    bar.label(),
                    expected,
                    open_time
                );
            }
        }
        self.watermark = Some(open_time);
        Some(bar)
    }
}
