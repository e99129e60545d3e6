use crate::data::bar::{Bar, BarError};
use chrono::{DateTime, Utc};
use std::{collections::VecDeque, sync::Arc};

/// Verdict returned by [`BarBuffer::admit`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Admitted {
    /// Bar appended at the tail.
    Appended,
    /// Bar replaced the tail: same timestamp, and the incoming bar is the canonical close
    /// of a period the tail only held a partial for.
    ReplacedTail,
    /// Bar already present (same timestamp); silently dropped.
    Duplicate,
    /// Bar older than the buffer tail; rejected.
    OutOfOrder,
}

/// Ordered, capacity-bounded sequence of [`Bar`]s for one subscription.
///
/// Single writer (the owning feed task); readers receive stable [`Arc`] snapshots and never
/// block the writer for longer than the snapshot copy. Timestamps are strictly increasing -
/// the admission rules below are what maintain that invariant:
/// * strictly newer than the tail → appended, oldest evicted beyond capacity
/// * equal to the tail timestamp → replaces the tail only if the incoming bar is `closed`
///   and the tail was not
/// * older than the tail → rejected
#[derive(Debug, Clone)]
pub struct BarBuffer {
    bars: VecDeque<Bar>,
    capacity: usize,
}

impl BarBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            bars: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Timestamp of the most recent bar, if any.
    pub fn tail_time(&self) -> Option<DateTime<Utc>> {
        self.bars.back().map(|bar| bar.time)
    }

    /// Grow the buffer capacity. Capacity only ever grows; a smaller value is ignored.
    pub fn grow_capacity(&mut self, capacity: usize) {
        if capacity > self.capacity {
            self.capacity = capacity;
        }
    }

    /// Admit a bar under the buffer ordering rules. Invalid bars are rejected before any
    /// ordering check.
    pub fn admit(&mut self, bar: Bar) -> Result<Admitted, BarError> {
        bar.validate()?;

        let Some(tail) = self.bars.back() else {
            self.bars.push_back(bar);
            return Ok(Admitted::Appended);
        };

        if bar.time > tail.time {
            self.bars.push_back(bar);
            while self.bars.len() > self.capacity {
                self.bars.pop_front();
            }
            return Ok(Admitted::Appended);
        }

        if bar.time == tail.time {
            return if bar.closed && !tail.closed {
                *self.bars.back_mut().expect("tail exists") = bar;
                Ok(Admitted::ReplacedTail)
            } else {
                Ok(Admitted::Duplicate)
            };
        }

        Ok(Admitted::OutOfOrder)
    }

    /// Stable snapshot of the buffered bars, oldest first.
    pub fn snapshot(&self) -> Arc<[Bar]> {
        self.bars.iter().cloned().collect()
    }
}
