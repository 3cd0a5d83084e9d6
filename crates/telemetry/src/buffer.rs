use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// A value stamped with the time it was committed to a buffer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimestampedValue<T> {
    timestamp: DateTime<Utc>,
    value: T,
}

impl<T> TimestampedValue<T> {
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn into_value(self) -> T {
        self.value
    }
}

/// Fixed-capacity window of the most recent values of one channel.
///
/// Backed by a `VecDeque`. When a push exceeds the capacity, the oldest
/// entries are evicted. Iteration order is oldest → newest and timestamps
/// never decrease: a wall clock that steps backwards reuses the newest
/// timestamp instead.
#[derive(Debug, Clone)]
pub struct WindowedBuffer<T> {
    buf: VecDeque<TimestampedValue<T>>,
    capacity: usize,
}

impl<T> WindowedBuffer<T> {
    /// Create an empty buffer with the given maximum capacity.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "WindowedBuffer capacity must be > 0");
        Self {
            buf: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Like [`new`](Self::new), returning `None` for a zero capacity.
    pub fn try_new(capacity: usize) -> Option<Self> {
        (capacity > 0).then(|| Self::new(capacity))
    }

    /// Append `value` stamped with the current time, evicting the oldest
    /// entries beyond capacity.
    pub fn push(&mut self, value: T) {
        let now = Utc::now();
        let timestamp = match self.buf.back() {
            Some(last) if last.timestamp > now => last.timestamp,
            _ => now,
        };
        self.buf.push_back(TimestampedValue { timestamp, value });
        while self.buf.len() > self.capacity {
            self.buf.pop_front();
        }
    }

    /// The most recently pushed entry, if any.
    pub fn latest(&self) -> Option<&TimestampedValue<T>> {
        self.buf.back()
    }

    /// Iterate from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &TimestampedValue<T>> {
        self.buf.iter()
    }

    /// Number of entries currently stored.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.buf.len() == self.capacity
    }

    /// Remove all entries.
    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

impl<T: Clone> WindowedBuffer<T> {
    /// Copy of the current window, oldest first. Later pushes do not affect it.
    pub fn snapshot(&self) -> Vec<TimestampedValue<T>> {
        self.buf.iter().cloned().collect()
    }

    /// Copy of the current values without timestamps, oldest first.
    pub fn values(&self) -> Vec<T> {
        self.buf.iter().map(|p| p.value.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_under_capacity() {
        let mut wb = WindowedBuffer::new(5);
        wb.push(1);
        wb.push(2);
        wb.push(3);

        assert_eq!(wb.len(), 3);
        assert!(!wb.is_full());
        assert_eq!(wb.values(), vec![1, 2, 3]);
    }

    #[test]
    fn one_past_capacity_drops_single_oldest() {
        let mut wb = WindowedBuffer::new(4);
        for i in 1..=4 {
            wb.push(i);
        }
        assert_eq!(wb.values(), vec![1, 2, 3, 4]);

        wb.push(5);

        assert_eq!(wb.len(), 4);
        assert_eq!(wb.values(), vec![2, 3, 4, 5]);
    }

    #[test]
    fn never_exceeds_capacity_and_tail_is_last_push() {
        for capacity in [1, 2, 3, 7, 100] {
            let mut wb = WindowedBuffer::new(capacity);
            for i in 0..250 {
                wb.push(i);
                let snap = wb.snapshot();
                assert!(snap.len() <= capacity);
                assert_eq!(snap.last().map(|p| *p.value()), Some(i));
            }
        }
    }

    #[test]
    fn capacity_one_keeps_only_newest() {
        let mut wb = WindowedBuffer::new(1);
        wb.push("a");
        wb.push("b");

        assert_eq!(wb.len(), 1);
        assert_eq!(wb.latest().map(|p| *p.value()), Some("b"));
    }

    #[test]
    fn empty_buffer() {
        let wb: WindowedBuffer<f64> = WindowedBuffer::new(10);

        assert!(wb.is_empty());
        assert_eq!(wb.len(), 0);
        assert!(wb.latest().is_none());
        assert!(wb.snapshot().is_empty());
    }

    #[test]
    fn snapshot_is_detached() {
        let mut wb = WindowedBuffer::new(2);
        wb.push(1);
        wb.push(2);
        let snap = wb.snapshot();

        wb.push(3);
        wb.clear();

        let values: Vec<i32> = snap.into_iter().map(TimestampedValue::into_value).collect();
        assert_eq!(values, vec![1, 2]);
    }

    #[test]
    fn timestamps_never_decrease() {
        let mut wb = WindowedBuffer::new(50);
        for i in 0..50 {
            wb.push(i);
        }
        let snap = wb.snapshot();
        assert!(snap.windows(2).all(|w| w[0].timestamp() <= w[1].timestamp()));
    }

    #[test]
    fn clear_resets() {
        let mut wb = WindowedBuffer::new(3);
        wb.push(1);
        wb.push(2);

        wb.clear();

        assert!(wb.is_empty());
        assert_eq!(wb.capacity(), 3);
    }

    #[test]
    fn is_full_transitions() {
        let mut wb = WindowedBuffer::new(2);
        assert!(!wb.is_full());

        wb.push(1);
        assert!(!wb.is_full());

        wb.push(2);
        assert!(wb.is_full());

        wb.push(3);
        assert!(wb.is_full());
    }

    #[test]
    fn try_new_rejects_zero() {
        assert!(WindowedBuffer::<i32>::try_new(0).is_none());
        assert_eq!(WindowedBuffer::<i32>::try_new(3).unwrap().capacity(), 3);
    }

    #[test]
    #[should_panic(expected = "capacity must be > 0")]
    fn zero_capacity_panics() {
        let _ = WindowedBuffer::<i32>::new(0);
    }

    #[test]
    fn timestamped_value_serializes() {
        let mut wb = WindowedBuffer::new(1);
        wb.push(1.5);
        let json = serde_json::to_value(wb.latest().unwrap()).unwrap();
        assert_eq!(json["value"], 1.5);
        assert!(json["timestamp"].is_string());
    }
}
