//! Rolling snapshot buffer
//!
//! Bounded at ~600 snapshots (two minutes at the feed's ~5 Hz). Single
//! writer (the subscriber task), single reader (the analyzer); the reader
//! takes timestamp slices without mutating the ring, so the lock is held
//! only for the copy of `Arc` handles.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

use services_common::DepthSnapshotMsg;

/// Default capacity: 120 s of snapshots at ~5 per second.
pub const DEFAULT_CAPACITY: usize = 600;

pub struct RollingBuffer {
    inner: Mutex<VecDeque<Arc<DepthSnapshotMsg>>>,
    capacity: usize,
}

impl RollingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&self, snapshot: DepthSnapshotMsg) {
        let mut inner = self.inner.lock();
        if inner.len() >= self.capacity {
            inner.pop_front();
        }
        inner.push_back(Arc::new(snapshot));
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn latest(&self) -> Option<Arc<DepthSnapshotMsg>> {
        self.inner.lock().back().cloned()
    }

    /// Snapshots with `time >= cutoff`, oldest first.
    pub fn slice_since(&self, cutoff: DateTime<Utc>) -> Vec<Arc<DepthSnapshotMsg>> {
        self.inner
            .lock()
            .iter()
            .filter(|s| s.time >= cutoff)
            .cloned()
            .collect()
    }

    /// Snapshots with `from <= time < to`, oldest first.
    pub fn slice_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Vec<Arc<DepthSnapshotMsg>> {
        self.inner
            .lock()
            .iter()
            .filter(|s| s.time >= from && s.time < to)
            .cloned()
            .collect()
    }
}

impl Default for RollingBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn snapshot(time: DateTime<Utc>, price: f64) -> DepthSnapshotMsg {
        DepthSnapshotMsg {
            time,
            current_price: price,
            best_bid: price,
            best_ask: price + 2.0,
            spread: 2.0,
            top_bids: Vec::new(),
            top_asks: Vec::new(),
        }
    }

    #[test]
    fn ring_drops_oldest_at_capacity() {
        let buffer = RollingBuffer::new(3);
        let t0 = Utc::now();
        for i in 0..5 {
            buffer.push(snapshot(t0 + Duration::seconds(i), 23450.0 + i as f64));
        }
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.latest().unwrap().current_price, 23454.0);
        let all = buffer.slice_since(t0);
        assert_eq!(all[0].current_price, 23452.0);
    }

    #[test]
    fn slices_are_time_filtered_and_ordered() {
        let buffer = RollingBuffer::new(100);
        let t0 = Utc::now();
        for i in 0..60 {
            buffer.push(snapshot(t0 + Duration::seconds(i), 23450.0));
        }
        let last_30 = buffer.slice_since(t0 + Duration::seconds(30));
        assert_eq!(last_30.len(), 30);
        let window = buffer.slice_between(t0 + Duration::seconds(10), t0 + Duration::seconds(20));
        assert_eq!(window.len(), 10);
        assert!(window.windows(2).all(|w| w[0].time <= w[1].time));
    }
}
