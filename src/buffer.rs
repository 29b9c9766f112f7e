//! Sliding-window sample store shared between the reader thread and readers
//! such as a plot.
//!
//! Retention policy: fixed capacity, append-only, oldest pair evicted once the
//! capacity is exceeded. Only recent history matters for display and scoring;
//! this is not a durable log.

use crate::sample::Sample;
use parking_lot::Mutex;
use std::collections::VecDeque;

pub const DEFAULT_CAPACITY: usize = 1000;

#[derive(Debug, Default)]
struct Inner {
    timestamps: VecDeque<f64>,
    values: VecDeque<i64>,
}

#[derive(Debug)]
pub struct SampleBuffer {
    inner: Mutex<Inner>,
    capacity: usize,
}

impl SampleBuffer {
    /// A capacity of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(Inner {
                timestamps: VecDeque::with_capacity(capacity),
                values: VecDeque::with_capacity(capacity),
            }),
            capacity,
        }
    }

    /// Appends a sample, evicting the oldest one when full. Returns true if a
    /// sample was evicted.
    pub fn push(&self, sample: Sample) -> bool {
        let mut inner = self.inner.lock();
        let evicted = if inner.timestamps.len() >= self.capacity {
            inner.timestamps.pop_front();
            inner.values.pop_front();
            true
        } else {
            false
        };
        inner.timestamps.push_back(sample.timestamp);
        inner.values.push_back(sample.value);
        evicted
    }

    /// Snapshot of recent samples as parallel `(timestamps, values)` vectors.
    ///
    /// With `time_range_secs`, keeps samples whose timestamp is at least
    /// `latest - time_range_secs`; the result is then trimmed to the most
    /// recent `max_points`. A `max_points` of zero means no limit.
    pub fn get_recent(
        &self,
        max_points: Option<usize>,
        time_range_secs: Option<f64>,
    ) -> (Vec<f64>, Vec<i64>) {
        let inner = self.inner.lock();
        let Some(&latest) = inner.timestamps.back() else {
            return (Vec::new(), Vec::new());
        };

        // Timestamps are appended in order, so the window is a suffix.
        let mut start = match time_range_secs {
            Some(range) => {
                let cutoff = latest - range;
                inner
                    .timestamps
                    .iter()
                    .position(|&t| t >= cutoff)
                    .unwrap_or(inner.timestamps.len())
            }
            None => 0,
        };

        if let Some(max) = max_points.filter(|&m| m > 0) {
            let len = inner.timestamps.len() - start;
            if len > max {
                start += len - max;
            }
        }

        let timestamps = inner.timestamps.range(start..).copied().collect();
        let values = inner.values.range(start..).copied().collect();
        (timestamps, values)
    }

    pub fn latest(&self) -> Option<Sample> {
        let inner = self.inner.lock();
        match (inner.timestamps.back(), inner.values.back()) {
            (Some(&t), Some(&v)) => Some(Sample::new(t, v)),
            _ => None,
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.timestamps.clear();
        inner.values.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for SampleBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn filled(n: usize, capacity: usize) -> SampleBuffer {
        let buf = SampleBuffer::new(capacity);
        for i in 0..n {
            buf.push(Sample::new(i as f64 * 0.1, i as i64));
        }
        buf
    }

    #[test]
    fn empty_buffer_returns_empty_pair() {
        let buf = SampleBuffer::default();
        let (t, v) = buf.get_recent(Some(10), Some(1.0));
        assert!(t.is_empty());
        assert!(v.is_empty());
        assert_eq!(buf.latest(), None);
    }

    #[test]
    fn evicts_oldest_when_full() {
        let buf = SampleBuffer::new(3);
        assert!(!buf.push(Sample::new(0.0, 10)));
        assert!(!buf.push(Sample::new(0.1, 11)));
        assert!(!buf.push(Sample::new(0.2, 12)));
        assert!(buf.push(Sample::new(0.3, 13)));

        let (t, v) = buf.get_recent(None, None);
        assert_eq!(t, vec![0.1, 0.2, 0.3]);
        assert_eq!(v, vec![11, 12, 13]);
        assert_eq!(buf.len(), 3);
    }

    #[test]
    fn time_range_keeps_recent_suffix() {
        let buf = filled(50, 100);
        let (t, v) = buf.get_recent(None, Some(1.0));
        let latest = *t.last().unwrap();
        assert!(t.iter().all(|&ts| ts >= latest - 1.0));
        assert_eq!(t.len(), v.len());
        assert_eq!(v.last(), Some(&49));
    }

    #[test]
    fn max_points_trims_after_time_range() {
        let buf = filled(50, 100);
        let (t, v) = buf.get_recent(Some(4), Some(2.0));
        assert_eq!(t.len(), 4);
        assert_eq!(v, vec![46, 47, 48, 49]);

        let (all_t, _) = buf.get_recent(Some(0), None);
        assert_eq!(all_t.len(), 50);
    }

    #[test]
    fn clear_empties_both_sequences() {
        let buf = filled(5, 10);
        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.get_recent(None, None), (vec![], vec![]));
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let buf = SampleBuffer::new(0);
        assert_eq!(buf.capacity(), 1);
        buf.push(Sample::new(0.0, 1));
        buf.push(Sample::new(0.1, 2));
        assert_eq!(buf.latest(), Some(Sample::new(0.1, 2)));
    }

    #[test]
    fn concurrent_reads_never_see_torn_pairs() {
        let buf = Arc::new(SampleBuffer::new(64));
        let writer = {
            let buf = Arc::clone(&buf);
            thread::spawn(move || {
                for i in 0..5_000 {
                    buf.push(Sample::new(i as f64 * 0.01, i));
                    if i % 1_000 == 0 {
                        buf.clear();
                    }
                }
            })
        };

        for _ in 0..2_000 {
            let (t, v) = buf.get_recent(Some(32), Some(0.2));
            assert_eq!(t.len(), v.len());
            if let Some(&latest) = t.last() {
                assert!(t.iter().all(|&ts| ts >= latest - 0.2));
            }
        }
        writer.join().unwrap();
    }
}
