use chrono::{DateTime, Duration, Utc};
use oxalarm_common::types::MetricSample;
use std::collections::VecDeque;

/// What [`SampleWindow::push`] did with a sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Newer than everything retained; the window head moved.
    Advanced,
    /// Late but still inside the window; inserted in timestamp order.
    Backfilled,
    /// A sample with the same timestamp is already retained.
    Duplicate,
    /// Older than the oldest retained sample (or past retention); dropped.
    Stale,
}

/// `secs` as a chrono duration, or `None` when it does not fit.
pub(crate) fn seconds(secs: u64) -> Option<Duration> {
    i64::try_from(secs).ok().and_then(Duration::try_seconds)
}

/// Bounded, timestamp-ordered buffer of the most recent samples of one series.
pub struct SampleWindow {
    capacity: usize,
    /// `None`: retention too large to represent, only the count bound applies.
    retention: Option<Duration>,
    data: VecDeque<MetricSample>,
}

impl SampleWindow {
    pub fn new(capacity: usize, retention_secs: u64) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            retention: seconds(retention_secs),
            data: VecDeque::with_capacity(capacity.min(1024)),
        }
    }

    /// Oldest timestamp still inside retention relative to `newest`.
    fn cutoff(&self, newest: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.retention
            .and_then(|retention| newest.checked_sub_signed(retention))
    }

    /// Insert a sample, keeping timestamp order. Never fails: late or repeated
    /// data is reported through the returned [`PushOutcome`] and dropped.
    pub fn push(&mut self, sample: MetricSample) -> PushOutcome {
        if let Some(cutoff) = self.newest_timestamp().and_then(|n| self.cutoff(n)) {
            if sample.timestamp < cutoff {
                return PushOutcome::Stale;
            }
        }
        if let Some(oldest) = self.data.front() {
            if sample.timestamp < oldest.timestamp {
                return PushOutcome::Stale;
            }
        }

        let outcome = match self.data.back() {
            Some(back) if sample.timestamp <= back.timestamp => {
                match self
                    .data
                    .binary_search_by(|held| held.timestamp.cmp(&sample.timestamp))
                {
                    Ok(_) => return PushOutcome::Duplicate,
                    Err(pos) => {
                        self.data.insert(pos, sample);
                        PushOutcome::Backfilled
                    }
                }
            }
            _ => {
                self.data.push_back(sample);
                PushOutcome::Advanced
            }
        };

        self.evict();
        outcome
    }

    fn evict(&mut self) {
        while self.data.len() > self.capacity {
            self.data.pop_front();
        }
        let Some(cutoff) = self.newest_timestamp().and_then(|n| self.cutoff(n)) else {
            return;
        };
        while let Some(front) = self.data.front() {
            if front.timestamp < cutoff {
                self.data.pop_front();
            } else {
                break;
            }
        }
    }

    /// The most recent `count` values, oldest first. A cold window returns
    /// fewer than requested; callers treat that as insufficient data.
    pub fn snapshot(&self, count: usize) -> Vec<f64> {
        let skip = self.data.len().saturating_sub(count);
        self.data.iter().skip(skip).map(|s| s.value).collect()
    }

    /// Change the retention count, evicting the oldest samples if it shrank.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        self.evict();
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn latest(&self) -> Option<&MetricSample> {
        self.data.back()
    }

    pub fn newest_timestamp(&self) -> Option<DateTime<Utc>> {
        self.data.back().map(|s| s.timestamp)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64, value: f64) -> MetricSample {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(secs);
        MetricSample::new("web-01", "cpu.usage", value, ts)
    }

    #[test]
    fn keeps_only_the_newest_capacity_samples() {
        let mut window = SampleWindow::new(3, 3600);
        for i in 0..5 {
            assert_eq!(window.push(at(i * 10, i as f64)), PushOutcome::Advanced);
        }
        assert_eq!(window.len(), 3);
        assert_eq!(window.snapshot(10), vec![2.0, 3.0, 4.0]);
        assert_eq!(window.snapshot(2), vec![3.0, 4.0]);
    }

    #[test]
    fn cold_window_returns_what_it_has() {
        let mut window = SampleWindow::new(5, 3600);
        window.push(at(0, 1.0));
        assert_eq!(window.snapshot(3), vec![1.0]);
    }

    #[test]
    fn late_sample_inside_window_is_backfilled_in_order() {
        let mut window = SampleWindow::new(5, 3600);
        window.push(at(0, 1.0));
        window.push(at(20, 3.0));
        assert_eq!(window.push(at(10, 2.0)), PushOutcome::Backfilled);
        assert_eq!(window.snapshot(5), vec![1.0, 2.0, 3.0]);
        assert_eq!(window.latest().map(|s| s.value), Some(3.0));
    }

    #[test]
    fn sample_older_than_window_minimum_is_dropped() {
        let mut window = SampleWindow::new(2, 3600);
        window.push(at(10, 1.0));
        window.push(at(20, 2.0));
        assert_eq!(window.push(at(5, 9.0)), PushOutcome::Stale);
        assert_eq!(window.snapshot(2), vec![1.0, 2.0]);
    }

    #[test]
    fn duplicate_timestamp_is_rejected() {
        let mut window = SampleWindow::new(4, 3600);
        window.push(at(10, 1.0));
        assert_eq!(window.push(at(10, 1.0)), PushOutcome::Duplicate);
        assert_eq!(window.len(), 1);
    }

    #[test]
    fn samples_past_retention_are_evicted() {
        let mut window = SampleWindow::new(10, 60);
        window.push(at(0, 1.0));
        window.push(at(30, 2.0));
        window.push(at(90, 3.0));
        assert_eq!(window.snapshot(10), vec![2.0, 3.0]);
        assert_eq!(window.push(at(20, 0.5)), PushOutcome::Stale);
    }

    #[test]
    fn huge_retention_keeps_count_bound_only() {
        let mut window = SampleWindow::new(2, u64::MAX);
        window.push(at(0, 1.0));
        window.push(at(10, 2.0));
        assert_eq!(window.push(at(20, 3.0)), PushOutcome::Advanced);
        assert_eq!(window.snapshot(5), vec![2.0, 3.0]);
        assert_eq!(window.push(at(5, 0.0)), PushOutcome::Stale);
    }

    #[test]
    fn shrinking_capacity_evicts_oldest() {
        let mut window = SampleWindow::new(4, 3600);
        for i in 0..4 {
            window.push(at(i, i as f64));
        }
        window.set_capacity(2);
        assert_eq!(window.snapshot(4), vec![2.0, 3.0]);
    }
}
