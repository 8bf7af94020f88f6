use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for everything the engine drops, swallows or emits.
///
/// Shared by all shards; every failure the core converts into a log line is
/// also counted here so it stays visible without scraping logs.
#[derive(Debug, Default)]
pub struct EngineStats {
    accepted: AtomicU64,
    rejected: AtomicU64,
    stale: AtomicU64,
    duplicate: AtomicU64,
    backfilled: AtomicU64,
    overflow_dropped: AtomicU64,
    overflow_cross_series: AtomicU64,
    unconfigured: AtomicU64,
    evaluation_errors: AtomicU64,
    cas_retries: AtomicU64,
    emitted: AtomicU64,
    suppressed: AtomicU64,
    torn_down: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub accepted: u64,
    pub rejected: u64,
    pub stale: u64,
    pub duplicate: u64,
    pub backfilled: u64,
    pub overflow_dropped: u64,
    /// Overflow drops that evicted another series' sample; included in
    /// `overflow_dropped`.
    pub overflow_cross_series: u64,
    pub unconfigured: u64,
    pub evaluation_errors: u64,
    pub cas_retries: u64,
    pub emitted: u64,
    pub suppressed: u64,
    pub torn_down: u64,
}

macro_rules! counter {
    ($record:ident, $field:ident) => {
        pub fn $record(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }
    };
}

impl EngineStats {
    counter!(record_accepted, accepted);
    counter!(record_rejected, rejected);
    counter!(record_stale, stale);
    counter!(record_duplicate, duplicate);
    counter!(record_backfilled, backfilled);
    counter!(record_overflow_drop, overflow_dropped);
    counter!(record_overflow_cross_series, overflow_cross_series);
    counter!(record_unconfigured, unconfigured);
    counter!(record_evaluation_error, evaluation_errors);
    counter!(record_cas_retry, cas_retries);
    counter!(record_emitted, emitted);
    counter!(record_suppressed, suppressed);

    pub fn record_torn_down(&self, count: usize) {
        self.torn_down.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            accepted: load(&self.accepted),
            rejected: load(&self.rejected),
            stale: load(&self.stale),
            duplicate: load(&self.duplicate),
            backfilled: load(&self.backfilled),
            overflow_dropped: load(&self.overflow_dropped),
            overflow_cross_series: load(&self.overflow_cross_series),
            unconfigured: load(&self.unconfigured),
            evaluation_errors: load(&self.evaluation_errors),
            cas_retries: load(&self.cas_retries),
            emitted: load(&self.emitted),
            suppressed: load(&self.suppressed),
            torn_down: load(&self.torn_down),
        }
    }
}
