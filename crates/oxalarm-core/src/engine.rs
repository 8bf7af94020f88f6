use crate::dfa::{AlarmDfa, Trigger};
use crate::dispatch::AlarmSink;
use crate::error::{AlarmError, Result};
use crate::evaluator::{self, Evaluation, Verdict};
use crate::rules::{RuleBook, RuleSet};
use crate::state::{AlarmState, StateStore};
use crate::stats::EngineStats;
use crate::strategy::Strategy;
use crate::window::{self, PushOutcome, SampleWindow};
use chrono::{DateTime, Utc};
use oxalarm_common::types::{AlarmEvent, AlarmKey, MetricSample, SeriesKey};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Samples kept per series even when no strategy needs that many.
    pub min_window: usize,
    /// Samples older than the newest one by more than this are evicted.
    pub window_retention_secs: u64,
    /// A series is quiet once `step_secs * no_data_factor` passes without a sample.
    pub no_data_factor: u32,
    pub cas_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            min_window: 10,
            window_retention_secs: 3600,
            no_data_factor: 3,
            cas_retries: 3,
        }
    }
}

/// Largest accepted reporting interval: one day.
pub const MAX_STEP_SECS: u64 = 86_400;

/// Reject samples the engine cannot reason about.
pub fn validate_sample(sample: &MetricSample) -> Result<()> {
    if sample.entity.trim().is_empty() {
        return Err(AlarmError::InvalidSample("entity is empty".into()));
    }
    if sample.metric.trim().is_empty() {
        return Err(AlarmError::InvalidSample("metric is empty".into()));
    }
    if !sample.value.is_finite() {
        return Err(AlarmError::InvalidSample(format!(
            "{}/{} value {} is not finite",
            sample.entity, sample.metric, sample.value
        )));
    }
    if sample.step_secs == 0 || sample.step_secs > MAX_STEP_SECS {
        return Err(AlarmError::InvalidSample(format!(
            "{}/{} step_secs {} outside 1..={MAX_STEP_SECS}",
            sample.entity, sample.metric, sample.step_secs
        )));
    }
    Ok(())
}

struct Series {
    window: SampleWindow,
    step_secs: u64,
    /// Most samples the window has held at once.
    peak_len: usize,
}

/// Evaluation pipeline for one partition of series.
///
/// Owns the sample windows of its series and is the only writer of the
/// alarm states of their keys. [`crate::router::AlarmRouter`] runs one per
/// shard; it can also be driven directly for deterministic replay.
pub struct AlarmEngine {
    config: EngineConfig,
    rules: Arc<RuleBook>,
    store: Arc<StateStore>,
    sink: Arc<dyn AlarmSink>,
    stats: Arc<EngineStats>,
    series: HashMap<SeriesKey, Series>,
    owned: HashSet<AlarmKey>,
    generation: u64,
}

impl AlarmEngine {
    pub fn new(
        config: EngineConfig,
        rules: Arc<RuleBook>,
        store: Arc<StateStore>,
        sink: Arc<dyn AlarmSink>,
        stats: Arc<EngineStats>,
    ) -> Self {
        Self {
            config,
            rules,
            store,
            sink,
            stats,
            series: HashMap::new(),
            owned: HashSet::new(),
            generation: 0,
        }
    }

    /// Push `sample` into its window and run every attached strategy.
    ///
    /// Returns the events handed to the sink. Errors never escape: bad
    /// samples and failed evaluations are logged, counted and skipped, and
    /// the affected key keeps its previous state.
    pub fn ingest(&mut self, sample: MetricSample) -> Vec<AlarmEvent> {
        if let Err(e) = validate_sample(&sample) {
            self.stats.record_rejected();
            tracing::warn!(error = %e, "Sample dropped");
            return Vec::new();
        }

        let rules = self.sync_rules();
        let series_key = sample.series();
        let strategies = rules.strategies_for(&sample.entity, &sample.metric);
        let capacity = window_capacity(&strategies, self.config.min_window);
        let retention = self.config.window_retention_secs;

        let series = self
            .series
            .entry(series_key.clone())
            .or_insert_with(|| Series {
                window: SampleWindow::new(capacity, retention),
                step_secs: sample.step_secs,
                peak_len: 0,
            });
        if series.window.capacity() != capacity {
            series.window.set_capacity(capacity);
        }
        series.step_secs = sample.step_secs;

        let now = sample.timestamp;
        let labels = sample.labels.clone();
        match series.window.push(sample) {
            PushOutcome::Advanced => {
                self.stats.record_accepted();
                series.peak_len = series.peak_len.max(series.window.len());
            }
            PushOutcome::Backfilled => {
                // improves later aggregations; the head did not move, so no verdict
                self.stats.record_backfilled();
                return Vec::new();
            }
            PushOutcome::Duplicate => {
                self.stats.record_duplicate();
                tracing::debug!(series = %series_key, %now, "Duplicate sample ignored");
                return Vec::new();
            }
            PushOutcome::Stale => {
                self.stats.record_stale();
                tracing::debug!(series = %series_key, %now, "Stale sample dropped");
                return Vec::new();
            }
        }

        if strategies.is_empty() {
            self.stats.record_unconfigured();
            tracing::debug!(series = %series_key, "No strategy attached, sample buffered only");
            return Vec::new();
        }

        let dfa = AlarmDfa::new(
            &self.store,
            self.sink.as_ref(),
            &self.stats,
            self.config.cas_retries,
        );
        let trigger = Trigger {
            now,
            labels: &labels,
        };

        let mut events = Vec::new();
        for strategy in &strategies {
            let key = series_key.with_strategy(&strategy.id);
            self.owned.insert(key.clone());
            let applied = evaluator::evaluate(&key, &series.window, strategy)
                .map(|eval| {
                    // a window that was once full and came up short lost data
                    if eval.verdict == Verdict::NoData
                        && series.peak_len >= strategy.required_samples()
                    {
                        Evaluation::silence()
                    } else {
                        eval
                    }
                })
                .and_then(|eval| dfa.process(&key, strategy, eval, &trigger));
            match applied {
                Ok(applied) => events.extend(applied.emitted),
                Err(e) => {
                    self.stats.record_evaluation_error();
                    tracing::warn!(%key, error = %e, "Evaluation failed, state left unchanged");
                }
            }
        }
        events
    }

    /// Feed NO_DATA to every strategy of every series that has gone quiet
    /// (no sample for `step_secs * no_data_factor`). Series with nothing
    /// attached and nothing retained past the retention horizon are dropped.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> Vec<AlarmEvent> {
        let rules = self.sync_rules();
        let retention = window::seconds(self.config.window_retention_secs);
        let factor = u64::from(self.config.no_data_factor.max(1));

        self.series.retain(|key, series| {
            let attached = !rules.strategies_for(&key.entity, &key.metric).is_empty();
            attached
                || series.window.newest_timestamp().is_some_and(|newest| {
                    retention.map_or(true, |retention| now - newest <= retention)
                })
        });

        let dfa = AlarmDfa::new(
            &self.store,
            self.sink.as_ref(),
            &self.stats,
            self.config.cas_retries,
        );

        let mut events = Vec::new();
        for (series_key, series) in &self.series {
            let Some(newest) = series.window.newest_timestamp() else {
                continue;
            };
            let Some(quiet_after) = series
                .step_secs
                .checked_mul(factor)
                .and_then(window::seconds)
            else {
                continue;
            };
            if now - newest < quiet_after {
                continue;
            }

            let labels = series
                .window
                .latest()
                .map(|s| s.labels.clone())
                .unwrap_or_default();
            let trigger = Trigger {
                now,
                labels: &labels,
            };
            for strategy in rules.strategies_for(&series_key.entity, &series_key.metric) {
                let key = series_key.with_strategy(&strategy.id);
                self.owned.insert(key.clone());
                match dfa.process(&key, &strategy, Evaluation::silence(), &trigger) {
                    Ok(applied) => events.extend(applied.emitted),
                    Err(e) => {
                        self.stats.record_evaluation_error();
                        tracing::warn!(%key, error = %e, "NO_DATA evaluation failed");
                    }
                }
            }
        }
        events
    }

    /// Set (or clear, with `None`) the mute deadline of `key`.
    pub fn mute(&mut self, key: &AlarmKey, until: Option<DateTime<Utc>>) -> Result<AlarmState> {
        self.sync_rules();
        self.owned.insert(key.clone());
        let dfa = AlarmDfa::new(
            &self.store,
            self.sink.as_ref(),
            &self.stats,
            self.config.cas_retries,
        );
        dfa.mute_from(key, self.store.get_or_create(key), until)
    }

    /// Pick up a new rule generation if one was installed, tearing down
    /// state of keys that are no longer configured.
    fn sync_rules(&mut self) -> Arc<RuleSet> {
        let rules = self.rules.current();
        if rules.generation() != self.generation {
            self.reconcile(&rules);
            self.generation = rules.generation();
        }
        rules
    }

    /// Drop alarm state for owned keys `rules` no longer configures and
    /// resize windows to what the remaining strategies need.
    pub fn reconcile(&mut self, rules: &RuleSet) {
        let store = &self.store;
        let before = self.owned.len();
        self.owned.retain(|key| {
            let keep = rules.is_configured(key);
            if !keep {
                store.remove(key);
                tracing::info!(%key, "Strategy unconfigured, alarm state removed");
            }
            keep
        });
        let removed = before - self.owned.len();
        self.stats.record_torn_down(removed);

        for (key, series) in self.series.iter_mut() {
            let strategies = rules.strategies_for(&key.entity, &key.metric);
            series
                .window
                .set_capacity(window_capacity(&strategies, self.config.min_window));
        }

        tracing::debug!(
            generation = rules.generation(),
            removed,
            series = self.series.len(),
            "Shard reconciled with rule set"
        );
    }

    pub fn series_count(&self) -> usize {
        self.series.len()
    }
}

fn window_capacity(strategies: &[Arc<Strategy>], min_window: usize) -> usize {
    strategies
        .iter()
        .map(|s| s.required_samples())
        .max()
        .unwrap_or(0)
        .max(min_window)
}
