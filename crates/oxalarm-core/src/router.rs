//! Key-partitioned worker pool.
//!
//! Every series hashes to exactly one shard. A shard is a tokio task that
//! owns an [`AlarmEngine`] and drains a bounded queue, so all samples of one
//! series are evaluated in submission order by a single writer while
//! unrelated series proceed in parallel on other shards.

use crate::dispatch::AlarmSink;
use crate::engine::{validate_sample, AlarmEngine, EngineConfig};
use crate::error::{AlarmError, Result};
use crate::rules::RuleBook;
use crate::state::{AlarmState, StateStore};
use crate::stats::{EngineStats, StatsSnapshot};
use chrono::{DateTime, Utc};
use oxalarm_common::types::{AlarmKey, MetricSample, SeriesKey};
use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub shards: usize,
    /// Per-shard queue bound before the overflow policy kicks in.
    pub queue_capacity: usize,
    pub engine: EngineConfig,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            shards: 4,
            queue_capacity: 1024,
            engine: EngineConfig::default(),
        }
    }
}

enum Command {
    Sample(MetricSample),
    Sweep(DateTime<Utc>),
    Mute {
        key: AlarmKey,
        until: Option<DateTime<Utc>>,
        reply: oneshot::Sender<Result<AlarmState>>,
    },
    Flush(oneshot::Sender<()>),
}

/// Bounded single-consumer queue.
///
/// When full, a new sample evicts the oldest queued sample of the same
/// series. If the queue holds nothing of that series, the oldest queued
/// sample overall goes instead, so a burst from one series can cost another
/// series a sample; those drops are also counted as
/// `overflow_cross_series`. Control commands are never evicted and never
/// refused.
struct ShardQueue {
    items: Mutex<VecDeque<Command>>,
    notify: Notify,
    capacity: usize,
    closed: AtomicBool,
}

impl ShardQueue {
    fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity: capacity.max(1),
            closed: AtomicBool::new(false),
        }
    }

    fn push(&self, command: Command, stats: &EngineStats) {
        {
            let mut items = self.items.lock().unwrap_or_else(|e| e.into_inner());
            if items.len() >= self.capacity {
                if let Command::Sample(incoming) = &command {
                    let same_series = items.iter().position(|c| {
                        matches!(c, Command::Sample(s) if s.entity == incoming.entity && s.metric == incoming.metric)
                    });
                    let cross_series = same_series.is_none();
                    let victim =
                        same_series.or_else(|| items.iter().position(|c| matches!(c, Command::Sample(_))));
                    if let Some(Command::Sample(dropped)) = victim.and_then(|i| items.remove(i)) {
                        stats.record_overflow_drop();
                        if cross_series {
                            stats.record_overflow_cross_series();
                        }
                        tracing::warn!(
                            entity = %dropped.entity,
                            metric = %dropped.metric,
                            timestamp = %dropped.timestamp,
                            cross_series,
                            "Shard queue full, oldest sample dropped"
                        );
                    }
                }
            }
            items.push_back(command);
        }
        self.notify.notify_one();
    }

    async fn pop(&self) -> Option<Command> {
        loop {
            let next = self
                .items
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .pop_front();
            if let Some(command) = next {
                return Some(command);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            self.notify.notified().await;
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }
}

pub struct AlarmRouter {
    shards: Vec<Arc<ShardQueue>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    rules: Arc<RuleBook>,
    store: Arc<StateStore>,
    stats: Arc<EngineStats>,
    closed: AtomicBool,
}

impl AlarmRouter {
    /// Spawn `config.shards` workers on the current tokio runtime.
    pub fn start(config: RouterConfig, rules: Arc<RuleBook>, sink: Arc<dyn AlarmSink>) -> Self {
        let store = Arc::new(StateStore::new());
        let stats = Arc::new(EngineStats::default());
        let shard_count = config.shards.max(1);

        let mut shards = Vec::with_capacity(shard_count);
        let mut workers = Vec::with_capacity(shard_count);
        for index in 0..shard_count {
            let queue = Arc::new(ShardQueue::new(config.queue_capacity));
            let engine = AlarmEngine::new(
                config.engine.clone(),
                rules.clone(),
                store.clone(),
                sink.clone(),
                stats.clone(),
            );
            workers.push(tokio::spawn(run_shard(index, queue.clone(), engine)));
            shards.push(queue);
        }

        tracing::info!(
            shards = shard_count,
            queue_capacity = config.queue_capacity,
            "Alarm router started"
        );

        Self {
            shards,
            workers: Mutex::new(workers),
            rules,
            store,
            stats,
            closed: AtomicBool::new(false),
        }
    }

    fn shard_for(&self, series: &SeriesKey) -> &ShardQueue {
        let mut hasher = DefaultHasher::new();
        series.hash(&mut hasher);
        let index = (hasher.finish() % self.shards.len() as u64) as usize;
        &self.shards[index]
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(AlarmError::Shutdown);
        }
        Ok(())
    }

    /// Queue `sample` on its series' shard. Never waits on evaluation.
    pub fn submit(&self, sample: MetricSample) -> Result<()> {
        self.ensure_open()?;
        if let Err(e) = validate_sample(&sample) {
            self.stats.record_rejected();
            return Err(e);
        }
        self.shard_for(&sample.series())
            .push(Command::Sample(sample), &self.stats);
        Ok(())
    }

    /// Mark the rule set stale; shards refetch it on their next evaluation.
    pub fn reload(&self) {
        tracing::info!("Rule reload requested");
        self.rules.reload();
    }

    /// Run the NO_DATA sweep on every shard.
    pub fn sweep(&self, now: DateTime<Utc>) -> Result<()> {
        self.ensure_open()?;
        for shard in &self.shards {
            shard.push(Command::Sweep(now), &self.stats);
        }
        Ok(())
    }

    pub async fn mute(&self, key: &AlarmKey, until: DateTime<Utc>) -> Result<AlarmState> {
        self.set_mute(key, Some(until)).await
    }

    pub async fn unmute(&self, key: &AlarmKey) -> Result<AlarmState> {
        self.set_mute(key, None).await
    }

    async fn set_mute(&self, key: &AlarmKey, until: Option<DateTime<Utc>>) -> Result<AlarmState> {
        self.ensure_open()?;
        let (reply, rx) = oneshot::channel();
        self.shard_for(&key.series()).push(
            Command::Mute {
                key: key.clone(),
                until,
                reply,
            },
            &self.stats,
        );
        rx.await.map_err(|_| AlarmError::Shutdown)?
    }

    /// Wait until everything queued before this call has been processed.
    pub async fn flush(&self) -> Result<()> {
        self.ensure_open()?;
        let mut pending = Vec::with_capacity(self.shards.len());
        for shard in &self.shards {
            let (tx, rx) = oneshot::channel();
            shard.push(Command::Flush(tx), &self.stats);
            pending.push(rx);
        }
        for rx in pending {
            rx.await.map_err(|_| AlarmError::Shutdown)?;
        }
        Ok(())
    }

    /// Last fully applied state of `key`.
    pub fn state_of(&self, key: &AlarmKey) -> Option<AlarmState> {
        self.store.get(key)
    }

    pub fn states(&self) -> Vec<(AlarmKey, AlarmState)> {
        self.store.snapshot()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Stop accepting work, drain every queue and wait for the workers.
    /// Later calls return immediately; submissions after this fail with
    /// [`AlarmError::Shutdown`].
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        for shard in &self.shards {
            shard.close();
        }
        let workers = std::mem::take(&mut *self.workers.lock().unwrap_or_else(|e| e.into_inner()));
        for (index, worker) in workers.into_iter().enumerate() {
            if let Err(e) = worker.await {
                tracing::error!(shard = index, error = %e, "Shard worker ended abnormally");
            }
        }
        tracing::info!("Alarm router stopped");
    }
}

async fn run_shard(index: usize, queue: Arc<ShardQueue>, mut engine: AlarmEngine) {
    tracing::debug!(shard = index, "Shard worker started");
    while let Some(command) = queue.pop().await {
        match command {
            Command::Sample(sample) => {
                engine.ingest(sample);
            }
            Command::Sweep(now) => {
                engine.sweep(now);
            }
            Command::Mute { key, until, reply } => {
                let _ = reply.send(engine.mute(&key, until));
            }
            Command::Flush(reply) => {
                let _ = reply.send(());
            }
        }
    }
    tracing::debug!(shard = index, series = engine.series_count(), "Shard worker stopped");
}
