//! Rule snapshots and the boundary to whatever loads them.
//!
//! A [`RuleSet`] is immutable once built. [`RuleBook`] holds the current one
//! behind an `ArcSwap`: evaluations grab an `Arc` and keep using it even if
//! a reload swaps in a newer set halfway through.

use crate::error::{AlarmError, Result};
use crate::strategy::Strategy;
use arc_swap::ArcSwap;
use oxalarm_common::types::AlarmKey;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

#[derive(Debug, Default)]
pub struct RuleSet {
    generation: u64,
    by_metric: HashMap<String, Vec<Arc<Strategy>>>,
    len: usize,
}

impl RuleSet {
    /// Validate and index `strategies`. Fails on the first invalid strategy
    /// or on a duplicated id.
    pub fn new(strategies: Vec<Strategy>) -> Result<Self> {
        let mut ids = HashSet::new();
        let mut by_metric: HashMap<String, Vec<Arc<Strategy>>> = HashMap::new();
        let len = strategies.len();

        for strategy in strategies {
            strategy.validate()?;
            if !ids.insert(strategy.id.clone()) {
                return Err(AlarmError::InvalidStrategy {
                    id: strategy.id.clone(),
                    reason: "duplicate strategy id".into(),
                });
            }
            by_metric
                .entry(strategy.metric.clone())
                .or_default()
                .push(Arc::new(strategy));
        }

        Ok(Self {
            generation: 0,
            by_metric,
            len,
        })
    }

    /// Bumped by [`RuleBook`] each time a set is installed.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn strategies_for(&self, entity: &str, metric: &str) -> Vec<Arc<Strategy>> {
        self.by_metric
            .get(metric)
            .map(|list| {
                list.iter()
                    .filter(|s| s.matches(entity, metric))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn is_configured(&self, key: &AlarmKey) -> bool {
        self.by_metric.get(&key.metric).is_some_and(|list| {
            list.iter()
                .any(|s| s.id == key.strategy_id && s.matches(&key.entity, &key.metric))
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Where rule sets come from (a file, a database, a control plane).
pub trait RuleSource: Send + Sync {
    /// Build a fresh, validated rule set.
    fn load(&self) -> Result<RuleSet>;
}

/// In-memory rule source; [`StaticRules::replace`] changes what the next
/// reload returns.
#[derive(Default)]
pub struct StaticRules {
    strategies: RwLock<Vec<Strategy>>,
}

impl StaticRules {
    pub fn new(strategies: Vec<Strategy>) -> Self {
        Self {
            strategies: RwLock::new(strategies),
        }
    }

    pub fn replace(&self, strategies: Vec<Strategy>) {
        *self.strategies.write().unwrap_or_else(|e| e.into_inner()) = strategies;
    }
}

impl RuleSource for StaticRules {
    fn load(&self) -> Result<RuleSet> {
        let strategies = self
            .strategies
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        RuleSet::new(strategies)
    }
}

/// The current rule snapshot plus a lazy reload flag.
pub struct RuleBook {
    source: Arc<dyn RuleSource>,
    current: ArcSwap<RuleSet>,
    stale: AtomicBool,
    generations: AtomicU64,
}

impl RuleBook {
    /// Load the initial rule set from `source`.
    pub fn new(source: Arc<dyn RuleSource>) -> Result<Self> {
        let mut initial = source.load()?;
        initial.generation = 1;
        tracing::info!(strategies = initial.len(), "Rule set loaded");
        Ok(Self {
            source,
            current: ArcSwap::from_pointee(initial),
            stale: AtomicBool::new(false),
            generations: AtomicU64::new(1),
        })
    }

    /// Current snapshot. Refetches from the source first if a reload was
    /// requested since the last call; a failed refetch keeps the old set.
    pub fn current(&self) -> Arc<RuleSet> {
        if self.stale.swap(false, Ordering::AcqRel) {
            match self.source.load() {
                Ok(set) => self.install(set),
                Err(e) => {
                    tracing::warn!(error = %e, "Rule reload failed, keeping previous rule set");
                }
            }
        }
        self.current.load_full()
    }

    /// Ask for the rule set to be refetched on next use.
    pub fn reload(&self) {
        self.stale.store(true, Ordering::Release);
    }

    /// Swap in `set` immediately.
    pub fn install(&self, mut set: RuleSet) {
        set.generation = self.generations.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::info!(
            generation = set.generation,
            strategies = set.len(),
            "Rule set installed"
        );
        self.current.store(Arc::new(set));
    }

    pub fn current_strategies(&self, entity: &str, metric: &str) -> Vec<Arc<Strategy>> {
        self.current().strategies_for(entity, metric)
    }
}
