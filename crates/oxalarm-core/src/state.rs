//! Per-key alarm state and the store that holds it.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use oxalarm_common::types::{AlarmKey, Severity};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlarmStatus {
    #[default]
    Ok,
    PendingProblem,
    Problem,
    PendingRecovered,
}

impl std::fmt::Display for AlarmStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ok => write!(f, "OK"),
            Self::PendingProblem => write!(f, "PENDING_PROBLEM"),
            Self::Problem => write!(f, "PROBLEM"),
            Self::PendingRecovered => write!(f, "PENDING_RECOVERED"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct AlarmState {
    pub status: AlarmStatus,
    pub breach_count: u32,
    pub clear_count: u32,
    pub last_transition_at: Option<DateTime<Utc>>,
    pub escalation_level: usize,
    /// Effective severity of the open problem (base, or last escalation step).
    pub severity: Option<Severity>,
    pub problem_since: Option<DateTime<Utc>>,
    pub mute_until: Option<DateTime<Utc>>,
    /// First NO_DATA of the current uninterrupted NO_DATA run.
    pub no_data_since: Option<DateTime<Utc>>,
    pub last_value: Option<f64>,
    pub last_evaluated_at: Option<DateTime<Utc>>,
    /// Bumped on every applied write; compare-and-swap checks it.
    pub revision: u64,
}

impl AlarmState {
    pub fn is_muted(&self, now: DateTime<Utc>) -> bool {
        self.mute_until.is_some_and(|until| now < until)
    }
}

/// Map from [`AlarmKey`] to its [`AlarmState`].
///
/// Writers are partitioned by key upstream, so `compare_and_swap` conflicts
/// only happen when that routing is bypassed. Readers (introspection) never
/// observe a partially applied transition: a write replaces the whole value.
#[derive(Default)]
pub struct StateStore {
    states: DashMap<AlarmKey, AlarmState>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, key: &AlarmKey) -> AlarmState {
        if let Some(state) = self.states.get(key) {
            return state.clone();
        }
        self.states.entry(key.clone()).or_default().clone()
    }

    pub fn get(&self, key: &AlarmKey) -> Option<AlarmState> {
        self.states.get(key).map(|s| s.clone())
    }

    /// Store `new` if the stored revision still equals `expected.revision`.
    ///
    /// On success returns the stored state (revision bumped). On conflict
    /// returns the state currently stored so the caller can retry from it.
    pub fn compare_and_swap(
        &self,
        key: &AlarmKey,
        expected: &AlarmState,
        mut new: AlarmState,
    ) -> Result<AlarmState, AlarmState> {
        new.revision = expected.revision + 1;
        match self.states.get_mut(key) {
            Some(mut current) => {
                if current.revision != expected.revision {
                    return Err(current.clone());
                }
                *current = new.clone();
                Ok(new)
            }
            None => {
                // removed (unconfigured) since it was read
                if expected.revision != 0 {
                    return Err(AlarmState::default());
                }
                self.states.insert(key.clone(), new.clone());
                Ok(new)
            }
        }
    }

    pub fn remove(&self, key: &AlarmKey) -> Option<AlarmState> {
        self.states.remove(key).map(|(_, state)| state)
    }

    pub fn retain(&self, mut keep: impl FnMut(&AlarmKey) -> bool) -> usize {
        let before = self.states.len();
        self.states.retain(|key, _| keep(key));
        before - self.states.len()
    }

    pub fn snapshot(&self) -> Vec<(AlarmKey, AlarmState)> {
        let mut all: Vec<_> = self
            .states
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> AlarmKey {
        AlarmKey::new("web-01", "cpu.usage", "cpu-high")
    }

    #[test]
    fn get_or_create_is_lazy_and_stable() {
        let store = StateStore::new();
        assert!(store.get(&key()).is_none());
        let state = store.get_or_create(&key());
        assert_eq!(state.status, AlarmStatus::Ok);
        assert_eq!(state.revision, 0);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get_or_create(&key()), state);
    }

    #[test]
    fn compare_and_swap_bumps_revision() {
        let store = StateStore::new();
        let current = store.get_or_create(&key());
        let next = AlarmState {
            status: AlarmStatus::PendingProblem,
            breach_count: 1,
            ..current.clone()
        };
        let stored = store.compare_and_swap(&key(), &current, next).unwrap();
        assert_eq!(stored.revision, 1);
        assert_eq!(store.get(&key()).unwrap().status, AlarmStatus::PendingProblem);
    }

    #[test]
    fn compare_and_swap_rejects_stale_expectation() {
        let store = StateStore::new();
        let stale = store.get_or_create(&key());
        store
            .compare_and_swap(&key(), &stale, AlarmState::default())
            .unwrap();

        let conflict = store
            .compare_and_swap(&key(), &stale, AlarmState::default())
            .unwrap_err();
        assert_eq!(conflict.revision, 1);
    }

    #[test]
    fn removed_key_conflicts_for_old_readers() {
        let store = StateStore::new();
        let first = store.get_or_create(&key());
        let stored = store
            .compare_and_swap(&key(), &first, AlarmState::default())
            .unwrap();
        assert!(store.remove(&key()).is_some());
        assert!(store.compare_and_swap(&key(), &stored, AlarmState::default()).is_err());
    }

    #[test]
    fn retain_reports_removed_count() {
        let store = StateStore::new();
        store.get_or_create(&key());
        store.get_or_create(&AlarmKey::new("web-02", "cpu.usage", "cpu-high"));
        let removed = store.retain(|k| k.entity == "web-02");
        assert_eq!(removed, 1);
        assert_eq!(store.snapshot().len(), 1);
    }

    #[test]
    fn mute_is_exclusive_of_its_end() {
        let now = Utc::now();
        let state = AlarmState {
            mute_until: Some(now),
            ..AlarmState::default()
        };
        assert!(!state.is_muted(now));
        assert!(state.is_muted(now - chrono::Duration::seconds(1)));
    }
}
