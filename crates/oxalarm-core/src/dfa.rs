//! The alarm state machine.
//!
//! [`transition`] is the pure transition table: given the current state of
//! one key and a verdict it returns the next state and the lifecycle events
//! the move implies. [`AlarmDfa`] applies that table to the [`StateStore`]
//! with compare-and-swap, applies mute/silence suppression, and hands the
//! resulting events to the [`AlarmSink`].
//!
//! ```text
//!  OK --BREACH--> PENDING_PROBLEM --BREACH x N--> PROBLEM (RAISED)
//!   ^                  |                           |    ^
//!   |               CLEAR                       CLEAR  BREACH
//!   |                  v                           v    |
//!   +------------------+-- CLEAR x M -- PENDING_RECOVERED
//!          (RECOVERED when leaving PENDING_RECOVERED)
//! ```

use crate::dispatch::AlarmSink;
use crate::error::{AlarmError, Result};
use crate::evaluator::{Evaluation, Verdict};
use crate::state::{AlarmState, AlarmStatus, StateStore};
use crate::stats::EngineStats;
use crate::strategy::{NoDataPolicy, Strategy};
use chrono::{DateTime, Utc};
use oxalarm_common::types::{format_labels, AlarmEvent, AlarmKey, Severity, TransitionKind};
use std::collections::HashMap;

/// A lifecycle event implied by a transition, before it is rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Emission {
    pub kind: TransitionKind,
    pub severity: Severity,
    pub escalation_level: usize,
    pub problem_since: Option<DateTime<Utc>>,
}

/// Apply one verdict to `state`. Pure: the caller persists the result.
pub fn transition(
    state: &AlarmState,
    eval: Evaluation,
    strategy: &Strategy,
    now: DateTime<Utc>,
) -> (AlarmState, Vec<Emission>) {
    let mut next = state.clone();
    let mut emissions = Vec::new();

    let breach = match eval.verdict {
        Verdict::NoData => match strategy.no_data {
            NoDataPolicy::Ignore => return (next, emissions),
            // a window that is still filling up is not an outage
            NoDataPolicy::BreachAfter { .. } if !eval.silent => return (next, emissions),
            NoDataPolicy::BreachAfter { grace } => {
                let since = *next.no_data_since.get_or_insert(now);
                if now - since < grace {
                    return (next, emissions);
                }
                true
            }
        },
        Verdict::Breach => {
            next.no_data_since = None;
            true
        }
        Verdict::Clear => {
            next.no_data_since = None;
            false
        }
    };

    if let Some(value) = eval.value {
        next.last_value = Some(value);
    }
    next.last_evaluated_at = Some(now);

    match (state.status, breach) {
        (AlarmStatus::Ok | AlarmStatus::PendingProblem, true) => {
            next.breach_count = state.breach_count.saturating_add(1);
            next.clear_count = 0;
            if next.breach_count >= strategy.raise_after {
                raise(&mut next, strategy, now, &mut emissions);
            } else if state.status == AlarmStatus::Ok {
                next.status = AlarmStatus::PendingProblem;
                next.last_transition_at = Some(now);
            }
        }
        (AlarmStatus::PendingProblem, false) => {
            next.status = AlarmStatus::Ok;
            next.breach_count = 0;
            next.last_transition_at = Some(now);
        }
        (AlarmStatus::Ok, false) => {
            next.breach_count = 0;
            next.clear_count = 0;
        }
        (AlarmStatus::Problem, true) => {
            escalate(&mut next, strategy, now, &mut emissions);
        }
        (AlarmStatus::Problem | AlarmStatus::PendingRecovered, false) => {
            next.clear_count = state.clear_count.saturating_add(1);
            if next.clear_count >= strategy.recover_after {
                recover(&mut next, strategy, now, &mut emissions);
            } else if state.status == AlarmStatus::Problem {
                next.status = AlarmStatus::PendingRecovered;
                next.last_transition_at = Some(now);
            }
        }
        (AlarmStatus::PendingRecovered, true) => {
            // still the same problem: no second RAISED
            next.status = AlarmStatus::Problem;
            next.clear_count = 0;
            next.last_transition_at = Some(now);
            escalate(&mut next, strategy, now, &mut emissions);
        }
    }

    (next, emissions)
}

fn raise(next: &mut AlarmState, strategy: &Strategy, now: DateTime<Utc>, out: &mut Vec<Emission>) {
    next.status = AlarmStatus::Problem;
    next.clear_count = 0;
    next.escalation_level = 0;
    next.severity = Some(strategy.severity);
    next.problem_since = Some(now);
    next.last_transition_at = Some(now);
    out.push(Emission {
        kind: TransitionKind::Raised,
        severity: strategy.severity,
        escalation_level: 0,
        problem_since: Some(now),
    });
    escalate(next, strategy, now, out);
}

/// Emit one ESCALATED per schedule step whose offset from `problem_since`
/// has been crossed and not yet announced.
fn escalate(next: &mut AlarmState, strategy: &Strategy, now: DateTime<Utc>, out: &mut Vec<Emission>) {
    let Some(since) = next.problem_since else {
        return;
    };
    let elapsed = now - since;
    while let Some(step) = strategy.escalation.get(next.escalation_level) {
        if elapsed < step.after {
            break;
        }
        next.escalation_level += 1;
        next.severity = Some(step.severity);
        next.last_transition_at = Some(now);
        out.push(Emission {
            kind: TransitionKind::Escalated,
            severity: step.severity,
            escalation_level: next.escalation_level,
            problem_since: Some(since),
        });
    }
}

fn recover(next: &mut AlarmState, strategy: &Strategy, now: DateTime<Utc>, out: &mut Vec<Emission>) {
    out.push(Emission {
        kind: TransitionKind::Recovered,
        severity: next.severity.unwrap_or(strategy.severity),
        escalation_level: next.escalation_level,
        problem_since: next.problem_since,
    });
    next.status = AlarmStatus::Ok;
    next.breach_count = 0;
    next.clear_count = 0;
    next.escalation_level = 0;
    next.severity = None;
    next.problem_since = None;
    next.last_transition_at = Some(now);
}

/// Context of the sample that produced a verdict.
pub struct Trigger<'a> {
    pub now: DateTime<Utc>,
    pub labels: &'a HashMap<String, String>,
}

/// Result of applying one verdict to one key.
#[derive(Debug)]
pub struct Applied {
    pub state: AlarmState,
    /// Events handed to the sink.
    pub emitted: Vec<AlarmEvent>,
    /// Events withheld by a mute or silence window.
    pub suppressed: usize,
}

pub struct AlarmDfa<'a> {
    store: &'a StateStore,
    sink: &'a dyn AlarmSink,
    stats: &'a EngineStats,
    cas_retries: u32,
}

impl<'a> AlarmDfa<'a> {
    pub fn new(
        store: &'a StateStore,
        sink: &'a dyn AlarmSink,
        stats: &'a EngineStats,
        cas_retries: u32,
    ) -> Self {
        Self {
            store,
            sink,
            stats,
            cas_retries,
        }
    }

    /// Feed one verdict for `key` through the state machine.
    pub fn process(
        &self,
        key: &AlarmKey,
        strategy: &Strategy,
        eval: Evaluation,
        trigger: &Trigger<'_>,
    ) -> Result<Applied> {
        let current = self.store.get_or_create(key);
        self.process_from(key, current, strategy, eval, trigger)
    }

    /// [`Self::process`] starting from a previously read `current` state.
    ///
    /// If the store no longer holds `current`, the transition is re-derived
    /// from the fresh state up to `cas_retries` times before giving up with
    /// [`AlarmError::Contention`]; nothing is emitted in that case.
    pub fn process_from(
        &self,
        key: &AlarmKey,
        mut current: AlarmState,
        strategy: &Strategy,
        eval: Evaluation,
        trigger: &Trigger<'_>,
    ) -> Result<Applied> {
        let now = trigger.now;
        let mut attempts = 0;

        let (stored, emissions) = loop {
            let (next, emissions) = transition(&current, eval, strategy, now);
            if next == current {
                break (current.clone(), emissions);
            }
            match self.store.compare_and_swap(key, &current, next) {
                Ok(stored) => break (stored, emissions),
                Err(fresh) => {
                    attempts += 1;
                    self.stats.record_cas_retry();
                    if attempts > self.cas_retries {
                        return Err(AlarmError::Contention {
                            key: key.clone(),
                            attempts,
                        });
                    }
                    tracing::debug!(%key, attempts, "State changed under us, retrying");
                    current = fresh;
                }
            }
        };

        if stored.status != current.status {
            tracing::debug!(
                %key,
                from = %current.status,
                to = %stored.status,
                breaches = stored.breach_count,
                clears = stored.clear_count,
                "Alarm state moved"
            );
        }

        let quiet = stored.is_muted(now) || strategy.is_silenced(now);
        let mut emitted = Vec::new();
        let mut suppressed = 0;
        for emission in emissions {
            let event = render(key, strategy, &stored, eval.value, emission, trigger);
            if quiet {
                suppressed += 1;
                self.stats.record_suppressed();
                tracing::info!(%key, kind = %event.kind, "Alarm event suppressed (muted)");
                continue;
            }
            tracing::info!(
                %key,
                kind = %event.kind,
                severity = %event.severity,
                value = ?event.value,
                "Alarm event"
            );
            self.stats.record_emitted();
            self.sink.emit(event.clone());
            emitted.push(event);
        }

        Ok(Applied {
            state: stored,
            emitted,
            suppressed,
        })
    }

    /// Set (or clear, with `None`) `mute_until` of `key`, starting from a
    /// previously read `current` state. Only the deadline changes; a
    /// conflicting write is kept and the deadline reapplied on top of it.
    pub fn mute_from(
        &self,
        key: &AlarmKey,
        mut current: AlarmState,
        until: Option<DateTime<Utc>>,
    ) -> Result<AlarmState> {
        for _ in 0..=self.cas_retries {
            let next = AlarmState {
                mute_until: until,
                ..current.clone()
            };
            match self.store.compare_and_swap(key, &current, next) {
                Ok(stored) => {
                    tracing::info!(%key, until = ?until, "Mute updated");
                    return Ok(stored);
                }
                Err(fresh) => {
                    self.stats.record_cas_retry();
                    current = fresh;
                }
            }
        }
        Err(AlarmError::Contention {
            key: key.clone(),
            attempts: self.cas_retries + 1,
        })
    }
}

fn render(
    key: &AlarmKey,
    strategy: &Strategy,
    state: &AlarmState,
    value: Option<f64>,
    emission: Emission,
    trigger: &Trigger<'_>,
) -> AlarmEvent {
    let value = value.or(state.last_value);
    let shown = value.map_or_else(|| "n/a".to_string(), |v| format!("{v:.2}"));
    let labels_str = format_labels(trigger.labels);
    let labels_display = if labels_str.is_empty() {
        String::new()
    } else {
        format!(" [{labels_str}]")
    };
    let conditions = strategy
        .conditions
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join(match strategy.combine {
            crate::strategy::Combine::All => " and ",
            crate::strategy::Combine::Any => " or ",
        });

    let message = match emission.kind {
        TransitionKind::Raised => {
            let mut msg = format!(
                "{}{} on {} is {} ({})",
                key.metric, labels_display, key.entity, shown, conditions
            );
            if let Some(desc) = strategy.description.as_deref().filter(|d| !d.is_empty()) {
                msg.push_str(": ");
                msg.push_str(desc);
            }
            msg
        }
        TransitionKind::Escalated => format!(
            "{}{} on {} still {} ({}), escalated to level {}",
            key.metric, labels_display, key.entity, shown, conditions, emission.escalation_level
        ),
        TransitionKind::Recovered => {
            let lasted = emission
                .problem_since
                .map(|since| format!(" after {}s", (trigger.now - since).num_seconds()))
                .unwrap_or_default();
            format!(
                "[RECOVERED] {}{} on {} back to {}{}",
                key.metric, labels_display, key.entity, shown, lasted
            )
        }
    };

    AlarmEvent {
        id: oxalarm_common::id::next_event_id(),
        key: key.clone(),
        kind: emission.kind,
        severity: emission.severity,
        strategy_name: strategy.name.clone(),
        message,
        value,
        threshold: strategy.primary_threshold(),
        escalation_level: emission.escalation_level,
        labels: trigger.labels.clone(),
        timestamp: trigger.now,
        problem_since: match emission.kind {
            TransitionKind::Raised => None,
            _ => emission.problem_since,
        },
    }
}
