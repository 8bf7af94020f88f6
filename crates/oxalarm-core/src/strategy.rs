//! Validated strategy model.
//!
//! Aggregations and operators are closed enums: anything that parses into a
//! [`Strategy`] and passes [`Strategy::validate`] can always be evaluated.

use crate::error::{AlarmError, Result};
use chrono::{DateTime, Duration, NaiveTime, Utc};
use oxalarm_common::types::Severity;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    GreaterThan,
    LessThan,
    GreaterEqual,
    LessEqual,
    Equal,
    NotEqual,
}

impl FromStr for CompareOp {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            ">" | "gt" | "greater_than" => Ok(Self::GreaterThan),
            "<" | "lt" | "less_than" => Ok(Self::LessThan),
            ">=" | "gte" | "greater_equal" => Ok(Self::GreaterEqual),
            "<=" | "lte" | "less_equal" => Ok(Self::LessEqual),
            "==" | "eq" | "equal" => Ok(Self::Equal),
            "!=" | "ne" | "not_equal" => Ok(Self::NotEqual),
            _ => Err(format!("unknown compare operator: {s}")),
        }
    }
}

impl std::fmt::Display for CompareOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.symbol())
    }
}

impl CompareOp {
    pub fn check(&self, value: f64, threshold: f64) -> bool {
        match self {
            Self::GreaterThan => value > threshold,
            Self::LessThan => value < threshold,
            Self::GreaterEqual => value >= threshold,
            Self::LessEqual => value <= threshold,
            Self::Equal => (value - threshold).abs() < f64::EPSILON,
            Self::NotEqual => (value - threshold).abs() >= f64::EPSILON,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Self::GreaterThan => ">",
            Self::LessThan => "<",
            Self::GreaterEqual => ">=",
            Self::LessEqual => "<=",
            Self::Equal => "==",
            Self::NotEqual => "!=",
        }
    }
}

/// Reduction applied to the window before comparing against the threshold.
/// The `usize` is the number of samples K the function looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregation {
    Instant,
    Sum(usize),
    Avg(usize),
    Max(usize),
    Min(usize),
    /// latest - value K samples back
    Diff(usize),
    /// (latest - value K samples back) / value K samples back * 100
    PercentDiff(usize),
}

impl Aggregation {
    /// Parse `name` plus an optional sample count, e.g. `("avg", Some(3))`.
    pub fn parse(name: &str, count: Option<usize>) -> std::result::Result<Self, String> {
        let k = count.unwrap_or(1);
        match name {
            "instant" | "last" | "all" => Ok(Self::Instant),
            "sum" => Ok(Self::Sum(k)),
            "avg" | "mean" => Ok(Self::Avg(k)),
            "max" => Ok(Self::Max(k)),
            "min" => Ok(Self::Min(k)),
            "diff" => Ok(Self::Diff(k)),
            "pdiff" | "percent_diff" => Ok(Self::PercentDiff(k)),
            _ => Err(format!("unknown aggregation: {name}")),
        }
    }

    /// Number of samples that must be retained before this function is defined.
    pub fn required_samples(&self) -> usize {
        match *self {
            Self::Instant => 1,
            Self::Sum(k) | Self::Avg(k) | Self::Max(k) | Self::Min(k) => k,
            Self::Diff(k) | Self::PercentDiff(k) => k + 1,
        }
    }

    fn count(&self) -> Option<usize> {
        match *self {
            Self::Instant => None,
            Self::Sum(k)
            | Self::Avg(k)
            | Self::Max(k)
            | Self::Min(k)
            | Self::Diff(k)
            | Self::PercentDiff(k) => Some(k),
        }
    }
}

impl std::fmt::Display for Aggregation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::Instant => write!(f, "instant"),
            Self::Sum(k) => write!(f, "sum(#{k})"),
            Self::Avg(k) => write!(f, "avg(#{k})"),
            Self::Max(k) => write!(f, "max(#{k})"),
            Self::Min(k) => write!(f, "min(#{k})"),
            Self::Diff(k) => write!(f, "diff(#{k})"),
            Self::PercentDiff(k) => write!(f, "pdiff(#{k})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub aggregation: Aggregation,
    pub operator: CompareOp,
    pub threshold: f64,
}

impl std::fmt::Display for Condition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} {}", self.aggregation, self.operator, self.threshold)
    }
}

/// How the verdicts of several conditions fold into one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Combine {
    #[default]
    All,
    Any,
}

impl FromStr for Combine {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "all" | "and" => Ok(Self::All),
            "any" | "or" => Ok(Self::Any),
            _ => Err(format!("unknown combinator: {s}")),
        }
    }
}

/// What a NO_DATA verdict does to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NoDataPolicy {
    /// State is frozen.
    #[default]
    Ignore,
    /// Counts as BREACH once only NO_DATA has been seen for `grace`.
    BreachAfter { grace: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EscalationStep {
    /// Offset from the RAISED transition.
    pub after: Duration,
    pub severity: Severity,
}

/// Recurring daily quiet hours during which events are not emitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SilenceWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl SilenceWindow {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        let current_time = now.time();
        if self.start <= self.end {
            current_time >= self.start && current_time <= self.end
        } else {
            // Overnight window (e.g., 23:00 - 03:00)
            current_time >= self.start || current_time <= self.end
        }
    }
}

/// An alerting rule attached to one metric.
#[derive(Debug, Clone)]
pub struct Strategy {
    pub id: String,
    pub name: String,
    pub metric: String,
    /// Glob over entity ids (e.g., `"web-*"` or `"*"`).
    pub entity_pattern: String,
    pub conditions: Vec<Condition>,
    pub combine: Combine,
    pub severity: Severity,
    /// Consecutive BREACH verdicts before RAISED (N).
    pub raise_after: u32,
    /// Consecutive CLEAR verdicts before RECOVERED (M).
    pub recover_after: u32,
    pub escalation: Vec<EscalationStep>,
    pub no_data: NoDataPolicy,
    pub silence: Vec<SilenceWindow>,
    pub description: Option<String>,
}

impl Strategy {
    /// A single-condition strategy with debounce 1/1 and no escalation.
    pub fn new(
        id: impl Into<String>,
        metric: impl Into<String>,
        condition: Condition,
        severity: Severity,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            metric: metric.into(),
            entity_pattern: "*".to_string(),
            conditions: vec![condition],
            combine: Combine::All,
            severity,
            raise_after: 1,
            recover_after: 1,
            escalation: Vec::new(),
            no_data: NoDataPolicy::Ignore,
            silence: Vec::new(),
            description: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| AlarmError::InvalidStrategy {
            id: self.id.clone(),
            reason,
        };

        if self.id.trim().is_empty() {
            return Err(invalid("id is empty".into()));
        }
        if self.metric.trim().is_empty() {
            return Err(invalid("metric is empty".into()));
        }
        if self.conditions.is_empty() {
            return Err(invalid("no conditions".into()));
        }
        for cond in &self.conditions {
            if cond.aggregation.count() == Some(0) {
                return Err(invalid(format!("{} needs at least one sample", cond.aggregation)));
            }
            if !cond.threshold.is_finite() {
                return Err(invalid(format!("threshold of `{cond}` is not finite")));
            }
        }
        if self.raise_after == 0 || self.recover_after == 0 {
            return Err(invalid("raise_after and recover_after must be >= 1".into()));
        }
        if self
            .escalation
            .windows(2)
            .any(|pair| pair[1].after <= pair[0].after)
        {
            return Err(invalid("escalation offsets must be strictly increasing".into()));
        }
        if self.escalation.iter().any(|step| step.after < Duration::zero()) {
            return Err(invalid("escalation offsets must not be negative".into()));
        }
        if let NoDataPolicy::BreachAfter { grace } = self.no_data {
            if grace < Duration::zero() {
                return Err(invalid("no_data grace must not be negative".into()));
            }
        }
        Ok(())
    }

    /// Deepest window any condition of this strategy needs.
    pub fn required_samples(&self) -> usize {
        self.conditions
            .iter()
            .map(|c| c.aggregation.required_samples())
            .max()
            .unwrap_or(1)
    }

    pub fn matches(&self, entity: &str, metric: &str) -> bool {
        self.metric == metric && entity_matches(&self.entity_pattern, entity)
    }

    pub fn is_silenced(&self, now: DateTime<Utc>) -> bool {
        self.silence.iter().any(|w| w.is_active(now))
    }

    /// Threshold reported on events (that of the first condition).
    pub fn primary_threshold(&self) -> f64 {
        self.conditions.first().map(|c| c.threshold).unwrap_or_default()
    }
}

fn entity_matches(pattern: &str, entity: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    glob_match::glob_match(pattern, entity)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cond(aggregation: Aggregation) -> Condition {
        Condition {
            aggregation,
            operator: CompareOp::GreaterThan,
            threshold: 80.0,
        }
    }

    #[test]
    fn operators_parse_symbols_and_words() {
        assert_eq!(">=".parse::<CompareOp>().unwrap(), CompareOp::GreaterEqual);
        assert_eq!("ne".parse::<CompareOp>().unwrap(), CompareOp::NotEqual);
        assert!("~=".parse::<CompareOp>().is_err());
        assert!(CompareOp::Equal.check(1.0, 1.0));
        assert!(CompareOp::NotEqual.check(1.0, 1.5));
    }

    #[test]
    fn required_samples_accounts_for_diff_lookback() {
        assert_eq!(Aggregation::Instant.required_samples(), 1);
        assert_eq!(Aggregation::Avg(3).required_samples(), 3);
        assert_eq!(Aggregation::Diff(3).required_samples(), 4);

        let mut strategy = Strategy::new("s", "m", cond(Aggregation::Avg(5)), Severity::Warning);
        strategy.conditions.push(cond(Aggregation::PercentDiff(2)));
        assert_eq!(strategy.required_samples(), 5);
    }

    #[test]
    fn validate_rejects_bad_shapes() {
        let ok = Strategy::new("s", "m", cond(Aggregation::Avg(3)), Severity::Warning);
        assert!(ok.validate().is_ok());

        let mut zero_window = ok.clone();
        zero_window.conditions = vec![cond(Aggregation::Sum(0))];
        assert!(zero_window.validate().is_err());

        let mut zero_debounce = ok.clone();
        zero_debounce.raise_after = 0;
        assert!(zero_debounce.validate().is_err());

        let mut unordered = ok.clone();
        unordered.escalation = vec![
            EscalationStep {
                after: Duration::seconds(300),
                severity: Severity::Critical,
            },
            EscalationStep {
                after: Duration::seconds(60),
                severity: Severity::Warning,
            },
        ];
        let err = unordered.validate().unwrap_err();
        assert!(err.to_string().contains("strictly increasing"));
    }

    #[test]
    fn entity_pattern_globs() {
        let mut strategy = Strategy::new("s", "cpu", cond(Aggregation::Instant), Severity::Info);
        strategy.entity_pattern = "web-*".into();
        assert!(strategy.matches("web-01", "cpu"));
        assert!(!strategy.matches("db-01", "cpu"));
        assert!(!strategy.matches("web-01", "mem"));
    }

    #[test]
    fn silence_window_overnight() {
        let window = SilenceWindow {
            start: NaiveTime::from_hms_opt(23, 0, 0).unwrap(),
            end: NaiveTime::from_hms_opt(3, 0, 0).unwrap(),
        };
        let late = chrono::NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(23, 30, 0)
            .unwrap()
            .and_utc();
        let noon = chrono::NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
            .and_utc();
        assert!(window.is_active(late));
        assert!(!window.is_active(noon));
    }
}
