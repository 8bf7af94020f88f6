use chrono::{Duration, NaiveTime};
use oxalarm_common::types::Severity;
use oxalarm_core::error::{AlarmError, Result};
use oxalarm_core::strategy::{
    Aggregation, CompareOp, Combine, Condition, EscalationStep, NoDataPolicy, SilenceWindow,
    Strategy,
};
use oxalarm_core::{RuleSet, RuleSource};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// ---- Rule file schema ----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RulesFile {
    #[serde(default)]
    pub strategies: Vec<StrategySpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategySpec {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub metric: String,
    #[serde(default = "default_entity_pattern")]
    pub entity_pattern: String,
    pub conditions: Vec<ConditionSpec>,
    #[serde(default = "default_combine")]
    pub combine: String,
    #[serde(default = "default_severity")]
    pub severity: String,
    #[serde(default = "default_debounce")]
    pub raise_after: u32,
    #[serde(default = "default_debounce")]
    pub recover_after: u32,
    #[serde(default)]
    pub escalation: Vec<EscalationSpec>,
    #[serde(default)]
    pub no_data: NoDataSpec,
    #[serde(default)]
    pub silence: Vec<SilenceSpec>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionSpec {
    #[serde(default = "default_aggregation")]
    pub aggregation: String,
    /// Samples the aggregation looks at; ignored for `instant`.
    #[serde(default)]
    pub count: Option<usize>,
    pub operator: String,
    pub threshold: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationSpec {
    pub after_secs: u64,
    pub severity: String,
}

/// `no_data = "ignore"` or `no_data = { breach_after_secs = 120 }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NoDataSpec {
    Named(String),
    BreachAfter { breach_after_secs: u64 },
}

impl Default for NoDataSpec {
    fn default() -> Self {
        NoDataSpec::Named("ignore".to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SilenceSpec {
    /// "HH:MM" or "HH:MM:SS", UTC.
    pub start: String,
    pub end: String,
}

fn default_entity_pattern() -> String {
    "*".to_string()
}

fn default_combine() -> String {
    "all".to_string()
}

fn default_severity() -> String {
    "warning".to_string()
}

fn default_debounce() -> u32 {
    1
}

fn default_aggregation() -> String {
    "instant".to_string()
}

// ---- Rule file entry -> Strategy ----

/// Convert one rule-file entry into a validated [`Strategy`].
pub fn build_strategy(spec: &StrategySpec) -> Result<Strategy> {
    let invalid = |reason: String| AlarmError::InvalidStrategy {
        id: spec.id.clone(),
        reason,
    };

    let conditions = spec
        .conditions
        .iter()
        .map(|c| -> Result<Condition> {
            let aggregation = Aggregation::parse(&c.aggregation, c.count).map_err(&invalid)?;
            let operator: CompareOp = c.operator.parse().map_err(&invalid)?;
            Ok(Condition {
                aggregation,
                operator,
                threshold: c.threshold,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let severity: Severity = spec.severity.parse().map_err(&invalid)?;
    let combine: Combine = spec.combine.parse().map_err(&invalid)?;

    let escalation = spec
        .escalation
        .iter()
        .map(|step| -> Result<EscalationStep> {
            Ok(EscalationStep {
                after: secs(step.after_secs),
                severity: step.severity.parse().map_err(&invalid)?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let no_data = match &spec.no_data {
        NoDataSpec::Named(name) if name.eq_ignore_ascii_case("ignore") => NoDataPolicy::Ignore,
        NoDataSpec::Named(other) => {
            return Err(invalid(format!("unknown no_data policy: {other}")));
        }
        NoDataSpec::BreachAfter { breach_after_secs } => NoDataPolicy::BreachAfter {
            grace: secs(*breach_after_secs),
        },
    };

    let silence = spec
        .silence
        .iter()
        .map(|w| -> Result<SilenceWindow> {
            Ok(SilenceWindow {
                start: parse_time(&w.start).map_err(&invalid)?,
                end: parse_time(&w.end).map_err(&invalid)?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let strategy = Strategy {
        id: spec.id.clone(),
        name: spec.name.clone().unwrap_or_else(|| spec.id.clone()),
        metric: spec.metric.clone(),
        entity_pattern: spec.entity_pattern.clone(),
        conditions,
        combine,
        severity,
        raise_after: spec.raise_after,
        recover_after: spec.recover_after,
        escalation,
        no_data,
        silence,
        description: spec.description.clone(),
    };
    strategy.validate()?;
    Ok(strategy)
}

fn secs(value: u64) -> Duration {
    // chrono panics past i64::MAX milliseconds
    Duration::seconds(value.min(i64::MAX as u64 / 1000) as i64)
}

fn parse_time(value: &str) -> std::result::Result<NaiveTime, String> {
    NaiveTime::parse_from_str(value, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M:%S"))
        .map_err(|e| format!("invalid time '{value}': {e}"))
}

/// Parse a whole rule file into a rule set.
pub fn parse_rules(content: &str) -> Result<RuleSet> {
    let file: RulesFile =
        toml::from_str(content).map_err(|e| AlarmError::Config(format!("invalid rule file: {e}")))?;
    let strategies = file
        .strategies
        .iter()
        .map(build_strategy)
        .collect::<Result<Vec<_>>>()?;
    RuleSet::new(strategies)
}

/// Rule source backed by a TOML file, re-read on every load.
pub struct FileRuleSource {
    path: PathBuf,
}

impl FileRuleSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl RuleSource for FileRuleSource {
    fn load(&self) -> Result<RuleSet> {
        let content = std::fs::read_to_string(&self.path).map_err(|e| {
            AlarmError::Config(format!("failed to read {}: {e}", self.path.display()))
        })?;
        let set = parse_rules(&content)?;
        tracing::debug!(path = %self.path.display(), strategies = set.len(), "Rule file parsed");
        Ok(set)
    }
}
