use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// One numeric value reported by a collector agent.
///
/// `step_secs` is the collector's declared reporting interval; the engine
/// uses it to decide when a series has gone quiet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub entity: String,
    pub metric: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(default = "default_step_secs")]
    pub step_secs: u64,
    #[serde(default)]
    pub labels: HashMap<String, String>,
}

fn default_step_secs() -> u64 {
    60
}

impl MetricSample {
    pub fn new(
        entity: impl Into<String>,
        metric: impl Into<String>,
        value: f64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            entity: entity.into(),
            metric: metric.into(),
            value,
            timestamp,
            step_secs: default_step_secs(),
            labels: HashMap::new(),
        }
    }

    pub fn series(&self) -> SeriesKey {
        SeriesKey::new(&self.entity, &self.metric)
    }
}

/// (entity, metric): identifies one sample window and one routing partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeriesKey {
    pub entity: String,
    pub metric: String,
}

impl SeriesKey {
    pub fn new(entity: &str, metric: &str) -> Self {
        Self {
            entity: entity.to_string(),
            metric: metric.to_string(),
        }
    }

    pub fn with_strategy(&self, strategy_id: &str) -> AlarmKey {
        AlarmKey {
            entity: self.entity.clone(),
            metric: self.metric.clone(),
            strategy_id: strategy_id.to_string(),
        }
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity, self.metric)
    }
}

/// (entity, metric, strategy id): identifies one alarm state machine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AlarmKey {
    pub entity: String,
    pub metric: String,
    pub strategy_id: String,
}

impl AlarmKey {
    pub fn new(entity: &str, metric: &str, strategy_id: &str) -> Self {
        Self {
            entity: entity.to_string(),
            metric: metric.to_string(),
            strategy_id: strategy_id.to_string(),
        }
    }

    pub fn series(&self) -> SeriesKey {
        SeriesKey::new(&self.entity, &self.metric)
    }
}

impl fmt::Display for AlarmKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}#{}", self.entity, self.metric, self.strategy_id)
    }
}

/// Alarm severity level, ordered from lowest to highest.
///
/// # Examples
///
/// ```
/// use oxalarm_common::types::Severity;
///
/// let sev: Severity = "warn".parse().unwrap();
/// assert_eq!(sev, Severity::Warning);
/// assert_eq!(sev.to_string(), "warning");
/// assert!(Severity::Critical > Severity::Info);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "info" => Ok(Severity::Info),
            "warning" | "warn" => Ok(Severity::Warning),
            "critical" | "crit" => Ok(Severity::Critical),
            _ => Err(format!("unknown severity: {s}")),
        }
    }
}

/// Lifecycle transition carried by an [`AlarmEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransitionKind {
    Raised,
    Escalated,
    Recovered,
}

impl fmt::Display for TransitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransitionKind::Raised => write!(f, "RAISED"),
            TransitionKind::Escalated => write!(f, "ESCALATED"),
            TransitionKind::Recovered => write!(f, "RECOVERED"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmEvent {
    pub id: String,
    pub key: AlarmKey,
    pub kind: TransitionKind,
    pub severity: Severity,
    /// Human-readable strategy name (e.g., "web CPU too high")
    pub strategy_name: String,
    pub message: String,
    /// Aggregated value that drove the transition; `None` when the series
    /// went silent before any value could be aggregated
    pub value: Option<f64>,
    pub threshold: f64,
    /// 0 for RAISED, 1.. for each ESCALATED step, level reached before recovery for RECOVERED
    pub escalation_level: usize,
    /// Labels from the triggering sample (e.g., mount=/data)
    pub labels: HashMap<String, String>,
    pub timestamp: DateTime<Utc>,
    /// Start of the problem lineage; set on ESCALATED and RECOVERED
    pub problem_since: Option<DateTime<Utc>>,
}

/// Format labels map into a human-readable string.
///
/// # Examples
///
/// ```
/// use std::collections::HashMap;
/// use oxalarm_common::types::format_labels;
///
/// let mut labels = HashMap::new();
/// labels.insert("mount".to_string(), "/data".to_string());
/// labels.insert("device".to_string(), "sda1".to_string());
/// assert_eq!(format_labels(&labels), "device=sda1, mount=/data");
/// ```
pub fn format_labels(labels: &HashMap<String, String>) -> String {
    if labels.is_empty() {
        return String::new();
    }
    let mut pairs: Vec<String> = labels.iter().map(|(k, v)| format!("{k}={v}")).collect();
    pairs.sort();
    pairs.join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn alarm_key_display_and_series() {
        let key = AlarmKey::new("web-01", "cpu.usage", "cpu-high");
        assert_eq!(key.to_string(), "web-01/cpu.usage#cpu-high");
        assert_eq!(key.series(), SeriesKey::new("web-01", "cpu.usage"));
        assert_eq!(key.series().with_strategy("cpu-high"), key);
    }

    #[test]
    fn sample_defaults_step_when_missing() {
        let json = r#"{"entity":"db-01","metric":"disk.used","value":81.5,"timestamp":"2024-01-01T00:00:00Z"}"#;
        let sample: MetricSample = serde_json::from_str(json).unwrap();
        assert_eq!(sample.step_secs, 60);
        assert!(sample.labels.is_empty());
        assert_eq!(
            sample.timestamp,
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn event_without_value_survives_json() {
        let event = AlarmEvent {
            id: "1".to_string(),
            key: AlarmKey::new("db-01", "disk.used", "disk-full"),
            kind: TransitionKind::Raised,
            severity: Severity::Critical,
            strategy_name: "disk-full".to_string(),
            message: "disk.used on db-01 is n/a".to_string(),
            value: None,
            threshold: 90.0,
            escalation_level: 0,
            labels: HashMap::new(),
            timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            problem_since: None,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""value":null"#), "{json}");
        let back: AlarmEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn severity_rejects_unknown() {
        assert!("page".parse::<Severity>().is_err());
        assert_eq!("CRIT".parse::<Severity>().unwrap(), Severity::Critical);
    }
}
