use oxalarm_common::types::AlarmKey;

/// Errors raised inside the alarm core.
///
/// Every variant is scoped to a single sample or a single alarm key. The
/// engine catches them at the per-sample boundary, logs and counts them, and
/// carries on with the next key.
///
/// # Examples
///
/// ```rust
/// use oxalarm_core::error::AlarmError;
///
/// let err = AlarmError::InvalidSample("value is NaN".to_string());
/// assert!(err.to_string().contains("NaN"));
/// ```
#[derive(Debug, thiserror::Error)]
pub enum AlarmError {
    /// Malformed sample (empty entity or metric, non-finite value).
    #[error("Alarm: invalid sample: {0}")]
    InvalidSample(String),

    /// A strategy failed validation when the rule set was built.
    #[error("Alarm: invalid strategy '{id}': {reason}")]
    InvalidStrategy { id: String, reason: String },

    /// The evaluator could not produce a verdict for a key.
    #[error("Alarm: evaluation of {key} failed: {reason}")]
    Evaluation { key: AlarmKey, reason: String },

    /// The rule source could not produce a rule set.
    #[error("Alarm: rule source error: {0}")]
    Config(String),

    /// Compare-and-swap on the state store kept losing after all retries.
    #[error("Alarm: state of {key} changed concurrently {attempts} times")]
    Contention { key: AlarmKey, attempts: u32 },

    /// The router has been shut down and no longer accepts work.
    #[error("Alarm: router is shut down")]
    Shutdown,
}

/// Convenience `Result` alias for alarm core operations.
pub type Result<T> = std::result::Result<T, AlarmError>;
