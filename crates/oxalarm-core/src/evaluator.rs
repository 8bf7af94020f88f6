//! Strategy evaluation: window snapshot + strategy -> verdict.
//!
//! Everything here is a pure function of its inputs.

use crate::error::{AlarmError, Result};
use crate::strategy::{Aggregation, Combine, Condition, Strategy};
use crate::window::SampleWindow;
use oxalarm_common::types::AlarmKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Breach,
    Clear,
    NoData,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evaluation {
    pub verdict: Verdict,
    /// Aggregated value that decided the verdict; `None` for NO_DATA.
    pub value: Option<f64>,
    /// NO_DATA because the series went quiet, as opposed to a window that
    /// has never held enough samples. Only silence starts a no-data grace.
    pub silent: bool,
}

impl Evaluation {
    pub fn breach(value: f64) -> Self {
        Self {
            verdict: Verdict::Breach,
            value: Some(value),
            silent: false,
        }
    }

    pub fn clear(value: f64) -> Self {
        Self {
            verdict: Verdict::Clear,
            value: Some(value),
            silent: false,
        }
    }

    /// Window still warming up.
    pub fn no_data() -> Self {
        Self {
            verdict: Verdict::NoData,
            value: None,
            silent: false,
        }
    }

    /// Series stopped reporting.
    pub fn silence() -> Self {
        Self {
            silent: true,
            ..Self::no_data()
        }
    }
}

/// Reduce `values` (oldest first) with `aggregation`.
///
/// `Ok(None)` means the window holds fewer samples than the function needs.
pub fn aggregate(values: &[f64], aggregation: Aggregation) -> std::result::Result<Option<f64>, String> {
    let needed = aggregation.required_samples();
    if values.len() < needed {
        return Ok(None);
    }
    let tail = &values[values.len() - needed..];
    let latest = tail[tail.len() - 1];

    let value = match aggregation {
        Aggregation::Instant => latest,
        Aggregation::Sum(_) => tail.iter().sum(),
        Aggregation::Avg(k) => tail.iter().sum::<f64>() / k as f64,
        Aggregation::Max(_) => tail.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        Aggregation::Min(_) => tail.iter().copied().fold(f64::INFINITY, f64::min),
        Aggregation::Diff(_) => latest - tail[0],
        Aggregation::PercentDiff(_) => {
            let base = tail[0];
            if base.abs() < f64::EPSILON {
                return Err(format!("{aggregation} against a zero base value"));
            }
            (latest - base) / base * 100.0
        }
    };

    if !value.is_finite() {
        return Err(format!("{aggregation} produced a non-finite value"));
    }
    Ok(Some(value))
}

fn evaluate_condition(values: &[f64], cond: &Condition) -> std::result::Result<Evaluation, String> {
    Ok(match aggregate(values, cond.aggregation)? {
        None => Evaluation::no_data(),
        Some(value) if cond.operator.check(value, cond.threshold) => Evaluation::breach(value),
        Some(value) => Evaluation::clear(value),
    })
}

/// Evaluate every condition of `strategy` against `window` and fold the
/// results with the strategy's combinator.
///
/// `All`: BREACH iff every condition that has data breaches.
/// `Any`: BREACH iff at least one condition breaches.
/// NO_DATA from every condition is NO_DATA for the strategy.
pub fn evaluate(key: &AlarmKey, window: &SampleWindow, strategy: &Strategy) -> Result<Evaluation> {
    let values = window.snapshot(strategy.required_samples());

    let mut results = Vec::with_capacity(strategy.conditions.len());
    for cond in &strategy.conditions {
        let eval = evaluate_condition(&values, cond).map_err(|reason| AlarmError::Evaluation {
            key: key.clone(),
            reason,
        })?;
        results.push(eval);
    }

    let with_data: Vec<&Evaluation> = results
        .iter()
        .filter(|e| e.verdict != Verdict::NoData)
        .collect();
    if with_data.is_empty() {
        return Ok(Evaluation::no_data());
    }

    let breaching = with_data.iter().find(|e| e.verdict == Verdict::Breach);
    let breach = match strategy.combine {
        Combine::All => with_data.iter().all(|e| e.verdict == Verdict::Breach),
        Combine::Any => breaching.is_some(),
    };

    let value = if breach {
        breaching.and_then(|e| e.value)
    } else {
        with_data[0].value
    };
    Ok(Evaluation {
        verdict: if breach { Verdict::Breach } else { Verdict::Clear },
        value,
        silent: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::CompareOp;
    use chrono::{Duration, TimeZone, Utc};
    use oxalarm_common::types::{MetricSample, Severity};

    fn window_of(values: &[f64]) -> SampleWindow {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut window = SampleWindow::new(16, 3600);
        for (i, v) in values.iter().enumerate() {
            window.push(MetricSample::new(
                "web-01",
                "cpu.usage",
                *v,
                base + Duration::seconds(i as i64 * 10),
            ));
        }
        window
    }

    fn strategy(conditions: Vec<Condition>, combine: Combine) -> Strategy {
        let mut s = Strategy::new("cpu-high", "cpu.usage", conditions[0].clone(), Severity::Warning);
        s.conditions = conditions;
        s.combine = combine;
        s
    }

    fn cond(aggregation: Aggregation, operator: CompareOp, threshold: f64) -> Condition {
        Condition {
            aggregation,
            operator,
            threshold,
        }
    }

    fn key() -> AlarmKey {
        AlarmKey::new("web-01", "cpu.usage", "cpu-high")
    }

    #[test]
    fn reductions_over_last_k() {
        let values = [1.0, 2.0, 3.0, 10.0];
        assert_eq!(aggregate(&values, Aggregation::Instant), Ok(Some(10.0)));
        assert_eq!(aggregate(&values, Aggregation::Sum(2)), Ok(Some(13.0)));
        assert_eq!(aggregate(&values, Aggregation::Avg(3)), Ok(Some(5.0)));
        assert_eq!(aggregate(&values, Aggregation::Max(4)), Ok(Some(10.0)));
        assert_eq!(aggregate(&values, Aggregation::Min(2)), Ok(Some(3.0)));
        assert_eq!(aggregate(&values, Aggregation::Diff(2)), Ok(Some(8.0)));
        let pdiff = aggregate(&values, Aggregation::PercentDiff(1)).unwrap().unwrap();
        assert!((pdiff - 700.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn under_filled_window_is_no_data_not_zero() {
        assert_eq!(aggregate(&[5.0, 6.0], Aggregation::Avg(3)), Ok(None));
        // diff(#2) needs the value two samples back
        assert_eq!(aggregate(&[5.0, 6.0], Aggregation::Diff(2)), Ok(None));

        let s = strategy(vec![cond(Aggregation::Sum(3), CompareOp::LessThan, 1.0)], Combine::All);
        let eval = evaluate(&key(), &window_of(&[0.0, 0.0]), &s).unwrap();
        assert_eq!(eval.verdict, Verdict::NoData);
        assert_eq!(eval.value, None);
    }

    #[test]
    fn percent_diff_against_zero_is_an_error() {
        let s = strategy(
            vec![cond(Aggregation::PercentDiff(1), CompareOp::GreaterThan, 50.0)],
            Combine::All,
        );
        let err = evaluate(&key(), &window_of(&[0.0, 5.0]), &s).unwrap_err();
        assert!(matches!(err, AlarmError::Evaluation { .. }));
        assert!(err.to_string().contains("web-01/cpu.usage#cpu-high"));
    }

    #[test]
    fn all_ignores_conditions_without_data() {
        let s = strategy(
            vec![
                cond(Aggregation::Instant, CompareOp::GreaterThan, 80.0),
                cond(Aggregation::Avg(5), CompareOp::GreaterThan, 80.0),
            ],
            Combine::All,
        );
        let eval = evaluate(&key(), &window_of(&[90.0]), &s).unwrap();
        assert_eq!(eval.verdict, Verdict::Breach);
        assert_eq!(eval.value, Some(90.0));

        let eval = evaluate(&key(), &window_of(&[90.0, 90.0, 90.0, 10.0, 95.0]), &s).unwrap();
        // instant breaches, avg = 75 does not
        assert_eq!(eval.verdict, Verdict::Clear);
    }

    #[test]
    fn any_needs_one_breach() {
        let s = strategy(
            vec![
                cond(Aggregation::Instant, CompareOp::GreaterThan, 80.0),
                cond(Aggregation::Min(2), CompareOp::LessThan, 5.0),
            ],
            Combine::Any,
        );
        let eval = evaluate(&key(), &window_of(&[50.0, 1.0]), &s).unwrap();
        assert_eq!(eval.verdict, Verdict::Breach);
        assert_eq!(eval.value, Some(1.0));

        let eval = evaluate(&key(), &window_of(&[50.0, 60.0]), &s).unwrap();
        assert_eq!(eval.verdict, Verdict::Clear);
        assert_eq!(eval.value, Some(60.0));
    }

    #[test]
    fn avg_over_three_matches_expected_verdicts() {
        let s = strategy(vec![cond(Aggregation::Avg(3), CompareOp::GreaterThan, 80.0)], Combine::All);
        let series = [70.0, 90.0, 90.0, 90.0, 90.0, 60.0, 60.0];
        let verdicts: Vec<Verdict> = (1..=series.len())
            .map(|n| evaluate(&key(), &window_of(&series[..n]), &s).unwrap().verdict)
            .collect();
        assert_eq!(
            verdicts,
            vec![
                Verdict::NoData,
                Verdict::NoData,
                Verdict::Breach,
                Verdict::Breach,
                Verdict::Breach,
                Verdict::Clear,
                Verdict::Clear,
            ]
        );
    }
}
