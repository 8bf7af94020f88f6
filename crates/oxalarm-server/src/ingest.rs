use oxalarm_common::types::MetricSample;
use oxalarm_core::{AlarmError, AlarmRouter};
use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// Counters for one ingestion run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct IngestSummary {
    pub lines: u64,
    pub submitted: u64,
    /// Lines that were not valid sample JSON.
    pub malformed: u64,
    /// Samples the router refused (data errors).
    pub rejected: u64,
}

/// Parse one JSON-lines record. Blank lines and `#` comments yield `None`.
pub fn parse_sample_line(line: &str) -> anyhow::Result<Option<MetricSample>> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(None);
    }
    let sample: MetricSample = serde_json::from_str(trimmed)?;
    Ok(Some(sample))
}

/// Read samples line by line from `reader` and submit them to `router`
/// until EOF. Bad lines are logged and skipped; only I/O errors and a
/// router shutdown end the run early.
pub async fn pump<R>(reader: R, router: &AlarmRouter) -> anyhow::Result<IngestSummary>
where
    R: AsyncBufRead + Unpin,
{
    let mut summary = IngestSummary::default();
    let mut lines = reader.lines();

    while let Some(line) = lines.next_line().await? {
        summary.lines += 1;
        let sample = match parse_sample_line(&line) {
            Ok(Some(sample)) => sample,
            Ok(None) => continue,
            Err(e) => {
                summary.malformed += 1;
                tracing::warn!(line = summary.lines, error = %e, "Malformed sample line skipped");
                continue;
            }
        };

        match router.submit(sample) {
            Ok(()) => summary.submitted += 1,
            Err(AlarmError::Shutdown) => {
                tracing::info!("Router shut down, ingestion stopped");
                break;
            }
            Err(e) => {
                summary.rejected += 1;
                tracing::warn!(line = summary.lines, error = %e, "Sample rejected");
            }
        }
    }

    tracing::info!(
        lines = summary.lines,
        submitted = summary.submitted,
        malformed = summary.malformed,
        rejected = summary.rejected,
        "Ingestion finished"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skips_blank_and_comment_lines() {
        assert!(parse_sample_line("").unwrap().is_none());
        assert!(parse_sample_line("   # header").unwrap().is_none());
    }

    #[test]
    fn step_defaults_when_missing() {
        let sample = parse_sample_line(
            r#"{"entity":"web-01","metric":"cpu.usage","value":91.5,"timestamp":"2024-01-01T00:00:00Z"}"#,
        )
        .unwrap()
        .unwrap();
        assert_eq!(sample.step_secs, 60);
        assert!(sample.labels.is_empty());
        assert_eq!(sample.value, 91.5);
    }

    #[test]
    fn malformed_line_is_an_error() {
        assert!(parse_sample_line(r#"{"entity":"web-01"}"#).is_err());
    }
}
