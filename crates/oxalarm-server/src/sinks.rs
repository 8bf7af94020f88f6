use anyhow::Context;
use oxalarm_common::types::{format_labels, AlarmEvent};
use std::path::PathBuf;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

/// Consume events produced by a `ChannelSink`: log each one and, when
/// `events_path` is set, append it to that file as a JSON line.
///
/// The task ends once every sender is dropped and returns how many events
/// it delivered.
pub fn spawn_event_writer(
    mut rx: UnboundedReceiver<AlarmEvent>,
    events_path: Option<PathBuf>,
) -> JoinHandle<anyhow::Result<u64>> {
    tokio::spawn(async move {
        let mut file = match &events_path {
            Some(path) => Some(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .await
                    .with_context(|| format!("failed to open events file {}", path.display()))?,
            ),
            None => None,
        };

        let mut delivered = 0u64;
        while let Some(event) = rx.recv().await {
            tracing::info!(
                id = %event.id,
                key = %event.key,
                kind = %event.kind,
                severity = %event.severity,
                labels = %format_labels(&event.labels),
                "{}",
                event.message
            );

            if let Some(f) = file.as_mut() {
                let mut line = serde_json::to_vec(&event)?;
                line.push(b'\n');
                if let Err(e) = f.write_all(&line).await {
                    tracing::error!(error = %e, "Failed to write alarm event");
                    continue;
                }
            }
            delivered += 1;
        }

        if let Some(f) = file.as_mut() {
            f.flush().await?;
        }
        tracing::debug!(delivered, "Event writer stopped");
        Ok(delivered)
    })
}
