//! Hand-off point between the alarm core and the notification layer.

use oxalarm_common::types::AlarmEvent;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Receives lifecycle events from the state machine.
///
/// `emit` is called on the evaluation path and must not block: queue the
/// event and deliver it elsewhere. The core emits each event exactly once
/// per transition and never retries; delivery guarantees beyond that belong
/// to the implementation.
pub trait AlarmSink: Send + Sync {
    fn emit(&self, event: AlarmEvent);
}

/// Forwards events into an unbounded tokio channel so an async task can
/// deliver them without ever stalling evaluation.
#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<AlarmEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<AlarmEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl AlarmSink for ChannelSink {
    fn emit(&self, event: AlarmEvent) {
        if let Err(e) = self.tx.send(event) {
            tracing::warn!(key = %e.0.key, kind = %e.0.kind, "Event receiver closed, event dropped");
        }
    }
}

/// Keeps every event in memory. Useful for replay tooling and tests.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<AlarmEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<AlarmEvent> {
        std::mem::take(&mut *self.events.lock().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AlarmSink for MemorySink {
    fn emit(&self, event: AlarmEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }
}
