//! # Swarm Events
//!
//! One-way progress reports from the runner to whoever renders them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Kind of swarm event
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SwarmEventKind {
    /// Run started (with instance count)
    RunStarted,
    /// Instance initialized and entering its loop
    InstanceStarted,
    /// One lifecycle step finished
    StepCompleted,
    /// A stage failed; the instance is being dead-ended
    StepFailed,
    /// Step budget used up before a terminal status
    MaxStepsReached,
    /// Shutdown observed between steps
    ShutdownObserved,
    /// Gate fixture regressed during resolution
    GateViolation,
    /// Dead-ends for a sub-type reached the threshold
    CircuitBreakerTripped,
    /// Instance finished (any outcome)
    InstanceFinished,
    /// Every instance has finished
    RunCompleted,
}

impl SwarmEventKind {
    /// Warnings are logged at `warn`, everything else at `info`
    pub fn is_warning(&self) -> bool {
        matches!(
            self,
            Self::StepFailed
                | Self::MaxStepsReached
                | Self::GateViolation
                | Self::CircuitBreakerTripped
        )
    }
}

/// An event in the swarm
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: SwarmEventKind,
    /// Instance label (`<ordinal>-<slug>`), or "swarm" for run-level events
    pub instance: String,
    pub message: String,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

impl SwarmEvent {
    pub fn new(kind: SwarmEventKind, instance: &str, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            instance: instance.to_string(),
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Optional event channel. Every event is also logged.
///
/// Sending never waits: when the channel is full or closed the event is
/// dropped and counted, so a slow consumer cannot hold up a step loop.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::Sender<SwarmEvent>>,
    dropped: Arc<AtomicU64>,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<SwarmEvent>) -> Self {
        Self {
            tx: Some(tx),
            dropped: Arc::default(),
        }
    }

    /// Log only
    pub fn silent() -> Self {
        Self::default()
    }

    pub fn emit(&self, event: SwarmEvent) {
        if event.kind.is_warning() {
            tracing::warn!(instance = %event.instance, kind = ?event.kind, "{}", event.message);
        } else {
            tracing::info!(instance = %event.instance, kind = ?event.kind, "{}", event.message);
        }

        if let Some(tx) = &self.tx {
            if tx.try_send(event).is_err() {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Events that did not fit in the channel (shared across clones)
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_creation() {
        let event = SwarmEvent::new(SwarmEventKind::StepCompleted, "01-cache", "gated -> building")
            .with_data(serde_json::json!({ "step": 2 }));

        assert_eq!(event.instance, "01-cache");
        assert_eq!(event.data.unwrap()["step"], 2);
        assert!(!event.kind.is_warning());
        assert!(SwarmEventKind::MaxStepsReached.is_warning());
    }

    #[tokio::test]
    async fn test_sink_forwards_and_survives_closed_channel() {
        let (tx, mut rx) = mpsc::channel(4);
        let sink = EventSink::new(tx);

        sink.emit(SwarmEvent::new(SwarmEventKind::RunStarted, "swarm", "go"));
        let received = rx.recv().await.unwrap();
        assert_eq!(received.kind, SwarmEventKind::RunStarted);

        drop(rx);
        sink.emit(SwarmEvent::new(SwarmEventKind::RunCompleted, "swarm", "done"));
        assert_eq!(sink.dropped(), 1);
    }

    #[test]
    fn test_full_channel_drops_instead_of_waiting() {
        let (tx, mut rx) = mpsc::channel(2);
        let sink = EventSink::new(tx);
        let clone = sink.clone();

        for step in 0..5 {
            clone.emit(SwarmEvent::new(
                SwarmEventKind::StepCompleted,
                "01-slow",
                format!("step {}", step),
            ));
        }

        assert_eq!(sink.dropped(), 3);
        assert_eq!(rx.try_recv().unwrap().message, "step 0");
        assert_eq!(rx.try_recv().unwrap().message, "step 1");
        assert!(rx.try_recv().is_err());
    }
}
