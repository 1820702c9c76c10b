//! Telemetry side channel.
//!
//! The engine and coordinator emit typed events when a sink is attached.
//! Events are observability only; no component reads them back for
//! correctness.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of emitted event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    NodeStart,
    NodeFinish,
    NodeError,
    Retry,
    Stalemate,
    ReviewerFailed,
}

/// One telemetry event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    pub task_id: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl TelemetryEvent {
    pub fn new(kind: EventKind, task_id: impl Into<String>) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
            task_id: task_id.into(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Event consumer. Implementations must be cheap and non-blocking; the
/// engine calls `record` inline on its execution path.
pub trait TelemetrySink: Send + Sync {
    fn record(&self, event: TelemetryEvent);
}

/// Sink that drops everything. Used when no sink is attached.
#[derive(Debug, Default)]
pub struct NullSink;

impl TelemetrySink for NullSink {
    fn record(&self, _event: TelemetryEvent) {}
}

/// Sink that buffers events in memory. Intended for tests and debugging.
#[derive(Debug, Default)]
pub struct CollectingSink {
    events: Mutex<Vec<TelemetryEvent>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TelemetryEvent> {
        self.events.lock().expect("sink poisoned").clone()
    }

    pub fn count_of(&self, kind: EventKind) -> usize {
        self.events
            .lock()
            .expect("sink poisoned")
            .iter()
            .filter(|e| e.kind == kind)
            .count()
    }
}

impl TelemetrySink for CollectingSink {
    fn record(&self, event: TelemetryEvent) {
        self.events.lock().expect("sink poisoned").push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static_assertions::assert_impl_all!(CollectingSink: Send, Sync);

    #[test]
    fn test_collecting_sink_buffers_in_order() {
        let sink = CollectingSink::new();
        sink.record(TelemetryEvent::new(EventKind::NodeStart, "t1"));
        sink.record(
            TelemetryEvent::new(EventKind::NodeFinish, "t1").with_meta("node", "observe"),
        );

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, EventKind::NodeStart);
        assert_eq!(events[1].metadata.get("node").map(String::as_str), Some("observe"));
    }

    #[test]
    fn test_count_of_filters_by_kind() {
        let sink = CollectingSink::new();
        sink.record(TelemetryEvent::new(EventKind::Retry, "t1"));
        sink.record(TelemetryEvent::new(EventKind::Retry, "t1"));
        sink.record(TelemetryEvent::new(EventKind::Stalemate, "t1"));
        assert_eq!(sink.count_of(EventKind::Retry), 2);
        assert_eq!(sink.count_of(EventKind::NodeError), 0);
    }

    #[test]
    fn test_event_kind_serialization() {
        let json = serde_json::to_string(&EventKind::ReviewerFailed).unwrap();
        assert_eq!(json, "\"reviewer_failed\"");
    }
}
