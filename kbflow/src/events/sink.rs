//! Event sink trait and implementations.

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, info, Level};

use crate::core::ProgressEvent;

/// Receives progress events from the orchestrator.
///
/// Delivery is best-effort: the orchestrator only calls [`EventSink::try_emit`]
/// on its hot path, which must never block or fail.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Emits an event, waiting for capacity if the sink has any notion of it.
    async fn emit(&self, event: ProgressEvent);

    /// Emits an event without blocking. Failures are logged and dropped.
    fn try_emit(&self, event: ProgressEvent);
}

/// A no-op event sink that discards all events.
///
/// Used as the default when no sink is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit(&self, _event: ProgressEvent) {}

    fn try_emit(&self, _event: ProgressEvent) {}
}

/// An event sink that logs events using the tracing framework.
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingEventSink {
    /// Creates a new logging event sink with the specified level.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a debug-level logging sink.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }

    fn log_event(&self, event: &ProgressEvent) {
        let phase = event.phase.map(|p| p.as_str()).unwrap_or("-");
        if self.level == Level::DEBUG {
            debug!(
                execution_id = %event.execution_id,
                phase,
                processed = event.processed,
                total = event.total,
                elapsed_ms = event.elapsed_ms,
                "Event: {}", event.event_type
            );
        } else {
            info!(
                execution_id = %event.execution_id,
                phase,
                processed = event.processed,
                total = event.total,
                elapsed_ms = event.elapsed_ms,
                "Event: {}", event.event_type
            );
        }
    }
}

#[async_trait]
impl EventSink for LoggingEventSink {
    async fn emit(&self, event: ProgressEvent) {
        self.log_event(&event);
    }

    fn try_emit(&self, event: ProgressEvent) {
        self.log_event(&event);
    }
}

/// Publishes events on a tokio broadcast channel.
///
/// Slow subscribers lag and lose events; the sender never waits.
#[derive(Debug, Clone)]
pub struct BroadcastEventSink {
    tx: broadcast::Sender<ProgressEvent>,
}

impl BroadcastEventSink {
    /// Creates a channel holding up to `capacity` undelivered events.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Adds a subscriber.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl EventSink for BroadcastEventSink {
    async fn emit(&self, event: ProgressEvent) {
        self.try_emit(event);
    }

    fn try_emit(&self, event: ProgressEvent) {
        // No subscribers is not an error.
        let _ = self.tx.send(event);
    }
}

/// A collecting event sink for testing purposes.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: parking_lot::RwLock<Vec<ProgressEvent>>,
}

impl CollectingEventSink {
    /// Creates a new collecting sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected events.
    #[must_use]
    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.read().clone()
    }

    /// Returns the collected event types, in order.
    #[must_use]
    pub fn event_types(&self) -> Vec<String> {
        self.events
            .read()
            .iter()
            .map(|e| e.event_type.clone())
            .collect()
    }

    /// Returns the number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if no events have been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Clears all collected events.
    pub fn clear(&self) {
        self.events.write().clear();
    }

    /// Returns events matching a type prefix.
    #[must_use]
    pub fn events_of_type(&self, type_prefix: &str) -> Vec<ProgressEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.event_type.starts_with(type_prefix))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    async fn emit(&self, event: ProgressEvent) {
        self.events.write().push(event);
    }

    fn try_emit(&self, event: ProgressEvent) {
        self.events.write().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Phase;
    use uuid::Uuid;

    fn event(kind: &str) -> ProgressEvent {
        ProgressEvent::new(kind, Uuid::nil())
    }

    #[tokio::test]
    async fn test_noop_and_logging_sinks() {
        NoOpEventSink.emit(event("x")).await;
        NoOpEventSink.try_emit(event("x"));

        let sink = LoggingEventSink::debug();
        sink.emit(ProgressEvent::phase_started(Uuid::nil(), Phase::Fetch)).await;
        sink.try_emit(event("pipeline.completed"));
    }

    #[tokio::test]
    async fn test_collecting_sink_filter() {
        let sink = CollectingEventSink::new();
        sink.emit(event("phase.started")).await;
        sink.try_emit(event("phase.completed"));
        sink.try_emit(event("item.completed"));

        assert_eq!(sink.len(), 3);
        assert_eq!(sink.events_of_type("phase.").len(), 2);
        assert_eq!(sink.event_types()[2], "item.completed");

        sink.clear();
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_sink_delivers_to_subscribers() {
        let sink = BroadcastEventSink::new(8);
        // Sending without subscribers must not panic.
        sink.try_emit(event("lost"));

        let mut rx = sink.subscribe();
        sink.try_emit(event("pipeline.started"));
        assert_eq!(rx.recv().await.unwrap().event_type, "pipeline.started");
    }
}
