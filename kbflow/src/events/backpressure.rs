//! A bounded queue in front of a slow event sink.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::EventSink;
use crate::core::ProgressEvent;

/// Counters for a [`QueuedEventSink`].
#[derive(Debug, Default)]
pub struct DeliveryStats {
    queued: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl DeliveryStats {
    /// Events accepted into the queue.
    #[must_use]
    pub fn queued(&self) -> u64 {
        self.queued.load(Ordering::Relaxed)
    }

    /// Events handed to the downstream sink.
    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    /// Events discarded because the queue was full.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Counters as JSON, for run summaries.
    #[must_use]
    pub fn to_dict(&self) -> serde_json::Value {
        serde_json::json!({
            "queued": self.queued(),
            "delivered": self.delivered(),
            "dropped": self.dropped(),
        })
    }
}

/// Decouples the pipeline from a sink whose delivery may wait, such as a
/// remote notification channel.
///
/// `try_emit` only ever enqueues. A background task forwards queued
/// events to the downstream sink in order; it starts with the first event
/// emitted inside a tokio runtime. A full queue drops the event and
/// counts it.
pub struct QueuedEventSink {
    downstream: Arc<dyn EventSink>,
    tx: mpsc::Sender<ProgressEvent>,
    rx: Mutex<Option<mpsc::Receiver<ProgressEvent>>>,
    capacity: usize,
    stats: Arc<DeliveryStats>,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for QueuedEventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueuedEventSink")
            .field("capacity", &self.capacity)
            .field("pending", &self.pending())
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl QueuedEventSink {
    /// Wraps `downstream` behind a queue of `capacity` events.
    #[must_use]
    pub fn new(downstream: Arc<dyn EventSink>, capacity: usize) -> Arc<Self> {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        Arc::new(Self {
            downstream,
            tx,
            rx: Mutex::new(Some(rx)),
            capacity,
            stats: Arc::new(DeliveryStats::default()),
            forwarder: Mutex::new(None),
        })
    }

    /// Events queued but not yet handed to the downstream sink.
    #[must_use]
    pub fn pending(&self) -> u64 {
        self.stats.queued().saturating_sub(self.stats.delivered())
    }

    /// Delivery counters.
    #[must_use]
    pub fn stats(&self) -> &DeliveryStats {
        &self.stats
    }

    /// Waits up to `timeout` for the queue to empty. Returns true if it did.
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.start_forwarding();
        tokio::time::timeout(timeout, async {
            while self.pending() > 0 {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .is_ok()
    }

    fn start_forwarding(&self) {
        let mut forwarder = self.forwarder.lock();
        if forwarder.is_some() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let Some(mut rx) = self.rx.lock().take() else {
            return;
        };
        let downstream = Arc::clone(&self.downstream);
        let stats = Arc::clone(&self.stats);
        *forwarder = Some(runtime.spawn(async move {
            while let Some(event) = rx.recv().await {
                downstream.emit(event).await;
                stats.delivered.fetch_add(1, Ordering::Relaxed);
            }
            debug!("Event queue closed");
        }));
    }
}

impl Drop for QueuedEventSink {
    fn drop(&mut self) {
        if let Some(handle) = self.forwarder.lock().take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl EventSink for QueuedEventSink {
    async fn emit(&self, event: ProgressEvent) {
        self.try_emit(event);
    }

    fn try_emit(&self, event: ProgressEvent) {
        self.start_forwarding();
        match self.tx.try_send(event) {
            Ok(()) => {
                self.stats.queued.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                let event = err.into_inner();
                warn!(
                    execution_id = %event.execution_id,
                    event_type = %event.event_type,
                    dropped_total = self.stats.dropped(),
                    "Progress event dropped, queue full"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CollectingEventSink;
    use uuid::Uuid;

    fn event(kind: &str) -> ProgressEvent {
        ProgressEvent::new(kind, Uuid::nil())
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking() {
        let downstream = Arc::new(CollectingEventSink::new());
        let sink = QueuedEventSink::new(downstream.clone(), 2);

        // Nothing yields, so the forwarder has not run yet.
        for i in 0..5 {
            sink.try_emit(event(&format!("item.completed.{i}")));
        }
        assert_eq!(sink.stats().queued(), 2);
        assert_eq!(sink.stats().dropped(), 3);
        assert_eq!(sink.pending(), 2);
        assert!(downstream.is_empty());
        assert_eq!(sink.stats().to_dict()["dropped"], 3);
    }

    #[tokio::test]
    async fn test_forwards_in_order() {
        let downstream = Arc::new(CollectingEventSink::new());
        let sink = QueuedEventSink::new(downstream.clone(), 16);

        sink.try_emit(event("phase.started"));
        sink.emit(event("phase.completed")).await;
        assert!(sink.drain(Duration::from_secs(1)).await);

        assert_eq!(
            downstream.event_types(),
            vec!["phase.started".to_string(), "phase.completed".to_string()]
        );
        assert_eq!(sink.stats().dropped(), 0);
    }

    #[test]
    fn test_events_before_a_runtime_wait_in_the_queue() {
        let downstream = Arc::new(CollectingEventSink::new());
        let sink = QueuedEventSink::new(downstream.clone(), 4);
        sink.try_emit(event("pipeline.started"));
        assert_eq!(sink.pending(), 1);

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        runtime.block_on(async {
            assert!(sink.drain(Duration::from_secs(1)).await);
        });
        assert_eq!(downstream.event_types(), vec!["pipeline.started".to_string()]);
    }
}
