//! Progress notification.
//!
//! The orchestrator reports every phase and item transition to an
//! [`EventSink`] handed to it at construction. Sinks are best-effort and
//! must never hold up the pipeline.

mod backpressure;
mod sink;

pub use backpressure::{DeliveryStats, QueuedEventSink};
pub use sink::{BroadcastEventSink, CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
