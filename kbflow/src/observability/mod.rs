//! Observability utilities.
//!
//! Log output goes through `tracing`; [`init_logging`] installs the
//! subscriber once per process. Phase timings use [`SpanTimer`] and the
//! end-of-run summary attached to `pipeline.*` events comes from
//! [`execution_summary`].

mod logging;
mod summary;

pub use logging::{init_logging, LogConfig, LogFormat, SpanTimer};
pub use summary::execution_summary;
