//! Thread detection.
//!
//! Groups a fetch batch into reply chains by author sequence. A chain
//! continues while each post replies to the one right before it from the
//! same author within the configured time window.

mod detector;

pub use detector::{CrossAuthorReply, Thread, ThreadConfig, ThreadDetector};
