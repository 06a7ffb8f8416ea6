//! Pause, resume and abort signalling for a running execution.

use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::watch;

/// Requested run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunSignal {
    /// Keep going.
    #[default]
    Run,
    /// Stop dispatching new items; finish in-flight ones.
    Pause,
    /// Stop dispatching and cancel in-flight calls.
    Abort,
}

/// Shared handle for steering one execution.
///
/// Abort is sticky: once aborted, pause and resume are ignored and only the
/// first abort reason is kept.
#[derive(Debug, Clone)]
pub struct RunControl {
    tx: Arc<watch::Sender<RunSignal>>,
    reason: Arc<RwLock<Option<String>>>,
}

impl Default for RunControl {
    fn default() -> Self {
        Self::new()
    }
}

impl RunControl {
    /// Creates a control in the running state.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = watch::channel(RunSignal::Run);
        Self {
            tx: Arc::new(tx),
            reason: Arc::new(RwLock::new(None)),
        }
    }

    /// Current signal.
    #[must_use]
    pub fn signal(&self) -> RunSignal {
        *self.tx.borrow()
    }

    /// Requests a pause.
    pub fn pause(&self) {
        self.tx.send_if_modified(|s| {
            if *s == RunSignal::Run {
                *s = RunSignal::Pause;
                true
            } else {
                false
            }
        });
    }

    /// Clears a pause.
    pub fn resume(&self) {
        self.tx.send_if_modified(|s| {
            if *s == RunSignal::Pause {
                *s = RunSignal::Run;
                true
            } else {
                false
            }
        });
    }

    /// Requests an abort.
    pub fn abort(&self, reason: impl Into<String>) {
        let mut slot = self.reason.write();
        if slot.is_none() {
            *slot = Some(reason.into());
        }
        drop(slot);
        self.tx.send_replace(RunSignal::Abort);
    }

    /// Returns true once an abort was requested.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.signal() == RunSignal::Abort
    }

    /// Returns true if no new work should be dispatched.
    #[must_use]
    pub fn should_stop(&self) -> bool {
        self.signal() != RunSignal::Run
    }

    /// The first abort reason.
    #[must_use]
    pub fn abort_reason(&self) -> Option<String> {
        self.reason.read().clone()
    }

    /// Resolves once an abort is requested.
    pub async fn aborted(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this only ends on abort.
        let _ = rx.wait_for(|s| *s == RunSignal::Abort).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_pause_resume() {
        let control = RunControl::new();
        assert!(!control.should_stop());
        control.pause();
        assert_eq!(control.signal(), RunSignal::Pause);
        assert!(control.should_stop());
        control.resume();
        assert_eq!(control.signal(), RunSignal::Run);
    }

    #[test]
    fn test_abort_is_sticky_and_keeps_first_reason() {
        let control = RunControl::new();
        control.abort("user");
        control.abort("second");
        control.resume();
        control.pause();
        assert!(control.is_aborted());
        assert_eq!(control.abort_reason().as_deref(), Some("user"));
    }

    #[tokio::test]
    async fn test_aborted_future_resolves() {
        let control = RunControl::new();
        let waiter = control.clone();
        let handle = tokio::spawn(async move { waiter.aborted().await });
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(!handle.is_finished());
        control.abort("stop");
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
